//! Error types for the hcitap library
//!
//! This module defines the error taxonomy shared by the transport, framer and dispatcher.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while opening a session on an HCI device
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("No HCI device found{}", .0.map(|id| format!(" (hci{id})")).unwrap_or_default())]
    NotFound(Option<u16>),

    #[error("Permission denied opening HCI socket")]
    PermissionDenied,

    #[error("Timed out after {0:?} opening HCI device")]
    Timeout(Duration),

    #[error("Failed to open HCI socket: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for OpenError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => OpenError::PermissionDenied,
            Some(libc::ENODEV) | Some(libc::ENOENT) | Some(libc::EAFNOSUPPORT) => {
                OpenError::NotFound(None)
            }
            _ => OpenError::Io(err),
        }
    }
}

/// Errors raised while reading from an open transport
#[derive(Error, Debug)]
pub enum IoError {
    /// The read was interrupted by a signal. Retried inside the transport.
    #[error("Read interrupted")]
    Interrupted,

    #[error("HCI device disconnected")]
    Disconnected,

    #[error("HCI read failed: {0}")]
    Other(std::io::Error),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::Interrupted {
            return IoError::Interrupted;
        }
        match err.raw_os_error() {
            Some(libc::ENODEV)
            | Some(libc::ENETDOWN)
            | Some(libc::EBADF)
            | Some(libc::EPIPE)
            | Some(libc::ECONNRESET)
            | Some(libc::ENOTCONN) => IoError::Disconnected,
            _ => IoError::Other(err),
        }
    }
}

/// Errors raised while framing the raw byte stream into packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The stream ended in the middle of a packet.
    #[error("Truncated packet: need {needed} bytes, have {buffered}")]
    Truncated { needed: usize, buffered: usize },

    #[error("Invalid HCI packet type 0x{0:02x}")]
    InvalidType(u8),

    #[error("Payload of {length} bytes exceeds maximum of {max} for packet type 0x{packet_type:02x}")]
    OversizedPayload {
        packet_type: u8,
        length: usize,
        max: usize,
    },

    /// A monitor record whose body is not exactly one packet. The record is skipped.
    #[error("Malformed monitor record: {length} bytes do not hold one packet of type 0x{packet_type:02x}")]
    MalformedRecord { packet_type: u8, length: usize },
}

impl FramingError {
    /// Whether framing can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FramingError::InvalidType(_) | FramingError::MalformedRecord { .. }
        )
    }
}

/// The consumer fell behind and the bounded packet queue overflowed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Packet queue overflowed (capacity {capacity})")]
pub struct BackpressureError {
    pub capacity: usize,
}

/// Errors that can occur when working with HCI sessions
#[derive(Error, Debug)]
pub enum HciError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Backpressure(#[from] BackpressureError),

    #[error("Failed to install HCI filter: {0}")]
    Filter(std::io::Error),

    #[error("Failed to send HCI command: {0}")]
    SendError(std::io::Error),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),
}

impl HciError {
    /// Whether this error ends a packet stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HciError::Framing(e) if e.is_recoverable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_from_errno() {
        let err = OpenError::from(std::io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(err, OpenError::PermissionDenied));

        let err = OpenError::from(std::io::Error::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, OpenError::NotFound(None)));

        let err = OpenError::from(std::io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(err, OpenError::Io(_)));
    }

    #[test]
    fn test_io_error_from_errno() {
        let err = IoError::from(std::io::Error::from_raw_os_error(libc::EINTR));
        assert!(matches!(err, IoError::Interrupted));

        let err = IoError::from(std::io::Error::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, IoError::Disconnected));

        let err = IoError::from(std::io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, IoError::Other(_)));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!HciError::from(FramingError::InvalidType(0x09)).is_terminal());
        assert!(!HciError::from(FramingError::MalformedRecord {
            packet_type: 0x04,
            length: 1
        })
        .is_terminal());
        assert!(HciError::from(FramingError::OversizedPayload {
            packet_type: 0x02,
            length: 9000,
            max: 4096
        })
        .is_terminal());
        assert!(HciError::from(BackpressureError { capacity: 4 }).is_terminal());
        assert!(HciError::from(IoError::Disconnected).is_terminal());
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(OpenError::NotFound(Some(1)).to_string(), "No HCI device found (hci1)");
        assert_eq!(OpenError::NotFound(None).to_string(), "No HCI device found");
    }
}
