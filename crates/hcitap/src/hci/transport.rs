//! Byte-level transport abstraction
//!
//! A transport yields raw byte chunks and exposes the HCI filter register of
//! the underlying socket. [`HciSocket`](super::HciSocket) is the real Linux
//! implementation and [`MockTransport`](super::MockTransport) an in-memory one.

use crate::error::IoError;
use crate::hci::constants::{HCI_CHANNEL_MONITOR, HCI_CHANNEL_RAW, HCI_MAX_FRAME_SIZE, HCI_MON_HDR_SIZE};
use crate::hci::filter::HciFilter;
use bytes::Bytes;
use std::io;
use std::ops::Deref;
use std::time::Duration;

/// An immutable run of bytes as returned by a single read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawChunk(Bytes);

impl RawChunk {
    pub fn new(bytes: Bytes) -> Self {
        RawChunk(bytes)
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        RawChunk(Bytes::copy_from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for RawChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RawChunk {
    fn from(data: Vec<u8>) -> Self {
        RawChunk(Bytes::from(data))
    }
}

impl From<Bytes> for RawChunk {
    fn from(bytes: Bytes) -> Self {
        RawChunk(bytes)
    }
}

/// The HCI socket channel a byte stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HciChannel {
    /// One controller's packets, each prefixed by its type byte, behind an `HCI_FILTER`
    #[default]
    Raw,
    /// Every controller's traffic as monitor records. There is no filter.
    Monitor,
}

impl HciChannel {
    pub fn id(self) -> u16 {
        match self {
            Self::Raw => HCI_CHANNEL_RAW,
            Self::Monitor => HCI_CHANNEL_MONITOR,
        }
    }

    /// Whether sockets on this channel carry an `HCI_FILTER`
    pub fn has_filter(self) -> bool {
        self == Self::Raw
    }

    /// Smallest read buffer that never truncates a frame
    pub fn min_read_buffer(self) -> usize {
        match self {
            Self::Raw => 1 + HCI_MAX_FRAME_SIZE,
            Self::Monitor => HCI_MON_HDR_SIZE + HCI_MAX_FRAME_SIZE,
        }
    }
}

/// A source of raw HCI bytes with a settable packet filter
pub trait HciTransport: Send {
    /// Block until at least one byte is available, then return what was read.
    ///
    /// Interrupted reads are retried internally and never surface as
    /// [`IoError::Interrupted`]. End of stream is [`IoError::Disconnected`].
    fn read_chunk(&mut self) -> Result<RawChunk, IoError>;

    /// Wait up to `timeout` for the transport to become readable.
    ///
    /// Returns `Ok(false)` when the timeout expired with nothing to read.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError>;

    /// Read the filter currently installed on the socket
    fn filter(&self) -> io::Result<HciFilter>;

    /// Install a new filter on the socket
    fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()>;

    /// Write one complete HCI packet, type byte included
    fn send(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Release the underlying handle. Calling this more than once is a no-op.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}
