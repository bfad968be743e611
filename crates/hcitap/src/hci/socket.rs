//! HCI Socket implementation for Bluetooth communication
//!
//! This module provides a wrapper around the raw HCI socket interface,
//! allowing for communication with Bluetooth controllers.

use crate::error::{IoError, OpenError};
use crate::hci::constants::*;
use crate::hci::filter::HciFilter;
use crate::hci::transport::{HciChannel, HciTransport, RawChunk};
use log::{debug, trace};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Default size of the buffer handed to each `read(2)`
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Represents an HCI socket
#[derive(Debug)]
pub struct HciSocket {
    fd: Option<OwnedFd>,
    dev_id: u16,
    channel: HciChannel,
    buffer: Vec<u8>,
}

// Define the sockaddr_hci structure
#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

fn bt_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fd was just returned by socket() and is owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl HciSocket {
    /// Opens a new HCI socket
    ///
    /// # Arguments
    ///
    /// * `dev_id` - The device ID to open (0 for the first device)
    ///
    /// # Returns
    ///
    /// A new `HciSocket` instance or an error if the socket could not be opened
    pub fn open(dev_id: u16) -> Result<Self, OpenError> {
        Self::open_with_buffer(dev_id, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Opens a new HCI socket whose reads use a buffer of `buffer_size` bytes
    pub fn open_with_buffer(dev_id: u16, buffer_size: usize) -> Result<Self, OpenError> {
        Self::open_channel(dev_id, HciChannel::Raw, buffer_size)
    }

    /// Opens the monitor channel, which captures the traffic of every controller.
    ///
    /// Needs `CAP_NET_RAW`, like `btmon`.
    pub fn open_monitor(buffer_size: usize) -> Result<Self, OpenError> {
        Self::open_channel(HCI_DEV_NONE, HciChannel::Monitor, buffer_size)
    }

    /// Opens a socket on `channel`, bound to `dev_id`.
    ///
    /// The read buffer is grown to hold the largest frame; the kernel drops
    /// whatever does not fit in a single read.
    pub fn open_channel(dev_id: u16, channel: HciChannel, buffer_size: usize) -> Result<Self, OpenError> {
        let fd = bt_socket()?;

        // Bind to the specified device
        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: channel.id(),
        };

        let result = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            return Err(match OpenError::from(err) {
                OpenError::NotFound(_) => OpenError::NotFound(Some(dev_id)),
                other => other,
            });
        }

        debug!("Bound {:?} HCI socket to device {}", channel, dev_id);

        Ok(HciSocket {
            fd: Some(fd),
            dev_id,
            channel,
            buffer: vec![0u8; buffer_size.max(channel.min_read_buffer())],
        })
    }

    /// Find the first controller that is up, like BlueZ's `hci_get_route(NULL)`
    pub fn default_route() -> Result<u16, OpenError> {
        let ctl = bt_socket()?;

        let mut req = HciDevListReq {
            dev_num: HCI_MAX_DEV as u16,
            dev_req: [HciDevReq::default(); HCI_MAX_DEV],
        };

        let result = unsafe {
            libc::ioctl(
                ctl.as_raw_fd(),
                HCIGETDEVLIST as _,
                &mut req as *mut HciDevListReq as *mut libc::c_void,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let count = (req.dev_num as usize).min(HCI_MAX_DEV);
        req.dev_req[..count]
            .iter()
            .find(|dr| dr.dev_opt & HCI_DEV_UP != 0)
            .map(|dr| dr.dev_id)
            .ok_or(OpenError::NotFound(None))
    }

    /// Device index this socket is bound to, `HCI_DEV_NONE` for the monitor
    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn channel(&self) -> HciChannel {
        self.channel
    }

    fn raw_fd(&self) -> Result<RawFd, IoError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(IoError::Disconnected)
    }
}

impl HciTransport for HciSocket {
    fn read_chunk(&mut self) -> Result<RawChunk, IoError> {
        let fd = self.raw_fd()?;

        loop {
            let bytes_read = unsafe {
                libc::read(
                    fd,
                    self.buffer.as_mut_ptr() as *mut libc::c_void,
                    self.buffer.len(),
                )
            };

            if bytes_read < 0 {
                match IoError::from(io::Error::last_os_error()) {
                    IoError::Interrupted => continue,
                    err => return Err(err),
                }
            }

            if bytes_read == 0 {
                return Err(IoError::Disconnected);
            }

            trace!("Read {} bytes from hci{}", bytes_read, self.dev_id);
            return Ok(RawChunk::copy_from_slice(&self.buffer[..bytes_read as usize]));
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError> {
        let mut pfd = libc::pollfd {
            fd: self.raw_fd()?,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        if result < 0 {
            return match IoError::from(io::Error::last_os_error()) {
                // Treated as an empty wait, the caller polls again
                IoError::Interrupted => Ok(false),
                err => Err(err),
            };
        }

        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(IoError::Disconnected);
        }

        // POLLHUP and POLLERR are left for the following read to report
        Ok(result > 0)
    }

    fn filter(&self) -> io::Result<HciFilter> {
        let fd = self.raw_fd().map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut filter = HciFilter::default();
        let mut len = std::mem::size_of::<HciFilter>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                SOL_HCI,
                HCI_FILTER,
                &mut filter as *mut HciFilter as *mut libc::c_void,
                &mut len,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(filter)
    }

    fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()> {
        let fd = self.raw_fd().map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;

        let result = unsafe {
            libc::setsockopt(
                fd,
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const libc::c_void,
                std::mem::size_of::<HciFilter>() as libc::socklen_t,
            )
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        let fd = self.raw_fd().map_err(|_| io::Error::from_raw_os_error(libc::EBADF))?;

        match unsafe { libc::write(fd, packet.as_ptr() as *const libc::c_void, packet.len()) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    fn close(&mut self) {
        if self.fd.take().is_some() {
            debug!("Closed HCI socket for hci{}", self.dev_id);
        }
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}

impl AsRawFd for HciSocket {
    /// Returns -1 once the socket has been closed
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_hci_socket() {
        // This test will only pass if run with sufficient privileges
        // and if a Bluetooth adapter is available
        let result = HciSocket::open(0);

        // We don't assert on failure because the test might run in environments
        // without Bluetooth hardware or sufficient privileges
        if let Ok(mut socket) = result {
            assert!(socket.as_raw_fd() > 0);
            assert!(!socket.is_closed());

            socket.close();
            socket.close();
            assert!(socket.is_closed());
            assert_eq!(socket.as_raw_fd(), -1);
            assert!(matches!(socket.read_chunk(), Err(IoError::Disconnected)));
        }
    }

    #[test]
    fn test_open_monitor() {
        // Needs CAP_NET_RAW, so only checked when it succeeds
        if let Ok(mut socket) = HciSocket::open_monitor(64) {
            assert_eq!(socket.dev_id(), HCI_DEV_NONE);
            assert_eq!(socket.channel(), HciChannel::Monitor);
            assert!(socket.buffer.len() >= HciChannel::Monitor.min_read_buffer());
            socket.close();
            assert!(socket.is_closed());
        }
    }

    #[test]
    fn test_open_missing_device() {
        // hci1023 does not exist on any real system
        match HciSocket::open(1023) {
            Err(OpenError::NotFound(Some(1023))) => {}
            // No Bluetooth support or no permission in this environment
            Err(_) => {}
            Ok(_) => panic!("bound to a nonexistent HCI device"),
        }
    }
}
