//! HCI sessions
//!
//! A [`Session`] owns one transport and the filter snapshot taken when it was
//! opened. Closing a session restores the snapshot and then releases the
//! transport; dropping it does the same, so every exit path restores the filter.

use crate::error::{HciError, IoError, OpenError};
use crate::hci::constants::DEFAULT_MAX_PAYLOAD_LEN;
use crate::hci::filter::{self, FilterState};
use crate::hci::packet::HciCommand;
use crate::hci::socket::{HciSocket, DEFAULT_READ_BUFFER_SIZE};
use crate::hci::transport::{HciChannel, HciTransport, RawChunk};
use log::{info, warn};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Environment variable naming the HCI device index to open
pub const DEVICE_ENV_VAR: &str = "HCITAP_DEVICE";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device to open, `None` for the default route. Ignored on the monitor channel.
    pub device_id: Option<u16>,
    /// Capture one controller on the raw channel, or all of them on the monitor channel
    pub channel: HciChannel,
    /// Upper bound on how long opening the device may take
    pub open_timeout: Option<Duration>,
    /// Longest single wait for data before the producer rechecks cancellation
    pub read_timeout: Duration,
    /// Size of the buffer used for each socket read
    pub read_buffer_size: usize,
    /// Packets buffered for the consumer before the stream fails
    pub queue_capacity: usize,
    /// Largest payload the framer accepts
    pub max_payload_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            channel: HciChannel::Raw,
            open_timeout: None,
            read_timeout: Duration::from_millis(100),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            queue_capacity: 256,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl SessionConfig {
    /// Defaults, with the device taken from `HCITAP_DEVICE` when it holds a valid index
    pub fn from_env() -> Self {
        let device_id = std::env::var(DEVICE_ENV_VAR)
            .ok()
            .and_then(|value| parse_device(&value));
        Self {
            device_id,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device_id: u16) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn with_channel(mut self, channel: HciChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }
}

/// Accepts `0`, `hci0` and similar forms
pub fn parse_device(value: &str) -> Option<u16> {
    let value = value.trim();
    value.strip_prefix("hci").unwrap_or(value).parse().ok()
}

/// What happened when a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReport {
    /// The socket carries the filter it had before the session.
    /// Always true on channels without a filter.
    pub filter_restored: bool,
    pub transport_closed: bool,
}

/// An open HCI device together with the filter it had before the session began
pub struct Session<T: HciTransport = HciSocket> {
    transport: T,
    filter: Option<FilterState>,
    config: SessionConfig,
    report: Option<CloseReport>,
}

impl Session<HciSocket> {
    /// Open the configured device, or the default route, and take over its filter
    pub fn open(config: &SessionConfig) -> Result<Self, HciError> {
        let socket = match config.open_timeout {
            Some(timeout) => open_socket_with_timeout(config, timeout)?,
            None => open_socket(config)?,
        };
        match socket.channel() {
            HciChannel::Raw => info!("Opened HCI session on hci{}", socket.dev_id()),
            HciChannel::Monitor => info!("Opened HCI monitor session"),
        }
        Self::with_transport(socket, config.clone())
    }
}

fn open_socket(config: &SessionConfig) -> Result<HciSocket, OpenError> {
    if config.channel == HciChannel::Monitor {
        return HciSocket::open_monitor(config.read_buffer_size);
    }

    let dev_id = match config.device_id {
        Some(dev_id) => dev_id,
        None => HciSocket::default_route()?,
    };
    HciSocket::open_with_buffer(dev_id, config.read_buffer_size)
}

fn open_socket_with_timeout(config: &SessionConfig, timeout: Duration) -> Result<HciSocket, OpenError> {
    let config = config.clone();
    open_with_timeout(move || open_socket(&config), timeout)
}

/// Run `opener` on a helper thread and give up on it after `timeout`.
///
/// A transport opened after the deadline is dropped, and so closed, with the failed send.
pub(crate) fn open_with_timeout<T, F>(opener: F, timeout: Duration) -> Result<T, OpenError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, OpenError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("hcitap-open".into())
        .spawn(move || {
            let _ = tx.send(opener());
        })
        .map_err(OpenError::Io)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(OpenError::Timeout(timeout)),
    }
}

impl<T: HciTransport> Session<T> {
    /// Start a session on an already open transport.
    ///
    /// The transport is closed again if its filter cannot be taken over.
    /// On the monitor channel the filter is left alone.
    pub fn with_transport(mut transport: T, config: SessionConfig) -> Result<Self, HciError> {
        if !config.channel.has_filter() {
            return Ok(Session {
                transport,
                filter: None,
                config,
                report: None,
            });
        }

        match filter::acquire(&mut transport) {
            Ok(state) => Ok(Session {
                transport,
                filter: Some(state),
                config,
                report: None,
            }),
            Err(err) => {
                transport.close();
                Err(HciError::Filter(err))
            }
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Block until the next chunk of bytes arrives
    pub fn read_chunk(&mut self) -> Result<RawChunk, IoError> {
        self.transport.read_chunk()
    }

    /// Wait up to the configured read timeout for data
    pub fn wait_readable(&mut self) -> Result<bool, IoError> {
        self.transport.wait_readable(self.config.read_timeout)
    }

    /// Send a command to the controller
    pub fn send_command(&mut self, command: &HciCommand) -> Result<(), HciError> {
        let packet = command.to_packet()?;
        self.transport.send(&packet).map_err(HciError::SendError)
    }

    /// Restore the saved filter, then close the transport.
    ///
    /// A failed restore is logged and reported but the transport is closed regardless.
    /// Later calls return the first report without touching the transport.
    pub fn close(&mut self) -> CloseReport {
        if let Some(report) = self.report {
            return report;
        }

        let filter_restored = match self.filter.take() {
            Some(state) => match filter::release(&mut self.transport, state) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Failed to restore HCI filter: {}", err);
                    false
                }
            },
            // Nothing was installed
            None => true,
        };

        self.transport.close();
        let report = CloseReport {
            filter_restored,
            transport_closed: self.transport.is_closed(),
        };
        info!("Closed HCI session (filter restored: {})", filter_restored);

        self.report = Some(report);
        report
    }

    pub fn is_closed(&self) -> bool {
        self.report.is_some()
    }
}

impl<T: HciTransport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}
