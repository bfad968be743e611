//! In-memory transport
//!
//! `MockTransport` replays scripted reads and keeps an observable filter
//! register, so sessions and dispatchers can run without a controller.
//! A [`MockHandle`] stays usable after the transport has moved into a session.

use crate::error::IoError;
use crate::hci::filter::HciFilter;
use crate::hci::transport::{HciTransport, RawChunk};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One scripted outcome of a read
#[derive(Debug)]
pub enum MockRead {
    Data(RawChunk),
    /// A signal interrupted the read; the transport retries it
    Interrupted,
    Disconnect,
    Error(io::ErrorKind),
}

#[derive(Debug, Default)]
struct MockState {
    reads: VecDeque<MockRead>,
    /// Once the script runs dry, report a disconnect instead of idling
    end_of_stream: bool,
    filter: HciFilter,
    filter_history: Vec<HciFilter>,
    fail_set_filter: bool,
    sent: Vec<Vec<u8>>,
    close_count: usize,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scripted in-memory transport
#[derive(Debug, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Observer and feeder for a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that yields `chunks` in order and then reports a disconnect
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<RawChunk>,
    {
        let transport = Self::new();
        let handle = transport.handle();
        for chunk in chunks {
            handle.push_read(MockRead::Data(chunk.into()));
        }
        handle.end_stream();
        transport
    }

    /// Build a replay from text: one chunk per line, hex digits with optional spaces.
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_hex_lines(text: &str) -> Result<Self, hex::FromHexError> {
        let chunks = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| hex::decode(line.replace(char::is_whitespace, "")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_chunks(chunks))
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: self.shared.clone(),
        }
    }
}

impl MockHandle {
    pub fn push_read(&self, read: MockRead) {
        self.shared.lock().reads.push_back(read);
        self.shared.readable.notify_all();
    }

    pub fn push_chunk(&self, data: &[u8]) {
        self.push_read(MockRead::Data(RawChunk::copy_from_slice(data)));
    }

    /// Report a disconnect once every queued read has been consumed
    pub fn end_stream(&self) {
        self.shared.lock().end_of_stream = true;
        self.shared.readable.notify_all();
    }

    pub fn filter(&self) -> HciFilter {
        self.shared.lock().filter
    }

    pub fn set_filter(&self, filter: HciFilter) {
        self.shared.lock().filter = filter;
    }

    /// Every filter installed through the transport, oldest first
    pub fn filter_history(&self) -> Vec<HciFilter> {
        self.shared.lock().filter_history.clone()
    }

    /// Make subsequent `set_filter` calls on the transport fail
    pub fn fail_set_filter(&self, fail: bool) {
        self.shared.lock().fail_set_filter = fail;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sent.clone()
    }

    pub fn close_count(&self) -> usize {
        self.shared.lock().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl HciTransport for MockTransport {
    fn read_chunk(&mut self) -> Result<RawChunk, IoError> {
        let mut state = self.shared.lock();

        loop {
            if state.closed {
                return Err(IoError::Disconnected);
            }

            match state.reads.pop_front() {
                Some(MockRead::Data(chunk)) => return Ok(chunk),
                Some(MockRead::Interrupted) => continue,
                Some(MockRead::Disconnect) => return Err(IoError::Disconnected),
                Some(MockRead::Error(kind)) => return Err(IoError::from(io::Error::from(kind))),
                None if state.end_of_stream => return Err(IoError::Disconnected),
                None => {
                    state = self
                        .shared
                        .readable
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool, IoError> {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .readable
            .wait_timeout_while(state, timeout, |s| {
                !s.closed && s.reads.is_empty() && !s.end_of_stream
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Err(IoError::Disconnected);
        }
        Ok(!state.reads.is_empty() || state.end_of_stream)
    }

    fn filter(&self) -> io::Result<HciFilter> {
        Ok(self.shared.lock().filter)
    }

    fn set_filter(&mut self, filter: &HciFilter) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.fail_set_filter {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        state.filter = *filter;
        state.filter_history.push(*filter);
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        state.sent.push(packet.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            state.close_count += 1;
        }
        drop(state);
        self.shared.readable.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.close();
    }
}
