//! Packet dispatch
//!
//! The dispatcher moves a [`Session`] onto a producer thread that reads,
//! frames and queues packets. The consumer drains them through a
//! [`PacketStream`]. The two sides share a single bounded queue; if the
//! consumer falls behind far enough to fill it, the stream ends with a
//! [`BackpressureError`] instead of buffering without limit.
//!
//! Stream items:
//! - `Ok(packet)` in the exact order the packets were framed
//! - `Err(HciError::Framing(_))` for an unknown type byte or a malformed monitor
//!   record, after which the stream continues
//! - any other `Err`, which is always the final item
//!
//! After [`Dispatcher::cancel`] the stream ends without an error and packets
//! still queued are discarded. The producer stops once its current read
//! completes and closes the session.

use crate::error::{BackpressureError, HciError};
use crate::hci::framer::Framer;
use crate::hci::packet::HciPacket;
use crate::hci::transport::HciTransport;
use crate::session::{CloseReport, Session};
use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

type Item = Result<HciPacket, HciError>;

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Item>,
    capacity: usize,
    finished: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Shared {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                finished: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item for the consumer, failing when the queue is full
    fn offer(&self, item: Item) -> Result<(), BackpressureError> {
        let mut state = self.lock();
        if state.items.len() >= state.capacity {
            return Err(BackpressureError {
                capacity: state.capacity,
            });
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Mark the stream finished, appending its terminal error if there is one
    fn finish(&self, terminal: Option<HciError>) {
        let mut state = self.lock();
        if let Some(err) = terminal {
            state.items.push_back(Err(err));
        }
        state.finished = true;
        drop(state);
        self.ready.notify_all();
    }
}

/// Cloneable handle that stops a dispatcher and its stream
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    queue: Option<Arc<Shared>>,
}

impl CancelHandle {
    fn for_queue(queue: Arc<Shared>) -> Self {
        CancelHandle {
            flag: Arc::default(),
            queue: Some(queue),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(queue) = &self.queue {
            // A consumer between its flag check and its wait holds the lock
            drop(queue.lock());
            queue.ready.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Blocking iterator over the packets of one session.
///
/// Returns `None` forever once the session has ended or was cancelled.
#[derive(Debug)]
pub struct PacketStream {
    shared: Arc<Shared>,
    cancel: CancelHandle,
}

impl Iterator for PacketStream {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        let mut state = self.shared.lock();
        loop {
            if self.cancel.is_cancelled() {
                state.items.clear();
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.finished {
                return None;
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl PacketStream {
    /// Number of items waiting to be taken
    pub fn queued(&self) -> usize {
        self.shared.lock().items.len()
    }
}

/// Runs one session on a producer thread and hands its packets to a consumer
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    cancel: CancelHandle,
    producer: Option<JoinHandle<CloseReport>>,
    stream_taken: bool,
}

impl Dispatcher {
    /// Move `session` onto a new producer thread and start reading
    pub fn start<T: HciTransport + 'static>(session: Session<T>) -> Result<Self, HciError> {
        let shared = Arc::new(Shared::new(session.config().queue_capacity));
        let cancel = CancelHandle::for_queue(shared.clone());

        let producer = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("hcitap-producer".into())
                .spawn(move || run_producer(session, &shared, &cancel))
                .map_err(|err| HciError::Io(err.into()))?
        };

        Ok(Dispatcher {
            shared,
            cancel,
            producer: Some(producer),
            stream_taken: false,
        })
    }

    /// The packet stream. Only the first call returns it.
    pub fn stream(&mut self) -> Option<PacketStream> {
        if self.stream_taken {
            return None;
        }
        self.stream_taken = true;
        Some(PacketStream {
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// End the stream now and ask the producer to stop after its current read
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the producer to finish and report how the session was closed
    pub fn join(mut self) -> CloseReport {
        self.join_producer()
    }

    /// Cancel, then wait for the session to close
    pub fn shutdown(self) -> CloseReport {
        self.cancel();
        self.join()
    }

    fn join_producer(&mut self) -> CloseReport {
        match self.producer.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                error!("HCI producer thread panicked");
                self.shared.finish(None);
                CloseReport {
                    filter_restored: false,
                    transport_closed: false,
                }
            }
            None => CloseReport {
                filter_restored: false,
                transport_closed: true,
            },
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.producer.is_some() {
            self.cancel();
            self.join_producer();
        }
    }
}

fn run_producer<T: HciTransport>(
    mut session: Session<T>,
    shared: &Shared,
    cancel: &CancelHandle,
) -> CloseReport {
    debug!("HCI producer started");
    let config = session.config();
    let mut framer = Framer::for_channel(config.channel, config.max_payload_len);

    let terminal = pump(&mut session, &mut framer, shared, cancel);
    match &terminal {
        Some(err) => error!("HCI stream terminated: {}", err),
        None => debug!("HCI producer cancelled"),
    }

    if let Err(err) = framer.finish() {
        debug!("Discarding partial packet at end of stream: {}", err);
    }

    // The session is closed before the consumer can observe the end of the stream
    let report = session.close();
    shared.finish(terminal);
    report
}

/// Read, frame and queue packets until cancelled or a terminal error occurs
fn pump<T: HciTransport>(
    session: &mut Session<T>,
    framer: &mut Framer,
    shared: &Shared,
    cancel: &CancelHandle,
) -> Option<HciError> {
    while !cancel.is_cancelled() {
        match session.wait_readable() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => return Some(err.into()),
        }

        let chunk = match session.read_chunk() {
            Ok(chunk) => chunk,
            Err(err) => return Some(err.into()),
        };
        trace!("Framing {} byte chunk", chunk.len());
        framer.push(chunk);

        loop {
            let item = match framer.poll() {
                Ok(Some(packet)) => Ok(packet),
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {
                    warn!("Resynchronising HCI stream: {}", err);
                    Err(err.into())
                }
                Err(err) => return Some(err.into()),
            };

            if let Err(err) = shared.offer(item) {
                return Some(err.into());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FramingError, IoError};
    use crate::hci::filter::HciFilter;
    use crate::hci::mock::{MockRead, MockTransport};
    use crate::hci::packet::PacketType;
    use crate::session::SessionConfig;
    use std::time::{Duration, Instant};

    fn init_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }

    fn test_config() -> SessionConfig {
        SessionConfig::default().with_read_timeout(Duration::from_millis(10))
    }

    fn original_filter() -> HciFilter {
        let mut filter = HciFilter::default();
        filter.set_packet_type(PacketType::Event);
        filter
    }

    #[test]
    fn test_stream_delivers_in_order_then_disconnect() {
        init_logger();
        let transport = MockTransport::from_chunks(vec![
            vec![0x04, 0x03, 0x01],
            vec![0x02, 0x04, 0x0E, 0x00],
            vec![0x04, 0x0F, 0x04, 0x00, 0x01, 0x03, 0x0C],
        ]);
        let handle = transport.handle();
        handle.set_filter(original_filter());

        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let items: Vec<_> = dispatcher.stream().unwrap().collect();

        assert_eq!(items.len(), 4);
        let codes: Vec<u8> = items[..3]
            .iter()
            .map(|item| match item {
                Ok(HciPacket::Event(evt)) => evt.event_code,
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        assert_eq!(codes, vec![0x03, 0x0E, 0x0F]);
        assert!(matches!(items[3], Err(HciError::Io(IoError::Disconnected))));

        let report = dispatcher.join();
        assert!(report.filter_restored);
        assert!(report.transport_closed);
        assert_eq!(handle.filter(), original_filter());
    }

    #[test]
    fn test_stream_is_not_restartable() {
        let transport = MockTransport::from_chunks(Vec::<Vec<u8>>::new());
        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();

        let mut stream = dispatcher.stream().unwrap();
        assert!(dispatcher.stream().is_none());

        assert!(matches!(stream.next(), Some(Err(HciError::Io(IoError::Disconnected)))));
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_invalid_type_is_not_terminal() {
        let transport = MockTransport::from_chunks(vec![vec![0x07, 0x04, 0x0E, 0x00]]);
        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let mut stream = dispatcher.stream().unwrap();

        match stream.next() {
            Some(Err(err)) => {
                assert!(!err.is_terminal());
                assert!(matches!(err, HciError::Framing(FramingError::InvalidType(0x07))));
            }
            other => panic!("expected framing error, got {:?}", other),
        }
        assert!(matches!(stream.next(), Some(Ok(HciPacket::Event(_)))));
        assert!(matches!(stream.next(), Some(Err(HciError::Io(IoError::Disconnected)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_oversized_payload_is_terminal() {
        let transport = MockTransport::from_chunks(vec![
            vec![0x04, 0x0E, 0x00],
            vec![0x02, 0x40, 0x20, 0xFF, 0xFF],
        ]);
        let handle = transport.handle();
        let session = Session::with_transport(transport, test_config().with_max_payload_len(1021)).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let items: Vec<_> = dispatcher.stream().unwrap().collect();

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(HciError::Framing(FramingError::OversizedPayload { length: 0xFFFF, .. }))
        ));
        assert!(dispatcher.join().filter_restored);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_cancel_stops_delivery_and_restores_filter() {
        init_logger();
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_filter(original_filter());

        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let mut stream = dispatcher.stream().unwrap();

        handle.push_chunk(&[0x04, 0x0E, 0x00]);
        assert!(matches!(stream.next(), Some(Ok(HciPacket::Event(_)))));

        // Cancel from another thread while the producer is idle
        let canceller = dispatcher.cancel_handle();
        let started = Instant::now();
        thread::spawn(move || canceller.cancel());

        assert!(stream.next().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));

        // Data arriving after cancellation is never delivered
        handle.push_chunk(&[0x04, 0x0F, 0x00]);
        assert!(stream.next().is_none());

        let report = dispatcher.join();
        assert!(report.filter_restored);
        assert!(report.transport_closed);
        assert!(handle.is_closed());
        assert_eq!(handle.filter(), original_filter());
        assert_eq!(handle.close_count(), 1);
    }

    #[test]
    fn test_cancel_discards_queued_packets() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_filter(original_filter());
        handle.push_chunk(&[0x04, 0x0E, 0x00].repeat(5));

        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let mut stream = dispatcher.stream().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stream.queued() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stream.queued(), 5);

        dispatcher.cancel();
        assert!(stream.next().is_none());
        assert_eq!(stream.queued(), 0);

        let report = dispatcher.join();
        assert!(report.filter_restored);
        assert!(report.transport_closed);
        assert_eq!(handle.filter(), original_filter());

        // Still nothing once the session is fully closed
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_cancel_wakes_blocked_consumer() {
        // A long read timeout keeps the producer from noticing the cancel quickly
        let transport = MockTransport::new();
        let session = Session::with_transport(
            transport,
            SessionConfig::default().with_read_timeout(Duration::from_secs(3)),
        )
        .unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let mut stream = dispatcher.stream().unwrap();

        let canceller = dispatcher.cancel_handle();
        let consumer = thread::spawn(move || {
            let started = Instant::now();
            let item = stream.next();
            (item.is_none(), started.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        canceller.cancel();

        let (ended, elapsed) = consumer.join().unwrap();
        assert!(ended);
        assert!(elapsed < Duration::from_millis(1500));
    }

    #[test]
    fn test_monitor_stream() {
        use crate::hci::constants::*;
        use crate::hci::monitor::encode_record;
        use crate::hci::transport::HciChannel;

        let mut capture = encode_record(HCI_MON_NEW_INDEX, 0, &[0u8; 16]);
        capture.extend(encode_record(HCI_MON_ACL_RX_PKT, 0, &[0x40, 0x20, 0x02, 0x00, 0xAA, 0xBB]));
        // Declares three bytes of parameters but carries one
        capture.extend(encode_record(HCI_MON_EVENT_PKT, 0, &[0x0E, 0x03, 0x01]));
        capture.extend(encode_record(HCI_MON_EVENT_PKT, 1, &[0x0F, 0x00]));
        let (first, rest) = capture.split_at(9);

        let transport = MockTransport::from_chunks(vec![first.to_vec(), rest.to_vec()]);
        let handle = transport.handle();
        let config = test_config().with_channel(HciChannel::Monitor);
        let session = Session::with_transport(transport, config).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let items: Vec<_> = dispatcher.stream().unwrap().collect();

        assert_eq!(items.len(), 4);
        match &items[0] {
            Ok(HciPacket::AclData(acl)) => {
                assert_eq!(acl.handle, 0x0040);
                assert_eq!(acl.data, vec![0xAA, 0xBB]);
            }
            other => panic!("expected ACL data, got {:?}", other),
        }
        assert!(matches!(
            items[1],
            Err(HciError::Framing(FramingError::MalformedRecord { packet_type: 0x04, length: 3 }))
        ));
        assert!(matches!(items[2], Ok(HciPacket::Event(_))));
        assert!(matches!(items[3], Err(HciError::Io(IoError::Disconnected))));

        assert!(dispatcher.join().filter_restored);
        assert!(handle.filter_history().is_empty());
    }

    #[test]
    fn test_backpressure_overflow_terminates_stream() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        // Six events in one read; the queue only holds four
        handle.push_chunk(&[0x04, 0x0E, 0x00].repeat(6));

        let session = Session::with_transport(transport, test_config().with_queue_capacity(4)).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();

        // Nothing is consumed until the producer has overflowed and closed the session
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_closed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_closed());

        let stream = dispatcher.stream().unwrap();
        assert_eq!(stream.queued(), 5);
        let items: Vec<_> = stream.collect();

        assert_eq!(items.len(), 5);
        assert!(items[..4].iter().all(|item| item.is_ok()));
        assert!(matches!(
            items[4],
            Err(HciError::Backpressure(BackpressureError { capacity: 4 }))
        ));
        assert!(dispatcher.join().filter_restored);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_interrupted_read_is_transparent() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.push_read(MockRead::Interrupted);
        handle.push_chunk(&[0x04, 0x0E, 0x00]);
        handle.push_read(MockRead::Disconnect);

        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let items: Vec<_> = dispatcher.stream().unwrap().collect();

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(HciError::Io(IoError::Disconnected))));
    }

    #[test]
    fn test_partial_packet_is_never_delivered() {
        // The stream ends in the middle of a Command Complete
        let transport = MockTransport::from_chunks(vec![vec![0x04, 0x0E, 0x04, 0x01, 0x03]]);
        let session = Session::with_transport(transport, test_config()).unwrap();
        let mut dispatcher = Dispatcher::start(session).unwrap();
        let items: Vec<_> = dispatcher.stream().unwrap().collect();

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(HciError::Io(IoError::Disconnected))));
    }

    #[test]
    fn test_drop_cancels_and_closes() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_filter(original_filter());

        let session = Session::with_transport(transport, test_config()).unwrap();
        let dispatcher = Dispatcher::start(session).unwrap();
        drop(dispatcher);

        assert!(handle.is_closed());
        assert_eq!(handle.filter(), original_filter());
    }

    #[test]
    fn test_shutdown_without_consumer() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let session = Session::with_transport(transport, test_config()).unwrap();
        let dispatcher = Dispatcher::start(session).unwrap();

        let report = dispatcher.shutdown();
        assert_eq!(
            report,
            CloseReport {
                filter_restored: true,
                transport_closed: true,
            }
        );
        assert!(handle.is_closed());
    }
}
