//! hcitap - A Rust library for tapping Bluetooth HCI traffic
//!
//! This library opens a raw HCI socket on Unix systems, takes over its packet
//! filter for the lifetime of a session, and frames the raw byte stream into
//! typed HCI packets (commands, events, ACL and SCO data). It can also capture
//! every controller passively on the monitor channel. Packets are handed to
//! a consumer through a bounded, cancellable stream.
//!
//! ```no_run
//! use hcitap::{Dispatcher, Session, SessionConfig};
//!
//! # fn main() -> Result<(), hcitap::HciError> {
//! let session = Session::open(&SessionConfig::from_env())?;
//! let mut dispatcher = Dispatcher::start(session)?;
//!
//! if let Some(stream) = dispatcher.stream() {
//!     for item in stream.take(10) {
//!         println!("{}", item?);
//!     }
//! }
//!
//! let report = dispatcher.shutdown();
//! assert!(report.filter_restored);
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod error;
pub mod hci;
pub mod session;

// Re-export common types for convenience
pub use dispatcher::{CancelHandle, Dispatcher, PacketStream};
pub use error::{BackpressureError, FramingError, HciError, IoError, OpenError};
pub use hci::{
    Framer, HciChannel, HciCommand, HciEvent, HciFilter, HciPacket, HciSocket, HciTransport,
    MockTransport, PacketType, RawChunk,
};
pub use session::{CloseReport, Session, SessionConfig};
