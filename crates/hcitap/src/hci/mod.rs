//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the byte transport, the packet filter and the framer
//! that turns a raw HCI byte stream, or a monitor capture, into typed packets.

pub mod constants;
pub mod filter;
pub mod framer;
pub mod mock;
pub mod monitor;
pub mod packet;
pub mod socket;
pub mod transport;


pub use filter::{FilterState, HciFilter};
pub use framer::Framer;
pub use mock::{MockHandle, MockRead, MockTransport};
pub use monitor::{Direction, MonitorHeader};
pub use packet::{AclFlags, AclPacket, HciCommand, HciCommandPacket, HciEvent, HciPacket, PacketType, ScoPacket};
pub use socket::HciSocket;
pub use transport::{HciChannel, HciTransport, RawChunk};
