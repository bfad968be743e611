//! HCI socket filter and its scoped acquisition
//!
//! A raw HCI socket only delivers the packet types and events admitted by its
//! filter. [`acquire`] snapshots the filter a socket had when the session
//! started and opens it up to everything; [`release`] puts the snapshot back.
//! [`FilterState`] is consumed by `release`, so a snapshot is restored at most once.

use crate::hci::packet::PacketType;
use crate::hci::transport::HciTransport;
use log::debug;
use std::io;

/// HCI filter structure, laid out like the kernel's `hci_ufilter`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HciFilter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

impl HciFilter {
    /// A filter admitting every packet type and every event
    pub fn all() -> Self {
        HciFilter {
            type_mask: u32::MAX,
            event_mask: [u32::MAX, u32::MAX],
            opcode: 0,
        }
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.type_mask |= 1 << (packet_type as u8 & 31);
    }

    pub fn accepts_packet_type(&self, packet_type: PacketType) -> bool {
        self.type_mask & (1 << (packet_type as u8 & 31)) != 0
    }

    pub fn set_event(&mut self, event_code: u8) {
        let bit = event_code & 63;
        self.event_mask[(bit >> 5) as usize] |= 1 << (bit & 31);
    }

    pub fn accepts_event(&self, event_code: u8) -> bool {
        let bit = event_code & 63;
        self.event_mask[(bit >> 5) as usize] & (1 << (bit & 31)) != 0
    }
}

/// Snapshot of the filter a socket carried before the session changed it
#[derive(Debug, PartialEq, Eq)]
pub struct FilterState {
    previous: HciFilter,
}

impl FilterState {
    pub fn previous(&self) -> &HciFilter {
        &self.previous
    }
}

/// Store the transport's current filter and install one that admits everything
pub fn acquire<T: HciTransport + ?Sized>(transport: &mut T) -> io::Result<FilterState> {
    let previous = transport.filter()?;
    debug!("Saved HCI filter {:?}", previous);

    transport.set_filter(&HciFilter::all())?;
    debug!("Installed accept-all HCI filter");

    Ok(FilterState { previous })
}

/// Restore exactly the filter captured by [`acquire`]
pub fn release<T: HciTransport + ?Sized>(transport: &mut T, state: FilterState) -> io::Result<()> {
    transport.set_filter(&state.previous)?;
    debug!("Restored HCI filter {:?}", state.previous);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::constants::*;
    use crate::hci::mock::MockTransport;

    #[test]
    fn test_filter_layout() {
        // type_mask(4) + event_mask(8) + opcode(2), padded to 4-byte alignment
        assert_eq!(std::mem::size_of::<HciFilter>(), 16);
    }

    #[test]
    fn test_filter_bits() {
        let mut filter = HciFilter::default();
        assert!(!filter.accepts_packet_type(PacketType::Event));

        filter.set_packet_type(PacketType::Event);
        assert!(filter.accepts_packet_type(PacketType::Event));
        assert!(!filter.accepts_packet_type(PacketType::AclData));
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);

        filter.set_event(EVT_CMD_COMPLETE);
        filter.set_event(EVT_LE_META_EVENT);
        assert!(filter.accepts_event(EVT_CMD_COMPLETE));
        assert!(filter.accepts_event(EVT_LE_META_EVENT));
        assert!(!filter.accepts_event(EVT_CMD_STATUS));
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT - 32));

        let all = HciFilter::all();
        assert!(all.accepts_packet_type(PacketType::ScoData));
        assert!(all.accepts_event(0x00));
        assert!(all.accepts_event(0xFF));
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let mut original = HciFilter::default();
        original.set_packet_type(PacketType::Event);
        original.set_event(EVT_CMD_COMPLETE);
        original.opcode = 0x0C03;

        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.set_filter(original);

        let state = acquire(&mut transport).unwrap();
        assert_eq!(state.previous(), &original);
        assert_eq!(handle.filter(), HciFilter::all());

        // Whatever happens in between, release puts back the snapshot
        transport.set_filter(&HciFilter::default()).unwrap();
        release(&mut transport, state).unwrap();
        assert_eq!(handle.filter(), original);
    }

    #[test]
    fn test_release_failure_is_reported() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();

        let state = acquire(&mut transport).unwrap();
        handle.fail_set_filter(true);

        assert!(release(&mut transport, state).is_err());
    }
}
