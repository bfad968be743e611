//! HCI monitor channel records
//!
//! A socket bound to `HCI_CHANNEL_MONITOR` on `HCI_DEV_NONE` sees the traffic
//! of every controller, as `btmon` does. Each record is a 6-byte header
//! followed by `len` bytes. For packet records the body is an HCI packet
//! without its type byte. The type and direction come from the opcode.

use crate::hci::constants::*;
use crate::hci::packet::PacketType;
use byteorder::{ByteOrder, LittleEndian};

/// Which way a captured packet travelled, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Header of one monitor record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorHeader {
    pub opcode: u16,
    /// Controller the record belongs to
    pub index: u16,
    /// Length of the record body
    pub len: u16,
}

impl MonitorHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_MON_HDR_SIZE {
            return None;
        }

        Some(MonitorHeader {
            opcode: LittleEndian::read_u16(&data[0..2]),
            index: LittleEndian::read_u16(&data[2..4]),
            len: LittleEndian::read_u16(&data[4..6]),
        })
    }

    /// Packet type carried by this record, `None` for index and system records
    pub fn packet_type(&self) -> Option<PacketType> {
        match self.opcode {
            HCI_MON_COMMAND_PKT => Some(PacketType::Command),
            HCI_MON_EVENT_PKT => Some(PacketType::Event),
            HCI_MON_ACL_TX_PKT | HCI_MON_ACL_RX_PKT => Some(PacketType::AclData),
            HCI_MON_SCO_TX_PKT | HCI_MON_SCO_RX_PKT => Some(PacketType::ScoData),
            _ => None,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.opcode {
            HCI_MON_COMMAND_PKT | HCI_MON_ACL_TX_PKT | HCI_MON_SCO_TX_PKT => Some(Direction::Sent),
            HCI_MON_EVENT_PKT | HCI_MON_ACL_RX_PKT | HCI_MON_SCO_RX_PKT => Some(Direction::Received),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; HCI_MON_HDR_SIZE] {
        let mut header = [0u8; HCI_MON_HDR_SIZE];
        LittleEndian::write_u16(&mut header[0..2], self.opcode);
        LittleEndian::write_u16(&mut header[2..4], self.index);
        LittleEndian::write_u16(&mut header[4..6], self.len);
        header
    }
}

/// Wrap a packet body (type byte stripped) in a monitor record
pub fn encode_record(opcode: u16, index: u16, body: &[u8]) -> Vec<u8> {
    let header = MonitorHeader {
        opcode,
        index,
        len: body.len() as u16,
    };
    let mut record = Vec::with_capacity(HCI_MON_HDR_SIZE + body.len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(body);
    record
}
