//! HCI packet structures and parsing
//!
//! This module contains the typed packets produced by the framer and the
//! command builder used to write packets back to a controller.

use crate::error::{FramingError, HciError};
use crate::hci::constants::*;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// HCI packet type tag, the first byte of every packet on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Command = HCI_COMMAND_PKT,
    AclData = HCI_ACL_PKT,
    ScoData = HCI_SCO_PKT,
    Event = HCI_EVENT_PKT,
}

impl PacketType {
    /// Size of the type-specific header that follows the tag byte
    pub fn header_len(self) -> usize {
        match self {
            Self::Command => HCI_COMMAND_HDR_SIZE,
            Self::AclData => HCI_ACL_HDR_SIZE,
            Self::ScoData => HCI_SCO_HDR_SIZE,
            Self::Event => HCI_EVENT_HDR_SIZE,
        }
    }

    /// Read the declared payload length out of a complete header
    pub(crate) fn payload_len(self, header: &[u8]) -> usize {
        match self {
            Self::Command => header[2] as usize,
            Self::AclData => LittleEndian::read_u16(&header[2..4]) as usize,
            Self::ScoData => header[2] as usize,
            Self::Event => header[1] as usize,
        }
    }

    /// Short name used in logs and CLI output
    pub fn name(self) -> &'static str {
        match self {
            Self::Command => "CMD",
            Self::AclData => "ACL",
            Self::ScoData => "SCO",
            Self::Event => "EVT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            HCI_COMMAND_PKT => Ok(Self::Command),
            HCI_ACL_PKT => Ok(Self::AclData),
            HCI_SCO_PKT => Ok(Self::ScoData),
            HCI_EVENT_PKT => Ok(Self::Event),
            other => Err(FramingError::InvalidType(other)),
        }
    }
}

bitflags! {
    /// Flag nibble carried in the top four bits of an ACL handle field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AclFlags: u8 {
        /// Packet boundary: continuing fragment of a higher layer message
        const CONTINUING_FRAGMENT = 0b0001;
        /// Packet boundary: first fragment, automatically flushable
        const FIRST_FLUSHABLE = 0b0010;
        /// Broadcast flag: active peripheral broadcast
        const ACTIVE_BROADCAST = 0b0100;
    }
}

impl AclFlags {
    /// The 2-bit packet boundary flag
    pub fn packet_boundary(self) -> u8 {
        self.bits() & 0b11
    }

    /// The 2-bit broadcast flag
    pub fn broadcast(self) -> u8 {
        (self.bits() >> 2) & 0b11
    }
}

fn split_handle(field: u16) -> (u16, u8) {
    (field & HCI_HANDLE_MASK, (field >> 12) as u8)
}

fn join_handle(handle: u16, flags: u8) -> u16 {
    (handle & HCI_HANDLE_MASK) | ((flags as u16 & 0x0F) << 12)
}

/// HCI Command packet, as framed from the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciCommandPacket {
    pub opcode: u16,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciCommandPacket {
    /// Parse a command packet from raw bytes (type byte already stripped)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_COMMAND_HDR_SIZE {
            return None;
        }

        let opcode = LittleEndian::read_u16(&data[0..2]);
        let parameter_total_length = data[2];
        let end = HCI_COMMAND_HDR_SIZE + parameter_total_length as usize;

        if data.len() < end {
            return None;
        }

        Some(HciCommandPacket {
            opcode,
            parameter_total_length,
            parameters: data[HCI_COMMAND_HDR_SIZE..end].to_vec(),
        })
    }

    /// Opcode Group Field
    pub fn ogf(&self) -> u8 {
        (self.opcode >> 10) as u8
    }

    /// Opcode Command Field
    pub fn ocf(&self) -> u16 {
        self.opcode & 0x03FF
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + HCI_EVENT_HDR_SIZE) {
            return None;
        }

        let parameters =
            data[HCI_EVENT_HDR_SIZE..(parameter_total_length as usize + HCI_EVENT_HDR_SIZE)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Opcode of the command this event answers, for Command Complete and Command Status
    pub fn command_opcode(&self) -> Option<u16> {
        match self.event_code {
            EVT_CMD_COMPLETE if self.parameters.len() >= 3 => {
                Some(LittleEndian::read_u16(&self.parameters[1..3]))
            }
            EVT_CMD_STATUS if self.parameters.len() >= 4 => {
                Some(LittleEndian::read_u16(&self.parameters[2..4]))
            }
            _ => None,
        }
    }
}

/// HCI ACL Data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub handle: u16,
    pub flags: AclFlags,
    pub data_total_length: u16,
    pub data: Vec<u8>,
}

impl AclPacket {
    /// Parse an ACL data packet from raw bytes (type byte already stripped)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_ACL_HDR_SIZE {
            return None;
        }

        let (handle, flags) = split_handle(LittleEndian::read_u16(&data[0..2]));
        let data_total_length = LittleEndian::read_u16(&data[2..4]);
        let end = HCI_ACL_HDR_SIZE + data_total_length as usize;

        if data.len() < end {
            return None;
        }

        Some(AclPacket {
            handle,
            flags: AclFlags::from_bits_retain(flags),
            data_total_length,
            data: data[HCI_ACL_HDR_SIZE..end].to_vec(),
        })
    }
}

/// HCI Synchronous (SCO) Data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoPacket {
    pub handle: u16,
    /// 2-bit packet status flag reported by the controller
    pub packet_status: u8,
    pub data_total_length: u8,
    pub data: Vec<u8>,
}

impl ScoPacket {
    /// Parse a SCO data packet from raw bytes (type byte already stripped)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_SCO_HDR_SIZE {
            return None;
        }

        let (handle, flags) = split_handle(LittleEndian::read_u16(&data[0..2]));
        let data_total_length = data[2];
        let end = HCI_SCO_HDR_SIZE + data_total_length as usize;

        if data.len() < end {
            return None;
        }

        Some(ScoPacket {
            handle,
            packet_status: flags & 0b11,
            data_total_length,
            data: data[HCI_SCO_HDR_SIZE..end].to_vec(),
        })
    }
}

/// A complete HCI packet of any type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Command(HciCommandPacket),
    AclData(AclPacket),
    ScoData(ScoPacket),
    Event(HciEvent),
}

impl HciPacket {
    /// Parse a complete packet body of the given type (type byte already stripped)
    pub fn parse(packet_type: PacketType, data: &[u8]) -> Option<Self> {
        match packet_type {
            PacketType::Command => HciCommandPacket::parse(data).map(Self::Command),
            PacketType::AclData => AclPacket::parse(data).map(Self::AclData),
            PacketType::ScoData => ScoPacket::parse(data).map(Self::ScoData),
            PacketType::Event => HciEvent::parse(data).map(Self::Event),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Command(_) => PacketType::Command,
            Self::AclData(_) => PacketType::AclData,
            Self::ScoData(_) => PacketType::ScoData,
            Self::Event(_) => PacketType::Event,
        }
    }

    /// Payload bytes following the type-specific header
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Command(cmd) => &cmd.parameters,
            Self::AclData(acl) => &acl.data,
            Self::ScoData(sco) => &sco.data,
            Self::Event(evt) => &evt.parameters,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Encode the packet back to its wire form, type byte included
    pub fn to_bytes(&self) -> Vec<u8> {
        let header_len = self.packet_type().header_len();
        let mut packet = Vec::with_capacity(1 + header_len + self.payload_len());
        packet.push(self.packet_type() as u8);

        match self {
            Self::Command(cmd) => {
                packet.extend_from_slice(&cmd.opcode.to_le_bytes());
                packet.push(cmd.parameter_total_length);
            }
            Self::AclData(acl) => {
                packet.extend_from_slice(&join_handle(acl.handle, acl.flags.bits()).to_le_bytes());
                packet.extend_from_slice(&acl.data_total_length.to_le_bytes());
            }
            Self::ScoData(sco) => {
                packet.extend_from_slice(&join_handle(sco.handle, sco.packet_status).to_le_bytes());
                packet.push(sco.data_total_length);
            }
            Self::Event(evt) => {
                packet.push(evt.event_code);
                packet.push(evt.parameter_total_length);
            }
        }

        packet.extend_from_slice(self.payload());
        packet
    }
}

impl fmt::Display for HciPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd) => write!(
                f,
                "CMD opcode=0x{:04x} (ogf=0x{:02x} ocf=0x{:04x}) plen={}",
                cmd.opcode,
                cmd.ogf(),
                cmd.ocf(),
                cmd.parameter_total_length
            ),
            Self::AclData(acl) => write!(
                f,
                "ACL handle=0x{:03x} pb={} bc={} dlen={}",
                acl.handle,
                acl.flags.packet_boundary(),
                acl.flags.broadcast(),
                acl.data_total_length
            ),
            Self::ScoData(sco) => write!(
                f,
                "SCO handle=0x{:03x} status={} dlen={}",
                sco.handle, sco.packet_status, sco.data_total_length
            ),
            Self::Event(evt) => match evt.command_opcode() {
                Some(opcode) => write!(
                    f,
                    "EVT code=0x{:02x} plen={} opcode=0x{:04x}",
                    evt.event_code, evt.parameter_total_length, opcode
                ),
                None => write!(
                    f,
                    "EVT code=0x{:02x} plen={}",
                    evt.event_code, evt.parameter_total_length
                ),
            },
        }
    }
}

/// Common HCI Commands
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },

    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },

    // LE Commands (OGF: 0x08)
    LeSetScanEnable { enable: bool, filter_duplicates: bool },

    /// Any other command, with pre-encoded parameters
    Raw { ogf: u8, ocf: u16, parameters: Vec<u8> },
}

impl HciCommand {
    /// Build a raw command, checking the parameter length fits the one-byte length field
    pub fn new(ogf: u8, ocf: u16, parameters: Vec<u8>) -> Result<Self, HciError> {
        if parameters.len() > HCI_MAX_PARAM_LEN {
            return Err(HciError::InvalidParamLength(parameters.len()));
        }
        Ok(Self::Raw {
            ogf,
            ocf,
            parameters,
        })
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::LeSetScanEnable { .. } => (OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset => vec![],

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
                params
            }

            Self::SetEventMask { event_mask } => event_mask.to_le_bytes().to_vec(),

            Self::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => vec![*enable as u8, *filter_duplicates as u8],

            Self::Raw { parameters, .. } => parameters.clone(),
        }
    }

    /// Convert the command to a raw HCI packet.
    ///
    /// Fails if the parameters do not fit the one-byte length field.
    pub fn to_packet(&self) -> Result<Vec<u8>, HciError> {
        let (ogf, ocf) = self.opcode_parts();
        let opcode = ((ogf as u16) << 10) | (ocf & 0x3ff);
        let params = self.parameters();
        let param_len =
            u8::try_from(params.len()).map_err(|_| HciError::InvalidParamLength(params.len()))?;

        let mut packet = Vec::with_capacity(1 + HCI_COMMAND_HDR_SIZE + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(param_len);
        packet.extend_from_slice(&params);
        Ok(packet)
    }
}
