//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol and the Linux HCI socket API.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Header sizes, not counting the packet type byte
pub const HCI_COMMAND_HDR_SIZE: usize = 3;
pub const HCI_EVENT_HDR_SIZE: usize = 2;
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_SCO_HDR_SIZE: usize = 3;

// Largest frame the kernel hands to an HCI socket (ACL data plus its header)
pub const HCI_MAX_FRAME_SIZE: usize = 1492 + 4;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// Default upper bound on a framed payload
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 4096;

// Connection handles are 12 bits, the top nibble carries flags
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;

// Linux Bluetooth socket API
pub const AF_BLUETOOTH: i32 = 31;
pub const BTPROTO_HCI: i32 = 1;
pub const SOL_HCI: i32 = 0;
pub const HCI_FILTER: i32 = 2;
pub const HCI_CHANNEL_RAW: u16 = 0;
pub const HCI_CHANNEL_MONITOR: u16 = 2;
pub const HCI_DEV_NONE: u16 = 0xFFFF;
pub const HCI_MAX_DEV: usize = 16;
pub const HCI_DEV_UP: u32 = 1 << 0;

// _IOR('H', 210, int)
pub const HCIGETDEVLIST: libc::c_ulong = 0x800448d2;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// Host Controller Commands (OGF: 0x03)
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// Monitor channel record header: opcode, controller index, length (all LE u16)
pub const HCI_MON_HDR_SIZE: usize = 6;

// Monitor channel opcodes
pub const HCI_MON_NEW_INDEX: u16 = 0;
pub const HCI_MON_DEL_INDEX: u16 = 1;
pub const HCI_MON_COMMAND_PKT: u16 = 2;
pub const HCI_MON_EVENT_PKT: u16 = 3;
pub const HCI_MON_ACL_TX_PKT: u16 = 4;
pub const HCI_MON_ACL_RX_PKT: u16 = 5;
pub const HCI_MON_SCO_TX_PKT: u16 = 6;
pub const HCI_MON_SCO_RX_PKT: u16 = 7;
