//! HCI protocol constants.

// HCI packet indicator bytes
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Opcode group fields
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LE: u8 = 0x08;

// Link Control commands (OGF 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// LE commands (OGF 0x08)
pub const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
pub const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
pub const OCF_LE_SET_SCAN_RESPONSE_DATA: u16 = 0x0009;
pub const OCF_LE_SET_ADVERTISING_ENABLE: u16 = 0x000A;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// HCI events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE meta subevents
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// Disconnect reason codes
pub const HCI_REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Advertising type: connectable undirected (ADV_IND).
pub const ADV_TYPE_ADV_IND: u8 = 0x00;

/// Use all three advertising channels.
pub const ADV_CHANNEL_MAP_ALL: u8 = 0x07;
