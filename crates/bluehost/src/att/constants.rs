//! ATT protocol constants.

// ATT opcode values
pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFO_REQ: u8 = 0x04;
pub const ATT_FIND_INFO_RSP: u8 = 0x05;
pub const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0A;
pub const ATT_READ_RSP: u8 = 0x0B;
pub const ATT_READ_BLOB_REQ: u8 = 0x0C;
pub const ATT_READ_BLOB_RSP: u8 = 0x0D;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub const ATT_HANDLE_VALUE_CONF: u8 = 0x1E;
pub const ATT_WRITE_CMD: u8 = 0x52;
pub const ATT_SIGNED_WRITE_CMD: u8 = 0xD2;

// ATT error codes
pub const ATT_ECODE_INVALID_HANDLE: u8 = 0x01;
pub const ATT_ECODE_READ_NOT_PERM: u8 = 0x02;
pub const ATT_ECODE_WRITE_NOT_PERM: u8 = 0x03;
pub const ATT_ECODE_INVALID_PDU: u8 = 0x04;
pub const ATT_ECODE_AUTHENTICATION: u8 = 0x05;
pub const ATT_ECODE_REQ_NOT_SUPP: u8 = 0x06;
pub const ATT_ECODE_INVALID_OFFSET: u8 = 0x07;
pub const ATT_ECODE_AUTHORIZATION: u8 = 0x08;
pub const ATT_ECODE_PREP_QUEUE_FULL: u8 = 0x09;
pub const ATT_ECODE_ATTR_NOT_FOUND: u8 = 0x0A;
pub const ATT_ECODE_ATTR_NOT_LONG: u8 = 0x0B;
pub const ATT_ECODE_INSUFF_ENCR_KEY_SIZE: u8 = 0x0C;
pub const ATT_ECODE_INVAL_ATTR_VALUE_LEN: u8 = 0x0D;
pub const ATT_ECODE_UNLIKELY: u8 = 0x0E;
pub const ATT_ECODE_INSUFF_ENC: u8 = 0x0F;
pub const ATT_ECODE_UNSUPP_GRP_TYPE: u8 = 0x10;
pub const ATT_ECODE_INSUFF_RESOURCES: u8 = 0x11;
pub const ATT_ECODE_APPLICATION_START: u8 = 0x80;
pub const ATT_ECODE_APPLICATION_END: u8 = 0x9F;

// Attribute permission flags
pub const ATT_PERM_NONE: u8 = 0x00;
pub const ATT_PERM_READ: u8 = 0x01;
pub const ATT_PERM_WRITE: u8 = 0x02;
pub const ATT_PERM_READ_ENCRYPT: u8 = 0x04;
pub const ATT_PERM_WRITE_ENCRYPT: u8 = 0x08;
pub const ATT_PERM_READ_AUTHEN: u8 = 0x10;
pub const ATT_PERM_WRITE_AUTHEN: u8 = 0x20;

// Characteristic properties (declaration value, first byte)
pub const GATT_PROP_BROADCAST: u8 = 0x01;
pub const GATT_PROP_READ: u8 = 0x02;
pub const GATT_PROP_WRITE_NO_RSP: u8 = 0x04;
pub const GATT_PROP_WRITE: u8 = 0x08;
pub const GATT_PROP_NOTIFY: u8 = 0x10;
pub const GATT_PROP_INDICATE: u8 = 0x20;
pub const GATT_PROP_AUTH_SIGN_WRITE: u8 = 0x40;
pub const GATT_PROP_EXTENDED: u8 = 0x80;

// Handle space
pub const ATT_HANDLE_MIN: u16 = 0x0001;
pub const ATT_HANDLE_MAX: u16 = 0xFFFF;

// MTU bounds
pub const ATT_DEFAULT_MTU: u16 = 23;
pub const ATT_MAX_MTU: u16 = 517;

// L2CAP fixed channel carrying ATT
pub const ATT_CID: u16 = 0x0004;

// Declaration and descriptor type UUIDs
pub const PRIMARY_SERVICE_UUID: u16 = 0x2800;
pub const SECONDARY_SERVICE_UUID: u16 = 0x2801;
pub const INCLUDE_UUID: u16 = 0x2802;
pub const CHARACTERISTIC_UUID: u16 = 0x2803;
pub const CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;

// CCCD value bits
pub const CCCD_NOTIFICATION: u16 = 0x0001;
pub const CCCD_INDICATION: u16 = 0x0002;

// Find Information Response formats
pub const ATT_FIND_INFO_FORMAT_16BIT: u8 = 0x01;
pub const ATT_FIND_INFO_FORMAT_128BIT: u8 = 0x02;
