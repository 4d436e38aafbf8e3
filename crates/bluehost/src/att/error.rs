//! ATT error codes and the server-side error type.

use thiserror::Error;

use super::constants::*;

/// Wire-level ATT error codes, as carried in an Error Response PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    Unlikely,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    /// 0x80..=0x9F, defined by the application's profile.
    ApplicationError(u8),
    Unknown(u8),
}

impl From<u8> for AttErrorCode {
    fn from(code: u8) -> Self {
        match code {
            ATT_ECODE_INVALID_HANDLE => AttErrorCode::InvalidHandle,
            ATT_ECODE_READ_NOT_PERM => AttErrorCode::ReadNotPermitted,
            ATT_ECODE_WRITE_NOT_PERM => AttErrorCode::WriteNotPermitted,
            ATT_ECODE_INVALID_PDU => AttErrorCode::InvalidPdu,
            ATT_ECODE_AUTHENTICATION => AttErrorCode::InsufficientAuthentication,
            ATT_ECODE_REQ_NOT_SUPP => AttErrorCode::RequestNotSupported,
            ATT_ECODE_INVALID_OFFSET => AttErrorCode::InvalidOffset,
            ATT_ECODE_AUTHORIZATION => AttErrorCode::InsufficientAuthorization,
            ATT_ECODE_PREP_QUEUE_FULL => AttErrorCode::PrepareQueueFull,
            ATT_ECODE_ATTR_NOT_FOUND => AttErrorCode::AttributeNotFound,
            ATT_ECODE_ATTR_NOT_LONG => AttErrorCode::AttributeNotLong,
            ATT_ECODE_INSUFF_ENCR_KEY_SIZE => AttErrorCode::InsufficientEncryptionKeySize,
            ATT_ECODE_INVAL_ATTR_VALUE_LEN => AttErrorCode::InvalidAttributeValueLength,
            ATT_ECODE_UNLIKELY => AttErrorCode::Unlikely,
            ATT_ECODE_INSUFF_ENC => AttErrorCode::InsufficientEncryption,
            ATT_ECODE_UNSUPP_GRP_TYPE => AttErrorCode::UnsupportedGroupType,
            ATT_ECODE_INSUFF_RESOURCES => AttErrorCode::InsufficientResources,
            c if (ATT_ECODE_APPLICATION_START..=ATT_ECODE_APPLICATION_END).contains(&c) => {
                AttErrorCode::ApplicationError(c)
            }
            c => AttErrorCode::Unknown(c),
        }
    }
}

impl From<AttErrorCode> for u8 {
    fn from(code: AttErrorCode) -> Self {
        match code {
            AttErrorCode::InvalidHandle => ATT_ECODE_INVALID_HANDLE,
            AttErrorCode::ReadNotPermitted => ATT_ECODE_READ_NOT_PERM,
            AttErrorCode::WriteNotPermitted => ATT_ECODE_WRITE_NOT_PERM,
            AttErrorCode::InvalidPdu => ATT_ECODE_INVALID_PDU,
            AttErrorCode::InsufficientAuthentication => ATT_ECODE_AUTHENTICATION,
            AttErrorCode::RequestNotSupported => ATT_ECODE_REQ_NOT_SUPP,
            AttErrorCode::InvalidOffset => ATT_ECODE_INVALID_OFFSET,
            AttErrorCode::InsufficientAuthorization => ATT_ECODE_AUTHORIZATION,
            AttErrorCode::PrepareQueueFull => ATT_ECODE_PREP_QUEUE_FULL,
            AttErrorCode::AttributeNotFound => ATT_ECODE_ATTR_NOT_FOUND,
            AttErrorCode::AttributeNotLong => ATT_ECODE_ATTR_NOT_LONG,
            AttErrorCode::InsufficientEncryptionKeySize => ATT_ECODE_INSUFF_ENCR_KEY_SIZE,
            AttErrorCode::InvalidAttributeValueLength => ATT_ECODE_INVAL_ATTR_VALUE_LEN,
            AttErrorCode::Unlikely => ATT_ECODE_UNLIKELY,
            AttErrorCode::InsufficientEncryption => ATT_ECODE_INSUFF_ENC,
            AttErrorCode::UnsupportedGroupType => ATT_ECODE_UNSUPP_GRP_TYPE,
            AttErrorCode::InsufficientResources => ATT_ECODE_INSUFF_RESOURCES,
            AttErrorCode::ApplicationError(c) => c,
            AttErrorCode::Unknown(c) => c,
        }
    }
}

/// Errors surfaced by the GATT server to the hosting application.
///
/// Wire-level ATT errors never appear here; those are encoded into Error
/// Response PDUs and stay between the engine and the remote client.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A previous indication on this connection has not been confirmed yet.
    #[error("indication already outstanding on this connection")]
    Busy,

    #[error("notifications not enabled by the client for handle 0x{0:04X}")]
    NotificationsDisabled(u16),

    #[error("indications not enabled by the client for handle 0x{0:04X}")]
    IndicationsDisabled(u16),

    #[error("unknown connection handle {0}")]
    UnknownConnection(u16),

    #[error("value of {len} bytes does not fit in MTU {mtu}")]
    ValueTooLong { len: usize, mtu: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("attribute database error: {0}")]
    Db(#[from] DbError),
}

/// Errors from attribute database mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("attribute handle space exhausted")]
    HandleSpaceExhausted,

    #[error("no attribute at handle 0x{0:04X}")]
    UnknownHandle(u16),

    #[error("handle 0x{0:04X} is not a characteristic value")]
    NotCharacteristicValue(u16),

    #[error("no service contains handle 0x{0:04X}")]
    ServiceNotFound(u16),
}
