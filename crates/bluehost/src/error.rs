//! Crate-level error type.
//!
//! Most APIs return their own focused error enums; this umbrella exists for
//! applications that want one `?`-able type across the whole library.

use thiserror::Error;

use crate::att::{DbError, ServerError};
use crate::codec::CodecError;
use crate::gap::BdAddrParseError;
use crate::scan::ScanError;
use crate::transport::TransportError;
use crate::uuid::UuidParseError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Uuid(#[from] UuidParseError),

    #[error(transparent)]
    Address(#[from] BdAddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
