//! Attribute Protocol (ATT) implementation: wire constants, PDU types, the
//! attribute database and the server engine.

pub mod constants;
pub mod database;
pub mod error;
pub mod pdu;
pub mod server;

#[cfg(test)]
mod tests;

pub use self::constants::*;
pub use self::database::{
    Attribute, AttributeDatabase, AttributeKind, ReadCallback, WriteCallback,
};
pub use self::error::{AttErrorCode, DbError, ServerError};
pub use self::server::{ConnectionState, GattServer, ServerConfig};
