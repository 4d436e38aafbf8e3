//! bluehost - a Bluetooth Low Energy host library
//!
//! Implements both sides of the Attribute Protocol (ATT) and the Generic
//! Attribute Profile (GATT): an attribute database with automatic CCCD
//! handling, a server engine dispatching the ATT request opcodes with
//! per-connection MTU and permission rules, a scanner with advertising
//! report parsing, and a transport abstraction with two backends — a kernel
//! HCI/L2CAP socket stack and an integrated stack driven through a
//! character-device ioctl interface.

pub mod att;
pub mod codec;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod scan;
pub mod transport;
pub mod uuid;

// Re-export the types most applications touch.
pub use att::{AttErrorCode, AttributeDatabase, GattServer, ServerConfig, ServerError};
pub use error::Error;
pub use gap::{AddressType, BdAddr};
pub use gatt::{CharacteristicDef, DescriptorDef, ServiceDef};
pub use scan::{AdvertisingReport, FilterDuplicates, Scanner};
pub use transport::{
    AdvertisingParams, ClientTransport, ConnId, ConnectParams, ScanParams, ServerTransport,
    Timeout, TransportError,
};
pub use uuid::Uuid;
