//! GAP-level types: device addresses and address types.

mod types;

pub use types::{AddressType, BdAddr, BdAddrParseError};
