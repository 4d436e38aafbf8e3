use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Device address type as carried in HCI advertising reports and L2CAP
/// socket addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => AddressType::Random,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => 0x00,
            AddressType::Random => 0x01,
        }
    }
}

/// A 48-bit Bluetooth device address.
///
/// Stored in the little-endian byte order used on the wire; `Display` and
/// `FromStr` use the conventional colon-separated big-endian text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const ANY: BdAddr = BdAddr { bytes: [0; 6] };

    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    /// Builds an address from the first 6 bytes of a wire buffer.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Marks the address as static random by setting the top two bits.
    pub fn into_static_random(mut self) -> Self {
        self.bytes[5] |= 0xC0;
        self
    }
}

/// Error from parsing a textual device address.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid Bluetooth address")]
pub struct BdAddrParseError;

impl FromStr for BdAddr {
    type Err = BdAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(BdAddrParseError);
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(BdAddrParseError);
            }
            // Text is big-endian, storage is wire (little-endian) order.
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| BdAddrParseError)?;
        }
        Ok(BdAddr { bytes })
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}
