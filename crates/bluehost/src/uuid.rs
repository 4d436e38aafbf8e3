use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A Bluetooth UUID.
///
/// Internally every UUID is stored as its full 128-bit form in little-endian
/// byte order, which is the order ATT PDUs carry on the wire. A 16-bit
/// SIG-assigned UUID is the base UUID `0000xxxx-0000-1000-8000-00805F9B34FB`
/// with `xxxx` substituted, so equality across the short and long form of the
/// same value falls out of plain byte comparison.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// The Bluetooth base UUID, little-endian.
const BASE_UUID_BYTES: [u8; 16] = [
    0xFB, 0x34, 0x9B, 0x5F, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Offset of the 16/32-bit short value within the base UUID.
const BASE_OFFSET: usize = 12;

impl Uuid {
    /// Creates a UUID from 16 little-endian bytes (wire order).
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    /// Creates a UUID from 16 big-endian bytes (the order of the canonical
    /// hyphenated text form).
    pub fn from_bytes_be(mut bytes: [u8; 16]) -> Self {
        bytes.reverse();
        Uuid { bytes }
    }

    /// Creates a UUID from a 16-bit SIG-assigned value.
    pub const fn from_u16(uuid16: u16) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid16 as u8;
        bytes[BASE_OFFSET + 1] = (uuid16 >> 8) as u8;
        Uuid { bytes }
    }

    /// Creates a UUID from a 32-bit SIG-assigned value.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        bytes[BASE_OFFSET] = uuid32 as u8;
        bytes[BASE_OFFSET + 1] = (uuid32 >> 8) as u8;
        bytes[BASE_OFFSET + 2] = (uuid32 >> 16) as u8;
        bytes[BASE_OFFSET + 3] = (uuid32 >> 24) as u8;
        Uuid { bytes }
    }

    /// Builds a UUID from a little-endian byte slice as found in ATT PDUs.
    ///
    /// Accepts 2 bytes (16-bit), 4 bytes (32-bit) or 16 bytes (128-bit).
    pub fn try_from_slice_le(slice: &[u8]) -> Option<Self> {
        match slice.len() {
            2 => Some(Uuid::from_u16(u16::from_le_bytes([slice[0], slice[1]]))),
            4 => Some(Uuid::from_u32(u32::from_le_bytes([
                slice[0], slice[1], slice[2], slice[3],
            ]))),
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(slice);
                Some(Uuid::from_bytes_le(bytes))
            }
            _ => None,
        }
    }

    /// The 16 underlying bytes, little-endian.
    pub const fn as_bytes_le(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// The 16 underlying bytes, big-endian.
    pub fn as_bytes_be(&self) -> [u8; 16] {
        let mut bytes = self.bytes;
        bytes.reverse();
        bytes
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[0..BASE_OFFSET] == BASE_UUID_BYTES[0..BASE_OFFSET]
    }

    /// Returns the short 16-bit form if this UUID has one.
    pub fn as_u16(&self) -> Option<u16> {
        if self.is_sig_assigned()
            && self.bytes[BASE_OFFSET + 2] == 0
            && self.bytes[BASE_OFFSET + 3] == 0
        {
            Some(u16::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
            ]))
        } else {
            None
        }
    }

    /// Returns the short 32-bit form if this UUID has one.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_le_bytes([
                self.bytes[BASE_OFFSET],
                self.bytes[BASE_OFFSET + 1],
                self.bytes[BASE_OFFSET + 2],
                self.bytes[BASE_OFFSET + 3],
            ]))
        } else {
            None
        }
    }

    /// True if this UUID goes on the wire as 2 bytes rather than 16.
    pub fn is_short(&self) -> bool {
        self.as_u16().is_some()
    }

    /// The wire representation used inside ATT PDUs: 2 little-endian bytes
    /// for a 16-bit UUID, 16 little-endian bytes otherwise.
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self.as_u16() {
            Some(u) => u.to_le_bytes().to_vec(),
            None => self.bytes.to_vec(),
        }
    }

    /// Wire size in bytes (2 or 16).
    pub fn wire_len(&self) -> usize {
        if self.is_short() {
            2
        } else {
            16
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl From<[u8; 16]> for Uuid {
    /// Bytes are taken in little-endian (wire) order.
    fn from(bytes: [u8; 16]) -> Self {
        Uuid::from_bytes_le(bytes)
    }
}

impl PartialEq<u16> for Uuid {
    fn eq(&self, other: &u16) -> bool {
        self.as_u16() == Some(*other)
    }
}

impl PartialEq<Uuid> for u16 {
    fn eq(&self, other: &Uuid) -> bool {
        other.as_u16() == Some(*self)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.as_bytes_be();
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(u) = self.as_u16() {
            write!(f, "Uuid(0x{:04X})", u)
        } else if let Some(u) = self.as_u32() {
            write!(f, "Uuid(0x{:08X})", u)
        } else {
            fmt::Display::fmt(self, f)
        }
    }
}

/// Errors from parsing a UUID out of text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UuidParseError {
    #[error("UUID text has invalid length")]
    InvalidLength,
    #[error("UUID text has invalid format")]
    InvalidFormat,
}

impl From<hex::FromHexError> for UuidParseError {
    fn from(_: hex::FromHexError) -> Self {
        UuidParseError::InvalidFormat
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Parses `"180F"` (16-bit), `"0000180A"` (32-bit) and the 128-bit form
    /// with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(UuidParseError::InvalidFormat);
        }

        let cleaned: String = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        match cleaned.len() {
            4 => {
                let val =
                    u16::from_str_radix(&cleaned, 16).map_err(|_| UuidParseError::InvalidFormat)?;
                Ok(Uuid::from_u16(val))
            }
            8 => {
                let val =
                    u32::from_str_radix(&cleaned, 16).map_err(|_| UuidParseError::InvalidFormat)?;
                Ok(Uuid::from_u32(val))
            }
            32 => {
                let mut bytes_be = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes_be)?;
                Ok(Uuid::from_bytes_be(bytes_be))
            }
            _ => Err(UuidParseError::InvalidLength),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms_compare_equal() {
        let short = Uuid::from_u16(0x180F);
        let long: Uuid = "0000180f-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(short, long);
        assert_eq!(long, short);
        assert_eq!(long.as_u16(), Some(0x180F));
    }

    #[test]
    fn parse_short_text() {
        let u: Uuid = "180F".parse().unwrap();
        assert_eq!(u, 0x180Fu16);
        assert!(u.is_short());
    }

    #[test]
    fn parse_full_text_round_trips_through_display() {
        let text = "12345678-1234-5678-1234-56789abcdef0";
        let u: Uuid = text.parse().unwrap();
        assert_eq!(u.to_string(), text);
        assert_eq!(u.as_u16(), None);
        assert!(!u.is_short());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("18".parse::<Uuid>(), Err(UuidParseError::InvalidLength));
        assert_eq!("18zz".parse::<Uuid>(), Err(UuidParseError::InvalidFormat));
        assert_eq!(
            "12345678-1234-5678-1234-56789abcdef0ff".parse::<Uuid>(),
            Err(UuidParseError::InvalidLength)
        );
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        assert_eq!(Uuid::from_u16(0x2800).wire_bytes(), vec![0x00, 0x28]);

        let u: Uuid = "12345678-1234-5678-1234-56789abcdef0".parse().unwrap();
        let wire = u.wire_bytes();
        assert_eq!(wire.len(), 16);
        // Wire order is the reverse of the text order.
        assert_eq!(wire[15], 0x12);
        assert_eq!(wire[0], 0xF0);
    }

    #[test]
    fn slice_round_trip() {
        let u = Uuid::from_u16(0x2A19);
        let again = Uuid::try_from_slice_le(&u.wire_bytes()).unwrap();
        assert_eq!(u, again);
        assert_eq!(Uuid::try_from_slice_le(&[1, 2, 3]), None);
    }
}
