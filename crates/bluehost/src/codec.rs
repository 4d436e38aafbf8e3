//! Wire primitives shared by the ATT PDU parsers and builders.
//!
//! All ATT integers are little-endian; handles are `u16`; UUID fields are
//! either 2 or 16 bytes depending on how much of the PDU remains.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::uuid::Uuid;

/// Errors produced by the wire codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("PDU truncated")]
    TruncatedPdu,
    #[error("invalid field format")]
    InvalidFormat,
}

/// A read cursor over an inbound PDU body.
pub struct PduReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> PduReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PduReader {
            cursor: Cursor::new(data),
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        let data = self.cursor.get_ref();
        data.len() - self.cursor.position() as usize
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8().map_err(|_| CodecError::TruncatedPdu)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| CodecError::TruncatedPdu)
    }

    /// Reads an attribute handle (same encoding as `u16`).
    pub fn read_handle(&mut self) -> Result<u16, CodecError> {
        self.read_u16()
    }

    /// Reads a UUID occupying the entire remainder of the PDU.
    ///
    /// ATT requests carry the UUID last, so its width is implied by how many
    /// bytes are left: 2 for a 16-bit UUID, 16 for a 128-bit one.
    pub fn read_trailing_uuid(&mut self) -> Result<Uuid, CodecError> {
        let rest = self.read_rest();
        Uuid::try_from_slice_le(&rest).ok_or(CodecError::InvalidFormat)
    }

    /// Consumes and returns all remaining bytes (the common "rest of the PDU
    /// is the value" pattern).
    pub fn read_rest(&mut self) -> Vec<u8> {
        let pos = self.cursor.position() as usize;
        let data = self.cursor.get_ref();
        let rest = data[pos..].to_vec();
        self.cursor.set_position(data.len() as u64);
        rest
    }
}

/// Appends a `u16` in little-endian order.
pub fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Appends an attribute handle.
pub fn put_handle(out: &mut Vec<u8>, handle: u16) {
    put_u16(out, handle);
}

/// Appends a UUID in its wire form (2 or 16 bytes, little-endian).
pub fn put_uuid(out: &mut Vec<u8>, uuid: &Uuid) {
    out.extend_from_slice(&uuid.wire_bytes());
}
