//! Typed ATT PDUs.
//!
//! Each request the server handles has a `parse` that takes the complete PDU
//! (opcode byte included); each response has a `serialize` producing the
//! complete PDU. Packing responses against the connection MTU is the
//! dispatcher's job, so response types carry already-selected entries.

use crate::codec::{put_handle, put_u16, CodecError, PduReader};
use crate::uuid::Uuid;

use super::constants::*;
use super::error::AttErrorCode;

fn expect_opcode(data: &[u8], opcode: u8) -> Result<PduReader<'_>, CodecError> {
    let mut reader = PduReader::new(data);
    if reader.read_u8()? != opcode {
        return Err(CodecError::InvalidFormat);
    }
    Ok(reader)
}

/// Error Response: `[0x01][request opcode][handle][error code]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_opcode: u8,
    pub handle: u16,
    pub error_code: AttErrorCode,
}

impl ErrorResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(ATT_ERROR_RSP);
        pdu.push(self.request_opcode);
        put_handle(&mut pdu, self.handle);
        pdu.push(self.error_code.into());
        pdu
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_ERROR_RSP)?;
        Ok(ErrorResponse {
            request_opcode: r.read_u8()?,
            handle: r.read_handle()?,
            error_code: AttErrorCode::from(r.read_u8()?),
        })
    }
}

/// Exchange MTU Request: `[0x02][client MTU]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeMtuRequest {
    pub client_mtu: u16,
}

impl ExchangeMtuRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_EXCHANGE_MTU_REQ)?;
        Ok(ExchangeMtuRequest {
            client_mtu: r.read_u16()?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3);
        pdu.push(ATT_EXCHANGE_MTU_REQ);
        put_u16(&mut pdu, self.client_mtu);
        pdu
    }
}

/// Exchange MTU Response: `[0x03][server MTU]`.
#[derive(Debug, Clone)]
pub struct ExchangeMtuResponse {
    pub server_mtu: u16,
}

impl ExchangeMtuResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3);
        pdu.push(ATT_EXCHANGE_MTU_RSP);
        put_u16(&mut pdu, self.server_mtu);
        pdu
    }
}

/// Find Information Request: `[0x04][start][end]`.
#[derive(Debug, Clone)]
pub struct FindInformationRequest {
    pub start_handle: u16,
    pub end_handle: u16,
}

impl FindInformationRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_FIND_INFO_REQ)?;
        Ok(FindInformationRequest {
            start_handle: r.read_handle()?,
            end_handle: r.read_handle()?,
        })
    }
}

/// One `[handle][type]` entry of a Find Information Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTypePair {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Find Information Response: `[0x05][format][pairs…]`.
///
/// All pairs share one format; the dispatcher guarantees that before
/// constructing the response.
#[derive(Debug, Clone)]
pub struct FindInformationResponse {
    pub format: u8,
    pub pairs: Vec<HandleTypePair>,
}

impl FindInformationResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::new();
        pdu.push(ATT_FIND_INFO_RSP);
        pdu.push(self.format);
        for pair in &self.pairs {
            put_handle(&mut pdu, pair.handle);
            if self.format == ATT_FIND_INFO_FORMAT_16BIT {
                put_u16(&mut pdu, pair.uuid.as_u16().unwrap_or(0));
            } else {
                pdu.extend_from_slice(pair.uuid.as_bytes_le());
            }
        }
        pdu
    }
}

/// Find By Type Value Request: `[0x06][start][end][type16][value…]`.
#[derive(Debug, Clone)]
pub struct FindByTypeValueRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: u16,
    pub attribute_value: Vec<u8>,
}

impl FindByTypeValueRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_FIND_BY_TYPE_VALUE_REQ)?;
        Ok(FindByTypeValueRequest {
            start_handle: r.read_handle()?,
            end_handle: r.read_handle()?,
            attribute_type: r.read_u16()?,
            attribute_value: r.read_rest(),
        })
    }
}

/// One `[found handle][group end handle]` entry of a Find By Type Value
/// Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRange {
    pub found_handle: u16,
    pub group_end_handle: u16,
}

/// Find By Type Value Response: `[0x07][ranges…]`.
#[derive(Debug, Clone)]
pub struct FindByTypeValueResponse {
    pub handles: Vec<HandleRange>,
}

impl FindByTypeValueResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.handles.len() * 4);
        pdu.push(ATT_FIND_BY_TYPE_VALUE_RSP);
        for range in &self.handles {
            put_handle(&mut pdu, range.found_handle);
            put_handle(&mut pdu, range.group_end_handle);
        }
        pdu
    }
}

/// Read By Type Request: `[0x08][start][end][uuid 2|16]`.
///
/// Total PDU length 7 or 21 distinguishes the UUID width.
#[derive(Debug, Clone)]
pub struct ReadByTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: Uuid,
}

impl ReadByTypeRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 7 && data.len() != 21 {
            return Err(CodecError::TruncatedPdu);
        }
        let mut r = expect_opcode(data, ATT_READ_BY_TYPE_REQ)?;
        Ok(ReadByTypeRequest {
            start_handle: r.read_handle()?,
            end_handle: r.read_handle()?,
            attribute_type: r.read_trailing_uuid()?,
        })
    }
}

/// One `[handle][value]` entry of a Read By Type Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValue {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Read By Type Response: `[0x09][pair length][pairs…]`.
#[derive(Debug, Clone)]
pub struct ReadByTypeResponse {
    pub pair_length: u8,
    pub pairs: Vec<HandleValue>,
}

impl ReadByTypeResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::new();
        pdu.push(ATT_READ_BY_TYPE_RSP);
        pdu.push(self.pair_length);
        for pair in &self.pairs {
            put_handle(&mut pdu, pair.handle);
            pdu.extend_from_slice(&pair.value);
        }
        pdu
    }
}

/// Read Request: `[0x0A][handle]`.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub handle: u16,
}

impl ReadRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_READ_REQ)?;
        Ok(ReadRequest {
            handle: r.read_handle()?,
        })
    }
}

/// Read Response: `[0x0B][value…]`.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub value: Vec<u8>,
}

impl ReadResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.value.len());
        pdu.push(ATT_READ_RSP);
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

/// Read Blob Request: `[0x0C][handle][offset]`.
#[derive(Debug, Clone)]
pub struct ReadBlobRequest {
    pub handle: u16,
    pub offset: u16,
}

impl ReadBlobRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_READ_BLOB_REQ)?;
        Ok(ReadBlobRequest {
            handle: r.read_handle()?,
            offset: r.read_u16()?,
        })
    }
}

/// Read Blob Response: `[0x0D][value part…]`.
#[derive(Debug, Clone)]
pub struct ReadBlobResponse {
    pub value: Vec<u8>,
}

impl ReadBlobResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.value.len());
        pdu.push(ATT_READ_BLOB_RSP);
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

/// Read By Group Type Request: `[0x10][start][end][uuid 2|16]`.
#[derive(Debug, Clone)]
pub struct ReadByGroupTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub group_type: Uuid,
}

impl ReadByGroupTypeRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != 7 && data.len() != 21 {
            return Err(CodecError::TruncatedPdu);
        }
        let mut r = expect_opcode(data, ATT_READ_BY_GROUP_TYPE_REQ)?;
        Ok(ReadByGroupTypeRequest {
            start_handle: r.read_handle()?,
            end_handle: r.read_handle()?,
            group_type: r.read_trailing_uuid()?,
        })
    }
}

/// One `[handle][end group handle][value]` entry of a Read By Group Type
/// Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupData {
    pub handle: u16,
    pub end_group_handle: u16,
    pub value: Vec<u8>,
}

/// Read By Group Type Response: `[0x11][pair length][entries…]`.
#[derive(Debug, Clone)]
pub struct ReadByGroupTypeResponse {
    pub pair_length: u8,
    pub groups: Vec<GroupData>,
}

impl ReadByGroupTypeResponse {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::new();
        pdu.push(ATT_READ_BY_GROUP_TYPE_RSP);
        pdu.push(self.pair_length);
        for group in &self.groups {
            put_handle(&mut pdu, group.handle);
            put_handle(&mut pdu, group.end_group_handle);
            pdu.extend_from_slice(&group.value);
        }
        pdu
    }
}

/// Write Request: `[0x12][handle][value…]`.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl WriteRequest {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_WRITE_REQ)?;
        Ok(WriteRequest {
            handle: r.read_handle()?,
            value: r.read_rest(),
        })
    }
}

/// Write Response: `[0x13]`.
#[derive(Debug, Clone)]
pub struct WriteResponse;

impl WriteResponse {
    pub fn serialize(&self) -> Vec<u8> {
        vec![ATT_WRITE_RSP]
    }
}

/// Write Command: `[0x52][handle][value…]`. No response.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl WriteCommand {
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_WRITE_CMD)?;
        Ok(WriteCommand {
            handle: r.read_handle()?,
            value: r.read_rest(),
        })
    }
}

/// Handle Value Notification: `[0x1B][handle][value…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueNotification {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl HandleValueNotification {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(ATT_HANDLE_VALUE_NTF);
        put_handle(&mut pdu, self.handle);
        pdu.extend_from_slice(&self.value);
        pdu
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_HANDLE_VALUE_NTF)?;
        Ok(HandleValueNotification {
            handle: r.read_handle()?,
            value: r.read_rest(),
        })
    }
}

/// Handle Value Indication: `[0x1D][handle][value…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueIndication {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl HandleValueIndication {
    pub fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(ATT_HANDLE_VALUE_IND);
        put_handle(&mut pdu, self.handle);
        pdu.extend_from_slice(&self.value);
        pdu
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = expect_opcode(data, ATT_HANDLE_VALUE_IND)?;
        Ok(HandleValueIndication {
            handle: r.read_handle()?,
            value: r.read_rest(),
        })
    }
}
