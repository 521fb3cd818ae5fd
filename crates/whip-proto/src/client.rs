//! The client protocol: 37-byte request and response headers, each followed
//! by `data_len` payload bytes.

use crate::id::ASSET_ID_LEN;
use crate::{AssetId, ProtocolError};

pub const REQUEST_HEADER_SIZE: usize = 37;
pub const RESPONSE_HEADER_SIZE: usize = 37;

const DATA_LEN_OFFSET: usize = 1 + ASSET_ID_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Get = 10,
    Put = 11,
    Purge = 12,
    Test = 13,
    PurgeLocals = 14,
    StatusGet = 15,
    StoredAssetIdsGet = 16,
    GetDontCache = 17,
}

impl RequestType {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            10 => Ok(RequestType::Get),
            11 => Ok(RequestType::Put),
            12 => Ok(RequestType::Purge),
            13 => Ok(RequestType::Test),
            14 => Ok(RequestType::PurgeLocals),
            15 => Ok(RequestType::StatusGet),
            16 => Ok(RequestType::StoredAssetIdsGet),
            17 => Ok(RequestType::GetDontCache),
            other => Err(ProtocolError::InvalidRequestType(other)),
        }
    }
}

/// A parsed request header. The id field is kept raw: several request kinds
/// (status, purge-locals) ignore it, and stored-ids requests use only its
/// leading shard prefix, so per-operation handlers decide how strictly to
/// interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: RequestType,
    uuid: [u8; ASSET_ID_LEN],
    pub data_len: u32,
}

impl RequestHeader {
    pub fn new(kind: RequestType, id: AssetId, data_len: u32) -> Self {
        RequestHeader {
            kind,
            uuid: *id.as_bytes(),
            data_len,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != REQUEST_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let kind = RequestType::from_byte(buf[0])?;
        let mut uuid = [0u8; ASSET_ID_LEN];
        uuid.copy_from_slice(&buf[1..DATA_LEN_OFFSET]);
        let data_len = u32::from_be_bytes(
            buf[DATA_LEN_OFFSET..REQUEST_HEADER_SIZE]
                .try_into()
                .expect("slice length is 4"),
        );
        Ok(RequestHeader {
            kind,
            uuid,
            data_len,
        })
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1..DATA_LEN_OFFSET].copy_from_slice(&self.uuid);
        buf[DATA_LEN_OFFSET..].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    /// The id field as a validated asset id.
    pub fn asset_id(&self) -> Result<AssetId, ProtocolError> {
        AssetId::parse(&self.uuid)
    }

    /// The raw id field, for error messages about invalid ids.
    pub fn uuid_lossy(&self) -> String {
        String::from_utf8_lossy(&self.uuid).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Found = 10,
    NotFound = 11,
    Error = 12,
    Ok = 13,
}

impl ResponseCode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            10 => Ok(ResponseCode::Found),
            11 => Ok(ResponseCode::NotFound),
            12 => Ok(ResponseCode::Error),
            13 => Ok(ResponseCode::Ok),
            other => Err(ProtocolError::InvalidResponseCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: ResponseCode,
    uuid: [u8; ASSET_ID_LEN],
    pub data_len: u32,
}

impl ResponseHeader {
    pub fn new(code: ResponseCode, id: AssetId, data_len: u32) -> Self {
        ResponseHeader {
            code,
            uuid: *id.as_bytes(),
            data_len,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != RESPONSE_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        let code = ResponseCode::from_byte(buf[0])?;
        let mut uuid = [0u8; ASSET_ID_LEN];
        uuid.copy_from_slice(&buf[1..DATA_LEN_OFFSET]);
        let data_len = u32::from_be_bytes(
            buf[DATA_LEN_OFFSET..RESPONSE_HEADER_SIZE]
                .try_into()
                .expect("slice length is 4"),
        );
        Ok(ResponseHeader {
            code,
            uuid,
            data_len,
        })
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[0] = self.code as u8;
        buf[1..DATA_LEN_OFFSET].copy_from_slice(&self.uuid);
        buf[DATA_LEN_OFFSET..].copy_from_slice(&self.data_len.to_be_bytes());
        buf
    }

    pub fn asset_id(&self) -> Result<AssetId, ProtocolError> {
        AssetId::parse(&self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> AssetId {
        "0123456789abcdef0123456789abcdef".parse().unwrap()
    }

    #[test]
    fn request_header_round_trips() {
        let header = RequestHeader::new(RequestType::Put, id(), 100);
        let encoded = header.encode();
        assert_eq!(encoded[0], 11);
        assert_eq!(&encoded[1..33], id().as_bytes());
        assert_eq!(&encoded[33..], &[0, 0, 0, 100]);

        let parsed = RequestHeader::parse(&encoded).unwrap();
        assert_eq!(parsed.kind, RequestType::Put);
        assert_eq!(parsed.asset_id().unwrap(), id());
        assert_eq!(parsed.data_len, 100);
    }

    #[test]
    fn request_data_len_is_big_endian() {
        let header = RequestHeader::new(RequestType::Put, id(), 0x01020304);
        assert_eq!(&header.encode()[33..], &[1, 2, 3, 4]);
    }

    #[test]
    fn all_request_types_round_trip() {
        for byte in 10u8..=17 {
            let kind = RequestType::from_byte(byte).unwrap();
            assert_eq!(kind as u8, byte);
            let header = RequestHeader::new(kind, AssetId::NULL, 0);
            assert_eq!(RequestHeader::parse(&header.encode()).unwrap().kind, kind);
        }
    }

    #[test]
    fn unknown_request_type_rejected() {
        let mut buf = RequestHeader::new(RequestType::Get, id(), 0).encode();
        buf[0] = 9;
        assert_eq!(
            RequestHeader::parse(&buf),
            Err(ProtocolError::InvalidRequestType(9))
        );
        buf[0] = 18;
        assert_eq!(
            RequestHeader::parse(&buf),
            Err(ProtocolError::InvalidRequestType(18))
        );
    }

    #[test]
    fn header_with_invalid_id_parses_but_id_fails() {
        let mut buf = RequestHeader::new(RequestType::StatusGet, id(), 0).encode();
        buf[1..33].copy_from_slice(&[b'X'; 32]);
        let parsed = RequestHeader::parse(&buf).unwrap();
        assert_eq!(parsed.kind, RequestType::StatusGet);
        assert!(parsed.asset_id().is_err());
    }

    #[test]
    fn response_header_round_trips() {
        for (code, byte) in [
            (ResponseCode::Found, 10u8),
            (ResponseCode::NotFound, 11),
            (ResponseCode::Error, 12),
            (ResponseCode::Ok, 13),
        ] {
            let header = ResponseHeader::new(code, id(), 42);
            let encoded = header.encode();
            assert_eq!(encoded[0], byte);

            let parsed = ResponseHeader::parse(&encoded).unwrap();
            assert_eq!(parsed.code, code);
            assert_eq!(parsed.asset_id().unwrap(), id());
            assert_eq!(parsed.data_len, 42);
        }
    }

    #[test]
    fn unknown_response_code_rejected() {
        let mut buf = ResponseHeader::new(ResponseCode::Ok, id(), 0).encode();
        buf[0] = 14;
        assert_eq!(
            ResponseHeader::parse(&buf),
            Err(ProtocolError::InvalidResponseCode(14))
        );
    }
}
