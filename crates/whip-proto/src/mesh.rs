//! The intramesh protocol: fixed 38-byte messages exchanged over the query
//! connections between peer servers.

use crate::id::ASSET_ID_LEN;
use crate::{AssetId, ProtocolError};

pub const MESSAGE_SIZE: usize = 38;

const TYPE_QUERY: u8 = 0;
const TYPE_RESPONSE: u8 = 1;
const TYPE_HEARTBEAT: u8 = 2;

const RESPONSE_RESULT_OFFSET: usize = 1 + ASSET_ID_LEN;

/// Capability flags carried by heartbeats.
pub mod flags {
    pub const ONLINE: u32 = 1 << 0;
    pub const READABLE: u32 = 1 << 1;
    pub const WRITABLE: u32 = 1 << 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    NotFound = 0,
    Found = 1,
    Error = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshMsg {
    /// Does the receiver hold this asset?
    Query { id: AssetId },
    /// Answer to a query.
    Response { id: AssetId, result: QueryResult },
    /// Periodic liveness + capability announcement.
    Heartbeat { flags: u32 },
}

impl MeshMsg {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != MESSAGE_SIZE {
            return Err(ProtocolError::Truncated);
        }
        match buf[0] {
            TYPE_QUERY => Ok(MeshMsg::Query {
                id: AssetId::parse(&buf[1..1 + ASSET_ID_LEN])?,
            }),
            TYPE_RESPONSE => {
                let id = AssetId::parse(&buf[1..1 + ASSET_ID_LEN])?;
                let result = match buf[RESPONSE_RESULT_OFFSET] {
                    0 => QueryResult::NotFound,
                    1 => QueryResult::Found,
                    2 => QueryResult::Error,
                    other => return Err(ProtocolError::InvalidQueryResult(other)),
                };
                Ok(MeshMsg::Response { id, result })
            }
            TYPE_HEARTBEAT => Ok(MeshMsg::Heartbeat {
                flags: u32::from_be_bytes(buf[1..5].try_into().expect("slice length is 4")),
            }),
            other => Err(ProtocolError::InvalidMeshType(other)),
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        match self {
            MeshMsg::Query { id } => {
                buf[0] = TYPE_QUERY;
                buf[1..1 + ASSET_ID_LEN].copy_from_slice(id.as_bytes());
            }
            MeshMsg::Response { id, result } => {
                buf[0] = TYPE_RESPONSE;
                buf[1..1 + ASSET_ID_LEN].copy_from_slice(id.as_bytes());
                buf[RESPONSE_RESULT_OFFSET] = *result as u8;
            }
            MeshMsg::Heartbeat { flags } => {
                buf[0] = TYPE_HEARTBEAT;
                buf[1..5].copy_from_slice(&flags.to_be_bytes());
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> AssetId {
        "fedcba9876543210fedcba9876543210".parse().unwrap()
    }

    #[test]
    fn query_round_trips() {
        let msg = MeshMsg::Query { id: id() };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), MESSAGE_SIZE);
        assert_eq!(encoded[0], 0);
        assert_eq!(&encoded[1..33], id().as_bytes());
        assert!(encoded[33..].iter().all(|&b| b == 0));
        assert_eq!(MeshMsg::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn response_round_trips() {
        for result in [QueryResult::NotFound, QueryResult::Found, QueryResult::Error] {
            let msg = MeshMsg::Response { id: id(), result };
            let encoded = msg.encode();
            assert_eq!(encoded[33], result as u8);
            assert_eq!(MeshMsg::parse(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn heartbeat_round_trips() {
        let all = flags::ONLINE | flags::READABLE | flags::WRITABLE;
        let msg = MeshMsg::Heartbeat { flags: all };
        let encoded = msg.encode();
        assert_eq!(&encoded[1..5], &[0, 0, 0, 7]);
        assert_eq!(MeshMsg::parse(&encoded).unwrap(), msg);
    }

    #[test]
    fn invalid_messages_rejected() {
        let mut buf = MeshMsg::Query { id: id() }.encode();
        buf[0] = 3;
        assert_eq!(MeshMsg::parse(&buf), Err(ProtocolError::InvalidMeshType(3)));

        let mut buf = MeshMsg::Query { id: id() }.encode();
        buf[5] = b'G';
        assert_eq!(MeshMsg::parse(&buf), Err(ProtocolError::InvalidAssetId));

        let mut buf = MeshMsg::Response {
            id: id(),
            result: QueryResult::Found,
        }
        .encode();
        buf[33] = 9;
        assert_eq!(
            MeshMsg::parse(&buf),
            Err(ProtocolError::InvalidQueryResult(9))
        );

        assert_eq!(
            MeshMsg::parse(&[0u8; 10]),
            Err(ProtocolError::Truncated)
        );
    }
}
