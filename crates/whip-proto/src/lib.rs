//! Wire protocol for the WHIP asset server.
//!
//! Three message families share a socket-level vocabulary of fixed-layout,
//! big-endian frames:
//!
//! * the authentication handshake (challenge / response / status),
//! * the client protocol (37-byte request and response headers followed by
//!   an optional payload),
//! * the intramesh protocol (fixed 38-byte query / response / heartbeat
//!   messages exchanged between peer servers).
//!
//! Everything here is pure byte manipulation; sockets and framing loops live
//! in the server crate.

pub mod auth;
pub mod client;
pub mod mesh;

mod id;
pub use id::{is_valid_asset_id, AssetId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid asset id")]
    InvalidAssetId,

    #[error("invalid request type {0}")]
    InvalidRequestType(u8),

    #[error("invalid response code {0}")]
    InvalidResponseCode(u8),

    #[error("invalid intramesh message type {0}")]
    InvalidMeshType(u8),

    #[error("invalid intramesh query result {0}")]
    InvalidQueryResult(u8),

    #[error("invalid auth message")]
    InvalidAuthMessage,

    #[error("message truncated")]
    Truncated,
}
