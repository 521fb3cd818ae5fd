use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Length of an asset id on the wire: 32 lowercase hex characters.
pub const ASSET_ID_LEN: usize = 32;

/// Number of leading hex characters that select a storage shard.
pub const SHARD_PREFIX_LEN: usize = 3;

/// Returns true iff `s` is exactly 32 chars drawn from `[0-9a-f]`.
pub fn is_valid_asset_id(s: &str) -> bool {
    s.len() == ASSET_ID_LEN
        && s.bytes()
            .all(|ch| ch.is_ascii_digit() || (b'a'..=b'f').contains(&ch))
}

/// A validated asset id: the 32-character lowercase-hex rendering of a
/// 128-bit UUID, kept in its wire form so it can be spliced into headers
/// without re-encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId([u8; ASSET_ID_LEN]);

impl AssetId {
    /// The all-zeros id used by responses that carry no particular asset
    /// (status reports, purge acknowledgements).
    pub const NULL: AssetId = AssetId([b'0'; ASSET_ID_LEN]);

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != ASSET_ID_LEN {
            return Err(ProtocolError::InvalidAssetId);
        }
        if !bytes
            .iter()
            .all(|ch| ch.is_ascii_digit() || (b'a'..=b'f').contains(ch))
        {
            return Err(ProtocolError::InvalidAssetId);
        }
        let mut id = [0u8; ASSET_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(AssetId(id))
    }

    /// Builds the id used to address a whole shard: a hex prefix padded out
    /// to 32 characters with zeros.
    pub fn from_prefix(prefix: &str) -> Result<Self, ProtocolError> {
        if prefix.len() > ASSET_ID_LEN {
            return Err(ProtocolError::InvalidAssetId);
        }
        let mut id = [b'0'; ASSET_ID_LEN];
        id[..prefix.len()].copy_from_slice(prefix.as_bytes());
        Self::parse(&id)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("asset ids are ascii hex")
    }

    pub fn as_bytes(&self) -> &[u8; ASSET_ID_LEN] {
        &self.0
    }

    /// The first three hex characters, naming the shard directory.
    pub fn shard_prefix(&self) -> &str {
        &self.as_str()[..SHARD_PREFIX_LEN]
    }

    /// The compact 128-bit form, used by the in-memory existence index.
    pub fn to_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::try_parse_ascii(&self.0).expect("asset ids are valid uuids")
    }
}

impl FromStr for AssetId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self.as_str())
    }
}
