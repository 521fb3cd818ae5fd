use bytes::Bytes;
use whip_proto::AssetId;

use crate::StorageError;

/// Byte offset of the asset type within the buffer.
const TYPE_OFFSET: usize = 32;
/// Byte offset of the locality flag.
const LOCAL_FLAG_OFFSET: usize = 33;
/// Minimum size of a well-formed asset: id + type + locality flag.
pub const HEADER_SIZE: usize = 34;

/// An immutable asset, exactly as it travels on the wire and sits in a data
/// file: a 32-character hex id, one type byte, one locality byte, then the
/// opaque payload. The buffer is shared (`Bytes`), so clones handed to the
/// cache, the disk worker and replication all reference the same storage.
#[derive(Clone)]
pub struct Asset {
    id: AssetId,
    data: Bytes,
}

impl Asset {
    /// Validates and wraps a raw buffer. The embedded id must be 32
    /// lowercase hex characters and the buffer must include the full
    /// 34-byte header.
    pub fn from_bytes(data: Bytes) -> Result<Self, StorageError> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::MalformedAsset(format!(
                "buffer of {} bytes is shorter than the {HEADER_SIZE}-byte asset header",
                data.len()
            )));
        }
        let id = AssetId::parse(&data[..TYPE_OFFSET]).map_err(|_| {
            StorageError::MalformedAsset(format!(
                "invalid asset id {:?}",
                String::from_utf8_lossy(&data[..TYPE_OFFSET])
            ))
        })?;
        Ok(Asset { id, data })
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    /// The asset type byte.
    pub fn kind(&self) -> u8 {
        self.data[TYPE_OFFSET]
    }

    /// Local assets are private to this node and never replicate.
    pub fn is_local(&self) -> bool {
        self.data[LOCAL_FLAG_OFFSET] == 1
    }

    /// Total size of the asset including its header.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The full backing buffer, header included.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Asset")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("local", &self.is_local())
            .field("len", &self.len())
            .finish()
    }
}
