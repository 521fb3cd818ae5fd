use whip_proto::AssetId;

/// Errors surfaced by the storage engine.
///
/// The split that matters operationally is [`StorageError::is_critical`]:
/// critical errors mean the disk or an index is damaged and are logged at
/// error level, while non-critical ones (asset absent, duplicate store, bad
/// input) are ordinary protocol outcomes.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("asset {0} not found")]
    NotFound(AssetId),

    #[error("unable to store asset {0}, asset already exists")]
    AlreadyExists(AssetId),

    #[error("malformed asset: {0}")]
    MalformedAsset(String),

    #[error("asset {0} exceeds the 4 GiB record limit")]
    TooLarge(AssetId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index file error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("data file corrupt: {0}")]
    Corrupt(String),

    #[error("storage worker is not running")]
    WorkerGone,
}

impl StorageError {
    pub fn is_critical(&self) -> bool {
        match self {
            StorageError::NotFound(_)
            | StorageError::AlreadyExists(_)
            | StorageError::MalformedAsset(_) => false,
            StorageError::TooLarge(_)
            | StorageError::Io(_)
            | StorageError::Index(_)
            | StorageError::Corrupt(_)
            | StorageError::WorkerGone => true,
        }
    }
}
