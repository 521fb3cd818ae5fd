use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;

use crate::{Asset, StorageError};

/// Magic header opening every data file.
pub const DATA_FILE_MAGIC: &[u8; 8] = b"IWZDDB01";

/// An append-only record file. Records are `[u32 BE length][length bytes]`
/// and are never rewritten; readers address them by the byte offset of the
/// length prefix, which the index file remembers.
pub struct DataFile {
    path: PathBuf,
}

impl DataFile {
    pub fn new(path: PathBuf) -> Self {
        DataFile { path }
    }

    /// Reads the record whose length prefix starts at `position`.
    pub fn read_at(&self, position: u64) -> Result<Bytes, StorageError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(position))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf).map_err(|err| {
            StorageError::Corrupt(format!(
                "short read of record length at {position} in {}: {err}",
                self.path.display()
            ))
        })?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data).map_err(|err| {
            StorageError::Corrupt(format!(
                "short read of {len}-byte record at {position} in {}: {err}",
                self.path.display()
            ))
        })?;
        Ok(Bytes::from(data))
    }

    /// Appends `asset` as a new record, creating the file (with its magic
    /// header) if needed. Returns the record's position for the index.
    pub fn append(&self, asset: &Asset) -> Result<u64, StorageError> {
        let len = u32::try_from(asset.len())
            .map_err(|_| StorageError::TooLarge(asset.id()))?;

        let existed = self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;

        let position = if existed {
            file.seek(SeekFrom::End(0))?
        } else {
            file.write_all(DATA_FILE_MAGIC)?;
            DATA_FILE_MAGIC.len() as u64
        };

        file.write_all(&len.to_be_bytes())?;
        file.write_all(asset.data())?;
        file.flush()?;
        Ok(position)
    }
}
