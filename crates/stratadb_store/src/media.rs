//! Log media: the opaque byte stores the engine writes to.
//!
//! A [`LogMedia`] is a flat, append-oriented byte store. The engine owns all
//! format interpretation; media implementations never see record structure.

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A flat byte store backing the write-ahead log and snapshot files.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at
/// - `read_at` returns exactly the bytes previously written there
/// - after `sync` returns, all appended data survives process termination
pub trait LogMedia: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Appends data, returning the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Pushes buffered writes to the OS.
    fn flush(&mut self) -> StoreResult<()>;

    /// Ensures all data and metadata are durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Returns the current size in bytes.
    fn len(&self) -> StoreResult<u64>;

    /// Returns true if the media holds no bytes.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates to `new_size` bytes. Used for log truncation after a
    /// checkpoint.
    fn truncate(&mut self, new_size: u64) -> StoreResult<()>;
}

/// In-memory log media for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryMedia {
    data: RwLock<Vec<u8>>,
}

impl MemoryMedia {
    /// Creates empty in-memory media.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the stored bytes. Useful in tests.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogMedia for MemoryMedia {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if offset > size || end > data.len() {
            return Err(StoreError::ReadPastEnd { offset, len, size });
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StoreResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn len(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        let mut data = self.data.write();
        if new_size > data.len() as u64 {
            return Err(StoreError::invalid_format(format!(
                "cannot truncate to {} beyond current size {}",
                new_size,
                data.len()
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

/// File-backed log media for persistent stores.
#[derive(Debug)]
pub struct FileMedia {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileMedia {
    /// Opens or creates file media at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogMedia for FileMedia {
    fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let size = *self.size.read();
        if offset > size || offset.saturating_add(len as u64) > size {
            return Err(StoreError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }
        let mut file = self.file.write();
        let mut size = self.size.write();
        let offset = *size;
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        *size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.write().sync_all()?;
        Ok(())
    }

    fn len(&self) -> StoreResult<u64> {
        Ok(*self.size.read())
    }

    fn truncate(&mut self, new_size: u64) -> StoreResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();
        if new_size > *size {
            return Err(StoreError::invalid_format(format!(
                "cannot truncate to {} beyond current size {}",
                new_size, *size
            )));
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}
