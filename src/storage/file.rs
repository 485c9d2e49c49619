use crate::errors::DbError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Raw file storage: append and positional I/O with explicit flush and
/// durable-sync. All access is serialized on one mutex so an append can
/// never interleave with a positional write.
pub struct FileStorage {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileStorage {
    /// Open (or create) the backing file for read/write without truncating.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        Ok(Self { file: Mutex::new(file), path: path.to_path_buf() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `data` at end-of-file; returns the offset the bytes landed at.
    /// On a partial write the file is truncated back to its prior length so
    /// the caller observes all-or-nothing.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn append(&self, data: &[u8]) -> Result<u64, DbError> {
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        if let Err(e) = file.write_all(data) {
            let _ = file.set_len(offset);
            return Err(e.into());
        }
        Ok(offset)
    }

    /// Write `data` at `offset`, extending the file if needed.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DbError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`. A read past end-of-file returns
    /// the available prefix (possibly empty).
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read exactly `len` bytes at `offset`.
    ///
    /// # Errors
    /// `Io` with `UnexpectedEof` if fewer than `len` bytes are available.
    pub fn read_exact_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Push buffered writes to the OS.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn flush(&self) -> Result<(), DbError> {
        self.file.lock().flush()?;
        Ok(())
    }

    /// Force written data to durable media. A durability-critical write is
    /// not considered durable until this returns Ok.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn sync(&self) -> Result<(), DbError> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Shrink (or grow) the file to `len` bytes.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn truncate(&self, len: u64) -> Result<(), DbError> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    /// Authoritative end-of-file position.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn len(&self) -> Result<u64, DbError> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }
}
