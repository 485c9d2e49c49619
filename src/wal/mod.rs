//! Write-ahead log.
//!
//! On disk the log is a sequence of framed records:
//! `u32 record_length (LE) | serialized entry` (see [`crate::codec::entry`]).
//! LSNs are assigned under a single-writer mutex, so on-disk order always
//! matches LSN order, and `append` acknowledges only after `fsync`.

use crate::codec::entry::{LogOp, LogRecord};
use crate::errors::DbError;
use crate::storage::FileStorage;
use crate::types::{Lsn, NO_PAGE};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Frames longer than this are rejected as corrupt and stop the scan.
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Transaction id stamped on synthetic checkpoint records.
pub const CHECKPOINT_TX_ID: &str = "CHECKPOINT";

#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub corrupt_frames_skipped: u64,
    pub file_bytes: u64,
}

pub struct Wal {
    storage: FileStorage,
    /// Serializes LSN assignment + append + fsync.
    writer: Mutex<()>,
    next_lsn: AtomicI64,
    first_lsn: AtomicI64,
    corrupt_skipped: AtomicU64,
}

impl Wal {
    /// Open (or create) the log at `path`, scanning existing frames to
    /// restore the LSN counters. Corrupt frames found during the scan are
    /// tolerated exactly as in [`Wal::read_entries`].
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let storage = FileStorage::open(path)?;
        let wal = Self {
            storage,
            writer: Mutex::new(()),
            next_lsn: AtomicI64::new(1),
            first_lsn: AtomicI64::new(0),
            corrupt_skipped: AtomicU64::new(0),
        };
        let existing = wal.scan()?;
        if let Some(max) = existing.iter().map(|r| r.lsn).max() {
            wal.next_lsn.store(max + 1, Ordering::SeqCst);
        }
        if let Some(min) = existing.iter().map(|r| r.lsn).min() {
            wal.first_lsn.store(min, Ordering::SeqCst);
        }
        log::debug!(
            "wal opened: {} records, next lsn {}",
            existing.len(),
            wal.next_lsn.load(Ordering::SeqCst)
        );
        Ok(wal)
    }

    /// Append a record: assign its LSN, frame it, write, and fsync. The
    /// LSN is returned only after the record is durable; on failure the
    /// partial frame is cut off and the LSN is not consumed.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty transaction id on a non-checkpoint
    /// record; otherwise propagates storage errors.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn, DbError> {
        if record.tx_id.is_empty() && record.op != LogOp::Checkpoint {
            return Err(DbError::InvalidArgument(
                "transaction id must not be empty".into(),
            ));
        }
        let _guard = self.writer.lock();
        let lsn = self.next_lsn.load(Ordering::SeqCst);
        record.lsn = lsn;
        let bytes = record.encode();
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&u32::try_from(bytes.len()).expect("record fits in u32").to_le_bytes());
        frame.extend_from_slice(&bytes);
        let offset = self.storage.append(&frame)?;
        if let Err(e) = self.storage.sync() {
            // Not durable: cut the frame off so the next append starts clean.
            let _ = self.storage.truncate(offset);
            return Err(e);
        }
        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        let _ = self
            .first_lsn
            .compare_exchange(0, lsn, Ordering::SeqCst, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Convenience constructor + append.
    ///
    /// # Errors
    /// As [`Wal::append`].
    pub fn append_op(
        &self,
        op: LogOp,
        tx_id: &str,
        page_id: i64,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn, DbError> {
        self.append(LogRecord::new(op, tx_id, page_id, before_image, after_image))
    }

    /// All surviving records with `lsn >= from_lsn`, in file order.
    ///
    /// Frames with an implausible length stop the scan; frames whose entry
    /// fails its checksum are skipped individually (the scan advances by
    /// the declared length), so one damaged record never hides the rest.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn read_entries(&self, from_lsn: Lsn) -> Result<Vec<LogRecord>, DbError> {
        Ok(self.scan()?.into_iter().filter(|r| r.lsn >= from_lsn).collect())
    }

    /// Highest LSN handed out (0 when the log is empty).
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst) - 1
    }

    /// Lowest LSN present after the open scan (0 when the log is empty).
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn.load(Ordering::SeqCst)
    }

    /// Write a synthetic checkpoint record carrying `lsn` in its
    /// after-image.
    ///
    /// # Errors
    /// As [`Wal::append`].
    pub fn checkpoint(&self, lsn: Lsn) -> Result<Lsn, DbError> {
        self.append(LogRecord::new(
            LogOp::Checkpoint,
            CHECKPOINT_TX_ID,
            NO_PAGE,
            Vec::new(),
            lsn.to_le_bytes().to_vec(),
        ))
    }

    /// Rewrite the log keeping only records with `lsn >= before_lsn`.
    /// Runs under the writer lock; callers invoke this only after the
    /// checkpoint record covering the dropped prefix is durable.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn truncate(&self, before_lsn: Lsn) -> Result<(), DbError> {
        let _guard = self.writer.lock();
        let survivors: Vec<LogRecord> =
            self.scan()?.into_iter().filter(|r| r.lsn >= before_lsn).collect();
        let mut buffer = Vec::new();
        for record in &survivors {
            let bytes = record.encode();
            buffer.extend_from_slice(
                &u32::try_from(bytes.len()).expect("record fits in u32").to_le_bytes(),
            );
            buffer.extend_from_slice(&bytes);
        }
        self.storage.truncate(0)?;
        if !buffer.is_empty() {
            self.storage.append(&buffer)?;
        }
        self.storage.sync()?;
        let new_first = survivors.iter().map(|r| r.lsn).min().unwrap_or(0);
        self.first_lsn.store(new_first, Ordering::SeqCst);
        log::info!("wal truncated before lsn {before_lsn}: {} records kept", survivors.len());
        Ok(())
    }

    /// Push OS buffers; appends already fsync individually.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn flush(&self) -> Result<(), DbError> {
        self.storage.flush()?;
        self.storage.sync()
    }

    /// Current log size in bytes.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn file_len(&self) -> Result<u64, DbError> {
        self.storage.len()
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            first_lsn: self.first_lsn(),
            last_lsn: self.last_lsn(),
            corrupt_frames_skipped: self.corrupt_skipped.load(Ordering::Relaxed),
            file_bytes: self.storage.len().unwrap_or(0),
        }
    }

    /// Scan every frame in the file, skipping damaged entries.
    fn scan(&self) -> Result<Vec<LogRecord>, DbError> {
        let len = self.storage.len()?;
        let buf = self.storage.read_at(0, usize::try_from(len).unwrap_or(usize::MAX))?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= buf.len() {
            let frame_len =
                u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"))
                    as usize;
            if frame_len == 0 || frame_len > MAX_RECORD_LEN {
                log::warn!("wal scan: implausible frame length {frame_len} at offset {offset}, stopping");
                break;
            }
            offset += 4;
            if offset + frame_len > buf.len() {
                // Torn tail from a crash mid-append.
                break;
            }
            match LogRecord::decode(&buf[offset..offset + frame_len]) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("wal scan: skipping corrupt frame at offset {offset}: {e}");
                }
            }
            offset += frame_len;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lsns_are_assigned_in_order() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.lode")).unwrap();
        for expected in 1..=5 {
            let lsn = wal
                .append_op(LogOp::Insert, "tx-a", 0, Vec::new(), vec![expected as u8])
                .unwrap();
            assert_eq!(lsn, expected);
        }
        assert_eq!(wal.last_lsn(), 5);
        assert_eq!(wal.first_lsn(), 1);
        let entries = wal.read_entries(3).unwrap();
        assert_eq!(entries.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn empty_tx_id_is_rejected() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.lode")).unwrap();
        assert!(matches!(
            wal.append_op(LogOp::Insert, "", 0, Vec::new(), Vec::new()),
            Err(DbError::InvalidArgument(_))
        ));
        // Checkpoint records are exempt.
        wal.checkpoint(0).unwrap();
    }

    #[test]
    fn reopen_restores_lsn_counter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.lode");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append_op(LogOp::Insert, "tx-a", 0, Vec::new(), b"x".to_vec()).unwrap();
            wal.append_op(LogOp::Commit, "tx-a", -1, Vec::new(), Vec::new()).unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.last_lsn(), 2);
        assert_eq!(wal.append_op(LogOp::Insert, "tx-b", 1, Vec::new(), b"y".to_vec()).unwrap(), 3);
    }

    #[test]
    fn corrupt_frame_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.lode");
        let wal = Wal::open(&path).unwrap();
        for i in 0..5u8 {
            wal.append_op(LogOp::Insert, "tx-a", i64::from(i), Vec::new(), vec![i; 8]).unwrap();
        }
        drop(wal);
        // Flip one byte inside the third record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let mut offset = 0usize;
        for _ in 0..2 {
            let len =
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4 + len;
        }
        bytes[offset + 4 + 40] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let wal = Wal::open(&path).unwrap();
        let entries = wal.read_entries(0).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|r| r.lsn != 3));
        assert_eq!(wal.stats().corrupt_frames_skipped, 1);
    }

    #[test]
    fn truncate_keeps_suffix() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(&dir.path().join("wal.lode")).unwrap();
        for i in 0..6u8 {
            wal.append_op(LogOp::Insert, "tx-a", i64::from(i), Vec::new(), vec![i]).unwrap();
        }
        wal.truncate(4).unwrap();
        let entries = wal.read_entries(0).unwrap();
        assert_eq!(entries.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(wal.first_lsn(), 4);
        assert_eq!(wal.last_lsn(), 6);
    }
}
