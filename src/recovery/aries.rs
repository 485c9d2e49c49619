//! ARIES-style crash recovery: Analysis, Redo, Undo over the full WAL.

use crate::codec::entry::{LogOp, LogRecord};
use crate::errors::DbError;
use crate::storage::{Page, PageManager, PageType};
use crate::types::{Lsn, TxId};
use crate::wal::Wal;
use std::collections::HashMap;
use std::sync::Arc;

/// Output of the Analysis phase.
#[derive(Debug, Default)]
pub struct Analysis {
    /// LSN of the newest checkpoint record, 0 when none exists.
    pub last_checkpoint_lsn: Lsn,
    /// Transactions with data records but no Commit/Rollback, each with
    /// its records in LSN order.
    pub active: HashMap<TxId, Vec<LogRecord>>,
    /// Committed transactions, each with its data records in LSN order.
    pub committed: HashMap<TxId, Vec<LogRecord>>,
}

/// Summary of a completed recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub redone_records: usize,
    pub undone_transactions: Vec<TxId>,
}

pub struct RecoveryManager {
    wal: Arc<Wal>,
    pages: Arc<PageManager>,
}

impl RecoveryManager {
    #[must_use]
    pub fn new(wal: Arc<Wal>, pages: Arc<PageManager>) -> Self {
        Self { wal, pages }
    }

    /// Analysis: one forward scan classifying every transaction.
    ///
    /// # Errors
    /// Propagates WAL read errors; corrupt records were already dropped by
    /// the WAL scan.
    pub fn analyze(&self) -> Result<Analysis, DbError> {
        let mut analysis = Analysis::default();
        for record in self.wal.read_entries(0)? {
            match record.op {
                LogOp::Insert | LogOp::Update | LogOp::Delete => {
                    analysis.active.entry(record.tx_id.clone()).or_default().push(record);
                }
                LogOp::Commit => {
                    if let Some(records) = analysis.active.remove(&record.tx_id) {
                        analysis.committed.insert(record.tx_id, records);
                    } else {
                        analysis.committed.entry(record.tx_id).or_default();
                    }
                }
                LogOp::Rollback => {
                    analysis.active.remove(&record.tx_id);
                }
                LogOp::Checkpoint => {
                    // The after-image carries the covered LSN; fall back to
                    // the record's own LSN for older logs.
                    let covered = record
                        .after_image
                        .as_slice()
                        .try_into()
                        .map(i64::from_le_bytes)
                        .unwrap_or(record.lsn);
                    analysis.last_checkpoint_lsn = covered.max(analysis.last_checkpoint_lsn);
                }
            }
        }
        Ok(analysis)
    }

    /// Full three-phase recovery. Idempotent: a second run finds no active
    /// transactions and changes nothing.
    ///
    /// # Errors
    /// Propagates WAL/page errors.
    pub fn recover(&self) -> Result<RecoveryReport, DbError> {
        let analysis = self.analyze()?;
        log::info!(
            "recovery: {} committed, {} uncommitted, checkpoint lsn {}",
            analysis.committed.len(),
            analysis.active.len(),
            analysis.last_checkpoint_lsn
        );
        let mut report = RecoveryReport::default();

        // Redo: apply committed after-images in global LSN order, starting
        // at the last checkpoint. Writing the same bytes twice is harmless.
        for record in self.wal.read_entries(analysis.last_checkpoint_lsn)? {
            if record.op.is_data_op() && analysis.committed.contains_key(&record.tx_id) {
                self.apply_after_image(&record)?;
                report.redone_records += 1;
            }
        }

        // Undo: roll every uncommitted transaction back, newest first.
        let mut active: Vec<(TxId, Vec<LogRecord>)> = analysis.active.into_iter().collect();
        active.sort_by_key(|(_, records)| {
            std::cmp::Reverse(records.iter().map(|r| r.lsn).max().unwrap_or(0))
        });
        for (tx_id, records) in active {
            self.undo_records(&records)?;
            self.wal.append(LogRecord::control(LogOp::Rollback, tx_id.clone()))?;
            log::warn!("recovery: rolled back uncommitted transaction {tx_id}");
            report.undone_transactions.push(tx_id);
        }

        self.pages.flush()?;
        Ok(report)
    }

    /// True iff the log still holds transactions that must be undone.
    ///
    /// # Errors
    /// Propagates WAL read errors.
    pub fn is_recovery_needed(&self) -> Result<bool, DbError> {
        Ok(!self.analyze()?.active.is_empty())
    }

    /// Uncommitted transaction ids found by Analysis.
    ///
    /// # Errors
    /// Propagates WAL read errors.
    pub fn uncommitted_transactions(&self) -> Result<Vec<TxId>, DbError> {
        let mut ids: Vec<TxId> = self.analyze()?.active.into_keys().collect();
        ids.sort();
        Ok(ids)
    }

    /// Undo a single transaction's records (reverse LSN order) and append
    /// its Rollback record.
    ///
    /// # Errors
    /// `NotFound` if the log holds nothing for `tx_id`.
    pub fn rollback_transaction(&self, tx_id: &str) -> Result<(), DbError> {
        let analysis = self.analyze()?;
        let records = analysis
            .active
            .get(tx_id)
            .ok_or_else(|| DbError::NotFound(format!("active transaction {tx_id}")))?;
        self.undo_records(records)?;
        self.wal.append(LogRecord::control(LogOp::Rollback, tx_id))?;
        Ok(())
    }

    /// Re-apply a single committed transaction's records in LSN order.
    ///
    /// # Errors
    /// `NotFound` if the log holds no committed records for `tx_id`.
    pub fn redo_transaction(&self, tx_id: &str) -> Result<(), DbError> {
        let analysis = self.analyze()?;
        let records = analysis
            .committed
            .get(tx_id)
            .ok_or_else(|| DbError::NotFound(format!("committed transaction {tx_id}")))?;
        for record in records {
            self.apply_after_image(record)?;
        }
        Ok(())
    }

    fn apply_after_image(&self, record: &LogRecord) -> Result<(), DbError> {
        if record.page_id < 0 {
            return Ok(());
        }
        self.pages.reserve_through(record.page_id);
        if record.after_image.is_empty() {
            // A delete's after-image is empty: the page goes back to Free.
            self.pages.free_page(record.page_id)?;
        } else {
            let mut page = Page::with_data(record.page_id, PageType::Data, &record.after_image)?;
            self.pages.write_page(&mut page)?;
        }
        Ok(())
    }

    fn undo_records(&self, records: &[LogRecord]) -> Result<(), DbError> {
        let mut ordered: Vec<&LogRecord> = records.iter().collect();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.lsn));
        for record in ordered {
            if record.page_id < 0 {
                continue;
            }
            self.pages.reserve_through(record.page_id);
            if record.before_image.is_empty() {
                // An empty before-image marks an op that allocated the
                // page (an insert's provenance); undoing it frees the page.
                self.pages.free_page(record.page_id)?;
            } else {
                let mut page =
                    Page::with_data(record.page_id, PageType::Data, &record.before_image)?;
                self.pages.write_page(&mut page)?;
            }
        }
        Ok(())
    }
}
