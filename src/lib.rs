#![forbid(unsafe_code)]

//! lodestore: an embedded, single-node, ACID document key-value store.
//!
//! The stack, leaves first: raw file storage → fixed-size pages with a
//! cache and free list → a durably-ordered write-ahead log → ARIES
//! recovery and periodic checkpoints → ordered/unordered indexes → a lock
//! manager with deadlock detection → multi-version visibility → the
//! transaction state machine. [`Database`] wires it together.

pub mod cache;
pub mod codec;
pub mod collection;
pub mod document;
pub mod errors;
pub mod index;
pub mod logger;
pub mod recovery;
pub mod storage;
pub mod txn;
pub mod types;
pub mod wal;

pub use cache::LruCache;
pub use collection::Collection;
pub use document::Document;
pub use errors::DbError;
pub use index::{Index, IndexKey, IndexKind};
pub use txn::{IsolationLevel, Transaction, TxState};

use crate::index::IndexDescriptor;
use crate::recovery::{
    CheckpointConfig, CheckpointManager, CheckpointOutcome, RecoveryManager, RecoveryReport,
};
use crate::storage::{DEFAULT_PAGE_CACHE, FileStorage, PageManager, PageStats};
use crate::txn::manager::TxConfig;
use crate::txn::TransactionManager;
use crate::wal::{Wal, WalStats};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

const INDEX_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexesMetadata {
    version: u32,
    collections: HashMap<String, Vec<IndexDescriptor>>,
}

/// Open database handles by canonical path; closing removes the entry.
static DB_REGISTRY: LazyLock<RwLock<HashSet<String>>> =
    LazyLock::new(|| RwLock::new(HashSet::new()));

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub pages: PageStats,
    pub wal: WalStats,
    pub active_transactions: usize,
    pub collections: usize,
}

/// The database facade composing the storage stack.
pub struct Database {
    name: String,
    data_path: PathBuf,
    meta_path: PathBuf,
    pages: Arc<PageManager>,
    wal: Arc<Wal>,
    txns: Arc<TransactionManager>,
    recovery: RecoveryManager,
    checkpoints: Arc<CheckpointManager>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    closed: AtomicBool,
}

impl Database {
    /// Open (or create) a database at `path`. The WAL lives next to the
    /// data file as `{stem}.wal`, index metadata as `{stem}.indexes.json`.
    /// Recovery runs automatically when the log holds unfinished
    /// transactions; background checkpointing and deadlock detection start
    /// here and stop on [`Database::close`].
    ///
    /// # Errors
    /// Propagates storage and recovery errors.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let data_path = path.to_path_buf();
        let wal_path = data_path.with_extension("wal");
        let meta_path = data_path.with_extension("indexes.json");
        let name = data_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("lodestore")
            .to_string();

        let storage = Arc::new(FileStorage::open(&data_path)?);
        let pages = Arc::new(PageManager::new(storage, DEFAULT_PAGE_CACHE)?);
        let wal = Arc::new(Wal::open(&wal_path)?);

        let recovery = RecoveryManager::new(Arc::clone(&wal), Arc::clone(&pages));
        if recovery.is_recovery_needed()? {
            let report = recovery.recover()?;
            log::info!(
                "{name}: recovery redid {} records, undid {:?}",
                report.redone_records,
                report.undone_transactions
            );
            pages.rescan()?;
        }

        let txns = TransactionManager::new(Arc::clone(&wal), Arc::clone(&pages), TxConfig::default());
        txns.load_existing()?;

        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&wal),
            Arc::clone(&pages),
            CheckpointConfig::default(),
        ));
        checkpoints.start();

        let db = Self {
            name,
            data_path: data_path.clone(),
            meta_path,
            pages,
            wal,
            txns,
            recovery,
            checkpoints,
            collections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };
        db.seed_collections();
        db.load_indexes_metadata();
        DB_REGISTRY.write().insert(data_path.to_string_lossy().to_string());
        log::info!("database {} opened at {}", db.name, db.data_path.display());
        Ok(db)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin a transaction; `None` uses the default isolation
    /// (Serializable).
    ///
    /// # Errors
    /// `InvalidState` on a closed database.
    pub fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<Arc<Transaction>, DbError> {
        self.check_open()?;
        Ok(self.txns.begin(isolation))
    }

    /// Fetch or create a collection handle.
    ///
    /// # Errors
    /// `InvalidState` on a closed database.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        self.check_open()?;
        if let Some(col) = self.collections.read().get(name) {
            return Ok(Arc::clone(col));
        }
        let mut collections = self.collections.write();
        let col = collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Collection::new(name.to_string(), Arc::clone(&self.txns)))
            });
        Ok(Arc::clone(col))
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Run ARIES recovery over the current log. Normally `open` does this;
    /// exposed for the reopen-after-crash flow and for tests.
    ///
    /// # Errors
    /// Propagates WAL/page errors.
    pub fn recover(&self) -> Result<RecoveryReport, DbError> {
        self.check_open()?;
        let report = self.recovery.recover()?;
        self.pages.rescan()?;
        self.txns.load_existing()?;
        Ok(report)
    }

    /// # Errors
    /// Propagates WAL read errors.
    pub fn is_recovery_needed(&self) -> Result<bool, DbError> {
        self.recovery.is_recovery_needed()
    }

    /// Checkpoint now and drop the covered WAL prefix.
    ///
    /// # Errors
    /// `InvalidState` on a closed database; checkpoint errors propagate.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome, DbError> {
        self.check_open()?;
        let outcome = self.checkpoints.run_once()?;
        if outcome.success && outcome.lsn > 0 {
            self.wal.truncate(outcome.lsn)?;
        }
        Ok(outcome)
    }

    /// Flush pages and the WAL to durable media.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.pages.flush()?;
        self.wal.flush()
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            pages: self.pages.stats(),
            wal: self.wal.stats(),
            active_transactions: self.txns.active_count(),
            collections: self.collections.read().len(),
        }
    }

    /// Flush, persist index metadata, stop background work, and mark the
    /// handle closed.
    ///
    /// # Errors
    /// `InvalidState` on a second close; flush errors propagate.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::InvalidState(format!("database {} already closed", self.name)));
        }
        if let Err(e) = self.save_indexes_metadata() {
            log::warn!("{}: could not persist index metadata: {e}", self.name);
        }
        if let Err(e) = self.checkpoints.run_once() {
            log::warn!("{}: final checkpoint failed: {e}", self.name);
        }
        self.checkpoints.stop();
        self.txns.shutdown();
        self.pages.flush()?;
        DB_REGISTRY.write().remove(&self.data_path.to_string_lossy().to_string());
        log::info!("database {} closed", self.name);
        Ok(())
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::InvalidState(format!("database {} is closed", self.name)));
        }
        Ok(())
    }

    /// Materialize collection handles for every prefix present in the
    /// committed key space.
    fn seed_collections(&self) {
        let mut collections = self.collections.write();
        for key in self.txns.versions().live_keys() {
            if let Some((name, _)) = key.split_once('/')
                && !collections.contains_key(name)
            {
                collections.insert(
                    name.to_string(),
                    Arc::new(Collection::new(name.to_string(), Arc::clone(&self.txns))),
                );
            }
        }
    }

    fn load_indexes_metadata(&self) {
        let Ok(bytes) = std::fs::read(&self.meta_path) else { return };
        match serde_json::from_slice::<IndexesMetadata>(&bytes) {
            Ok(meta) => {
                for (name, descriptors) in meta.collections {
                    if let Ok(col) = self.collection(&name) {
                        for d in descriptors {
                            col.create_index(&d.field, d.kind);
                        }
                    }
                }
            }
            Err(e) => log::warn!("{}: unreadable index metadata: {e}", self.name),
        }
    }

    fn save_indexes_metadata(&self) -> Result<(), DbError> {
        let collections: HashMap<String, Vec<IndexDescriptor>> = self
            .collections
            .read()
            .iter()
            .map(|(name, col)| (name.clone(), col.descriptors()))
            .filter(|(_, descriptors)| !descriptors.is_empty())
            .collect();
        let meta = IndexesMetadata { version: INDEX_METADATA_VERSION, collections };
        std::fs::write(&self.meta_path, serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}
