//! Transaction manager: the per-transaction state machine, read/write
//! paths, and the commit pipeline (WAL → versions → pages → locks).
//!
//! Resource values live in single pages; the page payload is a small
//! `path | value` frame so the directory can be rebuilt by scanning the
//! data file on open.

use crate::codec::entry::{LogOp, LogRecord};
use crate::errors::DbError;
use crate::storage::{Page, PageManager, PageType};
use crate::txn::deadlock::{DeadlockDetector, VictimSelector, WaitForGraph};
use crate::txn::locks::{CancelToken, LockManager};
use crate::txn::mvcc::VersionManager;
use crate::txn::{IsolationLevel, TxState};
use crate::types::{LogicalClock, PageId, Timestamp, TxId, new_tx_id};
use crate::wal::Wal;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TxConfig {
    pub default_isolation: IsolationLevel,
    /// Upper bound for any single lock wait.
    pub lock_timeout: Duration,
    /// Whole-transaction deadline; `None` disables it.
    pub tx_timeout: Option<Duration>,
    /// Deadlock detector scan interval.
    pub detector_interval: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::Serializable,
            lock_timeout: Duration::from_secs(10),
            tx_timeout: None,
            detector_interval: Duration::from_millis(200),
        }
    }
}

/// Shared control block: what the deadlock detector and the lock manager
/// need to know about a live transaction.
pub(crate) struct TxControl {
    pub tx_id: TxId,
    pub start_ts: Timestamp,
    pub state: Mutex<TxState>,
    /// Set when the deadlock detector picked this transaction.
    pub victim: AtomicBool,
    /// Terminal cleanup (commit or rollback) already ran.
    pub finalized: AtomicBool,
    pub cancel: CancelToken,
}

#[derive(Default)]
struct Registry {
    map: RwLock<HashMap<TxId, Arc<TxControl>>>,
}

impl VictimSelector for Registry {
    fn start_ts(&self, tx_id: &str) -> Option<Timestamp> {
        self.map.read().get(tx_id).map(|c| c.start_ts)
    }

    fn abort_victim(&self, tx_id: &str) {
        if let Some(control) = self.map.read().get(tx_id) {
            control.victim.store(true, Ordering::SeqCst);
            *control.state.lock() = TxState::Aborted;
            control.cancel.cancel();
        }
    }
}

/// Page payload framing: `u32 path_len | path utf8 | u32 value_len | value`.
pub(crate) fn encode_resource(path: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + path.len() + value.len());
    out.extend_from_slice(&u32::try_from(path.len()).expect("path fits in u32").to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(&u32::try_from(value.len()).expect("value fits in u32").to_le_bytes());
    out.extend_from_slice(value);
    out
}

pub(crate) fn decode_resource(bytes: &[u8]) -> Result<(String, Vec<u8>), DbError> {
    let err = || DbError::Corruption("resource page payload truncated".into());
    if bytes.len() < 4 {
        return Err(err());
    }
    let path_len = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice")) as usize;
    if bytes.len() < 4 + path_len + 4 {
        return Err(err());
    }
    let path = std::str::from_utf8(&bytes[4..4 + path_len])
        .map_err(|e| DbError::Corruption(format!("resource path not UTF-8: {e}")))?
        .to_string();
    let value_start = 4 + path_len + 4;
    let value_len = u32::from_le_bytes(
        bytes[4 + path_len..value_start].try_into().expect("4-byte slice"),
    ) as usize;
    if bytes.len() < value_start + value_len {
        return Err(err());
    }
    Ok((path, bytes[value_start..value_start + value_len].to_vec()))
}

pub struct TransactionManager {
    wal: Arc<Wal>,
    pages: Arc<PageManager>,
    versions: Arc<VersionManager>,
    locks: Arc<LockManager>,
    graph: Arc<WaitForGraph>,
    detector: Arc<DeadlockDetector>,
    registry: Arc<Registry>,
    clock: Arc<LogicalClock>,
    /// Resource path → page id for every committed resource.
    directory: RwLock<HashMap<String, PageId>>,
    config: TxConfig,
}

impl TransactionManager {
    #[must_use]
    pub fn new(wal: Arc<Wal>, pages: Arc<PageManager>, config: TxConfig) -> Arc<Self> {
        let graph = Arc::new(WaitForGraph::new());
        let locks = Arc::new(LockManager::new(Arc::clone(&graph), config.lock_timeout));
        let registry = Arc::new(Registry::default());
        let detector = Arc::new(DeadlockDetector::new(
            Arc::clone(&graph),
            Arc::clone(&locks),
            Arc::clone(&registry) as Arc<dyn VictimSelector>,
            config.detector_interval,
        ));
        let manager = Arc::new(Self {
            wal,
            pages,
            versions: Arc::new(VersionManager::new()),
            locks,
            graph,
            detector,
            registry,
            clock: Arc::new(LogicalClock::new()),
            directory: RwLock::new(HashMap::new()),
            config,
        });
        manager.detector.start();
        manager
    }

    /// Rebuild the resource directory and seed the version chains from the
    /// data file. Runs once on open, after recovery.
    ///
    /// # Errors
    /// Propagates page errors; undecodable payloads are logged and skipped.
    pub fn load_existing(&self) -> Result<usize, DbError> {
        let mut loaded = 0;
        for id in 0..self.pages.page_count() {
            if !self.pages.page_exists(id)? {
                continue;
            }
            let page = self.pages.get_page(id)?;
            if page.header.page_type != PageType::Data {
                continue;
            }
            match decode_resource(page.data()) {
                Ok((path, value)) => {
                    self.directory.write().insert(path.clone(), id);
                    // Boot versions commit at timestamp 0 so every snapshot
                    // sees them. A path that already has a chain was loaded
                    // (or written) before; leave its history alone.
                    if self.versions.chain_len(&path) == 0 {
                        self.versions.publish(&path, value, "BOOT", 0);
                    }
                    loaded += 1;
                }
                Err(e) => log::warn!("page {id}: unreadable resource payload: {e}"),
            }
        }
        log::debug!("loaded {loaded} resources from the data file");
        Ok(loaded)
    }

    /// Begin a transaction at `isolation` (default Serializable).
    pub fn begin(self: &Arc<Self>, isolation: Option<IsolationLevel>) -> Arc<Transaction> {
        let control = Arc::new(TxControl {
            tx_id: new_tx_id(),
            start_ts: self.clock.tick(),
            state: Mutex::new(TxState::Active),
            victim: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            cancel: CancelToken::new(),
        });
        self.registry.map.write().insert(control.tx_id.clone(), Arc::clone(&control));
        log::debug!("begin transaction {} ({:?})", control.tx_id, isolation);
        Arc::new(Transaction {
            manager: Arc::clone(self),
            control,
            isolation: isolation.unwrap_or(self.config.default_isolation),
            snapshot_ts: Mutex::new(None),
            writes: Mutex::new(WriteSet::default()),
            read_locks: Mutex::new(HashSet::new()),
            deadline: self.config.tx_timeout.map(|t| Instant::now() + t),
        })
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    #[must_use]
    pub fn wait_for_graph(&self) -> &Arc<WaitForGraph> {
        &self.graph
    }

    /// Transactions the deadlock detector has aborted.
    pub fn deadlock_victims(&self) -> Vec<TxId> {
        self.detector.victims()
    }

    pub fn active_count(&self) -> usize {
        self.registry.map.read().len()
    }

    /// Committed page id for a resource path, if any.
    pub fn resource_page(&self, path: &str) -> Option<PageId> {
        self.directory.read().get(path).copied()
    }

    /// Committed resource paths, unordered.
    pub fn resource_paths(&self) -> Vec<String> {
        self.directory.read().keys().cloned().collect()
    }

    /// Stop background work. Called on database close.
    pub fn shutdown(&self) {
        self.detector.stop();
    }
}

#[derive(Debug, Clone)]
struct WriteOp {
    /// Committed value when the transaction first touched the path.
    before: Option<Vec<u8>>,
    /// Buffered value; `None` is a pending delete.
    after: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct WriteSet {
    /// First-write order, preserved for WAL emission.
    order: Vec<String>,
    ops: HashMap<String, WriteOp>,
}

/// A single transaction. All methods take `&self`; the handle is shared
/// freely across threads.
pub struct Transaction {
    manager: Arc<TransactionManager>,
    control: Arc<TxControl>,
    isolation: IsolationLevel,
    /// Captured at first read under the snapshot levels.
    snapshot_ts: Mutex<Option<Timestamp>>,
    writes: Mutex<WriteSet>,
    /// Resources read-locked until commit/rollback (RepeatableRead and up).
    read_locks: Mutex<HashSet<String>>,
    deadline: Option<Instant>,
}

impl Transaction {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.control.tx_id
    }

    #[must_use]
    pub const fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        *self.control.state.lock()
    }

    #[must_use]
    pub fn start_ts(&self) -> Timestamp {
        self.control.start_ts
    }

    #[must_use]
    pub fn is_deadlock_victim(&self) -> bool {
        self.control.victim.load(Ordering::SeqCst)
    }

    /// Fail fast on victims, expired deadlines, and terminal states.
    fn ensure_active(&self) -> Result<(), DbError> {
        if self.is_deadlock_victim() {
            return Err(DbError::Deadlock(self.id().to_string()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() > deadline
        {
            let _ = self.rollback();
            return Err(DbError::Timeout(format!("transaction {} expired", self.id())));
        }
        let state = self.state();
        if state != TxState::Active {
            return Err(DbError::InvalidState(format!(
                "transaction {} is {state:?}",
                self.id()
            )));
        }
        Ok(())
    }

    /// Read a resource. The transaction's own buffered writes win
    /// (read-your-writes); otherwise visibility follows the isolation
    /// level.
    ///
    /// # Errors
    /// `Deadlock`/`Timeout`/`Cancelled` from lock waits, `InvalidState`
    /// on a finished transaction.
    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.ensure_active()?;
        if let Some(op) = self.writes.lock().ops.get(path) {
            return Ok(op.after.clone());
        }
        let manager = &self.manager;
        match self.isolation {
            // No lock: read whatever is newest, committed state included.
            IsolationLevel::ReadUncommitted => Ok(manager.versions.latest(path)),
            // Statement-scoped read lock, but never wait behind a writer:
            // the newest committed version is what this level returns
            // anyway, so a held exclusive lock degrades to a lock-free
            // committed read instead of a dirty-read or a stall.
            IsolationLevel::ReadCommitted => {
                let acquired = manager
                    .locks
                    .lock_shared(
                        self.id(),
                        path,
                        Some(Duration::from_millis(10)),
                        Some(&self.control.cancel),
                    )
                    .is_ok();
                let value = manager.versions.latest(path);
                if acquired {
                    manager.locks.unlock(self.id(), path);
                }
                Ok(value)
            }
            // Snapshot levels: read lock held to commit, version chosen by
            // the snapshot timestamp.
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                let snapshot = self.snapshot();
                manager.locks.lock_shared(
                    self.id(),
                    path,
                    Some(manager.config.lock_timeout),
                    Some(&self.control.cancel),
                )?;
                self.read_locks.lock().insert(path.to_string());
                Ok(manager.versions.visible_version(path, snapshot, self.isolation))
            }
        }
    }

    /// Buffer a write. The exclusive lock is taken now and held to
    /// commit/rollback; the before-image is captured on first touch.
    ///
    /// # Errors
    /// `Deadlock`/`Timeout`/`Cancelled` from the lock wait, `InvalidState`
    /// on a finished transaction.
    pub fn write(&self, path: &str, value: Vec<u8>) -> Result<(), DbError> {
        self.ensure_active()?;
        self.manager.locks.lock_exclusive(
            self.id(),
            path,
            Some(self.manager.config.lock_timeout),
            Some(&self.control.cancel),
        )?;
        let mut writes = self.writes.lock();
        match writes.ops.get_mut(path) {
            Some(op) => op.after = Some(value),
            None => {
                let before = self.manager.versions.latest(path);
                writes.order.push(path.to_string());
                writes.ops.insert(path.to_string(), WriteOp { before, after: Some(value) });
            }
        }
        Ok(())
    }

    /// Buffer a delete.
    ///
    /// # Errors
    /// `NotFound` when the path has neither a buffered nor a committed
    /// value; lock and state errors as for `write`.
    pub fn delete(&self, path: &str) -> Result<(), DbError> {
        self.ensure_active()?;
        self.manager.locks.lock_exclusive(
            self.id(),
            path,
            Some(self.manager.config.lock_timeout),
            Some(&self.control.cancel),
        )?;
        let mut writes = self.writes.lock();
        match writes.ops.get_mut(path) {
            Some(op) => {
                if op.after.is_none() {
                    return Err(DbError::NotFound(path.to_string()));
                }
                op.after = None;
            }
            None => {
                let before = self.manager.versions.latest(path);
                if before.is_none() {
                    return Err(DbError::NotFound(path.to_string()));
                }
                writes.order.push(path.to_string());
                writes.ops.insert(path.to_string(), WriteOp { before, after: None });
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Timestamp {
        *self
            .snapshot_ts
            .lock()
            .get_or_insert_with(|| self.manager.clock.tick())
    }

    /// 2PC participant vote: Active → Preparing → Prepared. Any failed
    /// validation aborts.
    ///
    /// # Errors
    /// `InvalidState` when not Active; `Deadlock` when victimized (the
    /// transaction rolls back).
    pub fn prepare(&self) -> Result<(), DbError> {
        {
            let mut state = self.control.state.lock();
            if *state != TxState::Active {
                return Err(DbError::InvalidState(format!(
                    "transaction {} is {:?}, cannot prepare",
                    self.id(),
                    *state
                )));
            }
            *state = TxState::Preparing;
        }
        if self.is_deadlock_victim()
            || self.deadline.is_some_and(|d| Instant::now() > d)
        {
            let _ = self.rollback();
            return Err(DbError::Deadlock(self.id().to_string()));
        }
        *self.control.state.lock() = TxState::Prepared;
        log::debug!("transaction {} prepared", self.id());
        Ok(())
    }

    /// Commit: WAL data records, the Commit record (durable), version
    /// publication, page application, lock release.
    ///
    /// # Errors
    /// `InvalidState` unless Active or Prepared. A WAL failure before the
    /// Commit record rolls the transaction back and surfaces the error.
    pub fn commit(&self) -> Result<(), DbError> {
        if self.is_deadlock_victim() {
            return Err(DbError::Deadlock(self.id().to_string()));
        }
        {
            let state = self.control.state.lock();
            if !matches!(*state, TxState::Active | TxState::Prepared) {
                return Err(DbError::InvalidState(format!(
                    "transaction {} is {:?}, cannot commit",
                    self.id(),
                    *state
                )));
            }
        }
        let manager = &self.manager;
        let writes = std::mem::take(&mut *self.writes.lock());

        // Phase 1: data records, then the Commit record. `Wal::append`
        // fsyncs, so returning from the Commit append IS the durability
        // point.
        let log_writes = || -> Result<Vec<(String, WriteOp, PageId, bool)>, DbError> {
            let mut out = Vec::with_capacity(writes.order.len());
            for path in &writes.order {
                let op = writes.ops.get(path).expect("ordered path has an op").clone();
                let existing = manager.directory.read().get(path).copied();
                let (page_id, fresh) = match existing {
                    Some(id) => (id, false),
                    None => (manager.pages.allocate_page(PageType::Data)?.header.page_id, true),
                };
                let before_image = op
                    .before
                    .as_ref()
                    .map(|v| encode_resource(path, v))
                    .unwrap_or_default();
                let after_image = op
                    .after
                    .as_ref()
                    .map(|v| encode_resource(path, v))
                    .unwrap_or_default();
                let log_op = if op.before.is_none() {
                    LogOp::Insert
                } else if op.after.is_none() {
                    LogOp::Delete
                } else {
                    LogOp::Update
                };
                manager.wal.append(LogRecord::new(
                    log_op,
                    self.id(),
                    page_id,
                    before_image,
                    after_image,
                ))?;
                out.push((path.clone(), op, page_id, fresh));
            }
            manager.wal.append(LogRecord::control(LogOp::Commit, self.id()))?;
            Ok(out)
        };
        let planned = match log_writes() {
            Ok(out) => out,
            Err(e) => {
                let _ = self.rollback();
                return Err(e);
            }
        };

        // Phase 2: publish versions at one commit timestamp.
        let commit_ts = manager.clock.tick();
        for (path, op, _, _) in &planned {
            match &op.after {
                Some(value) => {
                    manager.versions.publish(path, value.clone(), self.id(), commit_ts);
                }
                None => manager.versions.publish_tombstone(path, self.id(), commit_ts),
            }
        }

        // Phase 3: apply after-images to pages. Failures here are logged,
        // not surfaced: the Commit record is durable and redo will finish
        // the job on the next recovery.
        for (path, op, page_id, fresh) in &planned {
            let apply = || -> Result<(), DbError> {
                match &op.after {
                    Some(value) => {
                        let mut page = Page::with_data(
                            *page_id,
                            PageType::Data,
                            &encode_resource(path, value),
                        )?;
                        manager.pages.write_page(&mut page)?;
                        if *fresh {
                            manager.directory.write().insert(path.clone(), *page_id);
                        }
                        Ok(())
                    }
                    None => {
                        manager.pages.free_page(*page_id)?;
                        manager.directory.write().remove(path);
                        Ok(())
                    }
                }
            };
            if let Err(e) = apply() {
                log::error!("commit {}: lazy page apply for {path} failed: {e}", self.id());
            }
        }

        self.finish(TxState::Committed);
        log::debug!("transaction {} committed at ts {commit_ts}", self.id());
        Ok(())
    }

    /// Roll back: emit the Rollback record, discard the buffer, release
    /// locks. Also the cleanup path a deadlock victim runs.
    ///
    /// # Errors
    /// `InvalidState` when already committed or already finalized.
    pub fn rollback(&self) -> Result<(), DbError> {
        {
            let state = self.control.state.lock();
            if *state == TxState::Committed {
                return Err(DbError::InvalidState(format!(
                    "transaction {} already committed",
                    self.id()
                )));
            }
        }
        if self.control.finalized.swap(true, Ordering::SeqCst) {
            return Err(DbError::InvalidState(format!(
                "transaction {} already finalized",
                self.id()
            )));
        }
        if let Err(e) = self
            .manager
            .wal
            .append(LogRecord::control(LogOp::Rollback, self.id()))
        {
            log::warn!("rollback {}: could not log rollback record: {e}", self.id());
        }
        self.writes.lock().ops.clear();
        self.writes.lock().order.clear();
        self.finish_unlocked(TxState::Aborted);
        log::debug!("transaction {} rolled back", self.id());
        Ok(())
    }

    fn finish(&self, terminal: TxState) {
        self.control.finalized.store(true, Ordering::SeqCst);
        self.finish_unlocked(terminal);
    }

    fn finish_unlocked(&self, terminal: TxState) {
        self.manager.locks.release_all(self.id());
        self.read_locks.lock().clear();
        *self.control.state.lock() = terminal;
        self.manager.registry.map.write().remove(self.id());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An abandoned live transaction rolls back rather than leaking
        // locks; recovery would undo it anyway after a crash.
        if !self.control.finalized.load(Ordering::SeqCst)
            && matches!(self.state(), TxState::Active | TxState::Preparing | TxState::Prepared)
        {
            let _ = self.rollback();
        }
    }
}
