use crate::errors::DbError;
use crate::storage::PageManager;
use crate::types::Lsn;
use crate::wal::Wal;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Result of one checkpoint attempt, also delivered to observers.
#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    pub lsn: Lsn,
    pub duration: Duration,
    pub success: bool,
}

pub type CheckpointObserver = Box<dyn Fn(&CheckpointOutcome) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Periodic trigger.
    pub interval: Duration,
    /// Size-based trigger: WAL growth since the last checkpoint.
    pub wal_growth_limit: u64,
    /// How long a caller waits for the single checkpoint slot before
    /// abandoning the attempt.
    pub acquire_wait: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            wal_growth_limit: 64 * 1024 * 1024,
            acquire_wait: Duration::from_secs(30),
        }
    }
}

/// Periodic WAL compaction: flush dirty pages, stamp a checkpoint record,
/// and remember the covered LSN so recovery can skip the prefix.
pub struct CheckpointManager {
    wal: Arc<Wal>,
    pages: Arc<PageManager>,
    config: CheckpointConfig,
    /// Single checkpoint slot; concurrent attempts queue here.
    slot: Mutex<()>,
    last_checkpoint_lsn: AtomicI64,
    wal_len_at_checkpoint: AtomicU64,
    observers: RwLock<Vec<CheckpointObserver>>,
    shutdown: Arc<AtomicBool>,
    timer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(wal: Arc<Wal>, pages: Arc<PageManager>, config: CheckpointConfig) -> Self {
        Self {
            wal,
            pages,
            config,
            slot: Mutex::new(()),
            last_checkpoint_lsn: AtomicI64::new(0),
            wal_len_at_checkpoint: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    /// Register a completion observer. Observers run on the checkpointing
    /// thread and must not block.
    pub fn subscribe(&self, observer: CheckpointObserver) {
        self.observers.write().push(observer);
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn.load(Ordering::SeqCst)
    }

    /// True when WAL growth since the last checkpoint exceeds the limit.
    pub fn needs_checkpoint(&self) -> bool {
        let len = self.wal.file_len().unwrap_or(0);
        len.saturating_sub(self.wal_len_at_checkpoint.load(Ordering::SeqCst))
            > self.config.wal_growth_limit
    }

    /// Run one checkpoint now. Short-circuits to success when no new LSNs
    /// arrived since the previous checkpoint. On failure the observers see
    /// `success = false` and the covered LSN does not advance.
    ///
    /// # Errors
    /// `Timeout` when the slot cannot be acquired within the configured
    /// wait; otherwise propagates WAL/page errors.
    pub fn run_once(&self) -> Result<CheckpointOutcome, DbError> {
        let started = Instant::now();
        let Some(_slot) = self.slot.try_lock_for(self.config.acquire_wait) else {
            let outcome = CheckpointOutcome {
                lsn: self.last_checkpoint_lsn(),
                duration: started.elapsed(),
                success: false,
            };
            self.notify(&outcome);
            return Err(DbError::Timeout("checkpoint slot busy".into()));
        };

        let target_lsn = self.wal.last_lsn();
        if target_lsn == self.last_checkpoint_lsn() {
            let outcome =
                CheckpointOutcome { lsn: target_lsn, duration: started.elapsed(), success: true };
            self.notify(&outcome);
            return Ok(outcome);
        }

        let result: Result<(), DbError> = (|| {
            self.pages.flush()?;
            self.wal.flush()?;
            self.wal.checkpoint(target_lsn)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.last_checkpoint_lsn.store(target_lsn, Ordering::SeqCst);
                self.wal_len_at_checkpoint
                    .store(self.wal.file_len().unwrap_or(0), Ordering::SeqCst);
                let outcome = CheckpointOutcome {
                    lsn: target_lsn,
                    duration: started.elapsed(),
                    success: true,
                };
                log::info!("checkpoint at lsn {target_lsn} in {:?}", outcome.duration);
                self.notify(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                let outcome = CheckpointOutcome {
                    lsn: self.last_checkpoint_lsn(),
                    duration: started.elapsed(),
                    success: false,
                };
                log::error!("checkpoint failed: {e}");
                self.notify(&outcome);
                Err(e)
            }
        }
    }

    /// Start the background timer thread. Repeated calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            let tick = Duration::from_millis(500);
            let mut last_run = Instant::now();
            while !manager.shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(tick);
                let due = last_run.elapsed() >= manager.config.interval;
                if due || manager.needs_checkpoint() {
                    last_run = Instant::now();
                    if let Err(e) = manager.run_once() {
                        log::warn!("periodic checkpoint: {e}");
                    }
                }
            }
        });
        *timer = Some(handle);
    }

    /// Stop the timer thread and wait for it to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }

    fn notify(&self, outcome: &CheckpointOutcome) {
        for observer in self.observers.read().iter() {
            observer(outcome);
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }
}
