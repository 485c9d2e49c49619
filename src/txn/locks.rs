//! Per-resource read/write locks with FIFO waiters.
//!
//! Each resource gets its own record (sharded by the table map), holding a
//! shared-reader set, an optional exclusive holder, and a FIFO waiter
//! queue woken through a condition variable. Waits are slice-based so
//! timeouts, cancellation tokens, and deadlock victimization are all
//! observed promptly without holding any lock across I/O.

use crate::errors::DbError;
use crate::txn::deadlock::WaitForGraph;
use crate::types::TxId;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Cooperative cancellation for a pending acquisition.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Waiter {
    tx_id: TxId,
    mode: LockMode,
    ticket: u64,
}

#[derive(Debug, Default)]
struct LockState {
    read_holders: HashSet<TxId>,
    write_holder: Option<TxId>,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn holders(&self) -> Vec<TxId> {
        let mut holders: Vec<TxId> = self.read_holders.iter().cloned().collect();
        if let Some(w) = &self.write_holder
            && !self.read_holders.contains(w)
        {
            holders.push(w.clone());
        }
        holders
    }

    fn is_idle(&self) -> bool {
        self.read_holders.is_empty() && self.write_holder.is_none() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockRecord {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Polling granularity for cancellation and victimization while blocked.
const WAIT_SLICE: Duration = Duration::from_millis(25);

pub struct LockManager {
    table: RwLock<HashMap<String, Arc<LockRecord>>>,
    graph: Arc<WaitForGraph>,
    /// Deadlock victims; their pending and future waits fail fast.
    aborted: RwLock<HashSet<TxId>>,
    next_ticket: AtomicU64,
    default_timeout: Duration,
}

impl LockManager {
    #[must_use]
    pub fn new(graph: Arc<WaitForGraph>, default_timeout: Duration) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            graph,
            aborted: RwLock::new(HashSet::new()),
            next_ticket: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Shared (read) lock.
    ///
    /// # Errors
    /// `Timeout`, `Cancelled`, or `Deadlock` as the wait resolves.
    pub fn lock_shared(
        &self,
        tx_id: &str,
        resource: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DbError> {
        self.acquire(tx_id, resource, LockMode::Shared, timeout, cancel)
    }

    /// Exclusive (write) lock. A transaction holding the shared lock may
    /// upgrade; it waits only for the other holders to drain.
    ///
    /// # Errors
    /// `Timeout`, `Cancelled`, or `Deadlock` as the wait resolves.
    pub fn lock_exclusive(
        &self,
        tx_id: &str,
        resource: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DbError> {
        self.acquire(tx_id, resource, LockMode::Exclusive, timeout, cancel)
    }

    fn acquire(
        &self,
        tx_id: &str,
        resource: &str,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DbError> {
        if self.aborted.read().contains(tx_id) {
            return Err(DbError::Deadlock(tx_id.to_string()));
        }
        let record = self.record_for(resource);
        let deadline = Instant::now() + timeout.unwrap_or(self.default_timeout);
        let mut state = record.state.lock();

        // Reentrant paths return without queueing, so a pending writer can
        // never self-deadlock a transaction against its own lock.
        match mode {
            LockMode::Shared => {
                if state.read_holders.contains(tx_id)
                    || state.write_holder.as_deref() == Some(tx_id)
                {
                    return Ok(());
                }
                if state.write_holder.is_none() && state.waiters.is_empty() {
                    state.read_holders.insert(tx_id.to_string());
                    return Ok(());
                }
            }
            LockMode::Exclusive => {
                if state.write_holder.as_deref() == Some(tx_id) {
                    return Ok(());
                }
                if Self::upgrade_ready(&state, tx_id)
                    || (state.write_holder.is_none()
                        && state.read_holders.is_empty()
                        && state.waiters.is_empty())
                {
                    state.write_holder = Some(tx_id.to_string());
                    return Ok(());
                }
            }
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        state.waiters.push_back(Waiter { tx_id: tx_id.to_string(), mode, ticket });

        loop {
            // Keep the wait-for edges current with the live holder set.
            self.graph.set_edges(tx_id, state.holders());

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon_wait(&record, &mut state, tx_id, ticket);
                return Err(DbError::Timeout(format!("lock on {resource} for {tx_id}")));
            }
            let _ = record.cond.wait_for(&mut state, remaining.min(WAIT_SLICE));

            if cancel.is_some_and(CancelToken::is_cancelled) {
                self.abandon_wait(&record, &mut state, tx_id, ticket);
                return Err(DbError::Cancelled(format!("lock on {resource} for {tx_id}")));
            }
            if self.aborted.read().contains(tx_id) {
                self.abandon_wait(&record, &mut state, tx_id, ticket);
                return Err(DbError::Deadlock(tx_id.to_string()));
            }

            let grantable = match mode {
                // Upgrades bypass the FIFO queue: the transaction already
                // holds a read lock a queued writer can never get past.
                LockMode::Exclusive if state.read_holders.contains(tx_id) => {
                    Self::upgrade_ready(&state, tx_id)
                }
                LockMode::Exclusive => {
                    Self::is_head(&state, ticket)
                        && state.write_holder.is_none()
                        && state.read_holders.is_empty()
                }
                LockMode::Shared => Self::is_head(&state, ticket) && state.write_holder.is_none(),
            };
            if grantable {
                state.waiters.retain(|w| w.ticket != ticket);
                match mode {
                    LockMode::Shared => {
                        state.read_holders.insert(tx_id.to_string());
                    }
                    LockMode::Exclusive => state.write_holder = Some(tx_id.to_string()),
                }
                self.graph.set_edges(tx_id, Vec::new());
                // Let the next compatible waiter re-check.
                record.cond.notify_all();
                return Ok(());
            }
        }
    }

    fn upgrade_ready(state: &LockState, tx_id: &str) -> bool {
        state.write_holder.is_none()
            && state.read_holders.len() == 1
            && state.read_holders.contains(tx_id)
    }

    fn is_head(state: &LockState, ticket: u64) -> bool {
        state.waiters.front().is_some_and(|w| w.ticket == ticket)
    }

    /// Remove a waiter and its wait-for edges in one step.
    fn abandon_wait(
        &self,
        record: &LockRecord,
        state: &mut LockState,
        tx_id: &str,
        ticket: u64,
    ) {
        state.waiters.retain(|w| w.ticket != ticket);
        self.graph.set_edges(tx_id, Vec::new());
        record.cond.notify_all();
    }

    /// Release one lock (shared and/or exclusive) held on `resource`.
    pub fn unlock(&self, tx_id: &str, resource: &str) {
        let record = {
            let table = self.table.read();
            table.get(resource).cloned()
        };
        let Some(record) = record else { return };
        let idle = {
            let mut state = record.state.lock();
            state.read_holders.remove(tx_id);
            if state.write_holder.as_deref() == Some(tx_id) {
                state.write_holder = None;
            }
            record.cond.notify_all();
            state.is_idle()
        };
        if idle {
            self.drop_if_idle(resource);
        }
    }

    /// Release every lock `tx_id` holds and forget its graph presence.
    pub fn release_all(&self, tx_id: &str) {
        let records: Vec<(String, Arc<LockRecord>)> = {
            let table = self.table.read();
            table.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };
        let mut idle = Vec::new();
        for (resource, record) in records {
            let mut state = record.state.lock();
            let held = state.read_holders.remove(tx_id)
                | (state.write_holder.as_deref() == Some(tx_id));
            if state.write_holder.as_deref() == Some(tx_id) {
                state.write_holder = None;
            }
            state.waiters.retain(|w| w.tx_id != tx_id);
            if held || state.is_idle() {
                record.cond.notify_all();
            }
            if state.is_idle() {
                idle.push(resource);
            }
        }
        for resource in idle {
            self.drop_if_idle(&resource);
        }
        self.graph.remove_tx(tx_id);
        self.aborted.write().remove(tx_id);
    }

    /// Deadlock victimization: make every pending and future wait of
    /// `tx_id` fail fast with `Deadlock`.
    pub fn cancel_tx(&self, tx_id: &str) {
        self.aborted.write().insert(tx_id.to_string());
        let records: Vec<Arc<LockRecord>> =
            { self.table.read().values().cloned().collect() };
        for record in records {
            let state = record.state.lock();
            if state.waiters.iter().any(|w| w.tx_id == tx_id) {
                record.cond.notify_all();
            }
        }
    }

    /// Current holders of `resource`: `(readers, writer)`.
    pub fn holders(&self, resource: &str) -> (Vec<TxId>, Option<TxId>) {
        let table = self.table.read();
        table.get(resource).map_or((Vec::new(), None), |record| {
            let state = record.state.lock();
            let mut readers: Vec<TxId> = state.read_holders.iter().cloned().collect();
            readers.sort();
            (readers, state.write_holder.clone())
        })
    }

    pub fn waiter_count(&self, resource: &str) -> usize {
        let table = self.table.read();
        table.get(resource).map_or(0, |record| record.state.lock().waiters.len())
    }

    fn record_for(&self, resource: &str) -> Arc<LockRecord> {
        if let Some(record) = self.table.read().get(resource) {
            return Arc::clone(record);
        }
        let mut table = self.table.write();
        Arc::clone(table.entry(resource.to_string()).or_default())
    }

    fn drop_if_idle(&self, resource: &str) {
        let mut table = self.table.write();
        if let Some(record) = table.get(resource)
            && record.state.lock().is_idle()
        {
            table.remove(resource);
        }
    }
}
