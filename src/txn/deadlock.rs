//! Wait-for graph and the background deadlock detector.
//!
//! The graph is a single arena of `waiter → holder` edges behind its own
//! lock, never held across I/O. The detector runs a periodic DFS; on a
//! cycle it aborts the youngest transaction (latest start timestamp) and
//! the lock manager fails that victim's pending acquisitions with
//! `Deadlock`.

use crate::txn::locks::LockManager;
use crate::types::{Timestamp, TxId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct WaitForGraph {
    /// waiter → the holders it waits on.
    edges: Mutex<HashMap<TxId, HashSet<TxId>>>,
}

impl WaitForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges of `waiter` with `holders`.
    pub fn set_edges(&self, waiter: &str, holders: impl IntoIterator<Item = TxId>) {
        let holders: HashSet<TxId> =
            holders.into_iter().filter(|h| h != waiter).collect();
        let mut edges = self.edges.lock();
        if holders.is_empty() {
            edges.remove(waiter);
        } else {
            edges.insert(waiter.to_string(), holders);
        }
    }

    /// Drop every edge leaving `waiter` (it stopped waiting) and every
    /// edge pointing at it (it no longer holds anything).
    pub fn remove_tx(&self, tx_id: &str) {
        let mut edges = self.edges.lock();
        edges.remove(tx_id);
        for holders in edges.values_mut() {
            holders.remove(tx_id);
        }
        edges.retain(|_, holders| !holders.is_empty());
    }

    /// Would adding `waiter → holder` close a cycle? Used by callers that
    /// prefer to reject an edge instead of waiting for the periodic scan.
    pub fn would_cycle(&self, waiter: &str, holder: &str) -> bool {
        if waiter == holder {
            return true;
        }
        let edges = self.edges.lock();
        // A cycle appears iff `waiter` is already reachable from `holder`.
        let mut stack = vec![holder.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == waiter {
                return true;
            }
            if seen.insert(current.clone())
                && let Some(next) = edges.get(&current)
            {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }

    /// Find one cycle, if any, as the list of transactions on it.
    pub fn find_cycle(&self) -> Option<Vec<TxId>> {
        let edges = self.edges.lock();
        let mut visited: HashSet<&str> = HashSet::new();
        for start in edges.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();
            if let Some(cycle) = dfs(&edges, start, &mut visited, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
        None
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().values().map(HashSet::len).sum()
    }
}

fn dfs<'a>(
    edges: &'a HashMap<TxId, HashSet<TxId>>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    on_path: &mut HashSet<&'a str>,
) -> Option<Vec<TxId>> {
    if on_path.contains(node) {
        let start = path.iter().position(|n| *n == node).unwrap_or(0);
        return Some(path[start..].iter().map(ToString::to_string).collect());
    }
    if !visited.insert(node) {
        return None;
    }
    path.push(node);
    on_path.insert(node);
    if let Some(holders) = edges.get(node) {
        for holder in holders {
            if let Some(cycle) = dfs(edges, holder, visited, path, on_path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    on_path.remove(node);
    None
}

/// Callback used by the detector to look up start timestamps and to tell a
/// victim it lost. Implemented by the transaction manager.
pub trait VictimSelector: Send + Sync {
    /// Start timestamp of a live transaction, if it is still registered.
    fn start_ts(&self, tx_id: &str) -> Option<Timestamp>;

    /// Mark the transaction aborted and signal its abort event.
    fn abort_victim(&self, tx_id: &str);
}

pub struct DeadlockDetector {
    graph: Arc<WaitForGraph>,
    locks: Arc<LockManager>,
    selector: Arc<dyn VictimSelector>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    victims: Arc<RwLock<Vec<TxId>>>,
}

impl DeadlockDetector {
    #[must_use]
    pub fn new(
        graph: Arc<WaitForGraph>,
        locks: Arc<LockManager>,
        selector: Arc<dyn VictimSelector>,
        interval: Duration,
    ) -> Self {
        Self {
            graph,
            locks,
            selector,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            victims: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// One scan: break every cycle currently in the graph.
    pub fn scan_once(&self) {
        while let Some(cycle) = self.graph.find_cycle() {
            let victim = cycle
                .iter()
                .max_by_key(|tx| self.selector.start_ts(tx).unwrap_or(Timestamp::MAX))
                .cloned();
            let Some(victim) = victim else { break };
            log::warn!("deadlock cycle {cycle:?}: aborting youngest transaction {victim}");
            self.selector.abort_victim(&victim);
            self.locks.cancel_tx(&victim);
            self.graph.remove_tx(&victim);
            self.victims.write().push(victim);
        }
    }

    /// Transactions aborted by this detector since start.
    pub fn victims(&self) -> Vec<TxId> {
        self.victims.read().clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let detector = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || {
            while !detector.shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(detector.interval);
                detector.scan_once();
            }
        }));
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_party_cycle_is_found() {
        let graph = WaitForGraph::new();
        graph.set_edges("t1", vec!["t2".to_string()]);
        assert!(graph.find_cycle().is_none());
        graph.set_edges("t2", vec!["t1".to_string()]);
        let cycle = graph.find_cycle().expect("cycle exists");
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn would_cycle_predicts_insertion() {
        let graph = WaitForGraph::new();
        graph.set_edges("t1", vec!["t2".to_string()]);
        graph.set_edges("t2", vec!["t3".to_string()]);
        assert!(graph.would_cycle("t3", "t1"));
        assert!(!graph.would_cycle("t1", "t3"));
        assert!(graph.would_cycle("t1", "t1"));
    }

    #[test]
    fn removing_a_tx_clears_both_directions() {
        let graph = WaitForGraph::new();
        graph.set_edges("t1", vec!["t2".to_string()]);
        graph.set_edges("t3", vec!["t1".to_string()]);
        graph.remove_tx("t1");
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.find_cycle().is_none());
    }
}
