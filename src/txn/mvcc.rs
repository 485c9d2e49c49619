//! Multi-version concurrency control.
//!
//! Every committed write prepends a [`Version`] to its key's chain, newest
//! first, with strictly decreasing commit timestamps toward the tail.
//! Readers pick the version their isolation level allows; deletions are
//! tombstone versions that read as "not found".

use crate::txn::IsolationLevel;
use crate::types::{Timestamp, TxId};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Version {
    /// `None` marks a tombstone.
    pub data: Option<Vec<u8>>,
    pub tx_id: TxId,
    pub commit_ts: Timestamp,
}

impl Version {
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Debug, Default)]
pub struct VersionManager {
    /// Key → committed versions, newest first.
    chains: RwLock<HashMap<String, Vec<Version>>>,
}

impl VersionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a committed version.
    pub fn publish(&self, key: &str, data: Vec<u8>, tx_id: &str, commit_ts: Timestamp) {
        self.prepend(key, Version { data: Some(data), tx_id: tx_id.to_string(), commit_ts });
    }

    /// Prepend a tombstone.
    pub fn publish_tombstone(&self, key: &str, tx_id: &str, commit_ts: Timestamp) {
        self.prepend(key, Version { data: None, tx_id: tx_id.to_string(), commit_ts });
    }

    fn prepend(&self, key: &str, version: Version) {
        let mut chains = self.chains.write();
        let chain = chains.entry(key.to_string()).or_default();
        debug_assert!(
            chain.first().is_none_or(|head| head.commit_ts < version.commit_ts),
            "commit timestamps must be strictly increasing per key"
        );
        chain.insert(0, version);
    }

    /// The version a reader at `snapshot_ts` is allowed to see.
    ///
    /// ReadUncommitted and ReadCommitted see the newest committed version;
    /// the snapshot levels see the newest version at or below their
    /// snapshot. A tombstone reads as `None`.
    pub fn visible_version(
        &self,
        key: &str,
        snapshot_ts: Timestamp,
        isolation: IsolationLevel,
    ) -> Option<Vec<u8>> {
        let chains = self.chains.read();
        let chain = chains.get(key)?;
        let version = if isolation.uses_snapshot() {
            chain.iter().find(|v| v.commit_ts <= snapshot_ts)?
        } else {
            chain.first()?
        };
        version.data.clone()
    }

    /// Newest committed version regardless of snapshots.
    pub fn latest(&self, key: &str) -> Option<Vec<u8>> {
        let chains = self.chains.read();
        chains.get(key)?.first()?.data.clone()
    }

    /// True when the key has a chain whose head is not a tombstone.
    pub fn exists(&self, key: &str) -> bool {
        self.latest(key).is_some()
    }

    pub fn chain_len(&self, key: &str) -> usize {
        self.chains.read().get(key).map_or(0, Vec::len)
    }

    /// All keys whose head version is live (not a tombstone).
    pub fn live_keys(&self) -> Vec<String> {
        self.chains
            .read()
            .iter()
            .filter(|(_, chain)| chain.first().is_some_and(|v| !v.is_tombstone()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drop versions no snapshot at or above `horizon` can see: for each
    /// chain, the newest version at or below the horizon is kept and
    /// everything older goes. Returns the number of versions dropped.
    pub fn gc(&self, horizon: Timestamp) -> usize {
        let mut dropped = 0;
        let mut chains = self.chains.write();
        for chain in chains.values_mut() {
            if let Some(keep_through) = chain.iter().position(|v| v.commit_ts <= horizon) {
                dropped += chain.len() - (keep_through + 1);
                chain.truncate(keep_through + 1);
            }
        }
        chains.retain(|_, chain| !chain.is_empty());
        dropped
    }
}
