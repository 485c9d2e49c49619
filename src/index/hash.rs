//! Equality-only hash index. Point operations are O(1); the ordered parts
//! of the capability set sort a snapshot on demand.

use crate::errors::DbError;
use crate::index::{Index, IndexKey, IndexStats, check_key, check_range};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct HashIndex<V: Clone + Send + Sync> {
    map: RwLock<HashMap<IndexKey, V>>,
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
}

impl<V: Clone + Send + Sync> HashIndex<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    /// Snapshot all entries, sorted by key.
    fn sorted_snapshot(&self) -> Vec<(IndexKey, V)> {
        let mut entries: Vec<(IndexKey, V)> =
            self.map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl<V: Clone + Send + Sync> Default for HashIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> Index<V> for HashIndex<V> {
    fn get(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        check_key(key)?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        let found = self.map.read().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    fn put(&self, key: IndexKey, value: V) -> Result<(), DbError> {
        check_key(&key)?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.map.write().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        check_key(key)?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        Ok(self.map.write().remove(key))
    }

    fn range(&self, start: &IndexKey, end: &IndexKey) -> Result<Vec<(IndexKey, V)>, DbError> {
        check_range(start, end)?;
        Ok(self
            .sorted_snapshot()
            .into_iter()
            .filter(|(k, _)| k >= start && k <= end)
            .collect())
    }

    fn get_all(&self) -> Vec<(IndexKey, V)> {
        self.sorted_snapshot()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn min_key(&self) -> Option<IndexKey> {
        self.map.read().keys().min().cloned()
    }

    fn max_key(&self) -> Option<IndexKey> {
        self.map.read().keys().max().cloned()
    }

    fn keys_greater_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> =
            self.map.read().keys().filter(|k| *k > key).cloned().collect();
        keys.sort();
        keys.truncate(limit);
        keys
    }

    fn keys_less_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> =
            self.map.read().keys().filter(|k| *k < key).cloned().collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys.truncate(limit);
        keys
    }

    fn clear(&self) {
        self.map.write().clear();
    }

    fn stats(&self) -> IndexStats {
        let gets = self.gets.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        IndexStats {
            keys: self.len(),
            gets,
            hits,
            misses: gets - hits,
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}
