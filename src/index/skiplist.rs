//! Probabilistic skip list index.
//!
//! Classic multi-level list: each node is promoted to the next level with
//! probability 0.5, capped at 32 levels, giving `O(log n)` expected point
//! operations. Nodes live in an arena addressed by stable indices; a
//! reader-writer lock lets lookups proceed concurrently.

use crate::errors::DbError;
use crate::index::{Index, IndexKey, IndexStats, check_key, check_range};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_LEVEL: usize = 32;
const PROMOTE_P: f64 = 0.5;
const NIL: usize = usize::MAX;

struct SkipNode<V> {
    key: IndexKey,
    value: Option<V>,
    /// Per-level successor; `NIL` ends the chain.
    forward: Vec<usize>,
}

struct SkipInner<V> {
    nodes: Vec<SkipNode<V>>,
    free: Vec<usize>,
    /// Levels currently in use (at least 1).
    level: usize,
    len: usize,
}

impl<V> SkipInner<V> {
    fn new() -> Self {
        // Node 0 is the head; its key is never compared.
        let head = SkipNode { key: IndexKey::Null, value: None, forward: vec![NIL; MAX_LEVEL] };
        Self { nodes: vec![head], free: Vec::new(), level: 1, len: 0 }
    }

    /// Walk down from the top level, recording the rightmost node strictly
    /// before `key` at every level.
    fn search_path(&self, key: &IndexKey) -> [usize; MAX_LEVEL] {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0usize;
        for lvl in (0..self.level).rev() {
            loop {
                let next = self.nodes[x].forward[lvl];
                if next != NIL && self.nodes[next].key < *key {
                    x = next;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }
        update
    }

    fn find(&self, key: &IndexKey) -> Option<usize> {
        let update = self.search_path(key);
        let candidate = self.nodes[update[0]].forward[0];
        (candidate != NIL && self.nodes[candidate].key == *key).then_some(candidate)
    }

    fn alloc(&mut self, node: SkipNode<V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }
}

fn random_level() -> usize {
    let mut rng = rand::rng();
    let mut level = 1;
    while level < MAX_LEVEL && rng.random::<f64>() < PROMOTE_P {
        level += 1;
    }
    level
}

pub struct SkipListIndex<V: Clone + Send + Sync> {
    inner: RwLock<SkipInner<V>>,
    gets: AtomicU64,
    hits: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
}

impl<V: Clone + Send + Sync> SkipListIndex<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SkipInner::new()),
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    /// Snapshot of the level-0 chain (already ordered), optionally bounded.
    fn collect<F>(&self, mut keep: F) -> Vec<(IndexKey, V)>
    where
        F: FnMut(&IndexKey) -> ScanStep,
    {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut x = inner.nodes[0].forward[0];
        while x != NIL {
            let node = &inner.nodes[x];
            match keep(&node.key) {
                ScanStep::Take => {
                    out.push((node.key.clone(), node.value.clone().expect("data node has value")));
                }
                ScanStep::Skip => {}
                ScanStep::Stop => break,
            }
            x = node.forward[0];
        }
        out
    }
}

enum ScanStep {
    Take,
    Skip,
    Stop,
}

impl<V: Clone + Send + Sync> Default for SkipListIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> Index<V> for SkipListIndex<V> {
    fn get(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        check_key(key)?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.read();
        let found = inner.find(key).and_then(|idx| inner.nodes[idx].value.clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    fn put(&self, key: IndexKey, value: V) -> Result<(), DbError> {
        check_key(&key)?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        let update = inner.search_path(&key);
        let existing = inner.nodes[update[0]].forward[0];
        if existing != NIL && inner.nodes[existing].key == key {
            inner.nodes[existing].value = Some(value);
            return Ok(());
        }
        let node_level = random_level();
        let idx = inner.alloc(SkipNode { key, value: Some(value), forward: vec![NIL; node_level] });
        for lvl in 0..node_level {
            // Levels above the previous maximum splice off the head.
            let pred = if lvl < inner.level { update[lvl] } else { 0 };
            let next = self.splice(&mut inner, pred, lvl, idx);
            inner.nodes[idx].forward[lvl] = next;
        }
        if node_level > inner.level {
            inner.level = node_level;
        }
        inner.len += 1;
        Ok(())
    }

    fn remove(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        check_key(key)?;
        self.removes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        let update = inner.search_path(key);
        let target = inner.nodes[update[0]].forward[0];
        if target == NIL || inner.nodes[target].key != *key {
            return Ok(None);
        }
        for lvl in 0..inner.level {
            if inner.nodes[update[lvl]].forward[lvl] == target {
                let next = inner.nodes[target].forward[lvl];
                inner.nodes[update[lvl]].forward[lvl] = next;
            }
        }
        while inner.level > 1 && inner.nodes[0].forward[inner.level - 1] == NIL {
            inner.level -= 1;
        }
        let value = inner.nodes[target].value.take();
        inner.nodes[target] =
            SkipNode { key: IndexKey::Null, value: None, forward: Vec::new() };
        inner.free.push(target);
        inner.len -= 1;
        Ok(value)
    }

    fn range(&self, start: &IndexKey, end: &IndexKey) -> Result<Vec<(IndexKey, V)>, DbError> {
        check_range(start, end)?;
        Ok(self.collect(|k| {
            if k > end {
                ScanStep::Stop
            } else if k >= start {
                ScanStep::Take
            } else {
                ScanStep::Skip
            }
        }))
    }

    fn get_all(&self) -> Vec<(IndexKey, V)> {
        self.collect(|_| ScanStep::Take)
    }

    fn len(&self) -> usize {
        self.inner.read().len
    }

    fn min_key(&self) -> Option<IndexKey> {
        let inner = self.inner.read();
        let first = inner.nodes[0].forward[0];
        (first != NIL).then(|| inner.nodes[first].key.clone())
    }

    fn max_key(&self) -> Option<IndexKey> {
        let inner = self.inner.read();
        if inner.len == 0 {
            return None;
        }
        let mut x = 0usize;
        for lvl in (0..inner.level).rev() {
            loop {
                let next = inner.nodes[x].forward[lvl];
                if next != NIL {
                    x = next;
                } else {
                    break;
                }
            }
        }
        (x != 0).then(|| inner.nodes[x].key.clone())
    }

    fn keys_greater_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        let mut out = Vec::new();
        for (k, _) in self.collect(|k| if k > key { ScanStep::Take } else { ScanStep::Skip }) {
            if out.len() >= limit {
                break;
            }
            out.push(k);
        }
        out
    }

    fn keys_less_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        let mut keys: Vec<IndexKey> = self
            .collect(|k| if k < key { ScanStep::Take } else { ScanStep::Stop })
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.reverse();
        keys.truncate(limit);
        keys
    }

    fn clear(&self) {
        *self.inner.write() = SkipInner::new();
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

impl<V: Clone + Send + Sync> SkipListIndex<V> {
    /// Link `idx` after `pred` at `lvl`; returns the old successor.
    fn splice(&self, inner: &mut SkipInner<V>, pred: usize, lvl: usize, idx: usize) -> usize {
        let next = inner.nodes[pred].forward[lvl];
        inner.nodes[pred].forward[lvl] = idx;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: i64) -> IndexKey {
        IndexKey::I64(i)
    }

    #[test]
    fn insert_get_remove() {
        let list: SkipListIndex<i64> = SkipListIndex::new();
        for i in 0..200 {
            list.put(key(i), i).unwrap();
        }
        assert_eq!(list.len(), 200);
        assert_eq!(list.get(&key(150)).unwrap(), Some(150));
        assert_eq!(list.remove(&key(150)).unwrap(), Some(150));
        assert_eq!(list.get(&key(150)).unwrap(), None);
        assert_eq!(list.len(), 199);
    }

    #[test]
    fn level_zero_chain_is_ordered() {
        let list: SkipListIndex<i64> = SkipListIndex::new();
        for i in [9i64, 2, 7, 1, 8, 3, 6, 4, 5] {
            list.put(key(i), i).unwrap();
        }
        let all = list.get_all();
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(list.min_key(), Some(key(1)));
        assert_eq!(list.max_key(), Some(key(9)));
    }

    #[test]
    fn put_overwrites_in_place() {
        let list: SkipListIndex<&str> = SkipListIndex::new();
        list.put(key(1), "a").unwrap();
        list.put(key(1), "b").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&key(1)).unwrap(), Some("b"));
    }

    #[test]
    fn range_scan() {
        let list: SkipListIndex<i64> = SkipListIndex::new();
        for i in 0..50 {
            list.put(key(i), i).unwrap();
        }
        let hits = list.range(&key(10), &key(14)).unwrap();
        assert_eq!(hits.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![10, 11, 12, 13, 14]);
        assert!(list.range(&key(14), &key(10)).is_err());
    }
}
