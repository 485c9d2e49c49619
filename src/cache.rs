use crate::errors::DbError;
use lru::LruCache as LruBackend;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A capacity-bounded LRU cache: hash map keyed into an intrusive
/// recency list, so every operation is O(1). `put` on a full cache evicts
/// the least-recently-used entry; `get` promotes to most-recently-used.
///
/// All mutations run under a single lock. Enumerations snapshot under the
/// lock and hand back owned vectors so callers iterate lock-free.
pub struct LruCache<K: Hash + Eq + Clone, V: Clone> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K: Hash + Eq, V> {
    store: LruBackend<K, V>,
    disposed: bool,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// # Errors
    /// `InvalidArgument` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, DbError> {
        let cap = NonZeroUsize::new(capacity)
            .ok_or_else(|| DbError::InvalidArgument("cache capacity must be > 0".into()))?;
        Ok(Self { inner: Mutex::new(Inner { store: LruBackend::new(cap), disposed: false }) })
    }

    /// Insert or update. An update moves the entry to the front; at
    /// capacity the least-recently-used entry is evicted.
    ///
    /// # Errors
    /// `Disposed` after `dispose`.
    pub fn put(&self, key: K, value: V) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.check_alive()?;
        inner.store.put(key, value);
        Ok(())
    }

    /// Fetch and promote to most-recently-used.
    ///
    /// # Errors
    /// `NotFound` for a missing key, `Disposed` after `dispose`.
    pub fn get(&self, key: &K) -> Result<V, DbError>
    where
        K: std::fmt::Debug,
    {
        let mut inner = self.inner.lock();
        inner.check_alive()?;
        inner
            .store
            .get(key)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("cache key {key:?}")))
    }

    /// Non-failing form of `get`. Returns `None` for missing keys and on a
    /// disposed cache.
    pub fn try_get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        inner.store.get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return None;
        }
        inner.store.pop(key)
    }

    /// Membership test without promoting the entry.
    pub fn contains(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        !inner.disposed && inner.store.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().store.cap().get()
    }

    /// Keys in most-recent-first order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().store.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Key/value pairs in most-recent-first order.
    pub fn items(&self) -> Vec<(K, V)> {
        self.inner.lock().store.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn clear(&self) {
        self.inner.lock().store.clear();
    }

    /// Drop all entries and reject further use. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        if !inner.disposed {
            inner.store.clear();
            inner.disposed = true;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn check_alive(&self) -> Result<(), DbError> {
        if self.disposed {
            return Err(DbError::Disposed("lru cache".into()));
        }
        Ok(())
    }
}
