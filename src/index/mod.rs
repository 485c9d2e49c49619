//! Index variants behind one capability set.
//!
//! Callers depend on [`Index`], never on a concrete variant; the
//! [`StoreIndex`] enum dispatches to the B-tree (ordered, the primary),
//! the hash index (equality-only, sorts on demand), or the skip list
//! (ordered, probabilistic).

pub mod btree;
pub mod hash;
pub mod skiplist;

pub use btree::BTreeIndex;
pub use hash::HashIndex;
pub use skiplist::SkipListIndex;

use crate::errors::DbError;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Ordered scalar key. `Null` exists so document fields without a usable
/// value surface as a domain error instead of being silently indexed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Null,
    Bool(bool),
    I64(i64),
    F64(OrderedFloat<f64>),
    Str(String),
}

impl IndexKey {
    /// Extract a key from a BSON field value; non-scalar values are `Null`.
    #[must_use]
    pub fn from_bson(value: &bson::Bson) -> Self {
        match value {
            bson::Bson::String(s) => Self::Str(s.clone()),
            bson::Bson::Int32(i) => Self::I64(i64::from(*i)),
            bson::Bson::Int64(i) => Self::I64(*i),
            bson::Bson::Double(f) => Self::F64(OrderedFloat(*f)),
            bson::Bson::Boolean(b) => Self::Bool(*b),
            _ => Self::Null,
        }
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for IndexKey {
    fn from(i: i64) -> Self {
        Self::I64(i)
    }
}

impl From<f64> for IndexKey {
    fn from(f: f64) -> Self {
        Self::F64(OrderedFloat(f))
    }
}

impl From<bool> for IndexKey {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Reject `Null` keys; every index operation goes through this.
pub(crate) fn check_key(key: &IndexKey) -> Result<(), DbError> {
    if matches!(key, IndexKey::Null) {
        return Err(DbError::InvalidArgument("null index key".into()));
    }
    Ok(())
}

/// Validate an inclusive range before snapshotting it.
pub(crate) fn check_range(start: &IndexKey, end: &IndexKey) -> Result<(), DbError> {
    check_key(start)?;
    check_key(end)?;
    if start > end {
        return Err(DbError::InvalidArgument(format!(
            "range start {start:?} is greater than end {end:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    BTree,
    Hash,
    SkipList,
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub keys: usize,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
}

/// The capability set shared by every index variant.
///
/// Range and enumeration results are snapshots taken under the variant's
/// internal lock and iterated outside it, keeping critical sections short.
pub trait Index<V: Clone + Send + Sync>: Send + Sync {
    /// # Errors
    /// `InvalidArgument` for a null key.
    fn get(&self, key: &IndexKey) -> Result<Option<V>, DbError>;

    /// Insert or update.
    ///
    /// # Errors
    /// `InvalidArgument` for a null key.
    fn put(&self, key: IndexKey, value: V) -> Result<(), DbError>;

    /// # Errors
    /// `InvalidArgument` for a null key.
    fn remove(&self, key: &IndexKey) -> Result<Option<V>, DbError>;

    /// # Errors
    /// `InvalidArgument` for a null key.
    fn contains_key(&self, key: &IndexKey) -> Result<bool, DbError> {
        Ok(self.get(key)?.is_some())
    }

    /// Entries with `start <= key <= end`, ordered by key.
    ///
    /// # Errors
    /// `InvalidArgument` for a null bound or `start > end`.
    fn range(&self, start: &IndexKey, end: &IndexKey) -> Result<Vec<(IndexKey, V)>, DbError>;

    /// All entries ordered by key.
    fn get_all(&self) -> Vec<(IndexKey, V)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn min_key(&self) -> Option<IndexKey>;

    fn max_key(&self) -> Option<IndexKey>;

    /// Up to `limit` keys strictly greater than `key`, ascending.
    fn keys_greater_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey>;

    /// Up to `limit` keys strictly less than `key`, descending.
    fn keys_less_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey>;

    /// # Errors
    /// `InvalidArgument` if any key is null; prior entries stay applied.
    fn insert_batch(&self, entries: Vec<(IndexKey, V)>) -> Result<(), DbError> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` if any key is null; prior removals stay applied.
    fn remove_batch(&self, keys: &[IndexKey]) -> Result<(), DbError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    fn clear(&self);

    /// No-op for the in-memory variants; part of the capability set so a
    /// paged variant can hook durability in.
    ///
    /// # Errors
    /// None for in-memory variants.
    fn flush(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn stats(&self) -> IndexStats;
}

/// Concrete index dispatch. Construct via [`StoreIndex::new`].
pub enum StoreIndex<V: Clone + Send + Sync> {
    BTree(BTreeIndex<V>),
    Hash(HashIndex<V>),
    SkipList(SkipListIndex<V>),
}

impl<V: Clone + Send + Sync> StoreIndex<V> {
    #[must_use]
    pub fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::BTree => Self::BTree(BTreeIndex::new()),
            IndexKind::Hash => Self::Hash(HashIndex::new()),
            IndexKind::SkipList => Self::SkipList(SkipListIndex::new()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> IndexKind {
        match self {
            Self::BTree(_) => IndexKind::BTree,
            Self::Hash(_) => IndexKind::Hash,
            Self::SkipList(_) => IndexKind::SkipList,
        }
    }

    fn as_index(&self) -> &dyn Index<V> {
        match self {
            Self::BTree(i) => i,
            Self::Hash(i) => i,
            Self::SkipList(i) => i,
        }
    }
}

impl<V: Clone + Send + Sync> Index<V> for StoreIndex<V> {
    fn get(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        self.as_index().get(key)
    }

    fn put(&self, key: IndexKey, value: V) -> Result<(), DbError> {
        self.as_index().put(key, value)
    }

    fn remove(&self, key: &IndexKey) -> Result<Option<V>, DbError> {
        self.as_index().remove(key)
    }

    fn range(&self, start: &IndexKey, end: &IndexKey) -> Result<Vec<(IndexKey, V)>, DbError> {
        self.as_index().range(start, end)
    }

    fn get_all(&self) -> Vec<(IndexKey, V)> {
        self.as_index().get_all()
    }

    fn len(&self) -> usize {
        self.as_index().len()
    }

    fn min_key(&self) -> Option<IndexKey> {
        self.as_index().min_key()
    }

    fn max_key(&self) -> Option<IndexKey> {
        self.as_index().max_key()
    }

    fn keys_greater_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        self.as_index().keys_greater_than(key, limit)
    }

    fn keys_less_than(&self, key: &IndexKey, limit: usize) -> Vec<IndexKey> {
        self.as_index().keys_less_than(key, limit)
    }

    fn clear(&self) {
        self.as_index().clear();
    }

    fn flush(&self) -> Result<(), DbError> {
        self.as_index().flush()
    }

    fn stats(&self) -> IndexStats {
        self.as_index().stats()
    }
}

/// Descriptor persisted with collection metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub field: String,
    pub kind: IndexKind,
}
