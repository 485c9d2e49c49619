//! Collections: a thin, auto-committing facade over the transaction
//! stack, plus per-field secondary indexes.

use crate::document::Document;
use crate::errors::DbError;
use crate::index::{Index, IndexDescriptor, IndexKey, IndexKind, StoreIndex};
use crate::txn::{IsolationLevel, TransactionManager};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Collection {
    name: String,
    txns: Arc<TransactionManager>,
    /// Field path → index mapping field values to document ids.
    indexes: RwLock<HashMap<String, StoreIndex<String>>>,
}

impl Collection {
    #[must_use]
    pub fn new(name: String, txns: Arc<TransactionManager>) -> Self {
        Self { name, txns, indexes: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn path_for(&self, id: &str) -> String {
        format!("{}/{}", self.name, id)
    }

    /// Insert a document in its own transaction.
    ///
    /// # Errors
    /// `AlreadyExists` when the id is taken; transactional errors
    /// propagate.
    pub fn insert(&self, document: Document) -> Result<String, DbError> {
        let path = self.path_for(&document.id);
        if self.txns.versions().exists(&path) {
            return Err(DbError::AlreadyExists(path));
        }
        let tx = self.txns.begin(Some(IsolationLevel::Serializable));
        tx.write(&path, document.to_bytes()?)?;
        tx.commit()?;
        self.index_document(&document);
        log::debug!("collection {}: inserted {}", self.name, document.id);
        Ok(document.id)
    }

    /// Replace a document's body, bumping its version.
    ///
    /// # Errors
    /// `NotFound` for an unknown id; transactional errors propagate.
    pub fn update(&self, id: &str, data: bson::Document) -> Result<Document, DbError> {
        let path = self.path_for(id);
        let tx = self.txns.begin(Some(IsolationLevel::Serializable));
        let current = tx
            .read(&path)?
            .ok_or_else(|| DbError::NotFound(path.clone()))?;
        let mut document = Document::from_bytes(&current)?;
        self.unindex_document(&document);
        document.update(data);
        tx.write(&path, document.to_bytes()?)?;
        tx.commit()?;
        self.index_document(&document);
        Ok(document)
    }

    /// Delete a document.
    ///
    /// # Errors
    /// `NotFound` for an unknown id; transactional errors propagate.
    pub fn delete(&self, id: &str) -> Result<(), DbError> {
        let path = self.path_for(id);
        let tx = self.txns.begin(Some(IsolationLevel::Serializable));
        let current = tx
            .read(&path)?
            .ok_or_else(|| DbError::NotFound(path.clone()))?;
        let document = Document::from_bytes(&current)?;
        tx.delete(&path)?;
        tx.commit()?;
        self.unindex_document(&document);
        Ok(())
    }

    /// Newest committed copy of a document.
    ///
    /// # Errors
    /// Decoding errors propagate; a missing id is `Ok(None)`.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Document>, DbError> {
        match self.txns.versions().latest(&self.path_for(id)) {
            Some(bytes) => Ok(Some(Document::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All live documents, ordered by id.
    ///
    /// # Errors
    /// Decoding errors propagate.
    pub fn find_all(&self) -> Result<Vec<Document>, DbError> {
        let prefix = format!("{}/", self.name);
        let mut keys: Vec<String> = self
            .txns
            .versions()
            .live_keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();
        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.txns.versions().latest(&key) {
                documents.push(Document::from_bytes(&bytes)?);
            }
        }
        Ok(documents)
    }

    /// Number of live documents.
    pub fn count(&self) -> usize {
        let prefix = format!("{}/", self.name);
        self.txns
            .versions()
            .live_keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    /// Create (or rebuild) a single-field index over the collection.
    pub fn create_index(&self, field: &str, kind: IndexKind) {
        let index = StoreIndex::new(kind);
        if let Ok(documents) = self.find_all() {
            for document in documents {
                if let Some(value) = document.data.get(field) {
                    let key = IndexKey::from_bson(value);
                    if !matches!(key, IndexKey::Null) {
                        let _ = index.put(key, document.id.clone());
                    }
                }
            }
        }
        self.indexes.write().insert(field.to_string(), index);
        log::debug!("collection {}: indexed field {field} ({kind:?})", self.name);
    }

    pub fn drop_index(&self, field: &str) -> bool {
        self.indexes.write().remove(field).is_some()
    }

    /// Point lookup through a field index.
    ///
    /// # Errors
    /// `NotFound` when the field has no index; key errors propagate.
    pub fn find_by_field(
        &self,
        field: &str,
        value: &bson::Bson,
    ) -> Result<Option<Document>, DbError> {
        let indexes = self.indexes.read();
        let index = indexes
            .get(field)
            .ok_or_else(|| DbError::NotFound(format!("index on {field}")))?;
        let Some(id) = index.get(&IndexKey::from_bson(value))? else {
            return Ok(None);
        };
        drop(indexes);
        self.find_by_id(&id)
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes
            .read()
            .iter()
            .map(|(field, index)| IndexDescriptor { field: field.clone(), kind: index.kind() })
            .collect()
    }

    /// Delete every document in one transaction and reset the indexes.
    ///
    /// # Errors
    /// Transactional errors propagate; nothing is removed on failure.
    pub fn clear(&self) -> Result<usize, DbError> {
        let prefix = format!("{}/", self.name);
        let keys: Vec<String> = self
            .txns
            .versions()
            .live_keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let tx = self.txns.begin(Some(IsolationLevel::Serializable));
        for key in &keys {
            tx.delete(key)?;
        }
        tx.commit()?;
        for index in self.indexes.read().values() {
            index.clear();
        }
        Ok(keys.len())
    }

    fn index_document(&self, document: &Document) {
        let indexes = self.indexes.read();
        for (field, index) in indexes.iter() {
            if let Some(value) = document.data.get(field) {
                let key = IndexKey::from_bson(value);
                if !matches!(key, IndexKey::Null) {
                    let _ = index.put(key, document.id.clone());
                }
            }
        }
    }

    fn unindex_document(&self, document: &Document) {
        let indexes = self.indexes.read();
        for (field, index) in indexes.iter() {
            if let Some(value) = document.data.get(field) {
                let key = IndexKey::from_bson(value);
                if !matches!(key, IndexKey::Null) {
                    let _ = index.remove(&key);
                }
            }
        }
    }
}
