use crate::errors::DbError;
use bson::Document as BsonDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored document: identity, a monotonically growing version, audit
/// timestamps, and an insertion-ordered field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique within its collection; generated when absent.
    pub id: String,
    /// Starts at 1, bumped on every committed write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: BsonDocument,
}

impl Document {
    /// New document with a generated id.
    #[must_use]
    pub fn new(data: BsonDocument) -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string(), data)
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>, data: BsonDocument) -> Self {
        let now = Utc::now();
        Self { id: id.into(), version: 1, created_at: now, updated_at: now, data }
    }

    /// Replace the body, bumping version and `updated_at`.
    pub fn update(&mut self, data: BsonDocument) {
        self.data = data;
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Serialize for storage.
    ///
    /// # Errors
    /// Propagates BSON encoding errors.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DbError> {
        Ok(bson::serialize_to_vec(self)?)
    }

    /// # Errors
    /// Propagates BSON decoding errors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DbError> {
        Ok(bson::deserialize_from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn round_trip_preserves_field_order() {
        let document = Document::new(doc! { "b": 2, "a": 1, "nested": { "x": true } });
        let bytes = document.to_bytes().unwrap();
        let decoded = Document::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, document);
        let fields: Vec<&str> = decoded.data.keys().map(String::as_str).collect();
        assert_eq!(fields, vec!["b", "a", "nested"]);
    }

    #[test]
    fn update_bumps_version() {
        let mut document = Document::new(doc! { "n": 1 });
        assert_eq!(document.version, 1);
        document.update(doc! { "n": 2 });
        assert_eq!(document.version, 2);
        assert!(document.updated_at >= document.created_at);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Document::new(doc! {});
        let b = Document::new(doc! {});
        assert_ne!(a.id, b.id);
    }
}
