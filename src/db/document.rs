//! Abstract document store used by the monitor.
//!
//! Documents are JSON objects addressed by `(collection, id)` and carry a
//! version that increases on every write. Updates merge top-level fields and
//! may be guarded by the version the caller last read.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Top-level fields of a document.
pub type Fields = Map<String, Value>;

/// Document store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("document {collection}/{id} changed: expected version {expected}, found {actual}")]
    Conflict {
        collection: String,
        id: String,
        expected: i64,
        actual: i64,
    },
    #[error("store lock poisoned")]
    Poisoned,
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub fields: Fields,
}

/// Query predicate on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equal(String, Value),
    LessThanEqual(String, Value),
}

impl Filter {
    pub fn equal(field: &str, value: impl Into<Value>) -> Self {
        Filter::Equal(field.to_string(), value.into())
    }

    pub fn less_than_equal(field: &str, value: impl Into<Value>) -> Self {
        Filter::LessThanEqual(field.to_string(), value.into())
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return up to `limit` documents of `collection` matching every filter.
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create a document; fails with [`StoreError::AlreadyExists`] if the id is taken.
    async fn create(&self, collection: &str, id: &str, fields: Fields)
        -> Result<Document, StoreError>;

    /// Merge `fields` into an existing document.
    ///
    /// With `expected_version` set, the write only happens if the stored
    /// version still matches, otherwise [`StoreError::Conflict`] is returned.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        expected_version: Option<i64>,
    ) -> Result<Document, StoreError>;
}

/// Serialize a struct into top-level document fields.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::Serde(serde::ser::Error::custom(format!(
            "expected an object, got {}",
            other
        )))),
    }
}
