//! The storage seam: everything the validated layer needs from a document
//! database, plus an embedded SQLite-backed implementation.

mod query;
mod sqlite;
mod types;

pub use sqlite::SqliteStorage;
pub use types::{
    DeleteResult, FindOptions, IndexModel, IndexOptions, InsertManyResult, InsertOneResult,
    UpdateOptions, UpdateResult,
};

use crate::schema::FieldSchema;
use bson::{Bson, Document};
use std::sync::Arc;
use thiserror::Error;

/// Failures raised by a storage backend. The validated layer passes these
/// through unchanged.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("BSON encode error: {0}")]
    BsonSerialize(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    BsonDeserialize(#[from] bson::de::Error),

    #[error("E11000 duplicate key error collection: {collection} index: {index} dup key: {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    #[error("Document failed validation in '{collection}': {reason}")]
    DocumentValidation { collection: String, reason: String },

    #[error("Index '{index}' on '{collection}' already exists with different keys")]
    IndexConflict { collection: String, index: String },

    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Installed validator for '{collection}' is unusable: {reason}")]
    InvalidValidator { collection: String, reason: String },

    #[error("Invalid connection target '{0}'")]
    InvalidConnection(String),

    #[error("Storage connection lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A handle to a document database. Implementations must be safe to share
/// across threads; single-document writes are atomic.
pub trait Storage: Send + Sync {
    /// Create a collection. Creating one that exists is a no-op.
    fn create_collection(&self, name: &str) -> StorageResult<()>;

    fn list_collections(&self) -> StorageResult<Vec<String>>;

    /// Attach a rule set that every subsequent write to `name` must satisfy,
    /// replacing any earlier one.
    fn install_validator(&self, name: &str, schema: &FieldSchema) -> StorageResult<()>;

    /// Create an index, returning its name. Re-creating an identical index
    /// is a no-op.
    fn create_index(&self, name: &str, index: &IndexModel) -> StorageResult<String>;

    fn list_indexes(&self, name: &str) -> StorageResult<Vec<IndexModel>>;

    fn insert_one(&self, name: &str, doc: Document) -> StorageResult<InsertOneResult>;

    fn insert_many(&self, name: &str, docs: Vec<Document>) -> StorageResult<InsertManyResult>;

    fn find(
        &self,
        name: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>>;

    fn find_one(&self, name: &str, filter: &Document) -> StorageResult<Option<Document>> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.find(name, filter, &options)?.into_iter().next())
    }

    fn count_documents(&self, name: &str, filter: &Document) -> StorageResult<u64>;

    fn distinct(&self, name: &str, field: &str, filter: &Document) -> StorageResult<Vec<Bson>>;

    fn update_one(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> StorageResult<UpdateResult>;

    fn update_many(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> StorageResult<UpdateResult>;

    fn delete_one(&self, name: &str, filter: &Document) -> StorageResult<DeleteResult>;

    fn delete_many(&self, name: &str, filter: &Document) -> StorageResult<DeleteResult>;

    /// Replace every document in `target` with a copy of `source`'s
    /// documents in one step. Returns the number of documents copied.
    fn replace_collection_contents(&self, source: &str, target: &str) -> StorageResult<u64>;
}

/// Open a storage handle from a connection target: `sqlite::memory:`,
/// `sqlite://<path>`, or a bare path.
pub fn connect(target: &str) -> StorageResult<Arc<dyn Storage>> {
    let target = target.trim();
    if target.is_empty() {
        return Err(StorageError::InvalidConnection(target.to_string()));
    }
    let storage = if target == "sqlite::memory:" {
        SqliteStorage::open_in_memory()?
    } else if let Some(path) = target.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StorageError::InvalidConnection(target.to_string()));
        }
        SqliteStorage::open(std::path::Path::new(path))?
    } else if target.contains("://") {
        return Err(StorageError::InvalidConnection(target.to_string()));
    } else {
        SqliteStorage::open(std::path::Path::new(target))?
    };
    Ok(Arc::new(storage))
}
