//! Shaping of operation outcomes into caller-facing results and messages.

use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::storage::{DeleteResult, FindOptions, UpdateResult};
use bson::Document;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindResult {
    pub success: bool,
    pub message: String,
    pub docs: Vec<Document>,
    /// Count of all documents matching the filter, ignoring paging.
    pub count: u64,
}

/// Run a find and a count over the same filter.
pub fn find_result(
    collection: &dyn DocumentCollection,
    filter: &Document,
    options: &FindOptions,
) -> Result<FindResult> {
    let docs = collection.find(filter, options)?;
    let count = collection.count_documents(filter)?;
    Ok(FindResult {
        success: true,
        message: String::new(),
        docs,
        count,
    })
}

/// `"1 basic removed."` / `"3 basics removed."`
pub fn remove_message(collection: &dyn DocumentCollection, result: &DeleteResult) -> String {
    let label = if result.deleted_count == 1 {
        collection.label()
    } else {
        collection.plural_label()
    };
    format!("{} {label} removed.", result.deleted_count)
}

/// A non-blank caller message wins; otherwise `"<label> created."` when the
/// update inserted, `"<label> updated."` when it did not.
pub fn upsert_message(
    collection: &dyn DocumentCollection,
    result: &UpdateResult,
    message: Option<&str>,
) -> String {
    if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
        return message.to_string();
    }
    let op = if result.upserted_count == 1 {
        "created"
    } else {
        "updated"
    };
    format!("{} {op}.", collection.label())
}

/// Re-read the document an upsert targeted. `None` when it failed.
pub fn upsert_doc(
    collection: &dyn DocumentCollection,
    filter: &Document,
    success: bool,
) -> Result<Option<Document>> {
    if !success {
        return Ok(None);
    }
    collection.find_one(filter)
}
