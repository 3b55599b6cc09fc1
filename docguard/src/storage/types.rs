use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    /// `{field: 1 | -1}` in priority order.
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Inclusion (`{a: 1}`) or exclusion (`{a: 0}`) of top-level fields.
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        UpdateOptions { upsert: true }
    }
}

/// An index declaration: ordered key spec plus options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexModel {
    pub keys: Document,
    #[serde(default)]
    pub options: IndexOptions,
}

impl IndexModel {
    pub fn new(keys: Document) -> Self {
        IndexModel {
            keys,
            options: IndexOptions::default(),
        }
    }

    /// Explicit name, or the conventional `field_dir` join (`_id_1_test_1`).
    pub fn name(&self) -> String {
        if let Some(name) = &self.options.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, dir)| format!("{field}_{}", direction_label(dir)))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// The field names the index covers, in key order.
    pub fn fields(&self) -> Vec<&str> {
        self.keys.keys().map(String::as_str).collect()
    }
}

fn direction_label(dir: &Bson) -> String {
    match dir {
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) if n.fract() == 0.0 => format!("{n:.0}"),
        Bson::Double(n) => n.to_string(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_index_default_name() {
        let index = IndexModel::new(doc! { "_id": 1, "test": 1 });
        assert_eq!(index.name(), "_id_1_test_1");
        assert_eq!(index.fields(), vec!["_id", "test"]);
    }

    #[test]
    fn test_index_explicit_name() {
        let mut index = IndexModel::new(doc! { "created": -1 });
        assert_eq!(index.name(), "created_-1");
        index.options.name = Some("by_created".into());
        assert_eq!(index.name(), "by_created");
    }

    #[test]
    fn test_index_name_keeps_fractional_direction() {
        assert_eq!(IndexModel::new(doc! { "a": 1.0 }).name(), "a_1");
        assert_eq!(IndexModel::new(doc! { "a": -1.0 }).name(), "a_-1");
        assert_eq!(IndexModel::new(doc! { "a": 0.5 }).name(), "a_0.5");
        assert_eq!(IndexModel::new(doc! { "a": "text" }).name(), "a_text");
    }

    #[test]
    fn test_index_from_yaml() {
        let index: IndexModel =
            serde_yaml::from_str("keys: { email: 1 }\noptions: { unique: true }").unwrap();
        assert_eq!(index.name(), "email_1");
        assert!(index.options.unique);
    }
}
