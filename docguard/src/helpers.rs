//! Small builders for filters, query options and update documents.

use crate::error::{DocGuardError, Result};
use crate::storage::FindOptions;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// Copy a caller filter, renaming a top-level `id` key to `_id`.
pub fn create_filter(filter: &Document) -> Document {
    filter
        .iter()
        .map(|(key, value)| {
            let key = if key == "id" { "_id" } else { key.as_str() };
            (key.to_string(), value.clone())
        })
        .collect()
}

/// Caller-facing paging and ordering, before translation to [`FindOptions`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// `"asc"`; anything else sorts descending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

impl SortSpec {
    pub fn new(field: &str, dir: &str) -> Self {
        SortSpec {
            field: Some(field.to_string()),
            dir: Some(dir.to_string()),
        }
    }
}

pub fn create_options(options: &QueryOptions) -> Result<FindOptions> {
    let sort = match &options.sort {
        Some(specs) => {
            let mut sort = Document::new();
            for (i, spec) in specs.iter().enumerate() {
                let field = spec.field.as_deref().ok_or_else(|| {
                    DocGuardError::InvalidOptions(format!("sort field {i} must be defined"))
                })?;
                let dir = spec.dir.as_deref().ok_or_else(|| {
                    DocGuardError::InvalidOptions(format!(
                        "{field} sort direction must be defined"
                    ))
                })?;
                sort.insert(field, if dir == "asc" { 1 } else { -1 });
            }
            Some(sort)
        }
        None => None,
    };

    Ok(FindOptions {
        sort,
        skip: options.skip,
        limit: options.limit,
        projection: None,
    })
}

/// Add `key` to `update` as `$set` when a value is given, `$unset` otherwise.
pub fn set_unset_key(update: &mut Document, key: &str, value: Option<Bson>) {
    let (op, value) = match value {
        Some(value) => ("$set", value),
        None => ("$unset", Bson::String(String::new())),
    };
    match update.get_mut(op) {
        Some(Bson::Document(payload)) => {
            payload.insert(key, value);
        }
        _ => {
            let mut payload = Document::new();
            payload.insert(key, value);
            update.insert(op, payload);
        }
    }
}

/// Deterministic identifier for fixtures: the string's bytes as hex,
/// left-padded with zeros. `test_id("1")` is `000000000000000000000031`.
pub fn test_id(s: &str) -> Result<ObjectId> {
    if s.len() > 12 {
        return Err(DocGuardError::InvalidId(format!(
            "'{s}' is longer than 12 bytes"
        )));
    }
    let hex: String = s.bytes().map(|b| format!("{b:02x}")).collect();
    ObjectId::parse_str(format!("{hex:0>24}"))
        .map_err(|e| DocGuardError::InvalidId(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_filter_renames_id() {
        let filter = doc! {
            "id": "000000000000000000000031",
            "foo": "bar",
            "bin": true,
            "obj": { "foo": "bar", "bin": 1, "baz": false },
        };
        assert_eq!(
            create_filter(&filter),
            doc! {
                "_id": "000000000000000000000031",
                "foo": "bar",
                "bin": true,
                "obj": { "foo": "bar", "bin": 1, "baz": false },
            }
        );
    }

    #[test]
    fn test_create_filter_leaves_nested_id() {
        let filter = doc! { "obj": { "id": 1 } };
        assert_eq!(create_filter(&filter), filter);
    }

    #[test]
    fn test_create_options_empty() {
        assert_eq!(
            create_options(&QueryOptions::default()).unwrap(),
            FindOptions::default()
        );
    }

    #[test]
    fn test_create_options_full() {
        let options = QueryOptions {
            limit: Some(10),
            skip: Some(10),
            sort: Some(vec![SortSpec::new("foo", "asc"), SortSpec::new("bar", "desc")]),
        };
        let out = create_options(&options).unwrap();
        assert_eq!(out.limit, Some(10));
        assert_eq!(out.skip, Some(10));
        assert_eq!(out.sort, Some(doc! { "foo": 1, "bar": -1 }));
    }

    #[test]
    fn test_create_options_from_json() {
        let options: QueryOptions =
            serde_json::from_str(r#"{"limit": 2, "sort": [{"field": "a", "dir": "up"}]}"#)
                .unwrap();
        let out = create_options(&options).unwrap();
        assert_eq!(out.limit, Some(2));
        assert_eq!(out.sort, Some(doc! { "a": -1 }));
    }

    #[test]
    fn test_create_options_missing_direction() {
        let options = QueryOptions {
            sort: Some(vec![SortSpec {
                field: Some("foo".into()),
                dir: None,
            }]),
            ..QueryOptions::default()
        };
        let err = create_options(&options).unwrap_err();
        assert_eq!(err.to_string(), "foo sort direction must be defined");
    }

    #[test]
    fn test_create_options_missing_field() {
        let options = QueryOptions {
            sort: Some(vec![SortSpec {
                field: None,
                dir: Some("asc".into()),
            }]),
            ..QueryOptions::default()
        };
        let err = create_options(&options).unwrap_err();
        assert_eq!(err.to_string(), "sort field 0 must be defined");
    }

    #[test]
    fn test_set_unset_key() {
        let mut update = Document::new();
        set_unset_key(&mut update, "test", Some(Bson::from("test")));
        assert_eq!(update, doc! { "$set": { "test": "test" } });

        let mut update = Document::new();
        set_unset_key(&mut update, "test", None);
        assert_eq!(update, doc! { "$unset": { "test": "" } });
    }

    #[test]
    fn test_set_unset_key_accumulates() {
        let mut update = Document::new();
        set_unset_key(&mut update, "a", Some(Bson::Int32(1)));
        set_unset_key(&mut update, "b", Some(Bson::Int32(2)));
        set_unset_key(&mut update, "c", None);
        assert_eq!(
            update,
            doc! { "$set": { "a": 1, "b": 2 }, "$unset": { "c": "" } }
        );
    }

    #[test]
    fn test_test_id() {
        assert_eq!(test_id("1").unwrap().to_hex(), "000000000000000000000031");
        assert_eq!(test_id("").unwrap().to_hex(), "0".repeat(24));
        assert_eq!(
            test_id("foo").unwrap().to_hex(),
            "000000000000000000666f6f"
        );
    }

    #[test]
    fn test_test_id_too_long() {
        assert!(matches!(
            test_id("thirteen char"),
            Err(DocGuardError::InvalidId(_))
        ));
    }
}
