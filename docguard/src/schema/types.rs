use crate::storage::IndexModel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative description of one entity, loaded from a definition file.
/// Maps 1:1 to a storage collection named after `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Derived from the definition's file stem, never read from the file body.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "pluralLabel", alias = "plural_label", default)]
    pub plural_label: String,
    pub schema: FieldSchema,
    #[serde(default)]
    pub indexes: Vec<IndexModel>,
}

impl SchemaDefinition {
    /// Top-level field names an insert must supply.
    pub fn required_fields(&self) -> &[String] {
        &self.schema.required
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.schema.is_required(field)
    }

    /// Whether a dotted path (`meta.k`) names a field its enclosing object
    /// declares as required.
    pub fn requires_path(&self, path: &str) -> bool {
        self.schema.requires_path(path)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.schema.properties.get(name)
    }
}

/// One node of the typed field tree, written in the `$jsonSchema` dialect
/// (`bsonType`, `enum`, `items`, `required`, `properties`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub bson_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldSchema>,
}

impl FieldSchema {
    pub fn of_type(bson_type: &str) -> Self {
        FieldSchema {
            bson_type: bson_type.to_string(),
            description: None,
            enum_values: None,
            items: None,
            required: Vec::new(),
            additional_properties: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|r| r == field)
    }

    pub fn requires_path(&self, path: &str) -> bool {
        match path.split_once('.') {
            None => self.is_required(path),
            Some((head, rest)) => self
                .properties
                .get(head)
                .is_some_and(|child| child.requires_path(rest)),
        }
    }

    /// Nested objects are open unless they say otherwise.
    pub fn is_closed(&self) -> bool {
        self.additional_properties == Some(false)
    }
}
