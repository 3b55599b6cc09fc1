use super::types::{FieldSchema, SchemaDefinition};
use crate::error::{DocGuardError, Result};
use std::path::Path;

/// Parse a definition file. The entity name is the file stem.
pub fn parse_definition(path: &Path) -> Result<SchemaDefinition> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            DocGuardError::Configuration(format!(
                "Cannot derive an entity name from {}",
                path.display()
            ))
        })?;
    let content = std::fs::read_to_string(path)?;
    parse_definition_str(name, &content)
}

/// Parse a definition from YAML (or JSON) text and check its invariants.
pub fn parse_definition_str(name: &str, content: &str) -> Result<SchemaDefinition> {
    let mut def: SchemaDefinition = serde_yaml::from_str(content)?;
    def.name = name.to_string();
    if def.label.is_empty() {
        def.label = name.to_string();
    }
    if def.plural_label.is_empty() {
        def.plural_label = format!("{}s", def.label);
    }
    check_definition(&def)?;
    Ok(def)
}

/// Structural invariants of a definition. Field kinds are checked later,
/// when the validators are compiled.
pub fn check_definition(def: &SchemaDefinition) -> Result<()> {
    if def.name.is_empty() {
        return Err(DocGuardError::Configuration(
            "Schema definition has no name".into(),
        ));
    }
    if def.schema.bson_type != "object" {
        return Err(DocGuardError::Configuration(format!(
            "Schema for '{}' must have bsonType 'object', found '{}'",
            def.name, def.schema.bson_type
        )));
    }
    if def.is_required("_id") {
        return Err(DocGuardError::Configuration(format!(
            "Schema for '{}' lists '_id' as required; identifiers are assigned by storage",
            def.name
        )));
    }
    check_required_declared(&def.name, "", &def.schema)
}

fn check_required_declared(entity: &str, prefix: &str, node: &FieldSchema) -> Result<()> {
    for required in &node.required {
        if !node.properties.contains_key(required) {
            return Err(DocGuardError::Configuration(format!(
                "Schema for '{entity}' requires '{prefix}{required}' which is not declared in properties"
            )));
        }
    }
    for (name, child) in &node.properties {
        let path = format!("{prefix}{name}.");
        check_required_declared(entity, &path, child)?;
        if let Some(items) = &child.items {
            check_required_declared(entity, &path, items)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_default_from_name() {
        let def = parse_definition_str(
            "widget",
            "schema:\n  bsonType: object\n  properties:\n    size: { bsonType: int }\n",
        )
        .unwrap();
        assert_eq!(def.name, "widget");
        assert_eq!(def.label, "widget");
        assert_eq!(def.plural_label, "widgets");
        assert!(def.indexes.is_empty());
    }

    #[test]
    fn test_required_must_be_declared() {
        let err = parse_definition_str(
            "widget",
            "schema:\n  bsonType: object\n  required: [size, color]\n  properties:\n    size: { bsonType: int }\n",
        )
        .unwrap_err();
        assert!(matches!(err, DocGuardError::Configuration(ref m) if m.contains("color")));
    }

    #[test]
    fn test_nested_required_must_be_declared() {
        let yaml = r#"
schema:
  bsonType: object
  properties:
    meta:
      bsonType: object
      required: [missing]
      properties:
        present: { bsonType: string }
"#;
        let err = parse_definition_str("widget", yaml).unwrap_err();
        assert!(matches!(err, DocGuardError::Configuration(ref m) if m.contains("meta.missing")));
    }

    #[test]
    fn test_requires_path_follows_nested_objects() {
        let def = parse_definition_str(
            "doc",
            r#"
schema:
  bsonType: object
  required: [title]
  properties:
    title: { bsonType: string }
    meta:
      bsonType: object
      required: [k]
      properties:
        k: { bsonType: string }
        note: { bsonType: string }
    tags: { bsonType: array, items: { bsonType: string } }
"#,
        )
        .unwrap();
        assert!(def.requires_path("title"));
        assert!(def.requires_path("meta.k"));
        assert!(!def.requires_path("meta"));
        assert!(!def.requires_path("meta.note"));
        assert!(!def.requires_path("tags.0"));
        assert!(!def.requires_path("missing.k"));
    }

    #[test]
    fn test_id_never_required() {
        let yaml = "schema:\n  bsonType: object\n  required: [_id]\n  properties:\n    _id: { bsonType: objectId }\n";
        assert!(matches!(
            parse_definition_str("widget", yaml),
            Err(DocGuardError::Configuration(_))
        ));
    }

    #[test]
    fn test_top_level_must_be_object() {
        let yaml = "schema:\n  bsonType: string\n";
        assert!(matches!(
            parse_definition_str("widget", yaml),
            Err(DocGuardError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "label": "thing",
            "pluralLabel": "things",
            "schema": {
                "bsonType": "object",
                "required": ["title"],
                "properties": { "title": { "bsonType": "string" } }
            },
            "indexes": [ { "keys": { "title": 1 }, "options": { "unique": true } } ]
        }"#;
        let def = parse_definition_str("thing", json).unwrap();
        assert_eq!(def.plural_label, "things");
        assert_eq!(def.required_fields(), &["title".to_string()]);
        assert_eq!(def.indexes.len(), 1);
        assert!(def.indexes[0].options.unique);
    }
}
