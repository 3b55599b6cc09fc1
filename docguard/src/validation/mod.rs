use crate::error::{DocGuardError, Result};
use crate::schema::{FieldSchema, SchemaDefinition};
use bson::{Bson, Document};
use std::fmt;
use thiserror::Error;

/// The resolved kind of a declared field. Every `bsonType` the definition
/// format accepts maps onto exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Identifier,
    String { allowed: Option<Vec<String>> },
    Number,
    Boolean,
    Date,
    /// `None` accepts items of any kind.
    Array(Option<Box<FieldKind>>),
    Object(ObjectRules),
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Identifier => "objectId",
            FieldKind::String { .. } => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Array(_) => "array",
            FieldKind::Object(_) => "object",
        }
    }
}

/// Rules for the fields of one object level.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRules {
    pub fields: Vec<FieldRule>,
    /// Closed objects reject keys with no rule.
    pub closed: bool,
    /// Accept `_id` even when undeclared. Only the document root sets this,
    /// since storage assigns the identifier there.
    pub implicit_id: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub name: String,
    pub required: bool,
    pub kind: FieldKind,
}

/// An immutable rule set built from a schema for one required-enforcement
/// mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledValidator {
    enforce_required: bool,
    root: ObjectRules,
}

impl CompiledValidator {
    pub fn enforces_required(&self) -> bool {
        self.enforce_required
    }

    /// Flat list of top-level rules, in evaluation order.
    pub fn fields(&self) -> &[FieldRule] {
        &self.root.fields
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.root.fields.iter().find(|r| r.name == name)
    }

    /// Check a candidate document, stopping at the first violation.
    pub fn validate(&self, doc: &Document) -> std::result::Result<(), ValidationError> {
        check_object(&self.root, doc, "")
    }
}

/// Why a field was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    Missing,
    UnknownField,
    WrongType {
        expected: &'static str,
        found: &'static str,
    },
    NotInEnum {
        value: String,
        allowed: Vec<String>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing => write!(f, "is required but does not exist"),
            Violation::UnknownField => write!(f, "is not declared in schema"),
            Violation::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            Violation::NotInEnum { value, allowed } => {
                write!(f, "value '{value}' is not one of {allowed:?}")
            }
        }
    }
}

/// The first offending field of a document and the reason.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("field '{field}' {violation}")]
pub struct ValidationError {
    pub field: String,
    pub violation: Violation,
}

/// Compile a definition's field tree. Fails fast on an unrecognized
/// `bsonType`.
pub fn compile(def: &SchemaDefinition, enforce_required: bool) -> Result<CompiledValidator> {
    compile_schema(&def.schema, enforce_required).map_err(|e| match e {
        DocGuardError::Configuration(msg) => {
            DocGuardError::Configuration(format!("{}: {msg}", def.name))
        }
        other => other,
    })
}

/// Compile a bare object schema (used by the storage tier, which only
/// receives the schema node).
pub fn compile_schema(schema: &FieldSchema, enforce_required: bool) -> Result<CompiledValidator> {
    let mut root = compile_object(schema, enforce_required, "")?;
    // top level is always closed
    root.closed = true;
    root.implicit_id = true;
    Ok(CompiledValidator {
        enforce_required,
        root,
    })
}

/// Free-standing form of [`CompiledValidator::validate`].
pub fn validate(doc: &Document, validator: &CompiledValidator) -> Result<()> {
    validator.validate(doc)?;
    Ok(())
}

fn compile_object(node: &FieldSchema, enforce_required: bool, prefix: &str) -> Result<ObjectRules> {
    let mut fields = Vec::with_capacity(node.properties.len());
    for (name, child) in &node.properties {
        let path = join_path(prefix, name);
        fields.push(FieldRule {
            name: name.clone(),
            required: enforce_required && node.is_required(name),
            kind: resolve_kind(child, enforce_required, &path)?,
        });
    }
    Ok(ObjectRules {
        fields,
        closed: node.is_closed(),
        implicit_id: false,
    })
}

fn resolve_kind(node: &FieldSchema, enforce_required: bool, path: &str) -> Result<FieldKind> {
    let kind = match node.bson_type.as_str() {
        "objectId" => FieldKind::Identifier,
        "string" => FieldKind::String {
            allowed: node.enum_values.clone(),
        },
        "int" | "long" | "double" | "decimal" | "number" => FieldKind::Number,
        "date" => FieldKind::Date,
        "bool" => FieldKind::Boolean,
        "array" => {
            let items = match &node.items {
                Some(items) => Some(Box::new(resolve_kind(
                    items,
                    enforce_required,
                    &format!("{path}[]"),
                )?)),
                None => None,
            };
            FieldKind::Array(items)
        }
        "object" => FieldKind::Object(compile_object(node, enforce_required, path)?),
        other => {
            return Err(DocGuardError::Configuration(format!(
                "Unmapped bsonType '{other}' for field '{path}'"
            )))
        }
    };
    Ok(kind)
}

fn check_object(
    rules: &ObjectRules,
    doc: &Document,
    prefix: &str,
) -> std::result::Result<(), ValidationError> {
    for rule in &rules.fields {
        let path = join_path(prefix, &rule.name);
        match doc.get(&rule.name) {
            Some(value) => check_value(&rule.kind, value, &path)?,
            None if rule.required => {
                return Err(ValidationError {
                    field: path,
                    violation: Violation::Missing,
                })
            }
            None => {}
        }
    }

    if rules.closed {
        for key in doc.keys() {
            if rules.implicit_id && key == "_id" {
                continue;
            }
            if !rules.fields.iter().any(|r| &r.name == key) {
                return Err(ValidationError {
                    field: join_path(prefix, key),
                    violation: Violation::UnknownField,
                });
            }
        }
    }

    Ok(())
}

fn check_value(kind: &FieldKind, value: &Bson, path: &str) -> std::result::Result<(), ValidationError> {
    match (kind, value) {
        (FieldKind::Identifier, Bson::ObjectId(_)) => Ok(()),
        (FieldKind::String { allowed }, Bson::String(s)) => match allowed {
            Some(allowed) if !allowed.iter().any(|a| a == s) => Err(ValidationError {
                field: path.to_string(),
                violation: Violation::NotInEnum {
                    value: s.clone(),
                    allowed: allowed.clone(),
                },
            }),
            _ => Ok(()),
        },
        (
            FieldKind::Number,
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_),
        ) => Ok(()),
        (FieldKind::Boolean, Bson::Boolean(_)) => Ok(()),
        (FieldKind::Date, Bson::DateTime(_)) => Ok(()),
        (FieldKind::Array(items), Bson::Array(values)) => {
            if let Some(item_kind) = items {
                for (i, item) in values.iter().enumerate() {
                    check_value(item_kind, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        (FieldKind::Object(rules), Bson::Document(doc)) => check_object(rules, doc, path),
        (kind, other) => Err(ValidationError {
            field: path.to_string(),
            violation: Violation::WrongType {
                expected: kind.name(),
                found: type_name(other),
            },
        }),
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub(crate) fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null | Bson::Undefined => "null",
        Bson::Boolean(_) => "boolean",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => "number",
        Bson::String(_) | Bson::Symbol(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) | Bson::Timestamp(_) => "date",
        _ => "other",
    }
}
