//! Identifier codec: ObjectIds to and from their 24-character hex form.

use crate::error::{DocGuardError, Result};
use bson::oid::ObjectId;
use bson::Bson;

/// Render an identifier as hex. A string that already parses as an
/// ObjectId is passed through normalized.
pub fn serialize_object_id(value: &Bson) -> Result<String> {
    match value {
        Bson::ObjectId(oid) => Ok(oid.to_hex()),
        Bson::String(s) => parse_object_id(s).map(|oid| oid.to_hex()),
        other => Err(DocGuardError::InvalidId(format!(
            "cannot serialize {} as an identifier",
            crate::validation::type_name(other)
        ))),
    }
}

pub fn parse_object_id(s: &str) -> Result<ObjectId> {
    ObjectId::parse_str(s).map_err(|e| DocGuardError::InvalidId(format!("'{s}': {e}")))
}
