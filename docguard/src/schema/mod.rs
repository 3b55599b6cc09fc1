mod parser;
mod types;

pub use parser::{check_definition, parse_definition, parse_definition_str};
pub use types::{FieldSchema, SchemaDefinition};
