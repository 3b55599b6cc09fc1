pub mod collection;
pub mod error;
pub mod helpers;
pub mod registry;
pub mod results;
pub mod scalar;
pub mod schema;
pub mod storage;
pub mod validation;

pub use collection::{DocumentCollection, ValidatedCollection};
pub use error::{DocGuardError, Result};
pub use registry::{LoaderConfig, Registry};
pub use schema::SchemaDefinition;
pub use storage::{Storage, StorageError};
