mod config;

pub use config::LoaderConfig;

use crate::collection::ValidatedCollection;
use crate::error::{DocGuardError, Result};
use crate::schema::{parse_definition, SchemaDefinition};
use crate::storage::{self, Storage};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFINITION_FILE: &str = r"\.(ya?ml|json)$";

/// Every validated collection of an application, keyed by entity name.
/// Built once at startup and read-only afterwards.
pub struct Registry {
    storage: Arc<dyn Storage>,
    collections: HashMap<String, Arc<ValidatedCollection>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("collections", &self.names())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Connect to the configured storage and load the model directory.
    pub fn open(config: &LoaderConfig) -> Result<Self> {
        let storage = storage::connect(&config.connection)?;
        Self::load_directory(storage, &config.model_directory, config.provision)
    }

    /// Load one definition per matching file in `dir` (not recursive).
    pub fn load_directory(storage: Arc<dyn Storage>, dir: &Path, provision: bool) -> Result<Self> {
        if !dir.is_dir() {
            return Err(DocGuardError::Configuration(format!(
                "Model directory does not exist: {}",
                dir.display()
            )));
        }

        let pattern = Regex::new(DEFINITION_FILE)
            .map_err(|e| DocGuardError::Configuration(format!("Invalid file pattern: {e}")))?;
        let mut definitions = Vec::new();
        for path in list_matching(dir, &pattern)? {
            log::debug!("Loading definition {}", path.display());
            definitions.push(parse_definition(&path)?);
        }
        Self::from_definitions(storage, definitions, provision)
    }

    /// Build a registry from an explicit list of definitions.
    pub fn from_definitions(
        storage: Arc<dyn Storage>,
        definitions: Vec<SchemaDefinition>,
        provision: bool,
    ) -> Result<Self> {
        let mut collections = HashMap::with_capacity(definitions.len());
        for def in definitions {
            let name = def.name.clone();
            if collections.contains_key(&name) {
                return Err(DocGuardError::Configuration(format!(
                    "Collection '{name}' is defined more than once"
                )));
            }
            let collection = ValidatedCollection::new(def, Arc::clone(&storage))?;
            collections.insert(name, Arc::new(collection));
        }

        let registry = Registry {
            storage,
            collections,
        };
        if provision {
            for name in registry.names() {
                registry.get(&name)?.init()?;
            }
        }
        log::info!(
            "Loaded {} collections (provisioned: {provision})",
            registry.collections.len()
        );
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ValidatedCollection>> {
        self.collections
            .get(name)
            .cloned()
            .ok_or_else(|| DocGuardError::UnknownCollection(name.to_string()))
    }

    /// Entity names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Collections in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatedCollection> {
        self.collections.values().map(|c| c.as_ref())
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Files directly inside `dir` whose names match `pattern`, sorted by name.
pub fn list_matching(dir: &Path, pattern: &Regex) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        match file_name.to_str() {
            Some(name) if pattern.is_match(name) => out.push(entry.path()),
            _ => log::debug!("Skipping {}", entry.path().display()),
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::DocumentCollection;
    use crate::storage::{IndexModel, SqliteStorage};
    use bson::doc;
    use tempfile::TempDir;

    const BASIC: &str = "label: basic\npluralLabel: basics\nschema:\n  bsonType: object\n  required: [basic]\n  properties:\n    _id: { bsonType: objectId }\n    basic: { bsonType: string }\nindexes:\n  - keys: { basic: 1 }\n";

    const COMPLEX_JSON: &str = r#"{
  "label": "complex",
  "schema": {
    "bsonType": "object",
    "required": ["test_string"],
    "properties": {
      "_id": { "bsonType": "objectId" },
      "test_string": { "bsonType": "string" }
    }
  }
}"#;

    fn model_dir() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("basic.yaml"), BASIC).unwrap();
        std::fs::write(tmp.path().join("complex.json"), COMPLEX_JSON).unwrap();
        std::fs::write(tmp.path().join("README.md"), "not a model").unwrap();
        std::fs::create_dir(tmp.path().join("nested.yaml")).unwrap();
        tmp
    }

    fn memory() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::open_in_memory().unwrap())
    }

    #[test]
    fn test_list_matching() {
        let tmp = model_dir();
        let pattern = Regex::new(DEFINITION_FILE).unwrap();
        let files = list_matching(tmp.path(), &pattern).unwrap();
        assert_eq!(
            files,
            vec![tmp.path().join("basic.yaml"), tmp.path().join("complex.json")]
        );
    }

    #[test]
    fn test_load_directory_provisions() {
        let tmp = model_dir();
        let storage = memory();
        let registry = Registry::load_directory(storage.clone(), tmp.path(), true).unwrap();

        assert_eq!(registry.names(), vec!["basic".to_string(), "complex".to_string()]);
        assert_eq!(registry.len(), 2);
        assert_eq!(
            storage.list_collections().unwrap(),
            vec!["basic".to_string(), "complex".to_string()]
        );
        let names: Vec<String> = storage
            .list_indexes("basic")
            .unwrap()
            .iter()
            .map(IndexModel::name)
            .collect();
        assert_eq!(names, vec!["_id_".to_string(), "basic_1".to_string()]);

        let complex = registry.get("complex").unwrap();
        assert_eq!(complex.label(), "complex");
        assert_eq!(complex.plural_label(), "complexs");
    }

    #[test]
    fn test_load_directory_without_provisioning() {
        let tmp = model_dir();
        let storage = memory();
        let registry = Registry::load_directory(storage.clone(), tmp.path(), false).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(storage.list_collections().unwrap().is_empty());
    }

    #[test]
    fn test_load_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let err = Registry::load_directory(memory(), &tmp.path().join("nope"), true).unwrap_err();
        assert!(matches!(err, DocGuardError::Configuration(_)));
    }

    #[test]
    fn test_load_directory_bad_definition_fails() {
        let tmp = model_dir();
        std::fs::write(
            tmp.path().join("broken.yml"),
            "schema:\n  bsonType: object\n  properties:\n    x: { bsonType: javascript }\n",
        )
        .unwrap();
        let err = Registry::load_directory(memory(), tmp.path(), true).unwrap_err();
        assert!(matches!(err, DocGuardError::Configuration(ref m) if m.contains("broken")));
    }

    #[test]
    fn test_get_unknown() {
        let registry = Registry::from_definitions(memory(), vec![], true).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("nope"),
            Err(DocGuardError::UnknownCollection(ref n)) if n == "nope"
        ));
    }

    #[test]
    fn test_from_definitions_rejects_duplicates() {
        let def = crate::schema::parse_definition_str("basic", BASIC).unwrap();
        let err = Registry::from_definitions(memory(), vec![def.clone(), def], true).unwrap_err();
        assert!(matches!(err, DocGuardError::Configuration(ref m) if m.contains("basic")));
    }

    #[test]
    fn test_collections_share_storage() {
        let tmp = model_dir();
        let registry = Registry::load_directory(memory(), tmp.path(), true).unwrap();
        let basic = registry.get("basic").unwrap();
        basic.insert_one(doc! { "basic": "x" }).unwrap();

        assert_eq!(
            registry
                .storage()
                .count_documents("basic", &doc! {})
                .unwrap(),
            1
        );
        let mut labels: Vec<&str> = registry.iter().map(|c| c.label()).collect();
        labels.sort();
        assert_eq!(labels, vec!["basic", "complex"]);
    }

    #[test]
    fn test_open_from_config() {
        let tmp = model_dir();
        let config = LoaderConfig::new(
            format!("sqlite://{}", tmp.path().join("app.db").display()),
            tmp.path(),
        );
        let registry = Registry::open(&config).unwrap();
        registry
            .get("basic")
            .unwrap()
            .insert_one(doc! { "basic": "persisted" })
            .unwrap();
        drop(registry);

        let reopened = Registry::open(&LoaderConfig {
            provision: false,
            ..config
        })
        .unwrap();
        assert_eq!(
            reopened
                .get("basic")
                .unwrap()
                .count_documents(&doc! {})
                .unwrap(),
            1
        );
    }
}
