use crate::error::{DocGuardError, Result};
use crate::schema::{check_definition, SchemaDefinition};
use crate::storage::{
    DeleteResult, FindOptions, InsertManyResult, InsertOneResult, Storage, UpdateOptions,
    UpdateResult,
};
use crate::validation::{self, CompiledValidator};
use bson::{Bson, Document};
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// The data operations of a validated collection. Implemented only by
/// [`ValidatedCollection`]; result helpers consume it as `&dyn`.
pub trait DocumentCollection: sealed::Sealed + Send + Sync {
    fn name(&self) -> &str;
    fn label(&self) -> &str;
    fn plural_label(&self) -> &str;

    fn insert_one(&self, doc: Document) -> Result<InsertOneResult>;
    fn insert_many(&self, docs: Vec<Document>) -> Result<InsertManyResult>;
    fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Document>>;
    fn find_one(&self, filter: &Document) -> Result<Option<Document>>;
    fn count_documents(&self, filter: &Document) -> Result<u64>;
    fn distinct(&self, field: &str, filter: &Document) -> Result<Vec<Bson>>;
    fn delete_one(&self, filter: &Document) -> Result<DeleteResult>;
    fn delete_many(&self, filter: &Document) -> Result<DeleteResult>;
    fn update_many(
        &self,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;
}

/// A storage collection guarded by its schema definition.
///
/// Inserts are checked against every declared rule including required
/// fields. `update_one` picks the strictness from the operators present.
/// Reads, deletes and `update_many` go straight to storage, where the
/// constraint installed by [`init`](Self::init) still applies.
pub struct ValidatedCollection {
    definition: Arc<SchemaDefinition>,
    storage: Arc<dyn Storage>,
    strict: CompiledValidator,
    lenient: CompiledValidator,
    backup_name: String,
}

impl std::fmt::Debug for ValidatedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedCollection")
            .field("name", &self.definition.name)
            .field("backup_name", &self.backup_name)
            .finish_non_exhaustive()
    }
}

impl ValidatedCollection {
    /// Build both validators up front. An unrecognized field kind fails
    /// here, before the collection can be used.
    pub fn new(definition: SchemaDefinition, storage: Arc<dyn Storage>) -> Result<Self> {
        check_definition(&definition)?;
        let strict = validation::compile(&definition, true)?;
        let lenient = validation::compile(&definition, false)?;
        let backup_name = format!("{}.backup", definition.name);

        Ok(ValidatedCollection {
            definition: Arc::new(definition),
            storage,
            strict,
            lenient,
            backup_name,
        })
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    /// Name of the shadow collection holding the last backup.
    pub fn backup_name(&self) -> &str {
        &self.backup_name
    }

    pub fn validator(&self, enforce_required: bool) -> &CompiledValidator {
        if enforce_required {
            &self.strict
        } else {
            &self.lenient
        }
    }

    pub fn validate(&self, doc: &Document, enforce_required: bool) -> Result<()> {
        validation::validate(doc, self.validator(enforce_required))
    }

    /// Provision the backing collection: create it, attach the schema as a
    /// storage-tier constraint and create the declared indexes. Safe to
    /// call repeatedly.
    pub fn init(&self) -> Result<()> {
        let name = self.name();
        self.storage.create_collection(name)?;
        self.storage
            .install_validator(name, &self.definition.schema)?;
        for index in &self.definition.indexes {
            let index_name = self.storage.create_index(name, index)?;
            log::debug!("Index '{index_name}' ready on '{name}'");
        }
        log::info!(
            "Provisioned collection '{name}' ({} indexes)",
            self.definition.indexes.len()
        );
        Ok(())
    }

    /// Overwrite the backup slot with the current contents.
    pub fn backup(&self) -> Result<u64> {
        let copied = self
            .storage
            .replace_collection_contents(self.name(), &self.backup_name)?;
        log::debug!("Backed up {copied} documents from '{}'", self.name());
        Ok(copied)
    }

    /// Overwrite the collection with the contents of the backup slot.
    pub fn restore(&self) -> Result<u64> {
        let restored = self
            .storage
            .replace_collection_contents(&self.backup_name, self.name())?;
        log::debug!("Restored {restored} documents into '{}'", self.name());
        Ok(restored)
    }

    fn check_update(&self, update: &Document) -> Result<()> {
        if update.is_empty() {
            return Err(DocGuardError::InvalidUpdate("update document is empty".into()));
        }
        if let Some(key) = update.keys().find(|k| !k.starts_with('$')) {
            return Err(DocGuardError::InvalidUpdate(format!(
                "update document requires atomic operators, found '{key}'"
            )));
        }

        if let Some(unset) = operator_payload(update, "$unset")? {
            if let Some(field) = unset.keys().find(|k| self.definition.requires_path(k)) {
                return Err(DocGuardError::ProtectedField {
                    field: field.clone(),
                });
            }
        }

        let set = operator_payload(update, "$set")?;
        let set_on_insert = operator_payload(update, "$setOnInsert")?;
        match (set, set_on_insert) {
            (Some(set), Some(on_insert)) => {
                // together they may materialize a whole new document
                let mut merged = set.clone();
                for (key, value) in on_insert {
                    merged.insert(key.clone(), value.clone());
                }
                self.strict.validate(&merged)?;
            }
            (None, Some(on_insert)) => self.strict.validate(on_insert)?,
            // the target already satisfies required-ness
            (Some(set), None) => self.lenient.validate(set)?,
            (None, None) => {}
        }
        Ok(())
    }
}

fn operator_payload<'a>(update: &'a Document, op: &str) -> Result<Option<&'a Document>> {
    match update.get(op) {
        None => Ok(None),
        Some(Bson::Document(payload)) => Ok(Some(payload)),
        Some(_) => Err(DocGuardError::InvalidUpdate(format!(
            "{op} requires a document argument"
        ))),
    }
}

impl sealed::Sealed for ValidatedCollection {}

impl DocumentCollection for ValidatedCollection {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn label(&self) -> &str {
        &self.definition.label
    }

    fn plural_label(&self) -> &str {
        &self.definition.plural_label
    }

    fn insert_one(&self, doc: Document) -> Result<InsertOneResult> {
        self.strict.validate(&doc)?;
        Ok(self.storage.insert_one(self.name(), doc)?)
    }

    fn insert_many(&self, docs: Vec<Document>) -> Result<InsertManyResult> {
        // nothing is submitted unless every document passes
        for doc in &docs {
            self.strict.validate(doc)?;
        }
        Ok(self.storage.insert_many(self.name(), docs)?)
    }

    fn update_one(
        &self,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        self.check_update(update)?;
        Ok(self
            .storage
            .update_one(self.name(), filter, update, options)?)
    }

    fn find(&self, filter: &Document, options: &FindOptions) -> Result<Vec<Document>> {
        Ok(self.storage.find(self.name(), filter, options)?)
    }

    fn find_one(&self, filter: &Document) -> Result<Option<Document>> {
        Ok(self.storage.find_one(self.name(), filter)?)
    }

    fn count_documents(&self, filter: &Document) -> Result<u64> {
        Ok(self.storage.count_documents(self.name(), filter)?)
    }

    fn distinct(&self, field: &str, filter: &Document) -> Result<Vec<Bson>> {
        Ok(self.storage.distinct(self.name(), field, filter)?)
    }

    fn delete_one(&self, filter: &Document) -> Result<DeleteResult> {
        Ok(self.storage.delete_one(self.name(), filter)?)
    }

    fn delete_many(&self, filter: &Document) -> Result<DeleteResult> {
        Ok(self.storage.delete_many(self.name(), filter)?)
    }

    fn update_many(
        &self,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        Ok(self
            .storage
            .update_many(self.name(), filter, update, options)?)
    }
}
