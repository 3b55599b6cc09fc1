use super::query;
use super::{
    DeleteResult, FindOptions, IndexModel, IndexOptions, InsertManyResult, InsertOneResult,
    Storage, StorageError, StorageResult, UpdateOptions, UpdateResult,
};
use crate::schema::FieldSchema;
use crate::validation::{self, CompiledValidator};
use bson::{doc, oid::ObjectId, Bson, Document};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// An embedded document store on top of SQLite. Documents are kept as BSON
/// blobs in insertion order; queries scan the collection.
pub struct SqliteStorage {
    inner: Mutex<Inner>,
}

struct Inner {
    conn: Connection,
    /// Compiled storage-tier constraints, loaded lazily per collection.
    validators: HashMap<String, Option<Arc<CompiledValidator>>>,
}

impl SqliteStorage {
    /// Open or create a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        initialize_tables(&conn)?;
        Ok(SqliteStorage {
            inner: Mutex::new(Inner {
                conn,
                validators: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn initialize_tables(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            validator BLOB,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            spec BLOB NOT NULL,
            PRIMARY KEY (collection, name)
        );

        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            doc_key TEXT NOT NULL,
            body BLOB NOT NULL,
            UNIQUE (collection, doc_key)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, seq);
        ",
    )?;
    Ok(())
}

impl Storage for SqliteStorage {
    fn create_collection(&self, name: &str) -> StorageResult<()> {
        let inner = self.lock()?;
        ensure_collection(&inner.conn, name)
    }

    fn list_collections(&self) -> StorageResult<Vec<String>> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT name FROM collections ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn install_validator(&self, name: &str, schema: &FieldSchema) -> StorageResult<()> {
        let compiled = validation::compile_schema(schema, true).map_err(|e| {
            StorageError::InvalidValidator {
                collection: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        let blob = bson::to_vec(schema)?;

        let mut inner = self.lock()?;
        ensure_collection(&inner.conn, name)?;
        inner.conn.execute(
            "UPDATE collections SET validator = ?2 WHERE name = ?1",
            params![name, blob],
        )?;
        inner
            .validators
            .insert(name.to_string(), Some(Arc::new(compiled)));
        Ok(())
    }

    fn create_index(&self, name: &str, index: &IndexModel) -> StorageResult<String> {
        let index_name = index.name();
        if index_name == ID_INDEX {
            return Ok(index_name);
        }

        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        ensure_collection(&tx, name)?;

        let existing: Option<Vec<u8>> = tx
            .query_row(
                "SELECT spec FROM indexes WHERE collection = ?1 AND name = ?2",
                params![name, index_name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(blob) = existing {
            let current: IndexModel = bson::from_slice(&blob)?;
            if same_keys(&current.keys, &index.keys) && current.options.unique == index.options.unique {
                return Ok(index_name);
            }
            return Err(StorageError::IndexConflict {
                collection: name.to_string(),
                index: index_name,
            });
        }

        if index.options.unique {
            let docs = load_documents(&tx, name)?;
            for (i, (_, doc)) in docs.iter().enumerate() {
                let key = index_key(index, doc);
                if docs[i + 1..]
                    .iter()
                    .any(|(_, other)| keys_equal(&key, &index_key(index, other)))
                {
                    return Err(StorageError::DuplicateKey {
                        collection: name.to_string(),
                        index: index_name,
                        key: describe_key(index, &key),
                    });
                }
            }
        }

        tx.execute(
            "INSERT INTO indexes (collection, name, spec) VALUES (?1, ?2, ?3)",
            params![name, index_name, bson::to_vec(index)?],
        )?;
        tx.commit()?;
        Ok(index_name)
    }

    fn list_indexes(&self, name: &str) -> StorageResult<Vec<IndexModel>> {
        let inner = self.lock()?;
        let mut indexes = vec![id_index()];
        indexes.extend(stored_indexes(&inner.conn, name)?);
        Ok(indexes)
    }

    fn insert_one(&self, name: &str, doc: Document) -> StorageResult<InsertOneResult> {
        let mut inner = self.lock()?;
        let Inner { conn, validators } = &mut *inner;
        let tx = conn.transaction()?;
        let inserted_id = insert_document(&tx, validators, name, doc)?;
        tx.commit()?;
        Ok(InsertOneResult { inserted_id })
    }

    fn insert_many(&self, name: &str, docs: Vec<Document>) -> StorageResult<InsertManyResult> {
        let mut inner = self.lock()?;
        let Inner { conn, validators } = &mut *inner;
        // one transaction: a failure on any document leaves the collection untouched
        let tx = conn.transaction()?;
        let mut inserted_ids = Vec::with_capacity(docs.len());
        for doc in docs {
            inserted_ids.push(insert_document(&tx, validators, name, doc)?);
        }
        tx.commit()?;
        Ok(InsertManyResult { inserted_ids })
    }

    fn find(
        &self,
        name: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StorageResult<Vec<Document>> {
        let inner = self.lock()?;
        let mut docs = Vec::new();
        for (_, doc) in load_documents(&inner.conn, name)? {
            if query::matches(&doc, filter)? {
                docs.push(doc);
            }
        }
        drop(inner);

        if let Some(sort) = &options.sort {
            query::sort_documents(&mut docs, sort);
        }
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(docs
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| match &options.projection {
                Some(projection) => query::project(doc, projection),
                None => doc,
            })
            .collect())
    }

    fn count_documents(&self, name: &str, filter: &Document) -> StorageResult<u64> {
        let inner = self.lock()?;
        let mut count = 0;
        for (_, doc) in load_documents(&inner.conn, name)? {
            if query::matches(&doc, filter)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn distinct(&self, name: &str, field: &str, filter: &Document) -> StorageResult<Vec<Bson>> {
        let inner = self.lock()?;
        let mut matched = Vec::new();
        for (_, doc) in load_documents(&inner.conn, name)? {
            if query::matches(&doc, filter)? {
                matched.push(doc);
            }
        }
        Ok(query::distinct_values(matched.iter(), field))
    }

    fn update_one(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> StorageResult<UpdateResult> {
        self.update(name, filter, update, options, false)
    }

    fn update_many(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
    ) -> StorageResult<UpdateResult> {
        self.update(name, filter, update, options, true)
    }

    fn delete_one(&self, name: &str, filter: &Document) -> StorageResult<DeleteResult> {
        self.delete(name, filter, false)
    }

    fn delete_many(&self, name: &str, filter: &Document) -> StorageResult<DeleteResult> {
        self.delete(name, filter, true)
    }

    fn replace_collection_contents(&self, source: &str, target: &str) -> StorageResult<u64> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        ensure_collection(&tx, target)?;
        tx.execute("DELETE FROM documents WHERE collection = ?1", params![target])?;
        let copied = tx.execute(
            "INSERT INTO documents (collection, doc_key, body)
             SELECT ?2, doc_key, body FROM documents WHERE collection = ?1 ORDER BY seq",
            params![source, target],
        )?;
        tx.commit()?;
        Ok(copied as u64)
    }
}

impl SqliteStorage {
    fn update(
        &self,
        name: &str,
        filter: &Document,
        update: &Document,
        options: &UpdateOptions,
        multi: bool,
    ) -> StorageResult<UpdateResult> {
        let mut inner = self.lock()?;
        let Inner { conn, validators } = &mut *inner;
        let tx = conn.transaction()?;
        ensure_collection(&tx, name)?;

        let mut result = UpdateResult::default();
        for (seq, doc) in load_documents(&tx, name)? {
            if !query::matches(&doc, filter)? {
                continue;
            }
            result.matched_count += 1;

            let mut updated = doc;
            if query::apply_update(&mut updated, update, false)? {
                check_constraint(&tx, validators, name, &updated)?;
                check_unique(&tx, name, &updated, Some(seq))?;
                tx.execute(
                    "UPDATE documents SET body = ?2 WHERE seq = ?1",
                    params![seq, bson::to_vec(&updated)?],
                )?;
                result.modified_count += 1;
            }

            if !multi {
                break;
            }
        }

        if result.matched_count == 0 {
            if options.upsert {
                let mut seed = query::upsert_seed(filter)?;
                query::apply_update(&mut seed, update, true)?;
                let id = insert_document(&tx, validators, name, seed)?;
                result.upserted_count = 1;
                result.upserted_id = Some(id);
            } else {
                // surface malformed updates even when nothing matched
                query::apply_update(&mut Document::new(), update, false)?;
            }
        }

        tx.commit()?;
        Ok(result)
    }

    fn delete(&self, name: &str, filter: &Document, multi: bool) -> StorageResult<DeleteResult> {
        let mut inner = self.lock()?;
        let tx = inner.conn.transaction()?;
        let mut deleted_count = 0;
        for (seq, doc) in load_documents(&tx, name)? {
            if query::matches(&doc, filter)? {
                tx.execute("DELETE FROM documents WHERE seq = ?1", params![seq])?;
                deleted_count += 1;
                if !multi {
                    break;
                }
            }
        }
        tx.commit()?;
        Ok(DeleteResult { deleted_count })
    }
}

// ── Collections ──────────────────────────────────────────────────

fn ensure_collection(conn: &Connection, name: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
        params![name],
    )?;
    Ok(())
}

fn load_documents(conn: &Connection, name: &str) -> StorageResult<Vec<(i64, Document)>> {
    let mut stmt =
        conn.prepare("SELECT seq, body FROM documents WHERE collection = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![name], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (seq, body) = row?;
        docs.push((seq, bson::from_slice::<Document>(&body)?));
    }
    Ok(docs)
}

// ── Writes ───────────────────────────────────────────────────────

fn insert_document(
    conn: &Connection,
    validators: &mut HashMap<String, Option<Arc<CompiledValidator>>>,
    name: &str,
    doc: Document,
) -> StorageResult<Bson> {
    ensure_collection(conn, name)?;
    let doc = with_id(doc);
    let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
    let key = id_key(&id);

    check_constraint(conn, validators, name, &doc)?;

    let taken = conn
        .query_row(
            "SELECT 1 FROM documents WHERE collection = ?1 AND doc_key = ?2",
            params![name, key],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if taken {
        return Err(StorageError::DuplicateKey {
            collection: name.to_string(),
            index: ID_INDEX.to_string(),
            key: format!("{{ _id: {id} }}"),
        });
    }
    check_unique(conn, name, &doc, None)?;

    conn.execute(
        "INSERT INTO documents (collection, doc_key, body) VALUES (?1, ?2, ?3)",
        params![name, key, bson::to_vec(&doc)?],
    )?;
    Ok(id)
}

/// Ensure `_id` is present, generating one and placing it first if not.
fn with_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = doc! { "_id": ObjectId::new() };
    for (key, value) in doc {
        out.insert(key, value);
    }
    out
}

/// Canonical key for an `_id` so numerically equal ids collide. Integers
/// keep every digit; a double with no fractional part keys as its integer.
fn id_key(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => format!("oid:{}", oid.to_hex()),
        Bson::String(s) => format!("str:{s}"),
        Bson::Int32(n) => format!("num:{n}"),
        Bson::Int64(n) => format!("num:{n}"),
        Bson::Double(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
            format!("num:{}", *n as i64)
        }
        Bson::Double(n) => format!("num:{n}"),
        other => format!("ext:{}", other.clone().into_relaxed_extjson()),
    }
}

fn check_constraint(
    conn: &Connection,
    validators: &mut HashMap<String, Option<Arc<CompiledValidator>>>,
    name: &str,
    doc: &Document,
) -> StorageResult<()> {
    if !validators.contains_key(name) {
        let loaded = load_validator(conn, name)?;
        validators.insert(name.to_string(), loaded);
    }
    if let Some(Some(validator)) = validators.get(name) {
        validator
            .validate(doc)
            .map_err(|e| StorageError::DocumentValidation {
                collection: name.to_string(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

fn load_validator(conn: &Connection, name: &str) -> StorageResult<Option<Arc<CompiledValidator>>> {
    let blob: Option<Option<Vec<u8>>> = conn
        .query_row(
            "SELECT validator FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    let Some(Some(blob)) = blob else {
        return Ok(None);
    };
    let schema: FieldSchema = bson::from_slice(&blob)?;
    let compiled = validation::compile_schema(&schema, true).map_err(|e| {
        StorageError::InvalidValidator {
            collection: name.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(Some(Arc::new(compiled)))
}

// ── Indexes ──────────────────────────────────────────────────────

const ID_INDEX: &str = "_id_";

fn id_index() -> IndexModel {
    IndexModel {
        keys: doc! { "_id": 1 },
        options: IndexOptions {
            name: Some(ID_INDEX.to_string()),
            unique: true,
        },
    }
}

fn stored_indexes(conn: &Connection, name: &str) -> StorageResult<Vec<IndexModel>> {
    let mut stmt =
        conn.prepare("SELECT spec FROM indexes WHERE collection = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![name], |row| row.get::<_, Vec<u8>>(0))?;
    let mut indexes = Vec::new();
    for row in rows {
        indexes.push(bson::from_slice::<IndexModel>(&row?)?);
    }
    Ok(indexes)
}

fn check_unique(
    conn: &Connection,
    name: &str,
    doc: &Document,
    skip_seq: Option<i64>,
) -> StorageResult<()> {
    let unique: Vec<IndexModel> = stored_indexes(conn, name)?
        .into_iter()
        .filter(|i| i.options.unique)
        .collect();
    if unique.is_empty() {
        return Ok(());
    }

    let existing = load_documents(conn, name)?;
    for index in &unique {
        let key = index_key(index, doc);
        let clash = existing
            .iter()
            .filter(|(seq, _)| Some(*seq) != skip_seq)
            .any(|(_, other)| keys_equal(&key, &index_key(index, other)));
        if clash {
            return Err(StorageError::DuplicateKey {
                collection: name.to_string(),
                index: index.name(),
                key: describe_key(index, &key),
            });
        }
    }
    Ok(())
}

fn index_key(index: &IndexModel, doc: &Document) -> Vec<Bson> {
    index
        .fields()
        .into_iter()
        .map(|field| query::lookup(doc, field).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn keys_equal(a: &[Bson], b: &[Bson]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| query::values_equal(x, y))
}

fn same_keys(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((fa, da), (fb, db))| fa == fb && query::values_equal(da, db))
}

fn describe_key(index: &IndexModel, key: &[Bson]) -> String {
    let parts: Vec<String> = index
        .fields()
        .into_iter()
        .zip(key)
        .map(|(field, value)| format!("{field}: {value}"))
        .collect();
    format!("{{ {} }}", parts.join(", "))
}
