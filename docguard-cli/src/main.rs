use bson::{Bson, Document};
use clap::{Parser, Subcommand, ValueEnum};
use docguard::helpers::{create_filter, create_options, QueryOptions};
use docguard::results::{find_result, remove_message, upsert_doc, upsert_message};
use docguard::scalar::serialize_object_id;
use docguard::storage::UpdateOptions;
use docguard::{DocumentCollection, LoaderConfig, Registry};
use std::path::PathBuf;
use std::process;

/// docguard CLI: schema-validated access to document collections
#[derive(Parser)]
#[command(name = "docguard", version, about)]
struct Cli {
    /// Loader config file (YAML with connection, model_directory, provision)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage connection target (sqlite::memory:, sqlite://<path>, or a path)
    #[arg(long)]
    database: Option<String>,

    /// Directory of schema definition files
    #[arg(long)]
    models: Option<PathBuf>,

    /// Skip provisioning collections and indexes on startup
    #[arg(long)]
    no_provision: bool,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List registered collections
    Collections,

    /// Provision collections, validators and indexes
    Init {
        /// Only provision this collection
        collection: Option<String>,
    },

    /// Check a document against a collection's schema without writing it
    Validate {
        collection: String,
        /// Document as (extended) JSON
        doc: String,
        /// Skip required-field checks, as for a $set payload
        #[arg(long)]
        partial: bool,
    },

    /// Insert one or more documents
    Insert {
        collection: String,
        /// Documents as (extended) JSON
        #[arg(required = true)]
        docs: Vec<String>,
    },

    /// Find documents and the total match count
    Find {
        collection: String,
        /// Filter as (extended) JSON
        #[arg(default_value = "{}")]
        filter: String,
        /// Paging and ordering, e.g. {"limit":10,"sort":[{"field":"a","dir":"asc"}]}
        #[arg(long)]
        options: Option<String>,
    },

    /// Count documents matching a filter
    Count {
        collection: String,
        #[arg(default_value = "{}")]
        filter: String,
    },

    /// Apply an update document ($set, $setOnInsert, $unset, ...)
    Update {
        collection: String,
        filter: String,
        update: String,
        /// Insert when nothing matches
        #[arg(long)]
        upsert: bool,
        /// Update every match (skips operator validation)
        #[arg(long)]
        many: bool,
        /// Message to report instead of the default
        #[arg(long)]
        message: Option<String>,
    },

    /// Delete documents matching a filter
    Delete {
        collection: String,
        filter: String,
        /// Delete only the first match
        #[arg(long)]
        one: bool,
    },

    /// Copy a collection into its backup slot
    Backup { collection: String },

    /// Replace a collection with its backup slot
    Restore { collection: String },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<LoaderConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => LoaderConfig::from_file(path)?,
        None => LoaderConfig::new("docguard.db", "models"),
    };
    if let Some(database) = &cli.database {
        config.connection = database.clone();
    }
    if let Some(models) = &cli.models {
        config.model_directory = models.clone();
    }
    if cli.no_provision {
        config.provision = false;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    let registry = Registry::open(&config)?;
    log::debug!("Opened {} with {} collections", config.connection, registry.len());

    match cli.command {
        Command::Collections => {
            let rows: Vec<serde_json::Value> = registry
                .names()
                .iter()
                .map(|name| {
                    let collection = registry.get(name)?;
                    Ok(serde_json::json!({
                        "name": name,
                        "label": collection.label(),
                        "plural_label": collection.plural_label(),
                        "required": collection.definition().required_fields(),
                    }))
                })
                .collect::<docguard::Result<_>>()?;
            print_output(&serde_json::Value::Array(rows), &cli.format)?;
        }

        Command::Init { collection } => {
            let names = match collection {
                Some(name) => vec![name],
                None => registry.names(),
            };
            for name in &names {
                registry.get(name)?.init()?;
            }
            print_output(&serde_json::json!({ "ok": true, "provisioned": names }), &cli.format)?;
        }

        Command::Validate {
            collection,
            doc,
            partial,
        } => {
            let collection = registry.get(&collection)?;
            collection.validate(&parse_document(&doc)?, !partial)?;
            print_output(&serde_json::json!({ "ok": true }), &cli.format)?;
        }

        Command::Insert { collection, docs } => {
            let collection = registry.get(&collection)?;
            let mut docs = docs
                .iter()
                .map(|d| parse_document(d))
                .collect::<Result<Vec<_>, _>>()?;
            let ids = if docs.len() == 1 {
                vec![collection.insert_one(docs.remove(0))?.inserted_id]
            } else {
                collection.insert_many(docs)?.inserted_ids
            };
            let ids = ids.iter().map(display_id).collect::<Vec<_>>();
            print_output(&serde_json::json!({ "inserted_ids": ids }), &cli.format)?;
        }

        Command::Find {
            collection,
            filter,
            options,
        } => {
            let collection = registry.get(&collection)?;
            let query_options: QueryOptions = match options {
                Some(raw) => serde_json::from_str(&raw)?,
                None => QueryOptions::default(),
            };
            let filter = create_filter(&parse_document(&filter)?);
            let result = find_result(&*collection, &filter, &create_options(&query_options)?)?;
            print_output(
                &serde_json::json!({
                    "success": result.success,
                    "message": result.message,
                    "count": result.count,
                    "docs": result.docs.into_iter().map(to_json).collect::<Vec<_>>(),
                }),
                &cli.format,
            )?;
        }

        Command::Count { collection, filter } => {
            let collection = registry.get(&collection)?;
            let count = collection.count_documents(&create_filter(&parse_document(&filter)?))?;
            print_output(&serde_json::json!({ "count": count }), &cli.format)?;
        }

        Command::Update {
            collection,
            filter,
            update,
            upsert,
            many,
            message,
        } => {
            let collection = registry.get(&collection)?;
            let filter = create_filter(&parse_document(&filter)?);
            let update = parse_document(&update)?;
            let options = UpdateOptions { upsert };
            let result = if many {
                collection.update_many(&filter, &update, &options)?
            } else {
                collection.update_one(&filter, &update, &options)?
            };
            let reread = match &result.upserted_id {
                Some(id) => bson::doc! { "_id": id.clone() },
                None => filter,
            };
            let doc = upsert_doc(&*collection, &reread, true)?;
            print_output(
                &serde_json::json!({
                    "success": true,
                    "message": upsert_message(&*collection, &result, message.as_deref()),
                    "matched": result.matched_count,
                    "modified": result.modified_count,
                    "doc": doc.map(to_json),
                }),
                &cli.format,
            )?;
        }

        Command::Delete {
            collection,
            filter,
            one,
        } => {
            let collection = registry.get(&collection)?;
            let filter = create_filter(&parse_document(&filter)?);
            let result = if one {
                collection.delete_one(&filter)?
            } else {
                collection.delete_many(&filter)?
            };
            print_output(
                &serde_json::json!({
                    "success": true,
                    "message": remove_message(&*collection, &result),
                }),
                &cli.format,
            )?;
        }

        Command::Backup { collection } => {
            let collection = registry.get(&collection)?;
            let copied = collection.backup()?;
            print_output(
                &serde_json::json!({ "ok": true, "slot": collection.backup_name(), "copied": copied }),
                &cli.format,
            )?;
        }

        Command::Restore { collection } => {
            let collection = registry.get(&collection)?;
            let restored = collection.restore()?;
            print_output(
                &serde_json::json!({ "ok": true, "restored": restored }),
                &cli.format,
            )?;
        }
    }

    Ok(())
}

/// Parse (extended) JSON such as `{"_id": {"$oid": "..."}}` into a document.
fn parse_document(raw: &str) -> Result<Document, Box<dyn std::error::Error>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match Bson::try_from(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(format!("expected a JSON object, found {other}").into()),
    }
}

fn to_json(doc: Document) -> serde_json::Value {
    Bson::Document(doc).into_relaxed_extjson()
}

fn display_id(id: &Bson) -> serde_json::Value {
    match serialize_object_id(id) {
        Ok(hex) => serde_json::Value::String(hex),
        Err(_) => id.clone().into_relaxed_extjson(),
    }
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
