use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use folio_db::{InMemoryDatabase, InMemoryLargeObjectStore, Snapshot};
use folio_doc::{json, Value};
use folio_storage::{DigitalObject, ObjectStore, StorageConfig};
use tracing::debug;

use crate::cli::*;

/// A store backed by the snapshot file, written back after each change.
struct Session {
    store: ObjectStore,
    db: Arc<InMemoryDatabase>,
    blobs: Arc<InMemoryLargeObjectStore>,
    data: PathBuf,
}

impl Session {
    fn open(data: &Path, config: StorageConfig) -> anyhow::Result<Self> {
        let snapshot = Snapshot::load_or_default(data)
            .with_context(|| format!("reading {}", data.display()))?;
        Self::from_snapshot(snapshot, data, config)
    }

    fn from_snapshot(snapshot: Snapshot, data: &Path, config: StorageConfig) -> anyhow::Result<Self> {
        let (db, blobs) = snapshot.restore();
        debug!(path = %data.display(), blobs = blobs.len(), "snapshot restored");
        let db = Arc::new(db);
        let blobs = Arc::new(blobs);
        let store = ObjectStore::open(config, db.clone(), blobs.clone())?;
        Ok(Self {
            store,
            db,
            blobs,
            data: data.to_path_buf(),
        })
    }

    fn persist(&self) -> anyhow::Result<()> {
        debug!(path = %self.data.display(), "writing snapshot");
        Snapshot::capture(&self.db, &self.blobs)
            .save(&self.data)
            .with_context(|| format!("writing {}", self.data.display()))
    }

    fn object(&self, oid: &str, collection: &Option<String>) -> anyhow::Result<DigitalObject> {
        let collection = collection.as_deref().unwrap_or(self.store.default_collection());
        Ok(self.store.get_object_in(oid, collection)?)
    }
}

/// Execute one parsed command against the snapshot named by `--data`.
pub fn run_command(cli: Cli, config: StorageConfig) -> anyhow::Result<()> {
    let format = cli.format;
    let session = || Session::open(&cli.data, config.clone());
    match cli.command {
        Command::Init(args) => cmd_init(&cli.data, config.clone(), &args, format),
        Command::Create(args) => cmd_create(&session()?, args, format),
        Command::Show(args) => cmd_show(&session()?, args, format),
        Command::List => cmd_list(&session()?, format),
        Command::Rm(args) => cmd_rm(&session()?, args, format),
        Command::Put(args) => cmd_put(&session()?, args, format, false),
        Command::Link(args) => cmd_put(&session()?, args, format, true),
        Command::Cat(args) => cmd_cat(&session()?, args),
        Command::RmPayload(args) => cmd_rm_payload(&session()?, args, format),
        Command::Set(args) => cmd_set(&session()?, args, format),
        Command::Query(args) => cmd_query(&session()?, args, format),
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(data: &Path, config: StorageConfig, args: &InitArgs, format: OutputFormat) -> anyhow::Result<()> {
    if data.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", data.display());
    }
    let session = Session::from_snapshot(Snapshot::default(), data, config)?;
    session.persist()?;
    match format {
        OutputFormat::Json => print_json(&json!({"data": data.display().to_string()})),
        OutputFormat::Text => {
            println!("{} Initialized store in {}", "✓".green().bold(), data.display().to_string().bold());
            println!("  Collection: {}", session.store.default_collection().cyan());
            println!("  Views: {}", session.store.provisioned().created.join(", ").cyan());
            Ok(())
        }
    }
}

fn cmd_create(session: &Session, args: ObjectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let collection = args.collection.as_deref().unwrap_or(session.store.default_collection());
    let object = session.store.create_object_in(&args.oid, collection)?;
    session.persist()?;
    match format {
        OutputFormat::Json => print_json(&json!({"oid": object.id(), "collection": object.collection_name()})),
        OutputFormat::Text => {
            println!("{} Created {} in {}", "✓".green().bold(), object.id().yellow(), object.collection_name());
            Ok(())
        }
    }
}

fn cmd_show(session: &Session, args: ObjectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    let object_metadata = object.metadata_properties()?;
    let mut record_metadata = object.record_metadata()?;
    record_metadata.shift_remove("files");
    let manifest = object.manifest()?;
    let source = object.source_id()?;

    if format == OutputFormat::Json {
        let payloads: Vec<Value> = manifest
            .values()
            .map(|d| d.to_value())
            .collect::<Result<_, _>>()?;
        return print_json(&json!({
            "oid": object.id(),
            "collection": object.collection_name(),
            "sourceId": source,
            "objectMetadata": object_metadata,
            "recordMetadata": record_metadata,
            "payloads": payloads,
        }));
    }

    println!("Object {} ({})", object.id().yellow().bold(), object.collection_name());
    for (key, value) in &object_metadata {
        println!("  {}: {}", key.bold(), value);
    }
    if !record_metadata.is_empty() {
        println!("Record:");
        for (key, value) in &record_metadata {
            println!("  {}: {}", key.bold(), value);
        }
    }
    if manifest.is_empty() {
        println!("No payloads.");
        return Ok(());
    }
    println!("Payloads:");
    for descriptor in manifest.values() {
        let marker = if source.as_deref() == Some(descriptor.pid.as_str()) { "*" } else { " " };
        let backend = descriptor
            .backend_type
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            " {} {}  {}  {}  {}",
            marker.green(),
            descriptor.pid.bold(),
            descriptor.payload_type.to_string().cyan(),
            backend.dimmed(),
            descriptor.content_type.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn cmd_list(session: &Session, format: OutputFormat) -> anyhow::Result<()> {
    let ids = session.store.list_object_ids()?;
    match format {
        OutputFormat::Json => print_json(&ids),
        OutputFormat::Text => {
            if ids.is_empty() {
                println!("No objects.");
            }
            for id in &ids {
                println!("{id}");
            }
            Ok(())
        }
    }
}

fn cmd_rm(session: &Session, args: ObjectArgs, format: OutputFormat) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    let pids = object.payload_ids()?;
    for pid in &pids {
        object.remove_payload(pid)?;
    }
    object.remove()?;
    session.persist()?;
    match format {
        OutputFormat::Json => print_json(&json!({"oid": args.oid, "removedPayloads": pids})),
        OutputFormat::Text => {
            println!("{} Removed {} ({} payloads)", "✓".green().bold(), args.oid.yellow(), pids.len());
            Ok(())
        }
    }
}

fn cmd_put(session: &Session, args: PutArgs, format: OutputFormat, linked: bool) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    let exists = object.payload_ids()?.contains(&args.pid);
    let mut payload = if linked {
        object.create_linked_payload(&args.pid, &args.file)?
    } else {
        let mut file = File::open(&args.file)
            .with_context(|| format!("opening {}", args.file.display()))?;
        if exists {
            object.update_payload(&args.pid, &mut file)?
        } else {
            object.create_stored_payload(&args.pid, &mut file)?
        }
    };
    let kind = payload.backend_kind();
    let size = payload.size()?;
    let payload_type = payload.payload_type();
    drop(payload);
    session.persist()?;

    let action = if exists { "Updated" } else { "Stored" };
    match format {
        OutputFormat::Json => print_json(&json!({
            "oid": args.oid,
            "pid": args.pid,
            "payloadType": payload_type.to_string(),
            "backend": kind.to_string(),
            "size": size,
        })),
        OutputFormat::Text => {
            println!(
                "{} {} {} ({}, {} bytes, {})",
                "✓".green().bold(),
                action,
                args.pid.yellow(),
                payload_type.to_string().cyan(),
                size,
                kind
            );
            Ok(())
        }
    }
}

fn cmd_cat(session: &Session, args: PayloadArgs) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    let mut payload = object.get_payload(&args.pid)?;
    let mut reader = payload.open()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    std::io::copy(&mut reader, &mut out)?;
    out.flush()?;
    Ok(())
}

fn cmd_rm_payload(session: &Session, args: PayloadArgs, format: OutputFormat) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    object.remove_payload(&args.pid)?;
    session.persist()?;
    match format {
        OutputFormat::Json => print_json(&json!({"oid": args.oid, "removed": args.pid})),
        OutputFormat::Text => {
            println!("{} Removed payload {} from {}", "✓".green().bold(), args.pid.yellow(), args.oid);
            Ok(())
        }
    }
}

fn cmd_set(session: &Session, args: SetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let object = session.object(&args.oid, &args.collection)?;
    let value = serde_json::from_str::<Value>(&args.value).unwrap_or_else(|_| Value::String(args.value.clone()));
    if args.record {
        object.set_record_field(&args.key, value.clone())?;
    } else {
        object.set_property(&args.key, value.clone())?;
    }
    object.save()?;
    session.persist()?;
    match format {
        OutputFormat::Json => print_json(&json!({"oid": args.oid, "key": args.key, "value": value})),
        OutputFormat::Text => {
            println!("Set {} = {}", args.key.bold(), value);
            Ok(())
        }
    }
}

fn cmd_query(session: &Session, args: QueryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let page = session.store.paged_query(
        &args.collection,
        &args.filter,
        args.start,
        args.rows,
        args.sort.as_deref(),
    )?;
    match format {
        OutputFormat::Json => print_json(&page),
        OutputFormat::Text => {
            println!(
                "{} of {} documents (from {})",
                page.docs.len().to_string().bold(),
                page.num_found.to_string().bold(),
                args.start
            );
            for doc in &page.docs {
                println!("{}", serde_json::to_string(doc)?);
            }
            Ok(())
        }
    }
}
