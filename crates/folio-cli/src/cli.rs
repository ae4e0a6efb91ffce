use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use folio_storage::query::DEFAULT_ROWS;

#[derive(Parser)]
#[command(
    name = "folio",
    about = "Folio digital-object store",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Snapshot file holding the store state
    #[arg(long, global = true, default_value = "folio.json")]
    pub data: PathBuf,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an empty store snapshot
    Init(InitArgs),
    /// Create an empty object
    Create(ObjectArgs),
    /// Show an object's metadata and payloads
    Show(ObjectArgs),
    /// List all object ids
    List,
    /// Remove an object and all of its payloads
    Rm(ObjectArgs),
    /// Store a file as a payload, replacing existing content
    Put(PutArgs),
    /// Store a copy of a file as a payload
    Link(PutArgs),
    /// Write a payload's content to stdout
    Cat(PayloadArgs),
    /// Remove one payload
    RmPayload(PayloadArgs),
    /// Set a metadata property (or record field with --record)
    Set(SetArgs),
    /// Run a paged query over a collection or view
    Query(QueryArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing snapshot
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ObjectArgs {
    pub oid: String,
    #[arg(short, long)]
    pub collection: Option<String>,
}

#[derive(Args)]
pub struct PutArgs {
    pub oid: String,
    pub pid: String,
    pub file: PathBuf,
    #[arg(short, long)]
    pub collection: Option<String>,
}

#[derive(Args)]
pub struct PayloadArgs {
    pub oid: String,
    pub pid: String,
    #[arg(short, long)]
    pub collection: Option<String>,
}

#[derive(Args)]
pub struct SetArgs {
    pub oid: String,
    pub key: String,
    /// JSON value; anything that does not parse is stored as a string
    pub value: String,
    #[arg(long)]
    pub record: bool,
    #[arg(short, long)]
    pub collection: Option<String>,
}

#[derive(Args)]
pub struct QueryArgs {
    pub collection: String,
    #[arg(short, long, default_value = "{}")]
    pub filter: String,
    #[arg(long, default_value = "0")]
    pub start: usize,
    #[arg(long, default_value_t = DEFAULT_ROWS)]
    pub rows: usize,
    #[arg(long)]
    pub sort: Option<String>,
}
