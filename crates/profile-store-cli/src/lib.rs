//! Command surface of the `pstore` binary.
//!
//! Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for one command against any [`ProfileStore`] handle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use profile_store_core::{
    BatchPayload, EventId, EventKind, EventRecord, MetadataFilter, ProfileStore, StackFrame,
};
use profile_store_sqlite::{SqliteProfileStore, StoreOptions};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pstore")]
#[command(about = "Profile event store CLI")]
pub struct Cli {
    #[arg(long, env = "PSTORE_DB", default_value = "./profile_store.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "PSTORE_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,

    #[arg(long, env = "PSTORE_LOG", default_value = "warn")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store one JSON batch of profiling events.
    Ingest(IngestArgs),
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Sql {
        #[command(subcommand)]
        command: SqlCommand,
    },
    Metadata {
        #[command(subcommand)]
        command: MetadataCommand,
    },
    Senders {
        #[command(subcommand)]
        command: SendersCommand,
    },
    Batches {
        #[command(subcommand)]
        command: BatchesCommand,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
    Show(EventsShowArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    kind: EventKindArg,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct EventsShowArgs {
    #[arg(long)]
    kind: EventKindArg,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
pub enum SqlCommand {
    /// Show a statement with its arguments substituted.
    Show(SqlShowArgs),
}

#[derive(Debug, Args)]
pub struct SqlShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
pub enum MetadataCommand {
    Keys,
    Values(MetadataValuesArgs),
}

#[derive(Debug, Args)]
pub struct MetadataValuesArgs {
    /// `key` or `key=value`.
    #[arg(long)]
    filter: String,
}

#[derive(Debug, Subcommand)]
pub enum SendersCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum BatchesCommand {
    List(BatchesListArgs),
}

#[derive(Debug, Args)]
pub struct BatchesListArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventKindArg {
    CallStack,
    SqlStatement,
    FileAccess,
}

impl From<EventKindArg> for EventKind {
    fn from(value: EventKindArg) -> Self {
        match value {
            EventKindArg::CallStack => EventKind::CallStack,
            EventKindArg::SqlStatement => EventKind::SqlStatement,
            EventKindArg::FileAccess => EventKind::FileAccess,
        }
    }
}

#[derive(Debug, Serialize)]
struct SqlView {
    id: i64,
    template: String,
    sql: String,
    args: Vec<String>,
    stack: Vec<StackFrame>,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter);

    let options = StoreOptions {
        busy_timeout: Duration::from_millis(cli.busy_timeout_ms),
    };
    let mut store = open_store(&cli.db, &options)?;
    run_command(cli.command, &mut store)
}

/// Executes one command against an existing store handle and prints its
/// result as pretty JSON.
///
/// # Errors
/// Returns an error when input is invalid, a requested record is not found,
/// or a store operation fails.
pub fn run_command<S: ProfileStore>(command: Command, store: &mut S) -> Result<()> {
    match command {
        Command::Ingest(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read batch file {}", args.file.display()))?;
            let batch = BatchPayload::from_json_str(&raw)?;
            let report = store.push_batch(&batch)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Events { command } => match command {
            EventsCommand::List(args) => {
                let kind = EventKind::from(args.kind);
                let mut rendered = Vec::new();
                for record in store.list_events(kind, args.limit)? {
                    let metadata = store.pivot_metadata(kind, record.id())?;
                    rendered.push(record.display(&metadata));
                }
                println!("{}", serde_json::to_string_pretty(&rendered)?);
            }
            EventsCommand::Show(args) => {
                let kind = EventKind::from(args.kind);
                let id = EventId(args.id);
                let display = store
                    .display_record(kind, id)?
                    .ok_or_else(|| not_found(kind, id))?;
                println!("{}", serde_json::to_string_pretty(&display)?);
            }
        },
        Command::Sql { command } => match command {
            SqlCommand::Show(args) => {
                let id = EventId(args.id);
                let Some(EventRecord::SqlStatement(record)) =
                    store.get_event(EventKind::SqlStatement, id)?
                else {
                    return Err(not_found(EventKind::SqlStatement, id));
                };
                let view = SqlView {
                    id: record.id.0,
                    sql: record.reconstructed_sql(),
                    template: record.sql,
                    args: record.args,
                    stack: record.stack,
                };
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
        },
        Command::Metadata { command } => match command {
            MetadataCommand::Keys => {
                let keys = store.distinct_metadata_keys()?;
                println!("{}", serde_json::to_string_pretty(&keys)?);
            }
            MetadataCommand::Values(args) => {
                let filter = MetadataFilter::parse(&args.filter)?;
                let values = store.metadata_values(&filter)?;
                println!("{}", serde_json::to_string_pretty(&values)?);
            }
        },
        Command::Senders { command } => match command {
            SendersCommand::List => {
                let senders = store.list_senders()?;
                println!("{}", serde_json::to_string_pretty(&senders)?);
            }
        },
        Command::Batches { command } => match command {
            BatchesCommand::List(args) => {
                let batches = store.list_batches(args.limit)?;
                println!("{}", serde_json::to_string_pretty(&batches)?);
            }
        },
    }

    Ok(())
}

fn open_store(db_path: &Path, options: &StoreOptions) -> Result<SqliteProfileStore> {
    debug!(db = %db_path.display(), "opening profile store");
    let store = SqliteProfileStore::open_with(db_path, options)?;
    store.migrate()?;
    Ok(store)
}

fn not_found(kind: EventKind, id: EventId) -> anyhow::Error {
    anyhow!("{kind} event {id} not found")
}

/// Logs go to stderr so stdout stays machine-readable. `RUST_LOG` wins over
/// `--log-filter` when set.
fn init_tracing(log_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
