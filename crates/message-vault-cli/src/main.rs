use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use message_vault_store_sqlite::{copy_subset, ResetProgress, Store};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mvault")]
#[command(about = "Personal multi-platform message archive")]
struct Cli {
    /// Path to the archive database.
    #[arg(long, default_value = "./message_vault.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or upgrade the archive schema.
    Init,
    /// Row counts and database size.
    Stats,
    Sources {
        #[command(subcommand)]
        command: SourcesCommand,
    },
    Fts {
        #[command(subcommand)]
        command: FtsCommand,
    },
    /// Copy the most recent messages into a self-contained subset archive.
    Subset(SubsetArgs),
    /// Search messages.
    Search(SearchArgs),
    /// List messages, most recent first.
    List(ListArgs),
    /// Soft-delete (default) or permanently delete one message.
    Delete(DeleteArgs),
}

#[derive(Debug, Subcommand)]
enum SourcesCommand {
    /// List sources, optionally filtered by type.
    List {
        #[arg(long)]
        source_type: Option<String>,
    },
    /// Remove a source and everything it owns.
    Remove {
        #[arg(long)]
        id: i64,
    },
    /// Delete a source's synced data but keep the source entry.
    Reset {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum FtsCommand {
    /// Rebuild the full-text index from scratch.
    Backfill,
}

#[derive(Debug, Args)]
struct SubsetArgs {
    /// Destination directory for the new archive.
    #[arg(long)]
    out: PathBuf,
    /// Number of most-recent messages to keep.
    #[arg(long)]
    messages: i64,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, default_value_t = 0)]
    offset: i64,
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value_t = 0)]
    offset: i64,
    #[arg(long, default_value_t = 20)]
    limit: i64,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    source_id: i64,
    #[arg(long)]
    message_id: String,
    #[arg(long, default_value_t = false)]
    permanent: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init => run_init(&cli.db),
        Command::Stats => run_stats(&cli.db),
        Command::Sources { command } => run_sources(&cli.db, command),
        Command::Fts { command } => run_fts(&cli.db, command),
        Command::Subset(args) => run_subset(&cli.db, &args),
        Command::Search(args) => run_search(&cli.db, &args),
        Command::List(args) => run_list(&cli.db, &args),
        Command::Delete(args) => run_delete(&cli.db, &args),
    }
}

fn open_store(db: &PathBuf) -> Result<Store> {
    let mut store = Store::open(db).with_context(|| format!("open archive {}", db.display()))?;
    store.init_schema().context("initialize schema")?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{body}");
    Ok(())
}

fn run_init(db: &PathBuf) -> Result<()> {
    let store = open_store(db)?;
    print_json(&json!({
        "db": db.display().to_string(),
        "search_indexed": store.search_indexed(),
    }))
}

fn run_stats(db: &PathBuf) -> Result<()> {
    let store = open_store(db)?;
    let stats = store.stats().context("collect stats")?;
    print_json(&stats)
}

fn run_sources(db: &PathBuf, command: SourcesCommand) -> Result<()> {
    let mut store = open_store(db)?;
    match command {
        SourcesCommand::List { source_type } => {
            let sources = store.list_sources(source_type.as_deref()).context("list sources")?;
            print_json(&sources)
        }
        SourcesCommand::Remove { id } => {
            store.remove_source(id).context("remove source")?;
            print_json(&json!({ "removed": id }))
        }
        SourcesCommand::Reset { id } => {
            let mut on_progress = |progress: ResetProgress| {
                tracing::info!(
                    phase = progress.phase,
                    table = progress.current_table,
                    deleted = progress.deleted_messages,
                    total = progress.total_messages,
                    "reset progress"
                );
            };
            let deleted = store
                .reset_source_data(id, Some(&mut on_progress))
                .context("reset source data")?;
            print_json(&json!({ "source": id, "deleted_messages": deleted }))
        }
    }
}

fn run_fts(db: &PathBuf, command: FtsCommand) -> Result<()> {
    let mut store = open_store(db)?;
    match command {
        FtsCommand::Backfill => {
            let mut on_progress = |done: i64, total: i64| {
                tracing::info!(done, total, "backfill progress");
            };
            let indexed = store
                .backfill_fts(Some(&mut on_progress))
                .context("backfill search index")?;
            print_json(&json!({ "indexed": indexed, "search_indexed": store.search_indexed() }))
        }
    }
}

fn run_subset(db: &PathBuf, args: &SubsetArgs) -> Result<()> {
    let result = copy_subset(db, &args.out, args.messages).context("copy subset")?;
    print_json(&result)
}

fn run_search(db: &PathBuf, args: &SearchArgs) -> Result<()> {
    let store = open_store(db)?;
    let page = store
        .search_messages(&args.query, args.offset, args.limit)
        .context("search messages")?;
    print_json(&page)
}

fn run_list(db: &PathBuf, args: &ListArgs) -> Result<()> {
    let store = open_store(db)?;
    let page = store.list_messages(args.offset, args.limit).context("list messages")?;
    print_json(&page)
}

fn run_delete(db: &PathBuf, args: &DeleteArgs) -> Result<()> {
    let mut store = open_store(db)?;
    store
        .delete_message(args.source_id, &args.message_id, args.permanent)
        .context("delete message")?;
    print_json(&json!({
        "source_id": args.source_id,
        "message_id": args.message_id,
        "permanent": args.permanent,
    }))
}
