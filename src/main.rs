//! # Table Mirror CLI (`mirror`)
//!
//! Mirrors a directory of JSON table fixtures into a local SQLite file and
//! queries it.
//!
//! ## Usage
//!
//! ```bash
//! mirror --config ./config/mirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mirror init` | Create the SQLite database and run migrations |
//! | `mirror tables` | List remote tables and their local bindings |
//! | `mirror sync <table>` | Full sync of one table |
//! | `mirror query <table>` | Filtered, sorted, paged records as JSON |
//! | `mirror invalidate <scope> [target]` | Force a scope stale |
//! | `mirror refresh <scope> [target]` | Invalidate and resync now |
//! | `mirror freshness <scope> [target]` | Show a scope's TTL state |
//! | `mirror stats [table]` | Hit/miss counters per table |
//!
//! ## Examples
//!
//! ```bash
//! mirror query tbl_deals \
//!     --filter '{"operator":"and","clauses":[{"field":"status","comparator":"is","value":"Active"}]}' \
//!     --sort revenue:desc --limit 10
//!
//! mirror invalidate records tbl_deals
//! mirror refresh tables
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use table_mirror::config::{self, Config};
use table_mirror::connector_json::JsonDirSource;
use table_mirror::filter::FilterExpression;
use table_mirror::migrate;
use table_mirror::mirror::Mirror;
use table_mirror::query::SortKey;
use table_mirror::sources;
use table_mirror::stats;

/// Table Mirror CLI: a local SQLite mirror of remote tabular sources.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "mirror",
    about = "Table Mirror: query remote tables from a local SQLite mirror",
    version,
    long_about = "Table Mirror materializes remote tables into SQLite, keeps them fresh \
    on a TTL, and answers filtered, sorted, paged queries locally."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mirror.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List remote tables and their local bindings.
    Tables,

    /// Run a full sync of one table, regardless of freshness.
    Sync {
        /// Source table id.
        table: String,
    },

    /// Query a table (syncing first if its records are stale).
    Query {
        /// Source table id.
        table: String,

        /// Filter expression as JSON: {"operator": "and"|"or", "clauses": [...]}.
        #[arg(long)]
        filter: Option<String>,

        /// Sort key as `field` or `field:desc`. Repeatable.
        #[arg(long)]
        sort: Vec<String>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Force a scope stale: `tables`, `table <id>` or `records <id>`.
    Invalidate {
        scope: String,
        target: Option<String>,
    },

    /// Invalidate a scope and resync it immediately.
    Refresh {
        scope: String,
        target: Option<String>,
    },

    /// Show the freshness of a scope.
    Freshness {
        scope: String,
        target: Option<String>,
    },

    /// Show cache performance counters.
    Stats {
        /// Only this table.
        table: Option<String>,
    },
}

async fn open_mirror(cfg: &Config) -> Result<Mirror> {
    let source = JsonDirSource::from_config(cfg)?;
    Ok(Mirror::open(cfg, Arc::new(source)).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "table_mirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Tables => {
            let mirror = open_mirror(&cfg).await?;
            let tables = mirror.list_tables().await?;
            let bindings = mirror.bindings().await?;
            sources::print_tables(&tables, &bindings);
            mirror.close().await?;
        }
        Commands::Sync { table } => {
            let mirror = open_mirror(&cfg).await?;
            let report = mirror.sync_table(&table).await?;
            println!(
                "Synced {} → {}: {} records in {} page(s), {}",
                report.source_table_id,
                report.local_table_name,
                report.records,
                report.pages,
                stats::format_bytes(report.size_estimate.max(0) as u64)
            );
            mirror.close().await?;
        }
        Commands::Query {
            table,
            filter,
            sort,
            limit,
            offset,
        } => {
            let filter = filter
                .map(|raw| {
                    serde_json::from_str::<FilterExpression>(&raw)
                        .with_context(|| "Failed to parse --filter JSON")
                })
                .transpose()?;
            let sort = sort
                .iter()
                .map(|raw| {
                    SortKey::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("Invalid --sort value: {}", raw))
                })
                .collect::<Result<Vec<_>>>()?;

            let mirror = open_mirror(&cfg).await?;
            let result = mirror
                .get_records(&table, filter, sort, limit, offset)
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            mirror.close().await?;
        }
        Commands::Invalidate { scope, target } => {
            let mirror = open_mirror(&cfg).await?;
            let affected = mirror.invalidate(&scope, target.as_deref()).await?;
            println!(
                "Invalidated {} freshness entr{}.",
                affected,
                if affected == 1 { "y" } else { "ies" }
            );
            mirror.close().await?;
        }
        Commands::Refresh { scope, target } => {
            let mirror = open_mirror(&cfg).await?;
            let reports = mirror.refresh_now(&scope, target.as_deref()).await?;
            for report in &reports {
                println!(
                    "Refreshed {}: {} records",
                    report.source_table_id, report.records
                );
            }
            if reports.is_empty() {
                println!("Nothing to refresh.");
            }
            mirror.close().await?;
        }
        Commands::Freshness { scope, target } => {
            let mirror = open_mirror(&cfg).await?;
            let report = mirror.get_freshness(&scope, target.as_deref()).await?;
            let expires = report
                .expires_at
                .map(stats::format_ts_iso)
                .unwrap_or_else(|| "-".to_string());
            let synced = report
                .last_synced_at
                .map(stats::format_ts_relative)
                .unwrap_or_else(|| "never".to_string());
            println!("Scope:        {}", report.scope);
            println!("Fresh:        {}", report.fresh);
            println!("Expires at:   {}", expires);
            println!("Last synced:  {}", synced);
            mirror.close().await?;
        }
        Commands::Stats { table } => {
            let mirror = open_mirror(&cfg).await?;
            let table_stats = mirror.get_performance_stats(table.as_deref()).await?;
            stats::print_stats(&cfg.db.path, &table_stats);
            mirror.close().await?;
        }
    }

    Ok(())
}
