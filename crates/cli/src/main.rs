// crates/cli/src/main.rs
//! hudcache administrative binary.
//!
//! Imports hand histories into the rollup caches and maintains them:
//! rebuild from the fact log, clear, staleness checks and ad-hoc queries.
//! Results are printed as JSON on stdout; progress and logs go to stderr.

mod commands;
mod jsonl;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use hudcache_core::{paths, RollupConfig, RollupTable, StyleKey};
use hudcache_db::RollupEngine;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hudcache", version, about = "Incremental poker statistics caches")]
struct Cli {
    /// Config file [default: ~/.config/hudcache/hudcache.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides the config file and HUDCACHE_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import hands from a JSON-lines file (`-` for stdin)
    Ingest {
        file: PathBuf,
        /// Fold each batch in memory and write it in one transaction
        #[arg(long)]
        bulk: bool,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
    },

    /// Manage playing sessions
    #[command(subcommand)]
    Session(SessionCommand),

    /// Recompute rollup tables from the fact log
    Rebuild {
        /// A table name or `all`
        #[arg(value_parser = parse_tables)]
        tables: Tables,
        /// Only rows of these players
        #[arg(long = "player")]
        players: Vec<i64>,
        /// Only rows of these game types
        #[arg(long = "gametype")]
        gametypes: Vec<i64>,
        /// Skip comparing the recomputed rows with the live ones
        #[arg(long)]
        no_verify: bool,
    },

    /// Delete every row of a rollup table
    Clear {
        #[arg(value_parser = parse_table)]
        table: RollupTable,
    },

    /// Report whether tables need a rebuild
    Staleness {
        #[arg(value_parser = parse_tables)]
        tables: Option<Tables>,
    },

    /// Print rollup rows, or their sum with derived ratios
    Query {
        #[arg(value_parser = parse_table)]
        table: RollupTable,
        #[arg(long)]
        player: Option<i64>,
        /// Encoded HudCache style key, e.g. `A` or `D20240315`
        #[arg(long, conflicts_with = "since")]
        style: Option<StyleKey>,
        /// HudCache rows with a date style on or after this day
        #[arg(long)]
        since: Option<NaiveDate>,
        #[arg(long)]
        summary: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Create a session; hands reference it by the printed id
    Create {
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
    },
    /// Move everything in session FROM onto session TO and delete FROM
    Reassign { from: i64, to: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tables(Vec<RollupTable>);

fn parse_table(s: &str) -> Result<RollupTable, String> {
    s.parse().map_err(|e: hudcache_core::UnknownTable| e.to_string())
}

fn parse_tables(s: &str) -> Result<Tables, String> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(Tables(RollupTable::ALL.to_vec()));
    }
    parse_table(s).map(|t| Tables(vec![t]))
}

fn load_config(cli: &Cli) -> Result<RollupConfig> {
    let path = cli.config.clone().or_else(paths::config_path);
    let mut config = RollupConfig::load_or_default(path.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = Some(db.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let db_path = config.resolved_db_path()?;
    let engine = RollupEngine::open(config)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    match cli.command {
        Command::Ingest {
            file,
            bulk,
            batch_size,
        } => commands::ingest(&engine, &file, bulk, batch_size).await,
        Command::Session(SessionCommand::Create { start, end }) => {
            commands::create_session(&engine, start, end).await
        }
        Command::Session(SessionCommand::Reassign { from, to }) => {
            commands::reassign(&engine, from, to).await
        }
        Command::Rebuild {
            tables,
            players,
            gametypes,
            no_verify,
        } => commands::rebuild(&engine, &tables.0, players, gametypes, !no_verify).await,
        Command::Clear { table } => commands::clear(&engine, table).await,
        Command::Staleness { tables } => {
            let tables = tables.map_or_else(|| RollupTable::ALL.to_vec(), |t| t.0);
            commands::staleness(&engine, &tables).await
        }
        Command::Query {
            table,
            player,
            style,
            since,
            summary,
        } => commands::query(&engine, table, player, style, since, summary).await,
    }
}
