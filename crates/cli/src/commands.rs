// crates/cli/src/commands.rs
//! Subcommand implementations.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use hudcache_core::{AggregateRow, Ratio, RollupTable, StyleKey};
use hudcache_db::{
    DbError, IngestReport, KeyFilter, RebuildFilter, RebuildOptions, RebuildPhase, RebuildReport,
    RollupEngine,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::jsonl::{HandReader, MalformedLine};

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn spinner(template: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template(template) {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  interrupted, cancelling before commit");
            token.cancel();
        }
    });
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestOutput {
    #[serde(flatten)]
    report: IngestReport,
    malformed_lines: Vec<MalformedLine>,
}

pub async fn ingest(engine: &RollupEngine, file: &Path, bulk: bool, batch_size: usize) -> Result<()> {
    let started = Instant::now();
    let mut reader = HandReader::open(file).await?;
    let pb = spinner("  {spinner} Ingesting {msg}");

    let mut report = IngestReport::default();
    let mut malformed = Vec::new();
    while let Some(batch) = reader.next_batch(batch_size).await? {
        malformed.extend(batch.malformed);
        let one = if bulk {
            engine.ingest_bulk(&batch.hands).await?
        } else {
            engine.ingest_batch(&batch.hands).await?
        };
        report.absorb(one);
        pb.set_message(format!(
            "{} hands, {} rejected",
            report.hands_ingested,
            report.hands_rejected + malformed.len() as u64
        ));
    }
    pb.finish_and_clear();

    eprintln!(
        "  \u{2713} Ingested {} hands ({} facts) in {:.1}s",
        report.hands_ingested,
        report.facts_applied,
        started.elapsed().as_secs_f64()
    );
    print_json(&IngestOutput {
        report,
        malformed_lines: malformed,
    })
}

pub async fn create_session(
    engine: &RollupEngine,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<()> {
    let session = engine.sessions().create_session(start, end).await?;
    print_json(&session)
}

pub async fn reassign(engine: &RollupEngine, from: i64, to: i64) -> Result<()> {
    let report = engine.sessions().reassign(from, to).await?;
    print_json(&report)
}

fn phase_label(phase: RebuildPhase) -> &'static str {
    match phase {
        RebuildPhase::Scanning => "scanning",
        RebuildPhase::CatchingUp => "catching up",
        RebuildPhase::Swapping => "swapping",
    }
}

pub async fn rebuild(
    engine: &RollupEngine,
    tables: &[RollupTable],
    players: Vec<i64>,
    gametypes: Vec<i64>,
    verify: bool,
) -> Result<()> {
    let options = RebuildOptions {
        filter: RebuildFilter { players, gametypes },
        verify,
        cancel: CancellationToken::new(),
    };
    cancel_on_interrupt(options.cancel.clone());

    let mut reports: Vec<RebuildReport> = Vec::new();
    let mut diverged = Vec::new();
    for &table in tables {
        let pb = spinner("  {spinner} Rebuilding {msg}");
        pb.set_message(table.to_string());
        let result = engine
            .rebuilds()
            .rebuild(table, &options, |p| {
                pb.set_message(format!(
                    "{} ({}, {} facts)",
                    p.table,
                    phase_label(p.phase),
                    p.facts_scanned
                ));
            })
            .await;
        pb.finish_and_clear();

        match result {
            Ok(report) => {
                eprintln!(
                    "  \u{2713} {}: {} rows ({:+}) from {} facts",
                    table, report.rows_after, report.row_delta, report.facts_scanned
                );
                reports.push(report);
            }
            Err(DbError::RebuildInconsistency { report }) => {
                eprintln!(
                    "  \u{2717} {}: {} keys diverged from the fact log, corrected",
                    table,
                    report.divergent_keys.len()
                );
                diverged.push(table);
                reports.push(*report);
            }
            Err(e) => {
                print_json(&reports)?;
                return Err(e.into());
            }
        }
    }

    print_json(&reports)?;
    if !diverged.is_empty() {
        let names: Vec<String> = diverged.iter().map(ToString::to_string).collect();
        bail!("incremental state had diverged in {}", names.join(", "));
    }
    Ok(())
}

pub async fn clear(engine: &RollupEngine, table: RollupTable) -> Result<()> {
    let removed = engine.rebuilds().clear(table).await?;
    eprintln!("  \u{2713} {table}: removed {removed} rows; rebuild to repopulate");
    print_json(&serde_json::json!({ "table": table, "removed": removed }))
}

pub async fn staleness(engine: &RollupEngine, tables: &[RollupTable]) -> Result<()> {
    let mut reports = Vec::with_capacity(tables.len());
    for &table in tables {
        reports.push(engine.rebuilds().staleness(table).await?);
    }
    print_json(&reports)
}

/// Summed row with the ratios a HUD shows.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    table: RollupTable,
    rows: usize,
    hands: i64,
    vpip: Ratio,
    pfr: Ratio,
    three_bet: Ratio,
    steal: Ratio,
    aggression_factor: Ratio,
    wtsd: Ratio,
    won_at_showdown: Ratio,
    profit_per_100: Ratio,
    total: AggregateRow,
}

pub async fn query(
    engine: &RollupEngine,
    table: RollupTable,
    player: Option<i64>,
    style: Option<StyleKey>,
    since: Option<NaiveDate>,
    summary: bool,
) -> Result<()> {
    let mut filter = KeyFilter::new(table);
    if let Some(player) = player {
        filter = filter.player(player);
    }
    if let Some(style) = style {
        filter = filter.style(style);
    }
    if let Some(since) = since {
        filter = filter.style_since(since);
    }

    let rows = engine.store().query(&filter).await?;
    if !summary {
        return print_json(&rows);
    }

    let mut total = AggregateRow::default();
    for stored in &rows {
        total.merge(&stored.row);
    }
    print_json(&Summary {
        table,
        rows: rows.len(),
        hands: total.n,
        vpip: total.vpip(),
        pfr: total.pfr(),
        three_bet: total.three_bet(),
        steal: total.steal(),
        aggression_factor: total.aggression_factor(),
        wtsd: total.wtsd(),
        won_at_showdown: total.w_sd(),
        profit_per_100: total.profit_per_100(),
        total,
    })
}
