//! `dp-release` command line entry point.
//!
//! # Responsibility
//! - Drive the window scheduler against a SQLite release database.
//! - Manage tracked items and print published releases and budgets.
//!
//! Output is one `key=value` line per record so it stays greppable.

use clap::{Parser, Subcommand};
use dp_release_core::repo::item_repo::{ItemRepository, SqliteItemRepository};
use dp_release_core::service::projector;
use dp_release_core::{
    budget_status, current_release, default_log_level, init_logging, init_stderr_logging,
    open_db, release_history, Clock, ItemId, ReleaseConfig, SqliteCountSource, StopHandle,
    SystemClock, TickReport, TimeoutSource, WindowScheduler, DEFAULT_COUNT_QUERY,
};
use log::info;
use rusqlite::Connection;
use std::error::Error;
use std::path::PathBuf;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(
    name = "dp-release",
    version,
    about = "Windowed differentially private count releases"
)]
struct Cli {
    /// Release engine configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Release database; created and migrated on first use.
    #[arg(long, default_value = "dp_release.sqlite3")]
    db: PathBuf,
    /// Absolute directory for rolling log files. Logs go to stderr when omitted.
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct SourceArgs {
    /// Voting platform database that holds the true counts (opened read-only).
    #[arg(long)]
    source_db: PathBuf,
    /// Single-value count query; `?1` is bound to the item id.
    #[arg(long, default_value = DEFAULT_COUNT_QUERY)]
    count_query: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start evaluating items on every tick.
    Track { items: Vec<String> },
    /// Stop evaluating items; their history is kept.
    Untrack { items: Vec<String> },
    /// List tracked items.
    Items,
    /// Run a single tick.
    Tick {
        #[command(flatten)]
        source: SourceArgs,
        /// Tick time in epoch milliseconds instead of the wall clock.
        #[arg(long)]
        now: Option<i64>,
    },
    /// Tick on the poll interval.
    Run {
        #[command(flatten)]
        source: SourceArgs,
        /// Exit after this many ticks.
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Show the current release and budget of an item.
    Status { item: String },
    /// Show every published release of an item.
    History { item: String },
    /// Recompute every item summary from release and ledger history.
    RebuildSummaries,
    /// Compare an item's stored summary with its history.
    Verify { item: String },
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| default_log_level().to_string());
    match &cli.log_dir {
        Some(dir) => init_logging(&level, dir)?,
        None => init_stderr_logging(&level)?,
    }

    let config = match &cli.config {
        Some(path) => ReleaseConfig::load(path)?,
        None => ReleaseConfig::default(),
    };
    let conn = open_db(&cli.db)?;

    match cli.command {
        Command::Track { items } => {
            let repo = SqliteItemRepository::new(&conn);
            let now = SystemClock.now_ms();
            for raw in items {
                let item_id = ItemId::parse(&raw)?;
                let added = repo.track_item(&item_id, now)?;
                println!("item={item_id} tracked=true changed={added}");
            }
        }
        Command::Untrack { items } => {
            let repo = SqliteItemRepository::new(&conn);
            for raw in items {
                let item_id = ItemId::parse(&raw)?;
                let removed = repo.untrack_item(&item_id)?;
                println!("item={item_id} tracked=false changed={removed}");
            }
        }
        Command::Items => {
            for item_id in SqliteItemRepository::new(&conn).list_tracked_items()? {
                println!("item={item_id}");
            }
        }
        Command::Tick { source, now } => {
            let mut scheduler = build_scheduler(&conn, config, &source)?;
            let report = match now {
                Some(now) => scheduler.tick(now)?,
                None => scheduler.tick_now()?,
            };
            print_report(&report);
        }
        Command::Run { source, max_ticks } => {
            let mut scheduler = build_scheduler(&conn, config, &source)?;
            let stop = StopHandle::new();
            install_shutdown_handler(&stop)?;
            let ticks = scheduler.run(&stop, max_ticks)?;
            info!("event=cli_run module=cli status=ok ticks={}", ticks);
            println!("ticks={ticks}");
        }
        Command::Status { item } => {
            let item_id = ItemId::parse(&item)?;
            match current_release(&conn, &config, &item_id)? {
                Some(release) => println!(
                    "item={} window={} noisy_count={} ci_lower={} ci_upper={} meets_threshold={} locked={}",
                    release.item_id,
                    release.window,
                    format_optional(release.noisy_count),
                    format_optional(release.confidence_interval.map(|ci| ci.lower)),
                    format_optional(release.confidence_interval.map(|ci| ci.upper)),
                    release.meets_threshold,
                    release.is_locked
                ),
                None => println!("item={item_id} release=none"),
            }
            let budget = budget_status(&conn, &config, &item_id)?;
            println!(
                "item={} epsilon_remaining={} lifetime_cap={} total_spent={} locked={} queries_remaining={}",
                budget.item_id,
                budget.epsilon_remaining,
                budget.lifetime_cap,
                budget.total_spent,
                budget.is_locked,
                budget.queries_remaining
            );
        }
        Command::History { item } => {
            let item_id = ItemId::parse(&item)?;
            for record in release_history(&conn, &item_id)? {
                println!(
                    "item={} window={} decision={:?} noisy_count={} epsilon_used={} published_at={}",
                    item_id,
                    record.window,
                    record.decision,
                    format_optional(record.noisy_count),
                    record.epsilon_used,
                    record.published_at
                );
            }
        }
        Command::RebuildSummaries => {
            let rebuilt = projector::rebuild_all(&conn)?;
            println!("summaries_rebuilt={rebuilt}");
        }
        Command::Verify { item } => {
            let item_id = ItemId::parse(&item)?;
            match projector::verify(&conn, &item_id)? {
                None => println!("item={item_id} summary=consistent"),
                Some(drift) => {
                    println!(
                        "item={item_id} summary=drift stored={:?} expected={:?}",
                        drift.stored, drift.expected
                    );
                    return Err(format!("summary drift for item {item_id}").into());
                }
            }
        }
    }

    Ok(())
}

/// Ctrl-C and SIGTERM raise `stop`; the scheduler finishes the item in
/// progress and returns.
fn install_shutdown_handler(stop: &StopHandle) -> CliResult<()> {
    let stop = stop.clone();
    ctrlc::set_handler(move || request_shutdown(&stop))?;
    Ok(())
}

fn request_shutdown(stop: &StopHandle) {
    if !stop.is_stopped() {
        info!("event=shutdown_signal module=cli status=ok action=stop_after_current_item");
    }
    stop.stop();
}

fn build_scheduler<'conn>(
    conn: &'conn Connection,
    config: ReleaseConfig,
    source: &SourceArgs,
) -> CliResult<WindowScheduler<'conn, SystemClock, TimeoutSource<SqliteCountSource>>> {
    let counts = SqliteCountSource::open_with_query(&source.source_db, source.count_query.clone())?;
    let timeout = config.fetch_timeout();
    let scheduler = WindowScheduler::from_config(
        conn,
        config,
        SystemClock,
        TimeoutSource::new(counts, timeout)?,
    )?;
    Ok(scheduler)
}

fn print_report(report: &TickReport) {
    let window = report
        .window
        .as_ref()
        .map_or_else(|| "none".to_string(), |window| window.index.to_string());
    println!(
        "now={} window={} opened={} fresh={} reused={} suppressed={} locked={} unchanged={} failed={}",
        report.now,
        window,
        report.opened,
        report.fresh,
        report.reused,
        report.suppressed,
        report.locked,
        report.unchanged,
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "failed_item={} transient={} error={}",
            failure.item_id, failure.transient, failure.message
        );
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "none".to_string(), |value| format!("{value:.3}"))
}

#[cfg(test)]
mod tests {
    use super::{request_shutdown, Cli};
    use clap::Parser;
    use dp_release_core::StopHandle;

    #[test]
    fn shutdown_request_raises_the_shared_stop_handle() {
        let stop = StopHandle::new();
        let observed_by_scheduler = stop.clone();
        request_shutdown(&stop);
        request_shutdown(&stop);
        assert!(observed_by_scheduler.is_stopped());
    }

    #[test]
    fn run_accepts_source_and_tick_limit() {
        let cli = Cli::try_parse_from([
            "dp-release",
            "--db",
            "releases.sqlite3",
            "run",
            "--source-db",
            "platform.sqlite3",
            "--max-ticks",
            "3",
        ])
        .expect("valid arguments");
        assert_eq!(cli.db.to_str(), Some("releases.sqlite3"));
        assert!(format!("{:?}", cli.command).contains("max_ticks: Some(3)"));
    }
}
