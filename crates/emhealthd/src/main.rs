//! emhealthd - instrument health engine daemon.
//!
//! Every interval: collects PostgreSQL metrics snapshots, mines the server
//! log for vacuum and slow-query events, rolls up counters and applies
//! retention. State lives in `--data-dir` (WAL + checkpoint).
//!
//! `--backfill-sessions FILE` instead rebuilds session intervals from a
//! telemetry dump and exits.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Return unused jemalloc pages to the OS after a checkpoint.
#[cfg(not(target_env = "msvc"))]
fn release_memory_to_os() {
    // SAFETY: mallctl with a valid NUL-terminated name and no in/out buffers.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
fn release_memory_to_os() {}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Timelike, Utc};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use emhealth_core::collector::PostgresSource;
use emhealth_core::ingest::parse_telemetry;
use emhealth_core::miner::LogStream;
use emhealth_core::session::SessionDetector;
use emhealth_core::util::{format_duration, now_millis};
use emhealth_core::{CycleSummary, Engine, EngineConfig, Store};

/// Instrument health engine daemon.
#[derive(Parser)]
#[command(name = "emhealthd", about = "Instrument health engine daemon", version)]
struct Args {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the WAL and checkpoint.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Cycle interval in seconds.
    #[arg(short, long, default_value = "60")]
    interval: u64,

    /// PostgreSQL log file to mine (overrides `[log] path`).
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// libpq connection string. Defaults to the PG* environment variables.
    #[arg(long, value_name = "CONNINFO")]
    postgres: Option<String>,

    /// Rebuild session intervals from a telemetry COPY dump, then exit.
    #[arg(long, value_name = "FILE")]
    backfill_sessions: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["emhealthd", "emhealth_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn describe_cycle(summary: &CycleSummary) -> String {
    let mut parts: Vec<String> = summary
        .collected
        .iter()
        .map(|c| {
            if c.locked > 0 || c.skipped > 0 {
                format!(
                    "{} {} ({} locked, {} gone)",
                    c.written, c.class, c.locked, c.skipped
                )
            } else {
                format!("{} {}", c.written, c.class)
            }
        })
        .collect();
    if let Some(s) = summary.statements {
        parts.push(format!("{} statements", s.written));
    }
    if summary.mined.seen > 0 {
        parts.push(format!(
            "{} log records ({} vacuum, {} plans)",
            summary.mined.seen, summary.mined.vacuum_inserted, summary.mined.plans_inserted
        ));
    }
    parts.join(", ")
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("emhealthd {} starting", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Invalid configuration {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    let store = match Store::open(&args.data_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot open data directory {}: {}", args.data_dir.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!("Storage opened at {}", args.data_dir.display());

    if let Some(dump) = &args.backfill_sessions {
        return backfill(&store, &config, dump);
    }

    let source = match &args.postgres {
        Some(conninfo) => PostgresSource::with_connection_string(conninfo.clone()),
        None => match PostgresSource::from_env() {
            Ok(s) => s,
            Err(e) => {
                print_pg_warning(&e.to_string());
                return ExitCode::FAILURE;
            }
        },
    };
    run(args, config, store, source)
}

fn backfill(store: &Store, config: &EngineConfig, dump: &Path) -> ExitCode {
    let content = match std::fs::read_to_string(dump) {
        Ok(c) => c,
        Err(e) => {
            error!("Cannot read {}: {}", dump.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let (telemetry, malformed) = parse_telemetry(&content);
    if malformed > 0 {
        warn!("Skipped {} malformed telemetry rows", malformed);
    }
    let result = SessionDetector::backfill(store, config, &telemetry).and_then(|summary| {
        store.checkpoint()?;
        Ok(summary)
    });
    match result {
        Ok(summary) => {
            info!(
                "Backfill complete: {} sessions on {} lanes",
                summary.sessions, summary.lanes
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Backfill failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, config: EngineConfig, store: Store, mut source: PostgresSource) -> ExitCode {
    match source.try_connect() {
        Ok(()) => info!("PostgreSQL: connected"),
        Err(e) => {
            warn!("PostgreSQL: connection failed ({}), retrying each cycle", e);
            print_pg_warning(&e.to_string());
        }
    }

    let log_path = args.log_file.clone().or_else(|| config.log.path.clone());
    let log_format = config.log.format;
    let mut log_stream: Option<LogStream> = None;

    let interval = Duration::from_secs(args.interval.max(1));
    info!(
        "Config: interval={}, slow_query_threshold={}, rollup_bucket_width={}",
        format_duration(interval),
        format_duration(config.slow_query_threshold),
        format_duration(config.rollup_bucket_width)
    );

    let mut engine = Engine::new(config, store, source);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut last_checkpoint_hour: Option<u32> = None;
    let mut cycle_count: u64 = 0;

    info!("Starting engine loop");
    while running.load(Ordering::SeqCst) {
        let current_hour = Utc::now().hour();

        if log_stream.is_none()
            && let Some(path) = &log_path
        {
            match LogStream::follow(path.clone(), log_format) {
                Ok(stream) => {
                    info!("Mining log {}", path.display());
                    log_stream = Some(stream);
                }
                Err(e) => warn!("Cannot open log {}: {}", path.display(), e),
            }
        }
        let records = match log_stream.as_mut().map(LogStream::read_records) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("Log read failed: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        match engine.run_cycle(now_millis(), &records) {
            Ok(summary) => {
                cycle_count += 1;
                debug!("Cycle #{}: {}", cycle_count, describe_cycle(&summary));
            }
            Err(e) => error!("Cycle failed: {}", e),
        }

        if last_checkpoint_hour != Some(current_hour) {
            last_checkpoint_hour = Some(current_hour);
            checkpoint(engine.store());
            let counts = engine.store().counts();
            info!(
                "Store: {} snapshots, {} statements, {} vacuum, {} plans, {} rollup buckets",
                counts.snapshots,
                counts.statements,
                counts.vacuum_events,
                counts.plan_events,
                counts.rollup_buckets
            );
        }

        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutting down...");
    checkpoint(engine.store());
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

fn checkpoint(store: &Store) {
    match store.checkpoint() {
        Ok(()) => {
            release_memory_to_os();
            debug!("Checkpoint written");
        }
        Err(e) => error!("Checkpoint failed: {}", e),
    }
}

/// Prints a colored PostgreSQL warning with configuration hints.
fn print_pg_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}PostgreSQL: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure connection with environment variables:");
    eprintln!("    export PGHOST=localhost");
    eprintln!("    export PGPORT=5432");
    eprintln!("    export PGUSER=postgres");
    eprintln!("    export PGPASSWORD=secret");
    eprintln!("    export PGDATABASE=postgres");
    eprintln!("  or pass --postgres \"host=... user=...\"{RESET}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use emhealth_core::collector::CollectSummary;
    use emhealth_core::storage::model::ResourceClass;

    #[test]
    fn describe_cycle_lists_stages() {
        let summary = CycleSummary {
            collected: vec![CollectSummary {
                class: ResourceClass::Table,
                resources: 3,
                written: 3,
                locked: 1,
                skipped: 0,
                failed: 0,
                duplicates: 0,
            }],
            ..Default::default()
        };
        let desc = describe_cycle(&summary);
        assert!(desc.contains("3 table (1 locked, 0 gone)"));
        assert!(!desc.contains("log records"));
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from([
            "emhealthd",
            "--data-dir",
            "/var/lib/emhealth",
            "-i",
            "30",
            "--log-file",
            "/var/log/postgresql/postgresql.csv",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.interval, 30);
        assert_eq!(args.verbose, 2);
        assert!(args.backfill_sessions.is_none());
    }
}
