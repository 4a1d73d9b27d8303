//! # corpus-sync CLI (`csync`)
//!
//! The `csync` binary keeps a vector index in step with a document store.
//! Each `sync` invocation is one pass: list the store, diff against the
//! ledger, ingest what is new or changed, and delete what disappeared.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the ledger database and run schema migrations |
//! | `csync sync` | Run one sync pass |
//! | `csync status` | Show ledger counts, recent failures and lock holders |
//! | `csync unlock` | Force-release a stale pass lock |
//!
//! ## Exit codes
//!
//! `0` on success, `1` on a fatal error or when more records failed than
//! `--max-failures` allows, `2` when another pass holds the lock.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use corpus_sync::config::{self, Config};
use corpus_sync::ingest::{self, SyncOptions};
use corpus_sync::ledger::{Ledger, SqliteLedger};
use corpus_sync::models::PassStats;
use corpus_sync::progress::{format_number, ProgressMode};
use corpus_sync::stats;

/// corpus-sync: incremental document-store to vector-index ingestion.
///
/// Settings come from a TOML file overlaid with environment variables
/// (`SHAREPOINT_SITE_NAME`, `ASTRA_DB_API_ENDPOINT`, `SECURE`, ...).
#[derive(Parser)]
#[command(
    name = "csync",
    about = "Keep a vector index in sync with a document store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Optional when every required
    /// setting comes from the environment.
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    /// Console log level (or any `EnvFilter` directive). `RUST_LOG` wins.
    #[arg(long, global = true, default_value = "info")]
    console_log: String,

    /// Log file level, used together with `--log-file`.
    #[arg(long, global = true, default_value = "debug")]
    file_log: String,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the ledger database schema.
    ///
    /// Creates the SQLite file and its tables. Safe to run repeatedly.
    Init,

    /// Run one sync pass.
    ///
    /// Lists the store, compares it with the ledger, ingests new and
    /// changed documents and removes deleted ones from the index.
    Sync {
        /// List and plan only: no lock, no ledger or index writes.
        #[arg(long)]
        dry_run: bool,

        /// Ingest at most this many documents; the rest wait for the next pass.
        #[arg(long)]
        limit: Option<usize>,

        /// Concurrent document workers (overrides `sync.workers`).
        #[arg(long)]
        workers: Option<usize>,

        /// Exit 1 when more than this many documents fail (overrides `sync.max_failures`).
        #[arg(long)]
        max_failures: Option<u64>,

        /// Progress on stderr. Defaults to `human` on a TTY, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,

        /// Print the pass summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show ledger counts, recent failures and pass locks.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Force-release pass locks.
    ///
    /// Use after a crashed pass when waiting for the lease to expire is not
    /// an option. Without `--key` every lock in the ledger is released.
    Unlock {
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.console_log))
        .with_context(|| format!("invalid --console-log '{}'", cli.console_log))?;
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let (file_layer, guard) = match &cli.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .with_context(|| format!("--log-file has no file name: {}", path.display()))?;
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::never(&dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_filter = EnvFilter::try_new(&cli.file_log)
                .with_context(|| format!("invalid --file-log '{}'", cli.file_log))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "csync failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let ledger = SqliteLedger::open(&cfg.ledger.path).await?;
            ledger.close().await;
            println!("Ledger initialized at {}.", cfg.ledger.path.display());
        }
        Commands::Sync {
            dry_run,
            limit,
            workers,
            max_failures,
            progress,
            json,
        } => {
            return run_sync_command(&cfg, dry_run, limit, workers, max_failures, progress, json)
                .await;
        }
        Commands::Status { json } => {
            stats::run_status(&cfg, json).await?;
        }
        Commands::Unlock { key } => {
            let ledger = SqliteLedger::open(&cfg.ledger.path).await?;
            let keys = match key {
                Some(k) => vec![k],
                None => ledger.locks().await?.into_iter().map(|l| l.key).collect(),
            };
            let mut released = 0;
            for k in &keys {
                if ledger.force_release(k).await? {
                    tracing::warn!(key = %k, "force-released pass lock");
                    println!("Released lock {}", k);
                    released += 1;
                }
            }
            if released == 0 {
                println!("No locks held.");
            }
            ledger.close().await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_sync_command(
    cfg: &Config,
    dry_run: bool,
    limit: Option<usize>,
    workers: Option<usize>,
    max_failures: Option<u64>,
    progress: Option<ProgressArg>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut opts = SyncOptions::from_config(&cfg.sync);
    opts.dry_run = dry_run;
    opts.limit = limit;
    if let Some(w) = workers {
        anyhow::ensure!(w >= 1, "--workers must be >= 1");
        opts.workers = w;
    }
    let threshold = max_failures.or(cfg.sync.max_failures);
    let mode = progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);

    match ingest::run_sync(cfg, &opts, mode.reporter()).await {
        Ok(stats) => {
            print_summary(&stats, dry_run, json)?;
            if stats.exceeds_failure_threshold(threshold) {
                tracing::error!(
                    failed = stats.failed,
                    threshold = threshold.unwrap_or_default(),
                    "failure threshold exceeded"
                );
                return Ok(ExitCode::from(1));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(error = %err, "sync pass aborted");
            eprintln!("Error: {}", err);
            // Exit codes are small positive integers.
            Ok(ExitCode::from(err.exit_code() as u8))
        }
    }
}

fn print_summary(stats: &PassStats, dry_run: bool, json: bool) -> anyhow::Result<()> {
    if json {
        let mut value = serde_json::to_value(stats)?;
        value["dry_run"] = serde_json::Value::Bool(dry_run);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{}",
        if dry_run {
            "Sync plan (dry run)"
        } else {
            "Sync complete"
        }
    );
    let rows = [
        ("listed", stats.listed),
        ("ingested", stats.ingested),
        ("skipped", stats.skipped),
        ("deleted", stats.deleted),
        ("failed", stats.failed),
        ("delete failed", stats.delete_failed),
        ("deferred", stats.deferred),
        ("chunks upserted", stats.chunks_upserted),
    ];
    for (label, n) in rows {
        println!("  {:<16} {:>10}", label, format_number(n));
    }
    Ok(())
}
