//! # parcel CLI
//!
//! The `parcel` binary drives the collection engine from the command line.
//!
//! ## Usage
//!
//! ```bash
//! parcel --config ./config/parcel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `parcel init` | Create the SQLite database and run schema migrations |
//! | `parcel sources` | List the adapter chain and its status |
//! | `parcel collect <input>` | Collect one parcel (APN, address or owner name) |
//! | `parcel batch <file>` | Collect every input listed in a file |
//! | `parcel cached <input>` | Show the stored record if it is still fresh |
//! | `parcel invalidate <input>` | Forget the stored record |
//! | `parcel serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! parcel init
//! parcel collect "501 38 237" --priority high
//! parcel collect "5850 W Glendale Ave" --json > record.json
//! parcel batch ./apns.txt --progress json
//! parcel serve
//! ```
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (e.g. `RUST_LOG=parcel_harvest=debug`).

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use parcel_harvest::batch;
use parcel_harvest::collector::Collector;
use parcel_harvest::config;
use parcel_harvest::error::CollectError;
use parcel_harvest::migrate;
use parcel_harvest::models::{CollectionRecord, KeyKind, Priority};
use parcel_harvest::normalize::normalize;
use parcel_harvest::progress::{self, ProgressMode};
use parcel_harvest::server;
use parcel_harvest::sources;

/// parcel: progressive multi-source parcel record collection.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/parcel.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "parcel",
    about = "Progressive multi-source parcel record collection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/parcel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List the adapter chain and whether each source is usable.
    Sources,

    /// Collect one parcel and print the merged record.
    Collect {
        /// APN, street address or owner name.
        input: String,

        /// Skip auto-detection: apn, address or owner.
        #[arg(long)]
        kind: Option<KeyKind>,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Print the record as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 120)]
        wait_secs: u64,

        /// Progress on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long)]
        progress: Option<ProgressArg>,
    },

    /// Collect every input in a file (one per line, `#` comments allowed).
    Batch {
        file: PathBuf,

        #[arg(long)]
        kind: Option<KeyKind>,

        #[arg(long, default_value = "low")]
        priority: Priority,

        /// Print the summary as JSON on stdout.
        #[arg(long)]
        json: bool,

        #[arg(long)]
        progress: Option<ProgressArg>,
    },

    /// Show the stored record for an input if it is still fresh.
    Cached {
        input: String,

        #[arg(long)]
        kind: Option<KeyKind>,

        #[arg(long)]
        json: bool,
    },

    /// Forget the stored record for an input.
    Invalidate {
        input: String,

        #[arg(long)]
        kind: Option<KeyKind>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
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

fn progress_mode(arg: Option<ProgressArg>) -> ProgressMode {
    arg.map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Collect {
            input,
            kind,
            priority,
            json,
            wait_secs,
            progress,
        } => {
            // Reject bad input before touching the database.
            normalize(&input, kind)?;
            let collector = Collector::from_config(&cfg).await?;
            let forwarder =
                progress::forward_events(collector.subscribe(), progress_mode(progress).reporter());

            let handle = collector.submit_collection(&input, kind, priority)?;
            let outcome = handle.wait(Duration::from_secs(wait_secs)).await;
            if matches!(outcome, Err(CollectError::WaitTimeout)) {
                handle.cancel();
            }
            forwarder.abort();
            collector.shutdown().await;

            let record = outcome?;
            print_record(&record, json)?;
        }
        Commands::Batch {
            file,
            kind,
            priority,
            json,
            progress,
        } => {
            let inputs = batch::read_inputs(&file)?;
            let collector = Collector::from_config(&cfg).await?;
            let reporter = progress_mode(progress).reporter();
            let summary =
                batch::run_batch(&collector, &inputs, kind, priority, None, reporter.as_ref())
                    .await;
            collector.shutdown().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("inputs:       {}", summary.total);
                for (level, count) in &summary.by_completeness {
                    println!("  {:<10}  {}", level, count);
                }
                println!("placeholders: {}", summary.placeholders);
                println!("invalid:      {}", summary.invalid.len());
                for failure in &summary.invalid {
                    println!("  {}  ({})", failure.input, failure.error);
                }
                println!("failed:       {}", summary.failed.len());
                for failure in &summary.failed {
                    println!("  {}  ({})", failure.input, failure.error);
                }
            }
        }
        Commands::Cached { input, kind, json } => {
            let key = normalize(&input, kind)?;
            let collector = Collector::from_config(&cfg).await?;
            collector.warm_cache(std::slice::from_ref(&key)).await;
            let record = collector.get_cached_if_fresh(&key);
            collector.shutdown().await;
            match record {
                Some(record) => print_record(&record, json)?,
                None => {
                    eprintln!("No fresh record for {}", key);
                    std::process::exit(1);
                }
            }
        }
        Commands::Invalidate { input, kind } => {
            let key = normalize(&input, kind)?;
            let collector = Collector::from_config(&cfg).await?;
            let removed = collector
                .forget(&key)
                .await
                .with_context(|| format!("Failed to invalidate {}", key))?;
            collector.shutdown().await;
            if removed {
                println!("Invalidated {}", key);
            } else {
                println!("Nothing stored for {}", key);
            }
        }
        Commands::Serve => {
            let collector = Arc::new(Collector::from_config(&cfg).await?);
            server::serve(collector, &cfg.server.bind).await?;
        }
    }

    Ok(())
}

fn print_record(record: &CollectionRecord, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!("key:           {}", record.key);
    println!("completeness:  {}", record.completeness);
    println!("last updated:  {}", record.last_updated.to_rfc3339());
    if record.is_placeholder() {
        println!("note:          UNVERIFIED, no real source answered");
    }
    println!();
    for (name, field) in &record.fields {
        let value = match &field.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let marker = if field.low_confidence {
            " *"
        } else if field.carried_over {
            " (stale)"
        } else {
            ""
        };
        println!("  {:<18} {:<40} [{}]{}", name, value, field.source, marker);
    }
    println!();
    for result in &record.sources_attempted {
        let detail = result.error_detail.as_deref().unwrap_or("");
        println!(
            "  {:<16} {:<8} {:>6}ms  {}",
            result.source_name, result.status, result.elapsed_ms, detail
        );
    }
    Ok(())
}
