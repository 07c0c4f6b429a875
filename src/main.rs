use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use skimd::config::{Config, OutputConfig};
use skimd::engine::{Engine, PollOutcome};
use skimd::feed::HttpFetcher;
use skimd::sink::{JsonLinesSink, LogSink, Sink};
use skimd::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "skimd", about = "Feed ingestion daemon: polls RSS/Atom sources and emits new entries once")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE", default_value = "skimd.toml")]
    config: PathBuf,

    /// Poll every enabled source once, then exit
    #[arg(long)]
    once: bool,

    /// Delete the state database before starting (forgets all seen entries)
    #[arg(long)]
    reset_state: bool,

    /// Log at debug level when RUST_LOG is not set
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Remove the database file along with its WAL side files.
fn reset_state(db_path: &Path) -> Result<()> {
    if db_path.as_os_str() == ":memory:" {
        return Ok(());
    }
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        let path = PathBuf::from(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete '{}'", path.display()))?;
        }
    }
    tracing::info!(path = %db_path.display(), "State database reset");
    Ok(())
}

async fn build_sink(output: &OutputConfig) -> Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match output {
        OutputConfig::Log => Arc::new(LogSink),
        OutputConfig::Jsonl { path: None } => Arc::new(JsonLinesSink::stdout()),
        OutputConfig::Jsonl { path: Some(path) } => Arc::new(
            JsonLinesSink::append_to(path)
                .await
                .with_context(|| format!("Failed to open output file '{}'", path.display()))?,
        ),
    };
    Ok(sink)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;

    if args.reset_state {
        reset_state(&config.database_path)?;
    }

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of skimd appears to be using {}. Stop it and try again.",
                db_path
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let fetcher = HttpFetcher::new().context("Failed to build HTTP client")?;
    let sink = build_sink(&config.output).await?;

    let engine = Arc::new(Engine::new(
        config.engine_settings(),
        Arc::new(fetcher),
        sink,
        Arc::new(db.clone()),
    ));
    engine
        .load(config.sources())
        .await
        .context("Failed to restore source state")?;

    if args.once {
        let summaries = engine.run_once().await;
        let failed = summaries
            .iter()
            .filter(|s| matches!(s.outcome, PollOutcome::Error(_)))
            .count();
        let delivered: usize = summaries.iter().map(|s| s.delivered).sum();
        tracing::info!(
            polled = summaries.len(),
            failed = failed,
            delivered = delivered,
            "Single pass complete"
        );
        db.close().await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C, running until killed");
            // Dropping the sender would stop the engine
            std::future::pending::<()>().await;
        }
        tracing::info!("Interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    Arc::clone(&engine).run(shutdown_rx).await;

    for snapshot in engine.snapshot() {
        tracing::debug!(
            source = %snapshot.id,
            health = ?snapshot.health,
            failures = snapshot.consecutive_failures,
            "Final source state"
        );
    }
    db.close().await;
    Ok(())
}
