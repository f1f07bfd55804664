//! projector CLI
//!
//! ```bash
//! projector [--config PATH] [--db-path PATH] [--log-level LEVEL] status [--json] [--dead-letters N]
//! projector [--config PATH] [--log-level LEVEL] demo [--failures N]
//! ```
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (`--config`)
//! 3. Environment variables (`PROJECTOR__*`)
//! 4. CLI flags

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use projector_core::app::{ProjectorBuilder, StatusReport};
use projector_core::config::Settings;
use projector_core::domain::{CounterField, Subject, SubjectKind};
use projector_core::error::{IndexError, ProjectorError, StoreError};
use projector_core::impls::{InMemoryIndex, SqliteProjectionStore};
use projector_core::ports::{Clock, SystemClock, TracingEventSink};

#[derive(Parser, Debug)]
#[command(name = "projector")]
#[command(author, version, about = "Search-index projection worker", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite queue path
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue depth and dead letters of the SQLite queue
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// How many of the oldest dead letters to include
        #[arg(long, default_value_t = 5)]
        dead_letters: usize,
    },

    /// Run the whole pipeline against an in-memory database and a flaky index
    Demo {
        /// Number of index calls that fail before the index recovers
        #[arg(long, default_value_t = 2)]
        failures: usize,

        /// Give up if the queue has not drained after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // CLI overrides
    if let Some(db_path) = &cli.db_path {
        settings.db_path = db_path.clone();
    }
    if let Some(log_level) = &cli.log_level {
        settings.log_level = log_level.clone();
    }
    Ok(settings)
}

fn init_tracing(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

async fn show_status(settings: &Settings, json: bool, dead_letters: usize) -> Result<()> {
    let store = SqliteProjectionStore::open(&settings.db_path)
        .with_context(|| format!("Failed to open queue at {}", settings.db_path))?;
    let report = StatusReport::collect(&store, &store, SystemClock.now(), dead_letters).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("queue:        {}", settings.db_path);
    println!("pending:      {}", report.queue.pending);
    println!(
        "retrying:     {} ({} due)",
        report.queue.retrying, report.queue.retry_due
    );
    println!("dead letters: {}", report.dead_letters);
    for entry in &report.oldest_dead_letters {
        println!(
            "  {} {} task={} error={}",
            entry.created_at.to_rfc3339(),
            entry.subject,
            entry.task_id,
            entry.last_error
        );
    }
    Ok(())
}

async fn run_demo(settings: &Settings, failures: usize, timeout: Duration) -> Result<()> {
    let store = SqliteProjectionStore::open_in_memory()?;
    let index = InMemoryIndex::new();
    index.fail_next(failures, IndexError::Unavailable("demo outage".into()));
    let events = Arc::new(TracingEventSink::new());

    let projector = ProjectorBuilder::new()
        .task_store(Arc::new(store.clone()))
        .index(Arc::new(index.clone()))
        .event_sink(events.clone())
        .retry_policy(settings.retry_policy())
        .scheduler_config(settings.scheduler_config())
        .call_timeout(settings.call_timeout())
        .build()?;

    // primary write + intents in one transaction
    let factory = projector.task_factory(SubjectKind::Project);
    let outbox_store = store.clone();
    let project_id = tokio::task::spawn_blocking(move || {
        outbox_store.transaction(&factory, |outbox| -> Result<i64, ProjectorError> {
            let conn = outbox.connection();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS demo_comments (
                     id INTEGER PRIMARY KEY,
                     project_id INTEGER NOT NULL,
                     body TEXT NOT NULL
                 )",
            )
            .map_err(StoreError::from)?;

            let project_id = 42;
            conn.execute(
                "INSERT INTO demo_comments (project_id, body) VALUES (?1, ?2)",
                rusqlite::params![project_id, "first!"],
            )
            .map_err(StoreError::from)?;

            outbox.enqueue_set_deleted(project_id, false)?;
            outbox.enqueue_comment_delta(project_id, 1)?;
            outbox.enqueue_like_delta(project_id, 2)?;
            outbox.enqueue_like_delta(project_id, -1)?;
            outbox.enqueue_view_delta_batch(&[(project_id, 10), (project_id, 5)])?;
            Ok(project_id)
        })
    })
    .await
    .context("Outbox transaction panicked")??;
    info!(project_id, "primary write committed with its projection intents");

    let handle = projector.scheduler().spawn();
    let drained = tokio::select! {
        drained = wait_until_idle(&store, timeout) => drained?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            false
        }
    };
    handle.shutdown_and_join().await;

    let subject = Subject::project(project_id);
    let document = index.document(subject).unwrap_or_default();
    println!("document {subject}: {}", serde_json::to_string_pretty(&document)?);
    println!(
        "comments={} likes={} views={} deleted={}",
        document.counter(CounterField::Comment),
        document.counter(CounterField::Like),
        document.counter(CounterField::View),
        document.deleted
    );
    println!("counters: {}", serde_json::to_string_pretty(&events.snapshot())?);

    if !drained {
        bail!("queue did not drain within {timeout:?}");
    }
    Ok(())
}

async fn wait_until_idle(store: &SqliteProjectionStore, timeout: Duration) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let report = StatusReport::collect(store, store, SystemClock.now(), 0).await?;
        if report.is_idle() {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_tracing(&settings)?;

    match cli.command {
        Commands::Status { json, dead_letters } => {
            show_status(&settings, json, dead_letters).await?;
        }
        Commands::Demo {
            failures,
            timeout_secs,
        } => {
            run_demo(&settings, failures, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}
