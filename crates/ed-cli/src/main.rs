//! # ed-cli
//!
//! Load driver for the ed store: spawns entity putters and activity
//! recorders against one shared [`Store`], waits for all of them, then prints
//! the activity report.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ed_store::{Store, StoreConfig};
use rand::Rng;
use tokio::task::JoinSet;

/// Names assigned to entity ids `0..NAMES.len()`.
const NAMES: [&str; 4] = ["Andy", "Jim", "Sue", "SueSpoon"];

/// Concurrent load driver for the ed store.
#[derive(Parser, Debug)]
#[command(name = "ed-cli", about = "Concurrent load driver for the ed store")]
struct Cli {
    /// Path to the durable `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON config file (defaults, then file, then `ED_*` env vars, then flags).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of workers upserting random entities.
    #[arg(long, default_value_t = 5)]
    putters: usize,

    /// Number of workers recording activity for entity 0.
    #[arg(long, default_value_t = 5)]
    recorders: usize,

    /// Upserts per putter.
    #[arg(long, default_value_t = 100)]
    putter_iterations: usize,

    /// Events per recorder.
    #[arg(long, default_value_t = 100_000)]
    recorder_iterations: usize,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn store_config(&self) -> Result<StoreConfig> {
        let mut config = match &self.config {
            Some(path) => ed_store::load_config_from_path(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => {
                let mut config = StoreConfig::default();
                ed_store::config::apply_env_overrides(&mut config);
                config
            }
        };
        if let Some(path) = &self.db_path {
            config.db_path.clone_from(path);
        }
        Ok(config)
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Upsert `iterations` randomly chosen entities.
fn run_putter(store: &Store, worker: usize, iterations: usize) -> Result<String> {
    let mut rng = rand::rng();
    for _ in 0..iterations {
        let which = rng.random_range(0..NAMES.len());
        let id = i64::try_from(which).context("entity id out of range")?;
        let _ = store
            .upsert_entity(id, NAMES[which])
            .with_context(|| format!("putter {worker}: upsert {id}"))?;
    }
    Ok(format!("putter {worker} finished"))
}

/// Record `iterations` activity events for entity 0.
fn run_recorder(store: &Store, worker: usize, iterations: usize) -> Result<String> {
    for _ in 0..iterations {
        let _ = store
            .record_activity(0)
            .with_context(|| format!("recorder {worker}: record activity"))?;
    }
    Ok(format!("recorder {worker} finished"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    ed_store::logging::init_subscriber(&args.log_level);

    let config = args.store_config()?;
    ensure_parent_dir(&config.db_path)?;
    println!("Test start");

    let store = Arc::new(Store::open_with_config(&config).context("Failed to open store")?);

    let mut workers = JoinSet::new();
    for worker in 0..args.putters {
        let store = Arc::clone(&store);
        let iterations = args.putter_iterations;
        let _ = workers.spawn_blocking(move || run_putter(&store, worker, iterations));
    }
    for worker in 0..args.recorders {
        let store = Arc::clone(&store);
        let iterations = args.recorder_iterations;
        let _ = workers.spawn_blocking(move || run_recorder(&store, worker, iterations));
    }

    let mut failures = 0usize;
    while let Some(joined) = workers.join_next().await {
        match joined.context("worker panicked")? {
            Ok(message) => println!("{message}"),
            Err(e) => {
                failures += 1;
                tracing::error!(error = %format!("{e:#}"), "worker failed");
            }
        }
    }

    for row in store.report_activity().context("Failed to report activity")? {
        println!(
            "Result: {} {} {} {}",
            row.entity_id,
            row.entity_name.as_deref().unwrap_or("<unknown>"),
            row.latest_at.to_rfc3339(),
            row.event_count
        );
    }

    let store = Arc::try_unwrap(store)
        .map_err(|_| anyhow::anyhow!("store still shared after all workers finished"))?;
    let _ = store.close();

    if failures > 0 {
        anyhow::bail!("{failures} worker(s) failed");
    }
    println!("Finished!");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
