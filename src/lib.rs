//! Herdwatch -- offline livestock outbreak detection.
//!
//! This crate provides the detection core: reading validation, per-animal
//! baselines, anomaly scoring, spatiotemporal outbreak clustering, and the
//! SQLite-backed batch and scheduling machinery that runs it unattended.

pub mod alert;
pub mod analysis;
pub mod config;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod scheduler;
pub mod sim;
pub mod storage;

use std::path::Path;
use std::sync::Arc;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use pipeline::{BatchReport, BatchRunner};

use alert::AlertSink;
use storage::SqliteStore;

/// Open the configured database (or `db_override`) and build a batch runner
/// that reports to `sink`.
pub fn open_runner(
    config: EngineConfig,
    db_override: Option<&Path>,
    sink: Arc<dyn AlertSink>,
) -> Result<BatchRunner<SqliteStore>> {
    let db_path = db_override
        .unwrap_or(config.storage.db_path.as_path())
        .to_path_buf();
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store = Arc::new(SqliteStore::open(&db_path)?);
    Ok(BatchRunner::new(config, store, sink))
}
