//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS readings (
            animal_id TEXT NOT NULL,
            farm_id TEXT NOT NULL,
            ts_us INTEGER NOT NULL,
            metric_name TEXT NOT NULL,
            value REAL NOT NULL,
            suspect INTEGER NOT NULL DEFAULT 0,
            ingested_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (animal_id, metric_name, ts_us)
        );
        CREATE INDEX IF NOT EXISTS idx_readings_farm_ts ON readings(farm_id, ts_us);
        -- Batches consume readings per farm in rowid (arrival) order.
        CREATE INDEX IF NOT EXISTS idx_readings_farm ON readings(farm_id);

        CREATE TABLE IF NOT EXISTS baselines (
            animal_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            farm_id TEXT NOT NULL,
            sample_count INTEGER NOT NULL,
            mean REAL NOT NULL,
            variance REAL NOT NULL,
            trend REAL NOT NULL,
            seasonal_json TEXT NOT NULL,
            last_updated_us INTEGER NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY (animal_id, metric_name)
        );
        CREATE INDEX IF NOT EXISTS idx_baselines_farm ON baselines(farm_id);

        CREATE TABLE IF NOT EXISTS anomaly_events (
            id TEXT PRIMARY KEY,
            animal_id TEXT NOT NULL,
            farm_id TEXT NOT NULL,
            ts_us INTEGER NOT NULL,
            metric_name TEXT NOT NULL,
            observed_value REAL NOT NULL,
            expected_value REAL NOT NULL,
            z_score REAL NOT NULL,
            severity TEXT NOT NULL,
            suspect INTEGER NOT NULL DEFAULT 0,
            bin INTEGER NOT NULL,
            cluster_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_ts ON anomaly_events(ts_us);
        CREATE INDEX IF NOT EXISTS idx_events_bin ON anomaly_events(bin);

        CREATE TABLE IF NOT EXISTS outbreak_clusters (
            cluster_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            severity TEXT NOT NULL,
            farm_ids TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            observed_count INTEGER NOT NULL,
            expected_count REAL NOT NULL,
            significance REAL NOT NULL,
            confirmed_at TEXT,
            merged_into TEXT,
            updated_at TEXT NOT NULL,
            body_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_clusters_status ON outbreak_clusters(status);

        CREATE TABLE IF NOT EXISTS cell_activity (
            farm_id TEXT NOT NULL,
            bin INTEGER NOT NULL,
            animal_id TEXT NOT NULL,
            PRIMARY KEY (farm_id, bin, animal_id)
        );

        CREATE TABLE IF NOT EXISTS farm_history (
            farm_id TEXT NOT NULL,
            bin INTEGER NOT NULL,
            events INTEGER NOT NULL,
            animals INTEGER NOT NULL,
            PRIMARY KEY (farm_id, bin)
        );

        CREATE TABLE IF NOT EXISTS watermarks (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alert_spool (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            ref_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_alert_spool_pending ON alert_spool(dispatched, id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
