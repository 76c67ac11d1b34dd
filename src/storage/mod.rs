//! SQLite storage layer -- schema, queries, migrations.

pub mod retry;
pub mod schema;
pub mod spool;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::alert::Notification;
use crate::analysis::cluster::{DetectorState, HistoryCell, OutbreakCluster};
use crate::detect::baseline::{AnimalBaseline, BaselineStatus};
use crate::detect::{AnomalyEvent, Severity};
use crate::error::{Error, Result};
use crate::ingest::Reading;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const CLUSTER_WATERMARK: &str = "cluster:evaluated_through";
const LAST_BATCH: &str = "batch:last";

/// Namespace for batch tokens.
const BATCH_NAMESPACE: Uuid = Uuid::from_u128(0x2c9e_51d4_7b0a_4f86_9e13_d6a4_0b7c_58e2);

/// Token for the batch built on top of `based_on` and closed at
/// `window_close`. The same inputs always give the same token, so a retried
/// commit recognises itself.
pub fn batch_token(based_on: Option<Uuid>, window_close: DateTime<Utc>) -> Uuid {
    let base = based_on.map(|t| t.to_string()).unwrap_or_default();
    let key = format!("{base}|{}", window_close.timestamp_micros());
    Uuid::new_v5(&BATCH_NAMESPACE, key.as_bytes())
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder().max_size(4).build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Everything one batch writes, committed in a single transaction.
#[derive(Debug, Default)]
pub struct BatchCommit {
    pub baselines: Vec<AnimalBaseline>,
    pub events: Vec<AnomalyEvent>,
    /// Clusters changed by this batch, in their final state.
    pub clusters: Vec<OutbreakCluster>,
    pub detector: DetectorState,
    /// Ingestion sequence consumed, per farm.
    pub watermarks: BTreeMap<String, i64>,
    pub notifications: Vec<Notification>,
    /// Bin width used to index events.
    pub bin_secs: i64,
    /// Identifies this batch; see [`batch_token`].
    pub token: Uuid,
    /// Token of the last committed batch when this one loaded its state.
    pub based_on: Option<Uuid>,
}

/// Durable store behind the detection core.
///
/// Implementations are synchronous; async callers go through
/// [`retry::with_retry`], which moves each call onto the blocking pool.
pub trait Store: Send + Sync + 'static {
    /// Readings for `farm_id` strictly newer than `since`, oldest first.
    fn fetch_readings_since(&self, farm_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>>;
    fn persist_baseline(&self, baseline: &AnimalBaseline) -> Result<()>;
    fn persist_event(&self, event: &AnomalyEvent, bin_secs: i64) -> Result<()>;
    fn persist_cluster(&self, cluster: &OutbreakCluster) -> Result<()>;

    /// Readings for `farm_id` stored after ingestion sequence `after_seq`,
    /// in ingestion order, each with its sequence number.
    fn fetch_ingested_after(&self, farm_id: &str, after_seq: i64) -> Result<Vec<(i64, Reading)>>;

    /// Insert readings, ignoring exact repeats. Returns rows added.
    fn insert_readings(&self, readings: &[Reading]) -> Result<usize>;
    fn list_farms(&self) -> Result<Vec<String>>;
    fn load_baselines(&self, farm_id: &str) -> Result<Vec<AnimalBaseline>>;
    fn load_detector_state(&self) -> Result<DetectorState>;
    /// Ingestion sequence already consumed for `farm_id`.
    fn watermark(&self, farm_id: &str) -> Result<Option<i64>>;
    fn last_batch(&self) -> Result<Option<Uuid>>;

    /// Commit everything in one transaction. Committing a batch whose token
    /// is already the last one is a no-op; committing on top of a state that
    /// has moved on fails with `Superseded`.
    fn commit_batch(&self, batch: &BatchCommit) -> Result<()>;

    fn list_clusters(&self, include_expired: bool) -> Result<Vec<OutbreakCluster>>;
    fn list_events(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<AnomalyEvent>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Store for SqliteStore {
    fn fetch_readings_since(&self, farm_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT animal_id, farm_id, ts_us, metric_name, value, suspect FROM readings
             WHERE farm_id = ?1 AND ts_us > ?2
             ORDER BY ts_us, animal_id, metric_name",
        )?;
        let rows = stmt.query_map(params![farm_id, since.timestamp_micros()], |row| {
            Ok(Reading {
                animal_id: row.get(0)?,
                farm_id: row.get(1)?,
                timestamp: from_micros(row.get(2)?),
                metric_name: row.get(3)?,
                value: row.get(4)?,
                suspect: row.get::<_, i64>(5)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn persist_baseline(&self, baseline: &AnimalBaseline) -> Result<()> {
        let conn = self.pool.get()?;
        upsert_baseline(&conn, baseline)
    }

    fn persist_event(&self, event: &AnomalyEvent, bin_secs: i64) -> Result<()> {
        let conn = self.pool.get()?;
        insert_event(&conn, event, bin_secs)
    }

    fn persist_cluster(&self, cluster: &OutbreakCluster) -> Result<()> {
        let conn = self.pool.get()?;
        upsert_cluster(&conn, cluster)
    }

    fn fetch_ingested_after(&self, farm_id: &str, after_seq: i64) -> Result<Vec<(i64, Reading)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT rowid, animal_id, farm_id, ts_us, metric_name, value, suspect FROM readings
             WHERE farm_id = ?1 AND rowid > ?2
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![farm_id, after_seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                Reading {
                    animal_id: row.get(1)?,
                    farm_id: row.get(2)?,
                    timestamp: from_micros(row.get(3)?),
                    metric_name: row.get(4)?,
                    value: row.get(5)?,
                    suspect: row.get::<_, i64>(6)? != 0,
                },
            ))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn insert_readings(&self, readings: &[Reading]) -> Result<usize> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO readings
                 (animal_id, farm_id, ts_us, metric_name, value, suspect)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for r in readings {
                added += stmt.execute(params![
                    r.animal_id,
                    r.farm_id,
                    r.timestamp.timestamp_micros(),
                    r.metric_name,
                    r.value,
                    r.suspect as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    fn list_farms(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT DISTINCT farm_id FROM readings ORDER BY farm_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn load_baselines(&self, farm_id: &str) -> Result<Vec<AnimalBaseline>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT animal_id, metric_name, farm_id, sample_count, mean, variance, trend,
                    seasonal_json, last_updated_us, status
             FROM baselines WHERE farm_id = ?1 ORDER BY animal_id, metric_name",
        )?;
        let rows = stmt.query_map(params![farm_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, String>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (animal_id, metric_name, farm_id, count, mean, variance, trend, seasonal, ts, status) = r?;
            out.push(AnimalBaseline {
                animal_id,
                farm_id,
                metric_name,
                sample_count: count.max(0) as u64,
                mean,
                variance,
                trend_component: trend,
                seasonal_component: serde_json::from_str(&seasonal)?,
                last_updated_timestamp: from_micros(ts),
                status: BaselineStatus::parse(&status).unwrap_or(BaselineStatus::WarmingUp),
            });
        }
        Ok(out)
    }

    fn load_detector_state(&self) -> Result<DetectorState> {
        let conn = self.pool.get()?;
        let evaluated_through = get_watermark(&conn, CLUSTER_WATERMARK)?
            .and_then(|v| v.parse::<i64>().ok());

        let mut state = DetectorState {
            evaluated_through,
            ..DetectorState::default()
        };

        let floor = evaluated_through.unwrap_or(i64::MIN);
        state.pending_events = query_events(
            &conn,
            "WHERE bin > ?1 AND cluster_id IS NULL ORDER BY ts_us, id",
            params![floor],
        )?;

        {
            let mut stmt = conn.prepare(
                "SELECT farm_id, bin, animal_id FROM cell_activity WHERE bin > ?1
                 ORDER BY farm_id, bin, animal_id",
            )?;
            let rows = stmt.query_map(params![floor], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            state.activity = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        }
        {
            let mut stmt = conn.prepare(
                "SELECT farm_id, bin, events, animals FROM farm_history ORDER BY farm_id, bin",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    HistoryCell {
                        events: row.get::<_, i64>(2)?.max(0) as u64,
                        animals: row.get::<_, i64>(3)?.max(0) as u64,
                    },
                ))
            })?;
            state.history = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        }

        state.open_clusters = query_clusters(&conn, "WHERE status != 'EXPIRED'")?;
        debug!(
            evaluated_through = ?state.evaluated_through,
            pending = state.pending_events.len(),
            open_clusters = state.open_clusters.len(),
            "loaded detector state"
        );
        Ok(state)
    }

    fn watermark(&self, farm_id: &str) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        Ok(get_watermark(&conn, &reading_watermark_key(farm_id))?
            .and_then(|v| v.parse::<i64>().ok()))
    }

    fn last_batch(&self) -> Result<Option<Uuid>> {
        let conn = self.pool.get()?;
        read_last_batch(&conn)
    }

    fn commit_batch(&self, batch: &BatchCommit) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let current = read_last_batch(&tx)?;
        if current == Some(batch.token) {
            debug!(token = %batch.token, "batch already committed");
            return Ok(());
        }
        if current != batch.based_on {
            return Err(Error::Superseded(format!(
                "loaded on top of {:?}, store is now at {:?}",
                batch.based_on, current
            )));
        }

        for b in &batch.baselines {
            upsert_baseline(&tx, b)?;
        }
        for e in &batch.events {
            insert_event(&tx, e, batch.bin_secs)?;
        }
        for c in &batch.clusters {
            upsert_cluster(&tx, c)?;
        }
        for c in &batch.detector.open_clusters {
            upsert_cluster(&tx, c)?;
        }

        tx.execute("DELETE FROM cell_activity", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO cell_activity (farm_id, bin, animal_id) VALUES (?1, ?2, ?3)",
            )?;
            for (farm, bin, animal) in &batch.detector.activity {
                stmt.execute(params![farm, bin, animal])?;
            }
        }

        tx.execute("DELETE FROM farm_history", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO farm_history (farm_id, bin, events, animals) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (farm, bin, cell) in &batch.detector.history {
                stmt.execute(params![farm, bin, cell.events as i64, cell.animals as i64])?;
            }
        }

        if let Some(through) = batch.detector.evaluated_through {
            set_watermark(&tx, CLUSTER_WATERMARK, &through.to_string())?;
        }
        for (farm, seq) in &batch.watermarks {
            set_watermark(&tx, &reading_watermark_key(farm), &seq.to_string())?;
        }
        set_watermark(&tx, LAST_BATCH, &batch.token.to_string())?;

        for note in &batch.notifications {
            spool::enqueue(&tx, note)?;
        }

        tx.commit()?;
        debug!(
            baselines = batch.baselines.len(),
            events = batch.events.len(),
            clusters = batch.clusters.len(),
            "batch committed"
        );
        Ok(())
    }

    fn list_clusters(&self, include_expired: bool) -> Result<Vec<OutbreakCluster>> {
        let conn = self.pool.get()?;
        let filter = if include_expired {
            "ORDER BY window_start, cluster_id"
        } else {
            "WHERE status != 'EXPIRED' ORDER BY window_start, cluster_id"
        };
        query_clusters(&conn, filter)
    }

    fn list_events(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<AnomalyEvent>> {
        let conn = self.pool.get()?;
        query_events(
            &conn,
            "WHERE ts_us >= ?1 ORDER BY ts_us, id LIMIT ?2",
            params![since.timestamp_micros(), limit as i64],
        )
    }
}

fn reading_watermark_key(farm_id: &str) -> String {
    format!("ingested:{farm_id}")
}

fn read_last_batch(conn: &Connection) -> Result<Option<Uuid>> {
    Ok(get_watermark(conn, LAST_BATCH)?.and_then(|v| Uuid::parse_str(&v).ok()))
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or_default()
}

fn get_watermark(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM watermarks WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?)
}

fn set_watermark(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO watermarks (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

fn upsert_baseline(conn: &Connection, b: &AnimalBaseline) -> Result<()> {
    conn.execute(
        "INSERT INTO baselines
         (animal_id, metric_name, farm_id, sample_count, mean, variance, trend,
          seasonal_json, last_updated_us, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(animal_id, metric_name) DO UPDATE SET
            farm_id = excluded.farm_id,
            sample_count = excluded.sample_count,
            mean = excluded.mean,
            variance = excluded.variance,
            trend = excluded.trend,
            seasonal_json = excluded.seasonal_json,
            last_updated_us = excluded.last_updated_us,
            status = excluded.status",
        params![
            b.animal_id,
            b.metric_name,
            b.farm_id,
            b.sample_count as i64,
            b.mean,
            b.variance,
            b.trend_component,
            serde_json::to_string(&b.seasonal_component)?,
            b.last_updated_timestamp.timestamp_micros(),
            b.status.as_str(),
        ],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, e: &AnomalyEvent, bin_secs: i64) -> Result<()> {
    if bin_secs <= 0 {
        return Err(Error::Config("bin width must be positive".into()));
    }
    conn.execute(
        "INSERT OR IGNORE INTO anomaly_events
         (id, animal_id, farm_id, ts_us, metric_name, observed_value, expected_value,
          z_score, severity, suspect, bin)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            e.id.to_string(),
            e.animal_id,
            e.farm_id,
            e.timestamp.timestamp_micros(),
            e.metric_name,
            e.observed_value,
            e.expected_value,
            e.z_score,
            e.severity.as_str(),
            e.suspect as i64,
            e.timestamp.timestamp().div_euclid(bin_secs),
        ],
    )?;
    Ok(())
}

fn upsert_cluster(conn: &Connection, c: &OutbreakCluster) -> Result<()> {
    let farms = c.farm_ids.iter().cloned().collect::<Vec<_>>().join(",");
    conn.execute(
        "INSERT INTO outbreak_clusters
         (cluster_id, status, severity, farm_ids, window_start, window_end, observed_count,
          expected_count, significance, confirmed_at, merged_into, updated_at, body_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(cluster_id) DO UPDATE SET
            status = excluded.status,
            severity = excluded.severity,
            farm_ids = excluded.farm_ids,
            window_start = excluded.window_start,
            window_end = excluded.window_end,
            observed_count = excluded.observed_count,
            expected_count = excluded.expected_count,
            significance = excluded.significance,
            confirmed_at = excluded.confirmed_at,
            merged_into = excluded.merged_into,
            updated_at = excluded.updated_at,
            body_json = excluded.body_json",
        params![
            c.cluster_id.to_string(),
            c.status.as_str(),
            c.severity.as_str(),
            farms,
            c.time_window.start.to_rfc3339(),
            c.time_window.end.to_rfc3339(),
            c.observed_count as i64,
            c.expected_count,
            c.significance_score,
            c.confirmed_at.map(|t| t.to_rfc3339()),
            c.merged_into.map(|id| id.to_string()),
            c.updated_at.to_rfc3339(),
            serde_json::to_string(c)?,
        ],
    )?;

    let id = c.cluster_id.to_string();
    let mut mark = conn.prepare_cached("UPDATE anomaly_events SET cluster_id = ?1 WHERE id = ?2")?;
    for member in &c.member_event_ids {
        mark.execute(params![id, member.to_string()])?;
    }
    Ok(())
}

fn query_clusters(conn: &Connection, filter: &str) -> Result<Vec<OutbreakCluster>> {
    let mut stmt = conn.prepare(&format!("SELECT body_json FROM outbreak_clusters {filter}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(serde_json::from_str(&r?)?);
    }
    Ok(out)
}

fn query_events(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<AnomalyEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, animal_id, farm_id, ts_us, metric_name, observed_value, expected_value,
                z_score, severity, suspect
         FROM anomaly_events {filter}"
    ))?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, f64>(6)?,
            row.get::<_, f64>(7)?,
            row.get::<_, String>(8)?,
            row.get::<_, i64>(9)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (id, animal_id, farm_id, ts, metric_name, observed, expected, z, severity, suspect) = r?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| Error::malformed("anomaly_events.id", e.to_string()))?;
        let severity = Severity::parse(&severity)
            .ok_or_else(|| Error::malformed("anomaly_events.severity", severity.clone()))?;
        out.push(AnomalyEvent {
            id,
            animal_id,
            farm_id,
            timestamp: from_micros(ts),
            metric_name,
            observed_value: observed,
            expected_value: expected,
            z_score: z,
            severity,
            suspect: suspect != 0,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cluster::{ClusterStatus, TimeWindow};
    use crate::detect::event_id;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let s = SqliteStore::open(&dir.path().join("db").join("herdwatch.db")).unwrap();
        (dir, s)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn reading(farm: &str, animal: &str, hours: i64, value: f64) -> Reading {
        Reading {
            animal_id: animal.into(),
            farm_id: farm.into(),
            timestamp: t0() + Duration::hours(hours),
            metric_name: "temperature".into(),
            value,
            suspect: false,
        }
    }

    fn event(hours: i64) -> AnomalyEvent {
        let ts = t0() + Duration::hours(hours);
        AnomalyEvent {
            id: event_id("A1", "temperature", ts),
            animal_id: "A1".into(),
            farm_id: "f1".into(),
            timestamp: ts,
            metric_name: "temperature".into(),
            observed_value: 40.0,
            expected_value: 38.5,
            z_score: 9.0,
            severity: Severity::High,
            suspect: false,
        }
    }

    #[test]
    fn test_readings_since_and_dedup() {
        let (_dir, s) = store();
        let rs = vec![
            reading("f1", "A1", 0, 38.5),
            reading("f1", "A1", 6, 38.6),
            reading("f2", "B1", 6, 38.4),
        ];
        assert_eq!(s.insert_readings(&rs).unwrap(), 3);
        assert_eq!(s.insert_readings(&rs).unwrap(), 0);

        assert_eq!(s.list_farms().unwrap(), vec!["f1".to_string(), "f2".to_string()]);
        let since = s.fetch_readings_since("f1", t0()).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].value, 38.6);
        assert_eq!(s.fetch_readings_since("f1", DateTime::<Utc>::MIN_UTC).unwrap().len(), 2);
    }

    #[test]
    fn test_ingested_after_follows_arrival_order() {
        let (_dir, s) = store();
        s.insert_readings(&[reading("f1", "A1", 12, 38.5), reading("f2", "B1", 0, 38.4)])
            .unwrap();
        let first = s.fetch_ingested_after("f1", 0).unwrap();
        assert_eq!(first.len(), 1);
        let mark = first[0].0;

        // Older reading arriving later still comes after the mark.
        s.insert_readings(&[reading("f1", "A2", 0, 38.6)]).unwrap();
        let late = s.fetch_ingested_after("f1", mark).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].1.animal_id, "A2");
        assert!(late[0].0 > mark);
    }

    #[test]
    fn test_commit_batch_is_idempotent_per_token() {
        let (_dir, s) = store();
        let e = event(30);
        let first = BatchCommit {
            events: vec![e.clone()],
            notifications: vec![Notification::AnomalyEvent { event: e }],
            bin_secs: 86_400,
            token: batch_token(None, t0() + Duration::days(2)),
            ..BatchCommit::default()
        };
        s.commit_batch(&first).unwrap();
        s.commit_batch(&first).unwrap();
        assert_eq!(spool::pending(&s.pool().get().unwrap(), 10).unwrap().len(), 1);

        let next = BatchCommit {
            bin_secs: 86_400,
            token: batch_token(Some(first.token), t0() + Duration::days(3)),
            based_on: Some(first.token),
            ..BatchCommit::default()
        };
        s.commit_batch(&next).unwrap();

        // A commit still built on the first batch arrives late.
        let stale = BatchCommit {
            bin_secs: 86_400,
            token: batch_token(Some(first.token), t0() + Duration::days(4)),
            based_on: Some(first.token),
            ..BatchCommit::default()
        };
        assert!(matches!(s.commit_batch(&stale), Err(Error::Superseded(_))));
        assert_eq!(s.last_batch().unwrap(), Some(next.token));
    }

    #[test]
    fn test_baseline_roundtrip() {
        let (_dir, s) = store();
        let b = AnimalBaseline {
            animal_id: "A1".into(),
            farm_id: "f1".into(),
            metric_name: "temperature".into(),
            sample_count: 20,
            mean: 38.5,
            variance: 0.02,
            trend_component: 38.45,
            seasonal_component: vec![0.1; 24],
            last_updated_timestamp: t0(),
            status: BaselineStatus::Active,
        };
        s.persist_baseline(&b).unwrap();
        s.persist_baseline(&b).unwrap();
        assert_eq!(s.load_baselines("f1").unwrap(), vec![b]);
        assert!(s.load_baselines("f2").unwrap().is_empty());
    }

    #[test]
    fn test_commit_batch_and_detector_state() {
        let (_dir, s) = store();
        let member = event(30);
        let pending = event(60);
        let cluster = OutbreakCluster {
            cluster_id: Uuid::from_u128(7),
            farm_ids: ["f1".to_string()].into_iter().collect(),
            time_window: TimeWindow { start: t0() + Duration::days(1), end: t0() + Duration::days(2) },
            member_event_ids: vec![member.id],
            observed_count: 1,
            expected_count: 0.2,
            significance_score: 0.18,
            severity: Severity::Low,
            status: ClusterStatus::Candidate,
            affected_animals: BTreeSet::new(),
            metrics_affected: BTreeSet::new(),
            confirmed_at: None,
            merged_into: None,
            strengthening_passes: 0,
            quiet_bins: 0,
            last_bin_count: 1,
            updated_at: t0() + Duration::days(2),
        };

        let mut watermarks = BTreeMap::new();
        watermarks.insert("f1".to_string(), 3);
        let batch = BatchCommit {
            events: vec![member.clone(), pending.clone()],
            clusters: vec![cluster.clone()],
            detector: DetectorState {
                evaluated_through: Some(t0().timestamp() / 86_400 + 1),
                activity: vec![("f1".into(), t0().timestamp() / 86_400 + 2, "A1".into())],
                history: vec![("f1".into(), t0().timestamp() / 86_400, HistoryCell { events: 0, animals: 1 })],
                open_clusters: vec![cluster.clone()],
                ..DetectorState::default()
            },
            watermarks,
            notifications: vec![Notification::ClusterUpdate { cluster: cluster.clone() }],
            bin_secs: 86_400,
            token: batch_token(None, t0() + Duration::days(3)),
            ..BatchCommit::default()
        };
        s.commit_batch(&batch).unwrap();
        assert_eq!(s.last_batch().unwrap(), Some(batch.token));

        let state = s.load_detector_state().unwrap();
        assert_eq!(state.evaluated_through, batch.detector.evaluated_through);
        assert_eq!(state.pending_events, vec![pending]);
        assert_eq!(state.activity.len(), 1);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.open_clusters, vec![cluster]);
        assert_eq!(s.watermark("f1").unwrap(), Some(3));
        assert_eq!(s.watermark("f2").unwrap(), None);

        let spooled = spool::pending(&s.pool().get().unwrap(), 10).unwrap();
        assert_eq!(spooled.len(), 1);
        assert_eq!(spooled[0].kind, "cluster_update");
        assert_eq!(s.list_events(t0(), 10).unwrap().len(), 2);
        assert_eq!(s.list_clusters(false).unwrap().len(), 1);
    }

    #[test]
    fn test_persist_event_and_cluster_individually() {
        let (_dir, s) = store();
        let e = event(30);
        s.persist_event(&e, 86_400).unwrap();
        s.persist_event(&e, 86_400).unwrap();
        assert_eq!(s.list_events(t0(), 10).unwrap(), vec![e.clone()]);
        assert!(matches!(s.persist_event(&e, 0), Err(Error::Config(_))));

        let mut cluster = OutbreakCluster {
            cluster_id: Uuid::from_u128(9),
            farm_ids: ["f1".to_string()].into_iter().collect(),
            time_window: TimeWindow { start: t0() + Duration::days(1), end: t0() + Duration::days(2) },
            member_event_ids: vec![e.id],
            observed_count: 4,
            expected_count: 0.3,
            significance_score: 0.0003,
            severity: Severity::High,
            status: ClusterStatus::Candidate,
            affected_animals: ["A1".to_string()].into_iter().collect(),
            metrics_affected: ["temperature".to_string()].into_iter().collect(),
            confirmed_at: None,
            merged_into: None,
            strengthening_passes: 0,
            quiet_bins: 0,
            last_bin_count: 4,
            updated_at: t0() + Duration::days(2),
        };
        s.persist_cluster(&cluster).unwrap();
        cluster.status = ClusterStatus::Expired;
        s.persist_cluster(&cluster).unwrap();

        assert!(s.list_clusters(false).unwrap().is_empty());
        assert_eq!(s.list_clusters(true).unwrap(), vec![cluster]);
        // Members are no longer pending once a cluster owns them.
        assert!(s.load_detector_state().unwrap().pending_events.is_empty());
    }
}
