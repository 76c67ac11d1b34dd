//! One batch: readings in, baselines, events and clusters out.
//!
//! A batch loads state, fans the per-animal work out over blocking workers,
//! feeds the cluster detector, commits everything in one transaction and only
//! then notifies the alert sink. If any storage step fails after its retries,
//! nothing is committed and the next batch starts from the same state.
//!
//! Each farm is read in arrival order past its ingestion mark, so a reading
//! uploaded late is still scored by the next batch. Readings stamped at or
//! after `window_close` wait for a later batch. The commit carries a token
//! derived from the previous batch, which makes a retried commit a no-op even
//! when an abandoned attempt already landed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::alert::{dispatch, AlertSink, Notification};
use crate::analysis::cluster::{ClusterDetector, ClusterStatus};
use crate::config::EngineConfig;
use crate::detect::baseline::AnimalBaseline;
use crate::detect::engine::{process_shard, shard_by_animal, ShardOutcome, ShardStats};
use crate::error::{Error, Result};
use crate::ingest::{IngestReport, Normalizer, RawReading, Reading};
use crate::storage::retry::{with_retry, RetryPolicy};
use crate::storage::{batch_token, BatchCommit, Store};

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub window_close: Option<DateTime<Utc>>,
    pub farms: usize,
    #[serde(flatten)]
    pub stats: ShardStats,
    pub events: usize,
    pub clusters_changed: usize,
    pub clusters_confirmed: usize,
    pub clusters_open: usize,
}

pub struct BatchRunner<S: Store> {
    config: Arc<EngineConfig>,
    store: Arc<S>,
    sink: Arc<dyn AlertSink>,
    retry: RetryPolicy,
    normalizer: Normalizer,
}

impl<S: Store> BatchRunner<S> {
    pub fn new(config: EngineConfig, store: Arc<S>, sink: Arc<dyn AlertSink>) -> Self {
        let retry = RetryPolicy::from_config(&config.storage);
        let normalizer = Normalizer::new(config.metrics.clone());
        Self {
            config: Arc::new(config),
            store,
            sink,
            retry,
            normalizer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Validate raw readings and persist the accepted ones.
    pub async fn ingest(&self, raws: &[RawReading]) -> Result<IngestReport> {
        let (readings, report) = self.normalizer.normalize_batch(raws);
        if readings.is_empty() {
            return Ok(report);
        }

        let store = self.store.clone();
        let readings = Arc::new(readings);
        let added = with_retry(&self.retry, "insert_readings", move || {
            store.insert_readings(&readings)
        })
        .await?;

        info!(
            accepted = report.accepted,
            stored = added,
            rejected = report.rejected,
            duplicates = report.duplicates,
            suspect = report.suspect,
            "ingested readings"
        );
        Ok(report)
    }

    /// Process every reading older than `window_close` not yet seen, and
    /// evaluate all cluster bins closed by then.
    pub async fn run(&self, window_close: DateTime<Utc>) -> Result<BatchReport> {
        match self.run_inner(window_close).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(window_close = %window_close, error = %e, "batch failed, nothing committed");
                Err(e)
            }
        }
    }

    async fn run_inner(&self, window_close: DateTime<Utc>) -> Result<BatchReport> {
        let store = self.store.clone();
        let farms = with_retry(&self.retry, "list_farms", move || store.list_farms()).await?;

        let store = self.store.clone();
        let state = with_retry(&self.retry, "load_detector_state", move || {
            store.load_detector_state()
        })
        .await?;

        let store = self.store.clone();
        let based_on = with_retry(&self.retry, "last_batch", move || store.last_batch()).await?;

        let mut readings: Vec<Reading> = Vec::new();
        let mut baselines: Vec<AnimalBaseline> = Vec::new();
        let mut watermarks: BTreeMap<String, i64> = BTreeMap::new();
        let mut active_farms = 0;

        for farm in &farms {
            let store = self.store.clone();
            let f = farm.clone();
            let since = with_retry(&self.retry, "watermark", move || store.watermark(&f))
                .await?
                .unwrap_or(0);

            let store = self.store.clone();
            let f = farm.clone();
            let arrived = with_retry(&self.retry, "fetch_ingested_after", move || {
                store.fetch_ingested_after(&f, since)
            })
            .await?;

            let (fresh, mark) = split_at_window(arrived, window_close);
            if let Some(mark) = mark.filter(|m| *m > since) {
                watermarks.insert(farm.clone(), mark);
            }
            if fresh.is_empty() {
                continue;
            }
            active_farms += 1;

            let store = self.store.clone();
            let f = farm.clone();
            baselines.extend(
                with_retry(&self.retry, "load_baselines", move || store.load_baselines(&f)).await?,
            );
            readings.extend(fresh);
        }

        let mut detector = ClusterDetector::from_state(self.config.cluster.clone(), state);
        for r in &readings {
            detector.record_activity(&r.farm_id, &r.animal_id, r.timestamp);
        }

        let outcomes = self.fan_out(readings, baselines).await?;
        let mut stats = ShardStats::default();
        let mut all_baselines = Vec::new();
        let mut events = Vec::new();
        for o in outcomes {
            stats.merge(o.stats);
            all_baselines.extend(o.baselines);
            events.extend(o.events);
        }
        events.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));

        for e in &events {
            detector.ingest(e.clone());
        }
        let clusters = detector.evaluate(window_close);

        let mut notifications: Vec<Notification> = events
            .iter()
            .map(|e| Notification::AnomalyEvent { event: e.clone() })
            .collect();
        notifications.extend(
            clusters
                .iter()
                .map(|c| Notification::ClusterUpdate { cluster: c.clone() }),
        );

        let report = BatchReport {
            window_close: Some(window_close),
            farms: active_farms,
            stats,
            events: events.len(),
            clusters_changed: clusters.len(),
            clusters_confirmed: clusters
                .iter()
                .filter(|c| c.status == ClusterStatus::Confirmed)
                .count(),
            clusters_open: detector.open_clusters().count(),
        };

        let commit = Arc::new(BatchCommit {
            baselines: all_baselines,
            events,
            clusters,
            detector: detector.snapshot(),
            watermarks,
            notifications,
            bin_secs: i64::from(self.config.cluster.bin_hours) * 3_600,
            token: batch_token(based_on, window_close),
            based_on,
        });
        let store = self.store.clone();
        let to_commit = commit.clone();
        with_retry(&self.retry, "commit_batch", move || store.commit_batch(&to_commit)).await?;

        for note in &commit.notifications {
            dispatch(self.sink.as_ref(), note).await;
        }

        info!(
            window_close = %window_close,
            farms = report.farms,
            readings = report.stats.readings,
            scored = report.stats.scored,
            warming_up = report.stats.warming_up,
            events = report.events,
            clusters_changed = report.clusters_changed,
            clusters_open = report.clusters_open,
            "batch complete"
        );
        Ok(report)
    }

    /// Run the per-animal update-and-score loop across blocking workers.
    async fn fan_out(
        &self,
        readings: Vec<Reading>,
        baselines: Vec<AnimalBaseline>,
    ) -> Result<Vec<ShardOutcome>> {
        let shards = shard_by_animal(readings, self.config.schedule.effective_workers());

        let mut by_animal: BTreeMap<String, Vec<AnimalBaseline>> = BTreeMap::new();
        for b in baselines {
            by_animal.entry(b.animal_id.clone()).or_default().push(b);
        }

        let tasks = shards.into_iter().map(|shard| {
            let animals: BTreeSet<&str> = shard.iter().map(|r| r.animal_id.as_str()).collect();
            let profiles: Vec<AnimalBaseline> = animals
                .iter()
                .filter_map(|a| by_animal.remove(*a))
                .flatten()
                .collect();
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || process_shard(&config, shard, profiles))
        });
        let tasks: Vec<_> = tasks.collect();

        futures::future::try_join_all(tasks)
            .await
            .map_err(|e| Error::Worker(e.to_string()))
    }
}

/// Split readings fetched in arrival order into those older than
/// `window_close` and the sequence the farm's watermark may advance to.
///
/// The mark stops just before the first reading held back for a later
/// window. Readings after it that were processed now come back next time and
/// are skipped as stale by their profile.
fn split_at_window(
    arrived: Vec<(i64, Reading)>,
    window_close: DateTime<Utc>,
) -> (Vec<Reading>, Option<i64>) {
    let mut fresh = Vec::with_capacity(arrived.len());
    let mut first_held: Option<i64> = None;
    let mut last_seq: Option<i64> = None;
    for (seq, reading) in arrived {
        last_seq = Some(seq);
        if reading.timestamp < window_close {
            fresh.push(reading);
        } else if first_held.is_none() {
            first_held = Some(seq);
        }
    }
    let mark = match first_held {
        Some(seq) => Some(seq - 1),
        None => last_seq,
    };
    (fresh, mark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn reading(hours: i64) -> Reading {
        Reading {
            animal_id: "A1".into(),
            farm_id: "farm_001".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hours),
            metric_name: "temperature".into(),
            value: 38.5,
            suspect: false,
        }
    }

    #[test]
    fn test_split_holds_back_future_readings() {
        let close = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let arrived = vec![(4, reading(6)), (5, reading(30)), (6, reading(12))];
        let (fresh, mark) = split_at_window(arrived, close);
        assert_eq!(fresh.len(), 2);
        assert_eq!(mark, Some(4));

        let (fresh, mark) = split_at_window(vec![(7, reading(1)), (9, reading(2))], close);
        assert_eq!(fresh.len(), 2);
        assert_eq!(mark, Some(9));
        assert_eq!(split_at_window(Vec::new(), close), (Vec::new(), None));
    }
}
