//! Per-animal update-then-score loop, run on one shard of animals.
//!
//! Shards never share an animal, so a shard owns its profiles outright and
//! can run on a blocking worker without locks.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::detect::baseline::{AnimalBaseline, BaselineEstimator};
use crate::detect::scorer::AnomalyScorer;
use crate::detect::AnomalyEvent;
use crate::error::Error;
use crate::ingest::Reading;

/// Everything one shard produced.
#[derive(Debug, Default)]
pub struct ShardOutcome {
    /// Profiles touched by this shard, in key order.
    pub baselines: Vec<AnimalBaseline>,
    pub events: Vec<AnomalyEvent>,
    pub stats: ShardStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub readings: usize,
    pub scored: usize,
    pub warming_up: usize,
    pub stale: usize,
}

impl ShardStats {
    pub fn merge(&mut self, other: ShardStats) {
        self.readings += other.readings;
        self.scored += other.scored;
        self.warming_up += other.warming_up;
        self.stale += other.stale;
    }
}

/// Process a shard's readings in timestamp order per profile.
pub fn process_shard(
    config: &EngineConfig,
    mut readings: Vec<Reading>,
    profiles: Vec<AnimalBaseline>,
) -> ShardOutcome {
    readings.sort_by(|a, b| {
        (&a.animal_id, &a.metric_name, a.timestamp).cmp(&(&b.animal_id, &b.metric_name, b.timestamp))
    });

    let mut estimator = BaselineEstimator::with_profiles(config.baseline.clone(), profiles);
    let scorer = AnomalyScorer::new(config.scoring.clone(), config.baseline.warmup_min_samples);
    let mut touched: BTreeMap<(String, String), AnimalBaseline> = BTreeMap::new();
    let mut outcome = ShardOutcome::default();

    for reading in &readings {
        outcome.stats.readings += 1;
        let floor = config.variance_floor_for(&reading.metric_name);

        let Some(update) = estimator.update(reading, floor) else {
            outcome.stats.stale += 1;
            continue;
        };

        let verdict = match &update.prior {
            Some(prior) => scorer.score(reading, prior, floor),
            None => Err(Error::InsufficientData {
                needed: config.baseline.warmup_min_samples,
                have: 0,
            }),
        };

        match verdict {
            Ok(event) => {
                outcome.stats.scored += 1;
                outcome.events.extend(event);
            }
            Err(Error::InsufficientData { needed, have }) => {
                debug!(
                    animal_id = %reading.animal_id,
                    metric = %reading.metric_name,
                    needed,
                    have,
                    "baseline warming up, reading not scored"
                );
                outcome.stats.warming_up += 1;
            }
            Err(e) => debug!(error = %e, "scoring failed"),
        }

        touched.insert(
            (reading.animal_id.clone(), reading.metric_name.clone()),
            update.current,
        );
    }

    outcome.baselines = touched.into_values().collect();
    outcome
}

/// Split readings into at most `shards` groups, keeping each animal whole.
/// Animals are dealt round-robin in id order so the split is deterministic.
pub fn shard_by_animal(readings: Vec<Reading>, shards: usize) -> Vec<Vec<Reading>> {
    let mut by_animal: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
    for r in readings {
        by_animal.entry(r.animal_id.clone()).or_default().push(r);
    }

    let shards = shards.max(1).min(by_animal.len().max(1));
    let mut out: Vec<Vec<Reading>> = vec![Vec::new(); shards];
    for (i, (_, rs)) in by_animal.into_iter().enumerate() {
        out[i % shards].extend(rs);
    }
    out.retain(|s| !s.is_empty());
    out
}
