//! Spatiotemporal outbreak clustering.
//!
//! Qualifying anomaly events are counted per `(farm, time bin)` cell and
//! tested against a Poisson null whose rate comes from the farm's own
//! background history. Surprising cells are merged across adjacent farms into
//! outbreak clusters, which then grow, confirm or expire bin by bin.
//!
//! The detector's notion of "now" is the `window_close` passed to
//! [`ClusterDetector::evaluate`]; nothing reads the wall clock, so replaying
//! the same events against the same close yields the same clusters.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::adjacency::AdjacencyGraph;
use crate::analysis::poisson::poisson_sf;
use crate::config::ClusterConfig;
use crate::detect::{AnomalyEvent, Severity};

/// Namespace for deterministic cluster ids.
const CLUSTER_NAMESPACE: Uuid = Uuid::from_u128(0x2d4e_8a10_7c3b_4f62_9e15_b0a7_c4d9_3e28);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Candidate,
    Confirmed,
    Expired,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Candidate => "CANDIDATE",
            ClusterStatus::Confirmed => "CONFIRMED",
            ClusterStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CANDIDATE" => Some(ClusterStatus::Candidate),
            "CONFIRMED" => Some(ClusterStatus::Confirmed),
            "EXPIRED" => Some(ClusterStatus::Expired),
            _ => None,
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutbreakCluster {
    pub cluster_id: Uuid,
    pub farm_ids: BTreeSet<String>,
    pub time_window: TimeWindow,
    /// Absorbed events, ordered by timestamp then id.
    pub member_event_ids: Vec<Uuid>,
    pub observed_count: u64,
    pub expected_count: f64,
    /// Poisson tail probability of the cumulative count; lower is stronger.
    pub significance_score: f64,
    pub severity: Severity,
    pub status: ClusterStatus,
    pub affected_animals: BTreeSet<String>,
    pub metrics_affected: BTreeSet<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set when this cluster was folded into an older one.
    pub merged_into: Option<Uuid>,
    /// Consecutive bins in which the cluster strengthened.
    pub strengthening_passes: u32,
    /// Consecutive bins without a qualifying event.
    pub quiet_bins: u32,
    pub last_bin_count: u64,
    /// End of the last bin that changed this cluster.
    pub updated_at: DateTime<Utc>,
}

impl OutbreakCluster {
    pub fn is_open(&self) -> bool {
        self.status != ClusterStatus::Expired
    }
}

/// Background counts for one evaluated `(farm, bin)` cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryCell {
    /// Qualifying events not absorbed by any cluster.
    pub events: u64,
    /// Animals reporting in the bin.
    pub animals: u64,
}

/// Everything the detector needs to resume where the last batch stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorState {
    /// Last bin index already evaluated.
    pub evaluated_through: Option<i64>,
    pub pending_events: Vec<AnomalyEvent>,
    /// `(farm_id, bin, animal_id)` for bins not yet evaluated.
    pub activity: Vec<(String, i64, String)>,
    /// `(farm_id, bin, cell)` background history.
    pub history: Vec<(String, i64, HistoryCell)>,
    pub open_clusters: Vec<OutbreakCluster>,
}

/// Per-farm test result for one bin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellScore {
    pub observed: u64,
    pub expected: f64,
    pub significance: f64,
}

pub struct ClusterDetector {
    config: ClusterConfig,
    graph: AdjacencyGraph,
    evaluated_through: Option<i64>,
    pending: BTreeMap<i64, BTreeMap<Uuid, AnomalyEvent>>,
    activity: BTreeMap<(String, i64), BTreeSet<String>>,
    history: BTreeMap<String, BTreeMap<i64, HistoryCell>>,
    clusters: BTreeMap<Uuid, OutbreakCluster>,
}

impl ClusterDetector {
    pub fn new(config: ClusterConfig) -> Self {
        let graph = AdjacencyGraph::new(&config.farm_adjacency_graph);
        Self {
            config,
            graph,
            evaluated_through: None,
            pending: BTreeMap::new(),
            activity: BTreeMap::new(),
            history: BTreeMap::new(),
            clusters: BTreeMap::new(),
        }
    }

    pub fn from_state(config: ClusterConfig, state: DetectorState) -> Self {
        let mut detector = Self::new(config);
        detector.evaluated_through = state.evaluated_through;
        for (farm, bin, animal) in state.activity {
            if detector.is_open_bin(bin) {
                detector.activity.entry((farm, bin)).or_default().insert(animal);
            }
        }
        for (farm, bin, cell) in state.history {
            detector.history.entry(farm).or_default().insert(bin, cell);
        }
        for cluster in state.open_clusters.into_iter().filter(|c| c.is_open()) {
            detector.clusters.insert(cluster.cluster_id, cluster);
        }
        for event in state.pending_events {
            detector.ingest(event);
        }
        detector
    }

    pub fn snapshot(&self) -> DetectorState {
        DetectorState {
            evaluated_through: self.evaluated_through,
            pending_events: self
                .pending
                .values()
                .flat_map(|events| events.values().cloned())
                .collect(),
            activity: self
                .activity
                .iter()
                .flat_map(|((farm, bin), animals)| {
                    animals.iter().map(move |a| (farm.clone(), *bin, a.clone()))
                })
                .collect(),
            history: self
                .history
                .iter()
                .flat_map(|(farm, bins)| bins.iter().map(move |(b, c)| (farm.clone(), *b, *c)))
                .collect(),
            open_clusters: self.clusters.values().cloned().collect(),
        }
    }

    pub fn open_clusters(&self) -> impl Iterator<Item = &OutbreakCluster> {
        self.clusters.values()
    }

    pub fn evaluated_through(&self) -> Option<i64> {
        self.evaluated_through
    }

    fn bin_secs(&self) -> i64 {
        i64::from(self.config.bin_hours) * 3_600
    }

    fn bins_for_days(&self, days: u32) -> i64 {
        let hours = i64::from(days) * 24;
        let bin_hours = i64::from(self.config.bin_hours);
        ((hours + bin_hours - 1) / bin_hours).max(1)
    }

    /// Epoch-aligned bin index containing `ts`.
    pub fn bin_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bin_secs())
    }

    pub fn bin_start(&self, bin: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(bin * self.bin_secs(), 0).unwrap_or_default()
    }

    fn is_open_bin(&self, bin: i64) -> bool {
        self.evaluated_through.map_or(true, |t| bin > t)
    }

    /// Note that `animal_id` reported on `farm_id` at `ts`; this is the
    /// population an expected count scales with.
    pub fn record_activity(&mut self, farm_id: &str, animal_id: &str, ts: DateTime<Utc>) {
        let bin = self.bin_of(ts);
        if !self.is_open_bin(bin) {
            return;
        }
        self.activity
            .entry((farm_id.to_string(), bin))
            .or_default()
            .insert(animal_id.to_string());
    }

    /// Buffer an event for its bin. Returns `false` when the event does not
    /// qualify or its bin has already been evaluated.
    pub fn ingest(&mut self, event: AnomalyEvent) -> bool {
        if event.severity < self.config.min_event_severity {
            return false;
        }
        let bin = self.bin_of(event.timestamp);
        if !self.is_open_bin(bin) {
            debug!(event_id = %event.id, bin, "event for an evaluated bin ignored");
            return false;
        }
        self.record_activity(&event.farm_id, &event.animal_id, event.timestamp);
        self.pending.entry(bin).or_default().insert(event.id, event);
        true
    }

    /// Expected count for `farm_id` in `bin` given `animals` reporting, from
    /// the prior-smoothed background rate over
    /// `[bin - lookback, bin - window)`.
    pub fn expected_count(&self, farm_id: &str, bin: i64, animals: u64) -> f64 {
        let lookback = self.bins_for_days(self.config.lookback_days);
        let window = self.bins_for_days(self.config.cluster_window_days);
        let (events, animal_bins) = self
            .history
            .get(farm_id)
            .map(|bins| {
                bins.range(bin - lookback..bin - window)
                    .fold((0u64, 0u64), |(e, a), (_, c)| (e + c.events, a + c.animals))
            })
            .unwrap_or((0, 0));

        let prior = self.config.prior_animal_bins;
        let rate = (events as f64 + self.config.prior_rate * prior) / (animal_bins as f64 + prior);
        rate * animals as f64
    }

    /// Poisson test of one cell.
    pub fn score_cell(&self, observed: u64, expected: f64) -> CellScore {
        CellScore {
            observed,
            expected,
            significance: poisson_sf(observed, expected),
        }
    }

    pub fn is_candidate(&self, cell: &CellScore) -> bool {
        cell.observed >= u64::from(self.config.cluster_min_count)
            && cell.significance < self.config.cluster_alpha
    }

    fn cluster_severity(&self, significance: f64, farms: usize) -> Severity {
        if significance < self.config.severity_high_p || farms >= 3 {
            Severity::High
        } else if significance < self.config.severity_medium_p || farms == 2 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Evaluate every bin that has closed (bin end plus grace) by
    /// `window_close` and was not evaluated before. Returns each cluster
    /// changed by this call in its final state, ordered by window start then
    /// id. Calling again with the same close changes nothing.
    pub fn evaluate(&mut self, window_close: DateTime<Utc>) -> Vec<OutbreakCluster> {
        let grace = Duration::hours(i64::from(self.config.grace_hours));
        let last_closed = ((window_close - grace).timestamp()).div_euclid(self.bin_secs()) - 1;

        let first = match self.evaluated_through {
            Some(t) => t + 1,
            None => {
                let earliest_pending = self.pending.keys().next().copied();
                let earliest_activity = self.activity.keys().map(|(_, b)| *b).min();
                match (earliest_pending, earliest_activity) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(a), None) | (None, Some(a)) => a,
                    (None, None) => return Vec::new(),
                }
            }
        };
        if first > last_closed {
            return Vec::new();
        }

        let window_first = last_closed - self.bins_for_days(self.config.cluster_window_days) + 1;
        let mut changed: BTreeSet<Uuid> = BTreeSet::new();

        for bin in first..=last_closed {
            if bin >= window_first {
                changed.extend(self.evaluate_bin(bin));
            } else {
                self.fold_into_history(bin, &BTreeSet::new());
            }
            self.evaluated_through = Some(bin);
        }
        self.prune_history(last_closed);

        let mut out: Vec<OutbreakCluster> = changed
            .iter()
            .filter_map(|id| self.clusters.get(id).cloned())
            .collect();
        out.sort_by(|a, b| {
            (a.time_window.start, a.cluster_id).cmp(&(b.time_window.start, b.cluster_id))
        });
        self.clusters.retain(|_, c| c.is_open());

        info!(
            bins = last_closed - first + 1,
            evaluated_through = last_closed,
            changed = out.len(),
            open = self.clusters.len(),
            "cluster evaluation complete"
        );
        out
    }

    fn evaluate_bin(&mut self, bin: i64) -> BTreeSet<Uuid> {
        let bin_start = self.bin_start(bin);
        let bin_end = self.bin_start(bin + 1);
        let events: Vec<AnomalyEvent> = {
            let mut v: Vec<AnomalyEvent> = self
                .pending
                .get(&bin)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default();
            v.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
            v
        };

        // Per-farm observed counts and populations.
        let mut farms: BTreeSet<String> = self
            .activity
            .keys()
            .filter(|(_, b)| *b == bin)
            .map(|(f, _)| f.clone())
            .collect();
        farms.extend(events.iter().map(|e| e.farm_id.clone()));

        let mut cells: BTreeMap<String, CellScore> = BTreeMap::new();
        for farm in &farms {
            let observed = events.iter().filter(|e| &e.farm_id == farm).count() as u64;
            let animals = self.animals_in(farm, bin);
            let expected = self.expected_count(farm, bin, animals);
            cells.insert(farm.clone(), self.score_cell(observed, expected));
        }

        let hot: BTreeSet<String> = cells
            .iter()
            .filter(|(_, c)| self.is_candidate(c))
            .map(|(f, _)| f.clone())
            .collect();

        let mut changed = BTreeSet::new();
        let mut fresh: BTreeSet<Uuid> = BTreeSet::new();

        for component in self.graph.components(&hot) {
            let mut touching: Vec<Uuid> = self
                .clusters
                .values()
                .filter(|c| c.is_open() && self.touches(c, &component))
                .map(|c| c.cluster_id)
                .collect();

            if touching.is_empty() {
                let cluster = self.open_cluster(&component, bin_start, bin_end);
                debug!(cluster_id = %cluster.cluster_id, farms = ?component, "candidate cell opened a cluster");
                fresh.insert(cluster.cluster_id);
                changed.insert(cluster.cluster_id);
                self.clusters.insert(cluster.cluster_id, cluster);
                continue;
            }

            touching.sort_by_key(|id| {
                self.clusters
                    .get(id)
                    .map(|c| (c.time_window.start, c.cluster_id))
            });
            let survivor = touching[0];
            for absorbed in &touching[1..] {
                self.merge(survivor, *absorbed, bin_end);
                changed.insert(*absorbed);
            }
            if let Some(c) = self.clusters.get_mut(&survivor) {
                c.farm_ids.extend(component.iter().cloned());
            }
            changed.insert(survivor);
        }

        // Every open cluster absorbs this bin's events on its farms.
        let hold_bins = self.config.hold_bins;
        let confirm_passes = self.config.confirm_passes;
        let confirm_alpha = self.config.confirm_alpha;
        let mut absorbed_ids: BTreeSet<Uuid> = BTreeSet::new();
        let open_ids: Vec<Uuid> = self
            .clusters
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.cluster_id)
            .collect();

        for id in open_ids {
            let Some(farm_ids) = self.clusters.get(&id).map(|c| c.farm_ids.clone()) else {
                continue;
            };
            let members: Vec<&AnomalyEvent> = events
                .iter()
                .filter(|e| farm_ids.contains(&e.farm_id) && !absorbed_ids.contains(&e.id))
                .collect();
            let bin_expected: f64 = farm_ids
                .iter()
                .map(|f| match cells.get(f) {
                    Some(c) => c.expected,
                    None => self.expected_count(f, bin, 0),
                })
                .sum();

            let is_fresh = fresh.contains(&id);
            let Some(cluster) = self.clusters.get_mut(&id) else {
                continue;
            };

            if members.is_empty() {
                cluster.quiet_bins += 1;
                cluster.strengthening_passes = 0;
                if cluster.quiet_bins >= hold_bins {
                    cluster.status = ClusterStatus::Expired;
                    cluster.updated_at = bin_end;
                    info!(cluster_id = %id, farms = ?cluster.farm_ids, "cluster expired");
                    changed.insert(id);
                }
                continue;
            }

            let previous = cluster.significance_score;
            let previous_count = cluster.last_bin_count;
            let bin_count = members.len() as u64;
            for e in &members {
                absorbed_ids.insert(e.id);
                cluster.member_event_ids.push(e.id);
                cluster.affected_animals.insert(e.animal_id.clone());
                cluster.metrics_affected.insert(e.metric_name.clone());
            }
            cluster.observed_count += bin_count;
            cluster.expected_count += bin_expected;
            cluster.significance_score = poisson_sf(cluster.observed_count, cluster.expected_count);
            cluster.time_window.end = bin_end;
            cluster.quiet_bins = 0;
            cluster.last_bin_count = bin_count;
            cluster.updated_at = bin_end;

            if !is_fresh {
                let strengthened =
                    cluster.significance_score < previous || bin_count > previous_count;
                if strengthened {
                    cluster.strengthening_passes += 1;
                } else {
                    cluster.strengthening_passes = 0;
                }
                if cluster.status == ClusterStatus::Candidate
                    && (cluster.strengthening_passes >= confirm_passes
                        || cluster.significance_score < confirm_alpha)
                {
                    cluster.status = ClusterStatus::Confirmed;
                    cluster.confirmed_at = Some(bin_end);
                    info!(
                        cluster_id = %id,
                        farms = ?cluster.farm_ids,
                        observed = cluster.observed_count,
                        expected = cluster.expected_count,
                        significance = cluster.significance_score,
                        "outbreak cluster confirmed"
                    );
                }
            }
            changed.insert(id);
        }

        for id in &changed {
            if let Some(c) = self.clusters.get(id) {
                let severity = self.cluster_severity(c.significance_score, c.farm_ids.len());
                if let Some(c) = self.clusters.get_mut(id) {
                    c.severity = severity;
                }
            }
        }

        self.fold_into_history(bin, &absorbed_ids);
        changed
    }

    fn animals_in(&self, farm: &str, bin: i64) -> u64 {
        self.activity
            .get(&(farm.to_string(), bin))
            .map(|a| a.len() as u64)
            .unwrap_or(0)
    }

    fn touches(&self, cluster: &OutbreakCluster, component: &BTreeSet<String>) -> bool {
        component.iter().any(|f| {
            cluster.farm_ids.contains(f)
                || cluster.farm_ids.iter().any(|c| self.graph.are_adjacent(c, f))
        })
    }

    fn open_cluster(
        &self,
        farms: &BTreeSet<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> OutbreakCluster {
        let key = format!(
            "{}|{}",
            start.timestamp(),
            farms.iter().cloned().collect::<Vec<_>>().join(",")
        );
        OutbreakCluster {
            cluster_id: Uuid::new_v5(&CLUSTER_NAMESPACE, key.as_bytes()),
            farm_ids: farms.clone(),
            time_window: TimeWindow { start, end },
            member_event_ids: Vec::new(),
            observed_count: 0,
            expected_count: 0.0,
            significance_score: 1.0,
            severity: Severity::Low,
            status: ClusterStatus::Candidate,
            affected_animals: BTreeSet::new(),
            metrics_affected: BTreeSet::new(),
            confirmed_at: None,
            merged_into: None,
            strengthening_passes: 0,
            quiet_bins: 0,
            last_bin_count: 0,
            updated_at: end,
        }
    }

    /// Fold `absorbed` into `survivor`; the absorbed cluster expires empty so
    /// no event ever belongs to two clusters.
    fn merge(&mut self, survivor: Uuid, absorbed: Uuid, at: DateTime<Utc>) {
        let Some(mut gone) = self.clusters.remove(&absorbed) else {
            return;
        };
        if let Some(target) = self.clusters.get_mut(&survivor) {
            target.farm_ids.extend(gone.farm_ids.iter().cloned());
            target.member_event_ids.append(&mut gone.member_event_ids);
            target.affected_animals.extend(std::mem::take(&mut gone.affected_animals));
            target.metrics_affected.extend(std::mem::take(&mut gone.metrics_affected));
            target.observed_count += gone.observed_count;
            target.expected_count += gone.expected_count;
            target.significance_score = poisson_sf(target.observed_count, target.expected_count);
            target.time_window.start = target.time_window.start.min(gone.time_window.start);
            target.time_window.end = target.time_window.end.max(gone.time_window.end);
            if target.confirmed_at.is_none() && gone.confirmed_at.is_some() {
                target.status = ClusterStatus::Confirmed;
                target.confirmed_at = gone.confirmed_at;
            }
            info!(survivor = %survivor, absorbed = %absorbed, "clusters merged");
        }
        gone.observed_count = 0;
        gone.expected_count = 0.0;
        gone.status = ClusterStatus::Expired;
        gone.merged_into = Some(survivor);
        gone.updated_at = at;
        self.clusters.insert(absorbed, gone);
    }

    fn fold_into_history(&mut self, bin: i64, absorbed: &BTreeSet<Uuid>) {
        let events = self.pending.remove(&bin).unwrap_or_default();
        let keys: Vec<(String, i64)> = self
            .activity
            .keys()
            .filter(|(_, b)| *b == bin)
            .cloned()
            .collect();

        let mut cells: BTreeMap<String, HistoryCell> = BTreeMap::new();
        for key in keys {
            if let Some(animals) = self.activity.remove(&key) {
                cells.entry(key.0).or_default().animals = animals.len() as u64;
            }
        }
        for event in events.values().filter(|e| !absorbed.contains(&e.id)) {
            cells.entry(event.farm_id.clone()).or_default().events += 1;
        }
        for (farm, cell) in cells {
            self.history.entry(farm).or_default().insert(bin, cell);
        }
    }

    fn prune_history(&mut self, last_closed: i64) {
        let oldest = last_closed - self.bins_for_days(self.config.lookback_days);
        for bins in self.history.values_mut() {
            *bins = bins.split_off(&oldest);
        }
        self.history.retain(|_, bins| !bins.is_empty());
    }
}
