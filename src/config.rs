//! TOML configuration for the detection engine.
//!
//! Every section carries compiled-in defaults, so a partial (or empty) file is
//! a valid configuration. The file path may be overridden with the
//! `HERDWATCH_CONFIG` environment variable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::Severity;
use crate::error::{Error, Result};

pub const CONFIG_ENV_VAR: &str = "HERDWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/herdwatch/herdwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "default_metrics")]
    pub metrics: BTreeMap<String, MetricProfile>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baseline: BaselineConfig::default(),
            scoring: ScoringConfig::default(),
            cluster: ClusterConfig::default(),
            metrics: default_metrics(),
            storage: StorageConfig::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (a failure here is an error, not a fallback).
    /// 2. The path in `HERDWATCH_CONFIG`.
    /// 3. `/etc/herdwatch/herdwatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HERDWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject threshold combinations the engine cannot act on.
    pub fn validate(&self) -> Result<()> {
        let b = &self.baseline;
        if !(b.decay_halflife_days > 0.0) {
            return Err(Error::Config("baseline.decay_halflife_days must be > 0".into()));
        }
        if b.warmup_min_samples == 0 {
            return Err(Error::Config("baseline.warmup_min_samples must be >= 1".into()));
        }
        if !(b.suspect_weight > 0.0 && b.suspect_weight <= 1.0) {
            return Err(Error::Config("baseline.suspect_weight must be in (0, 1]".into()));
        }
        if !(b.seasonal_smoothing >= 0.0 && b.seasonal_smoothing < 1.0) {
            return Err(Error::Config("baseline.seasonal_smoothing must be in [0, 1)".into()));
        }
        if !(b.residual_clip_sigma > 0.0) {
            return Err(Error::Config("baseline.residual_clip_sigma must be > 0".into()));
        }

        let s = &self.scoring;
        if !(s.z_low_threshold > 0.0
            && s.z_low_threshold <= s.z_med_threshold
            && s.z_med_threshold <= s.z_high_threshold)
        {
            return Err(Error::Config(
                "scoring thresholds must satisfy 0 < z_low <= z_med <= z_high".into(),
            ));
        }
        if !(s.variance_floor > 0.0) {
            return Err(Error::Config("scoring.variance_floor must be > 0".into()));
        }

        let c = &self.cluster;
        if c.cluster_window_days == 0 || c.bin_hours == 0 {
            return Err(Error::Config(
                "cluster.cluster_window_days and cluster.bin_hours must be >= 1".into(),
            ));
        }
        if c.lookback_days <= c.cluster_window_days {
            return Err(Error::Config(
                "cluster.lookback_days must exceed cluster.cluster_window_days".into(),
            ));
        }
        for (name, p) in [
            ("cluster_alpha", c.cluster_alpha),
            ("confirm_alpha", c.confirm_alpha),
            ("severity_high_p", c.severity_high_p),
            ("severity_medium_p", c.severity_medium_p),
        ] {
            if !(p > 0.0 && p < 1.0) {
                return Err(Error::Config(format!("cluster.{name} must be in (0, 1)")));
            }
        }
        if !(c.prior_rate > 0.0 && c.prior_animal_bins > 0.0) {
            return Err(Error::Config(
                "cluster.prior_rate and cluster.prior_animal_bins must be > 0".into(),
            ));
        }
        if c.hold_bins == 0 {
            return Err(Error::Config("cluster.hold_bins must be >= 1".into()));
        }

        for (name, m) in &self.metrics {
            if m.min > m.max {
                return Err(Error::Config(format!("metrics.{name}: min exceeds max")));
            }
        }

        if self.storage.retry_initial_ms > self.storage.retry_max_ms {
            return Err(Error::Config(
                "storage.retry_initial_ms must not exceed storage.retry_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Variance floor for a metric, falling back to the scoring default.
    pub fn variance_floor_for(&self, metric: &str) -> f64 {
        self.metrics
            .get(metric)
            .and_then(|m| m.variance_floor)
            .unwrap_or(self.scoring.variance_floor)
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Seasonal cycle tracked on top of the trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonalCycle {
    None,
    /// 24 hour-of-day buckets.
    Daily,
    /// 7 day-of-week buckets.
    Weekly,
}

impl SeasonalCycle {
    pub fn buckets(self) -> usize {
        match self {
            SeasonalCycle::None => 0,
            SeasonalCycle::Daily => 24,
            SeasonalCycle::Weekly => 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Half-life of the exponential weighting, in days.
    pub decay_halflife_days: f64,
    /// Samples required before a profile leaves WARMING_UP.
    pub warmup_min_samples: u64,
    /// Fraction of the normal update weight given to suspect readings.
    pub suspect_weight: f64,
    pub seasonal_cycle: SeasonalCycle,
    /// Smoothing factor for the per-bucket seasonal offsets.
    pub seasonal_smoothing: f64,
    /// Residuals beyond this many standard deviations are clipped before
    /// they update an ACTIVE profile.
    pub residual_clip_sigma: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            decay_halflife_days: 7.0,
            warmup_min_samples: 14,
            suspect_weight: 0.1,
            seasonal_cycle: SeasonalCycle::Daily,
            seasonal_smoothing: 0.1,
            residual_clip_sigma: 3.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub z_low_threshold: f64,
    pub z_med_threshold: f64,
    pub z_high_threshold: f64,
    /// Minimum variance used as the z-score denominator.
    pub variance_floor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            z_low_threshold: 2.0,
            z_med_threshold: 3.0,
            z_high_threshold: 4.0,
            variance_floor: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Sliding evaluation window, in days.
    pub cluster_window_days: u32,
    /// Width of one spatiotemporal bin, in hours.
    pub bin_hours: u32,
    /// Late-data allowance after a bin ends before it is evaluated.
    pub grace_hours: u32,
    /// History used to estimate each farm's background anomaly rate.
    pub lookback_days: u32,
    pub cluster_alpha: f64,
    pub cluster_min_count: u32,
    /// Significance below which a cluster is confirmed immediately.
    pub confirm_alpha: f64,
    /// Consecutive strengthening passes that confirm a candidate.
    pub confirm_passes: u32,
    /// Quiet bins after which an open cluster expires.
    pub hold_bins: u32,
    /// Lowest event severity counted toward a cell.
    pub min_event_severity: Severity,
    /// Prior anomaly rate per animal per bin, blended with observed history.
    pub prior_rate: f64,
    /// Weight of the prior, in animal-bins.
    pub prior_animal_bins: f64,
    pub severity_high_p: f64,
    pub severity_medium_p: f64,
    /// Undirected farm adjacency; farms absent from the graph are isolated.
    pub farm_adjacency_graph: BTreeMap<String, BTreeSet<String>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_window_days: 7,
            bin_hours: 24,
            grace_hours: 6,
            lookback_days: 90,
            cluster_alpha: 0.05,
            cluster_min_count: 3,
            confirm_alpha: 0.001,
            confirm_passes: 2,
            hold_bins: 2,
            min_event_severity: Severity::Medium,
            prior_rate: 0.01,
            prior_animal_bins: 100.0,
            severity_high_p: 0.001,
            severity_medium_p: 0.01,
            farm_adjacency_graph: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Physical plausibility range and scoring overrides for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricProfile {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance_floor: Option<f64>,
}

fn default_metrics() -> BTreeMap<String, MetricProfile> {
    let mut m = BTreeMap::new();
    m.insert(
        "temperature".to_string(),
        MetricProfile { min: 30.0, max: 45.0, variance_floor: Some(0.01) },
    );
    m.insert(
        "heart_rate".to_string(),
        MetricProfile { min: 20.0, max: 250.0, variance_floor: Some(1.0) },
    );
    m.insert(
        "activity_level".to_string(),
        MetricProfile { min: 0.0, max: 10.0, variance_floor: Some(0.0025) },
    );
    m
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Hard ceiling for a single storage call.
    pub op_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/herdwatch.db"),
            max_retries: 3,
            retry_initial_ms: 250,
            retry_max_ms: 5_000,
            op_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expression (with seconds) for the daemon loop.
    pub cron: String,
    /// Blocking workers for the per-animal fan-out; 0 picks the core count.
    pub workers: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 2 * * *".to_string(),
            workers: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
