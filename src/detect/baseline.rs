//! Per-animal, per-metric rolling profiles.
//!
//! Each profile is an additive trend + seasonal model with exponentially
//! weighted level, seasonal offsets and residual variance, so memory per
//! animal stays constant regardless of how much history has been seen.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BaselineConfig;
use crate::error::{Error, Result};
use crate::ingest::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineStatus {
    WarmingUp,
    Active,
}

impl BaselineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BaselineStatus::WarmingUp => "WARMING_UP",
            BaselineStatus::Active => "ACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WARMING_UP" => Some(BaselineStatus::WarmingUp),
            "ACTIVE" => Some(BaselineStatus::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimalBaseline {
    pub animal_id: String,
    pub farm_id: String,
    pub metric_name: String,
    pub sample_count: u64,
    /// Exponentially weighted mean of the raw (clipped) values.
    pub mean: f64,
    /// Exponentially weighted variance of the model residuals.
    pub variance: f64,
    /// Deseasonalised level.
    pub trend_component: f64,
    /// Additive offset per hour-of-day (24) or day-of-week (7) bucket.
    pub seasonal_component: Vec<f64>,
    pub last_updated_timestamp: DateTime<Utc>,
    pub status: BaselineStatus,
}

impl AnimalBaseline {
    /// Model prediction at `ts`: trend plus the seasonal offset of its bucket.
    pub fn expected_at(&self, ts: DateTime<Utc>) -> f64 {
        let offset = season_bucket(self.seasonal_component.len(), ts)
            .map(|b| self.seasonal_component[b])
            .unwrap_or(0.0);
        self.trend_component + offset
    }

    pub fn is_active(&self) -> bool {
        self.status == BaselineStatus::Active
    }
}

/// Bucket index for a timestamp, given the number of seasonal buckets.
pub fn season_bucket(buckets: usize, ts: DateTime<Utc>) -> Option<usize> {
    match buckets {
        0 => None,
        7 => Some(ts.weekday().num_days_from_monday() as usize),
        n => Some(ts.hour() as usize % n),
    }
}

/// Result of folding one reading into its profile.
#[derive(Debug, Clone)]
pub struct BaselineUpdate {
    /// Profile as it stood before the reading, i.e. what the reading is
    /// judged against. `None` for the first reading of a profile.
    pub prior: Option<AnimalBaseline>,
    pub current: AnimalBaseline,
}

pub struct BaselineEstimator {
    config: BaselineConfig,
    profiles: BTreeMap<(String, String), AnimalBaseline>,
}

impl BaselineEstimator {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            profiles: BTreeMap::new(),
        }
    }

    /// Seed previously persisted profiles.
    pub fn with_profiles(
        config: BaselineConfig,
        profiles: impl IntoIterator<Item = AnimalBaseline>,
    ) -> Self {
        let mut estimator = Self::new(config);
        for p in profiles {
            estimator
                .profiles
                .insert((p.animal_id.clone(), p.metric_name.clone()), p);
        }
        estimator
    }

    pub fn get(&self, animal_id: &str, metric_name: &str) -> Option<&AnimalBaseline> {
        self.profiles
            .get(&(animal_id.to_string(), metric_name.to_string()))
    }

    /// The profile a new reading may be judged against, or `InsufficientData`
    /// while it is still warming up.
    pub fn reference(&self, animal_id: &str, metric_name: &str) -> Result<&AnimalBaseline> {
        match self.get(animal_id, metric_name) {
            Some(p) if p.is_active() => Ok(p),
            Some(p) => Err(Error::InsufficientData {
                needed: self.config.warmup_min_samples,
                have: p.sample_count,
            }),
            None => Err(Error::InsufficientData {
                needed: self.config.warmup_min_samples,
                have: 0,
            }),
        }
    }

    pub fn profiles(&self) -> impl Iterator<Item = &AnimalBaseline> {
        self.profiles.values()
    }

    pub fn into_profiles(self) -> Vec<AnimalBaseline> {
        self.profiles.into_values().collect()
    }

    /// Fold a reading into its profile.
    ///
    /// Returns `None` when the reading is not newer than the profile's last
    /// update; such readings are stale and leave the profile untouched.
    /// `variance_floor` bounds the spread used for residual clipping.
    pub fn update(&mut self, reading: &Reading, variance_floor: f64) -> Option<BaselineUpdate> {
        let key = (reading.animal_id.clone(), reading.metric_name.clone());
        let buckets = self.config.seasonal_cycle.buckets();

        let warmup = self.config.warmup_min_samples;
        let Some(profile) = self.profiles.get_mut(&key) else {
            let fresh = seed(reading, buckets, warmup);
            self.profiles.insert(key, fresh.clone());
            return Some(BaselineUpdate {
                prior: None,
                current: fresh,
            });
        };

        if reading.timestamp <= profile.last_updated_timestamp {
            debug!(
                animal_id = %reading.animal_id,
                metric = %reading.metric_name,
                ts = %reading.timestamp,
                "stale reading skipped"
            );
            return None;
        }

        let prior = profile.clone();
        if profile.sample_count == 0 {
            // Only suspect readings so far; the seed is provisional.
            *profile = seed(reading, buckets, warmup);
            return Some(BaselineUpdate {
                prior: Some(prior),
                current: profile.clone(),
            });
        }
        if profile.seasonal_component.len() != buckets {
            profile.seasonal_component = vec![0.0; buckets];
        }

        let cfg = &self.config;
        let n = profile.sample_count + 1;
        let dt_days = (reading.timestamp - profile.last_updated_timestamp).num_seconds() as f64
            / 86_400.0;
        let decay = 1.0 - 0.5f64.powf(dt_days / cfg.decay_halflife_days);
        let weight = if reading.suspect { cfg.suspect_weight } else { 1.0 };
        let alpha = decay.max(1.0 / n as f64) * weight;
        let gamma = cfg.seasonal_smoothing * weight;

        let bucket = season_bucket(buckets, reading.timestamp);
        let expected = profile.expected_at(reading.timestamp);
        let mut residual = reading.value - expected;
        if profile.is_active() {
            let limit = cfg.residual_clip_sigma * profile.variance.max(variance_floor).sqrt();
            residual = residual.clamp(-limit, limit);
        }
        let value = expected + residual;

        profile.trend_component += alpha * residual;
        if let Some(b) = bucket {
            let target = value - profile.trend_component;
            profile.seasonal_component[b] += gamma * (target - profile.seasonal_component[b]);
        }
        profile.variance = (1.0 - alpha) * (profile.variance + alpha * residual * residual);
        profile.mean += alpha * (value - profile.mean);

        profile.sample_count = n;
        profile.farm_id = reading.farm_id.clone();
        profile.last_updated_timestamp = reading.timestamp;
        profile.status = status_for(n, cfg.warmup_min_samples);

        Some(BaselineUpdate {
            prior: Some(prior),
            current: profile.clone(),
        })
    }
}

/// A new profile centred on `reading`. A suspect reading may place the
/// profile but does not count as a sample, so the next normal reading
/// replaces it instead of averaging with it.
fn seed(reading: &Reading, buckets: usize, warmup: u64) -> AnimalBaseline {
    let sample_count = if reading.suspect { 0 } else { 1 };
    AnimalBaseline {
        animal_id: reading.animal_id.clone(),
        farm_id: reading.farm_id.clone(),
        metric_name: reading.metric_name.clone(),
        sample_count,
        mean: reading.value,
        variance: 0.0,
        trend_component: reading.value,
        seasonal_component: vec![0.0; buckets],
        last_updated_timestamp: reading.timestamp,
        status: status_for(sample_count, warmup),
    }
}

fn status_for(sample_count: u64, warmup: u64) -> BaselineStatus {
    if sample_count >= warmup {
        BaselineStatus::Active
    } else {
        BaselineStatus::WarmingUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SeasonalCycle;
    use chrono::{Duration, TimeZone};

    fn reading(ts: DateTime<Utc>, value: f64) -> Reading {
        Reading {
            animal_id: "A1".into(),
            farm_id: "farm_001".into(),
            timestamp: ts,
            metric_name: "temperature".into(),
            value,
            suspect: false,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    /// Four readings a day, `days` days, cycling through `pattern`.
    fn feed(est: &mut BaselineEstimator, days: i64, pattern: &[f64]) -> DateTime<Utc> {
        for i in 0..days * 4 {
            let ts = start() + Duration::hours(6 * i);
            est.update(&reading(ts, pattern[i as usize % pattern.len()]), 0.01);
        }
        start() + Duration::hours(6 * (days * 4 - 1))
    }

    #[test]
    fn test_warmup_transition() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        for i in 0..13 {
            est.update(&reading(start() + Duration::hours(i), 38.5), 0.01);
        }
        match est.reference("A1", "temperature") {
            Err(Error::InsufficientData { needed, have }) => {
                assert_eq!(needed, 14);
                assert_eq!(have, 13);
            }
            other => panic!("expected InsufficientData, got {:?}", other),
        }

        let update = est
            .update(&reading(start() + Duration::hours(13), 38.5), 0.01)
            .unwrap();
        assert_eq!(update.current.status, BaselineStatus::Active);
        assert_eq!(update.prior.unwrap().status, BaselineStatus::WarmingUp);
        assert!(est.reference("A1", "temperature").is_ok());
    }

    #[test]
    fn test_unknown_profile_is_insufficient() {
        let est = BaselineEstimator::new(BaselineConfig::default());
        assert!(matches!(
            est.reference("nobody", "temperature"),
            Err(Error::InsufficientData { have: 0, .. })
        ));
    }

    #[test]
    fn test_steady_pattern_converges() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        feed(&mut est, 14, &[38.5, 38.6, 38.4, 38.5]);

        let b = est.reference("A1", "temperature").unwrap();
        assert_eq!(b.sample_count, 56);
        assert!((b.mean - 38.5).abs() < 0.05, "mean = {}", b.mean);
        assert!(b.variance < 0.01, "variance = {}", b.variance);
        assert_eq!(b.seasonal_component.len(), 24);
        // 06:00 readings run hotter than 12:00 readings.
        assert!(b.seasonal_component[6] > b.seasonal_component[12]);
    }

    #[test]
    fn test_stale_reading_is_skipped() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        est.update(&reading(start(), 38.5), 0.01);
        est.update(&reading(start() + Duration::hours(6), 38.6), 0.01);

        assert!(est.update(&reading(start() + Duration::hours(6), 45.0), 0.01).is_none());
        assert!(est.update(&reading(start(), 45.0), 0.01).is_none());
        assert_eq!(est.get("A1", "temperature").unwrap().sample_count, 2);
    }

    #[test]
    fn test_suspect_reading_moves_mean_less() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        let last = feed(&mut est, 14, &[38.5]);
        let ts = last + Duration::hours(6);

        let mut normal = BaselineEstimator::with_profiles(BaselineConfig::default(), est.into_profiles());
        let mut suspect = BaselineEstimator::with_profiles(
            BaselineConfig::default(),
            normal.profiles().cloned().collect::<Vec<_>>(),
        );

        let before = normal.get("A1", "temperature").unwrap().mean;
        let n = normal.update(&reading(ts, 39.0), 0.01).unwrap().current.mean;
        let mut r = reading(ts, 39.0);
        r.suspect = true;
        let s = suspect.update(&r, 0.01).unwrap().current.mean;

        assert!((s - before).abs() < (n - before).abs());
        assert!(s > before);
    }

    #[test]
    fn test_suspect_first_reading_does_not_anchor_profile() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        let mut bad = reading(start(), -5.0);
        bad.suspect = true;
        let seeded = est.update(&bad, 0.01).unwrap().current;
        assert_eq!(seeded.sample_count, 0);

        let mut also_bad = reading(start() + Duration::hours(1), 50.0);
        also_bad.suspect = true;
        assert_eq!(est.update(&also_bad, 0.01).unwrap().current.sample_count, 0);

        for i in 0..14 {
            est.update(&reading(start() + Duration::hours(6 * (i + 1)), 38.5), 0.01);
        }
        let b = est.reference("A1", "temperature").unwrap();
        assert_eq!(b.sample_count, 14);
        assert_eq!(b.trend_component, 38.5);
        assert_eq!(b.mean, 38.5);
        assert_eq!(b.variance, 0.0);
    }

    #[test]
    fn test_residual_clipping_limits_single_spike() {
        let mut est = BaselineEstimator::new(BaselineConfig::default());
        let last = feed(&mut est, 14, &[38.5]);
        let before = est.get("A1", "temperature").unwrap().clone();

        let update = est.update(&reading(last + Duration::hours(6), 60.0), 0.01).unwrap();
        let limit = 3.0 * before.variance.max(0.01).sqrt();
        let shift = update.current.trend_component - before.trend_component;
        assert!(shift > 0.0);
        assert!(shift <= limit + 1e-12);
    }

    #[test]
    fn test_no_seasonal_cycle() {
        let cfg = BaselineConfig {
            seasonal_cycle: SeasonalCycle::None,
            ..BaselineConfig::default()
        };
        let mut est = BaselineEstimator::new(cfg);
        feed(&mut est, 2, &[10.0, 12.0]);
        let b = est.get("A1", "temperature").unwrap();
        assert!(b.seasonal_component.is_empty());
        assert_eq!(b.expected_at(start()), b.trend_component);
    }

    #[test]
    fn test_season_bucket() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 6, 18, 0, 0).unwrap(); // Wednesday
        assert_eq!(season_bucket(24, ts), Some(18));
        assert_eq!(season_bucket(7, ts), Some(2));
        assert_eq!(season_bucket(0, ts), None);
    }
}
