//! Z-score judgment of a reading against its baseline.

use crate::config::ScoringConfig;
use crate::detect::baseline::AnimalBaseline;
use crate::detect::{event_id, AnomalyEvent, Severity};
use crate::error::{Error, Result};
use crate::ingest::Reading;

pub struct AnomalyScorer {
    config: ScoringConfig,
    warmup_min_samples: u64,
}

impl AnomalyScorer {
    pub fn new(config: ScoringConfig, warmup_min_samples: u64) -> Self {
        Self {
            config,
            warmup_min_samples,
        }
    }

    /// Severity bucket for an absolute z-score, `None` below the low threshold.
    pub fn classify(&self, z: f64) -> Option<Severity> {
        let z = z.abs();
        if z >= self.config.z_high_threshold {
            Some(Severity::High)
        } else if z >= self.config.z_med_threshold {
            Some(Severity::Medium)
        } else if z >= self.config.z_low_threshold {
            Some(Severity::Low)
        } else {
            None
        }
    }

    /// Judge `reading` against `baseline`.
    ///
    /// A profile that is not yet ACTIVE yields `InsufficientData`; callers
    /// treat that as "no judgment", never as a normal verdict. Variance below
    /// `variance_floor` is raised to it so perfectly stable animals do not
    /// produce unbounded scores.
    pub fn score(
        &self,
        reading: &Reading,
        baseline: &AnimalBaseline,
        variance_floor: f64,
    ) -> Result<Option<AnomalyEvent>> {
        if !baseline.is_active() {
            return Err(Error::InsufficientData {
                needed: self.warmup_min_samples,
                have: baseline.sample_count,
            });
        }

        let expected = baseline.expected_at(reading.timestamp);
        let sd = baseline.variance.max(variance_floor).sqrt();
        let z = (reading.value - expected) / sd;

        Ok(self.classify(z).map(|severity| AnomalyEvent {
            id: event_id(&reading.animal_id, &reading.metric_name, reading.timestamp),
            animal_id: reading.animal_id.clone(),
            farm_id: reading.farm_id.clone(),
            timestamp: reading.timestamp,
            metric_name: reading.metric_name.clone(),
            observed_value: reading.value,
            expected_value: expected,
            z_score: z,
            severity,
            suspect: reading.suspect,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::baseline::BaselineStatus;
    use chrono::{TimeZone, Utc};

    fn baseline(variance: f64, status: BaselineStatus) -> AnimalBaseline {
        AnimalBaseline {
            animal_id: "A1".into(),
            farm_id: "farm_001".into(),
            metric_name: "temperature".into(),
            sample_count: 20,
            mean: 38.5,
            variance,
            trend_component: 38.5,
            seasonal_component: vec![0.0; 24],
            last_updated_timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            status,
        }
    }

    fn reading(value: f64) -> Reading {
        Reading {
            animal_id: "A1".into(),
            farm_id: "farm_001".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
            metric_name: "temperature".into(),
            value,
            suspect: false,
        }
    }

    fn scorer() -> AnomalyScorer {
        AnomalyScorer::new(ScoringConfig::default(), 14)
    }

    #[test]
    fn test_severity_buckets() {
        let s = scorer();
        assert_eq!(s.classify(1.99), None);
        assert_eq!(s.classify(2.0), Some(Severity::Low));
        assert_eq!(s.classify(-2.5), Some(Severity::Low));
        assert_eq!(s.classify(3.0), Some(Severity::Medium));
        assert_eq!(s.classify(3.99), Some(Severity::Medium));
        assert_eq!(s.classify(4.0), Some(Severity::High));
        assert_eq!(s.classify(-12.0), Some(Severity::High));
    }

    #[test]
    fn test_warming_up_is_insufficient_data() {
        let b = baseline(0.04, BaselineStatus::WarmingUp);
        assert!(matches!(
            scorer().score(&reading(41.0), &b, 0.01),
            Err(Error::InsufficientData { needed: 14, have: 20 })
        ));
    }

    #[test]
    fn test_normal_reading_yields_nothing() {
        let b = baseline(0.04, BaselineStatus::Active);
        assert!(scorer().score(&reading(38.6), &b, 0.01).unwrap().is_none());
    }

    #[test]
    fn test_event_fields() {
        let b = baseline(0.04, BaselineStatus::Active);
        let event = scorer().score(&reading(37.8), &b, 0.01).unwrap().unwrap();
        assert!((event.z_score + 3.5).abs() < 1e-9);
        assert_eq!(event.severity, Severity::Medium);
        assert_eq!(event.expected_value, 38.5);
        assert_eq!(event.observed_value, 37.8);
        assert_eq!(event.farm_id, "farm_001");
    }

    #[test]
    fn test_zero_variance_uses_floor() {
        let b = baseline(0.0, BaselineStatus::Active);
        let event = scorer().score(&reading(38.75), &b, 0.01).unwrap().unwrap();
        assert!(event.z_score.is_finite());
        assert!((event.z_score - 2.5).abs() < 1e-9);
        assert_eq!(event.severity, Severity::Low);
    }

    #[test]
    fn test_seasonal_offset_shifts_expectation() {
        let mut b = baseline(0.04, BaselineStatus::Active);
        b.seasonal_component[6] = 0.8;
        // 39.3 is normal at 06:00 once the morning offset is applied.
        assert!(scorer().score(&reading(39.3), &b, 0.01).unwrap().is_none());
    }
}
