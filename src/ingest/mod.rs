//! Reading validation and cleaning.
//!
//! Raw readings arrive loosely typed from the collectors. Anything that fails
//! structural validation is rejected here and never reaches the baseline;
//! physically implausible values are forwarded but tagged `suspect`.

pub mod import;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MetricProfile;
use crate::error::{Error, Result};

/// One validated metric observation for one animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub animal_id: String,
    /// Location key used for spatial clustering.
    pub farm_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    /// Outside the metric's physical range; down-weighted by the baseline.
    #[serde(default)]
    pub suspect: bool,
}

/// A reading as handed over by a collector, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawReading {
    #[serde(default, alias = "tag_id")]
    pub animal_id: Option<String>,
    #[serde(default)]
    pub farm_id: Option<String>,
    #[serde(default, alias = "date")]
    pub timestamp: Option<String>,
    #[serde(default, alias = "metric")]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// A per-animal daily row carrying several metrics at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WideRecord {
    #[serde(default, alias = "tag_id")]
    pub animal_id: Option<String>,
    #[serde(default)]
    pub farm_id: Option<String>,
    #[serde(default, alias = "date")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub temperature: Option<serde_json::Value>,
    #[serde(default)]
    pub heart_rate: Option<serde_json::Value>,
    #[serde(default)]
    pub activity_level: Option<serde_json::Value>,
    #[serde(default)]
    pub feed_intake: Option<serde_json::Value>,
    #[serde(default)]
    pub water_intake: Option<serde_json::Value>,
}

impl WideRecord {
    /// Split into one raw reading per metric present. Absent or null metrics
    /// produce nothing rather than a placeholder.
    pub fn explode(self) -> Vec<RawReading> {
        let metrics = [
            ("temperature", self.temperature),
            ("heart_rate", self.heart_rate),
            ("activity_level", self.activity_level),
            ("feed_intake", self.feed_intake),
            ("water_intake", self.water_intake),
        ];

        metrics
            .into_iter()
            .filter_map(|(name, value)| match value {
                None | Some(serde_json::Value::Null) => None,
                Some(v) => Some(RawReading {
                    animal_id: self.animal_id.clone(),
                    farm_id: self.farm_id.clone(),
                    timestamp: self.timestamp.clone(),
                    metric_name: Some(name.to_string()),
                    value: Some(v),
                }),
            })
            .collect()
    }
}

/// Outcome counts for one ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub suspect: usize,
}

/// Validates raw readings against the configured metric profiles.
pub struct Normalizer {
    metrics: BTreeMap<String, MetricProfile>,
}

impl Normalizer {
    pub fn new(metrics: BTreeMap<String, MetricProfile>) -> Self {
        Self { metrics }
    }

    /// Validate one raw reading.
    pub fn normalize(&self, raw: &RawReading) -> Result<Reading> {
        let animal_id = required_text("animal_id", raw.animal_id.as_deref())?;
        let farm_id = required_text("farm_id", raw.farm_id.as_deref())?;
        let timestamp = parse_timestamp(required_text("timestamp", raw.timestamp.as_deref())?)?;
        let metric_name = required_text("metric_name", raw.metric_name.as_deref())?.to_lowercase();
        let value = parse_value(raw.value.as_ref())?;

        let suspect = self
            .metrics
            .get(&metric_name)
            .map(|range| value < range.min || value > range.max)
            .unwrap_or(false);

        Ok(Reading {
            animal_id: animal_id.to_string(),
            farm_id: farm_id.to_string(),
            timestamp,
            metric_name,
            value,
            suspect,
        })
    }

    /// Validate a batch, logging and dropping rejects. Exact repeats of
    /// `(animal_id, metric_name, timestamp)` keep their first occurrence.
    pub fn normalize_batch(&self, raws: &[RawReading]) -> (Vec<Reading>, IngestReport) {
        let mut report = IngestReport::default();
        let mut seen = HashSet::new();
        let mut readings = Vec::with_capacity(raws.len());

        for (index, raw) in raws.iter().enumerate() {
            match self.normalize(raw) {
                Ok(reading) => {
                    let key = (
                        reading.animal_id.clone(),
                        reading.metric_name.clone(),
                        reading.timestamp,
                    );
                    if !seen.insert(key) {
                        debug!(index, animal_id = %reading.animal_id, "duplicate reading dropped");
                        report.duplicates += 1;
                        continue;
                    }
                    if reading.suspect {
                        warn!(
                            animal_id = %reading.animal_id,
                            metric = %reading.metric_name,
                            value = reading.value,
                            "reading outside physical range, tagged suspect"
                        );
                        report.suspect += 1;
                    }
                    report.accepted += 1;
                    readings.push(reading);
                }
                Err(e) => {
                    warn!(index, error = %e, "rejected reading");
                    report.rejected += 1;
                }
            }
        }

        (readings, report)
    }
}

fn required_text<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::malformed(field, "is missing")),
    }
}

fn parse_value(value: Option<&serde_json::Value>) -> Result<f64> {
    let parsed = match value {
        None | Some(serde_json::Value::Null) => return Err(Error::malformed("value", "is missing")),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        Some(_) => Err(Error::malformed("value", "is not finite")),
        None => Err(Error::malformed("value", "is not numeric")),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` (UTC) or a
/// bare date (midnight UTC).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::malformed("timestamp", format!("`{s}` is not a recognised timestamp")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(EngineConfig::default().metrics)
    }

    fn raw(value: serde_json::Value) -> RawReading {
        RawReading {
            animal_id: Some("ANM0001".into()),
            farm_id: Some("farm_001".into()),
            timestamp: Some("2024-03-01T06:00:00Z".into()),
            metric_name: Some("temperature".into()),
            value: Some(value),
        }
    }

    #[test]
    fn test_accepts_numeric_and_numeric_string() {
        let n = normalizer();
        let a = n.normalize(&raw(json!(38.6))).unwrap();
        assert_eq!(a.value, 38.6);
        assert!(!a.suspect);

        let b = n.normalize(&raw(json!(" 38.6 "))).unwrap();
        assert_eq!(b.value, 38.6);
    }

    #[test]
    fn test_rejects_missing_fields() {
        let n = normalizer();
        let mut r = raw(json!(38.6));
        r.farm_id = None;
        match n.normalize(&r) {
            Err(Error::MalformedInput { field, .. }) => assert_eq!(field, "farm_id"),
            other => panic!("expected MalformedInput, got {:?}", other),
        }

        let mut r = raw(json!(38.6));
        r.animal_id = Some("   ".into());
        assert!(matches!(n.normalize(&r), Err(Error::MalformedInput { field: "animal_id", .. })));
    }

    #[test]
    fn test_rejects_non_numeric_value() {
        let n = normalizer();
        assert!(matches!(
            n.normalize(&raw(json!("feverish"))),
            Err(Error::MalformedInput { field: "value", .. })
        ));
        assert!(matches!(
            n.normalize(&raw(json!(true))),
            Err(Error::MalformedInput { field: "value", .. })
        ));
        assert!(matches!(
            n.normalize(&raw(json!("NaN"))),
            Err(Error::MalformedInput { field: "value", .. })
        ));
    }

    #[test]
    fn test_out_of_range_is_suspect_not_rejected() {
        let n = normalizer();
        let r = n.normalize(&raw(json!(-4.0))).unwrap();
        assert!(r.suspect);
        assert_eq!(r.value, -4.0);
    }

    #[test]
    fn test_unknown_metric_has_no_range_check() {
        let n = normalizer();
        let mut r = raw(json!(-50.0));
        r.metric_name = Some("Rumination_Minutes".into());
        let reading = n.normalize(&r).unwrap();
        assert_eq!(reading.metric_name, "rumination_minutes");
        assert!(!reading.suspect);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2024-03-01 06:30:00").unwrap().to_rfc3339(),
            "2024-03-01T06:30:00+00:00"
        );
        assert_eq!(
            parse_timestamp("2024-03-01T08:00:00+02:00").unwrap().to_rfc3339(),
            "2024-03-01T06:00:00+00:00"
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_wide_record_skips_absent_metrics() {
        let record: WideRecord = serde_json::from_value(json!({
            "tag_id": "ANM0002",
            "farm_id": "farm_002",
            "date": "2024-03-01",
            "temperature": 39.1,
            "heart_rate": null,
            "activity_level": 0.9
        }))
        .unwrap();

        let raws = record.explode();
        assert_eq!(raws.len(), 2);
        assert!(raws.iter().all(|r| r.animal_id.as_deref() == Some("ANM0002")));
        assert!(raws.iter().all(|r| r.metric_name.as_deref() != Some("heart_rate")));
    }

    #[test]
    fn test_batch_counts_rejects_duplicates_and_suspects() {
        let n = normalizer();
        let raws = vec![
            raw(json!(38.5)),
            raw(json!(38.5)),
            raw(json!("n/a")),
            {
                let mut r = raw(json!(60.0));
                r.timestamp = Some("2024-03-01T12:00:00Z".into());
                r
            },
        ];

        let (readings, report) = n.normalize_batch(&raws);
        assert_eq!(readings.len(), 2);
        assert_eq!(
            report,
            IngestReport { accepted: 2, rejected: 1, duplicates: 1, suspect: 1 }
        );
    }
}
