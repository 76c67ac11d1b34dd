//! Per-animal baselines and anomaly scoring.

pub mod baseline;
pub mod engine;
pub mod scorer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic event ids.
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_93a4_4d51_a8e0_5c3f_1d2a_9b01);

/// Ordinal classification of how extreme an anomaly or cluster is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reading judged anomalous against its animal's baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub animal_id: String,
    pub farm_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub observed_value: f64,
    pub expected_value: f64,
    pub z_score: f64,
    pub severity: Severity,
    /// Carried over from the reading.
    #[serde(default)]
    pub suspect: bool,
}

/// Stable id for the event produced by one animal/metric/timestamp, so a
/// replayed batch never mints a second event for the same reading.
pub fn event_id(animal_id: &str, metric_name: &str, timestamp: DateTime<Utc>) -> Uuid {
    let key = format!("{}|{}|{}", animal_id, metric_name, timestamp.timestamp_micros());
    Uuid::new_v5(&EVENT_NAMESPACE, key.as_bytes())
}
