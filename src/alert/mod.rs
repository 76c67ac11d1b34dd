//! Outputs of the detection core.
//!
//! Delivery (SMS, email, dashboards) is somebody else's job; the core only
//! hands events and cluster changes to an [`AlertSink`].

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::cluster::{ClusterStatus, OutbreakCluster};
use crate::detect::{AnomalyEvent, Severity};

/// One item handed to the notification subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    AnomalyEvent { event: AnomalyEvent },
    ClusterUpdate { cluster: OutbreakCluster },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::AnomalyEvent { .. } => "anomaly_event",
            Notification::ClusterUpdate { .. } => "cluster_update",
        }
    }

    pub fn ref_id(&self) -> Uuid {
        match self {
            Notification::AnomalyEvent { event } => event.id,
            Notification::ClusterUpdate { cluster } => cluster.cluster_id,
        }
    }
}

/// Receiver for the core's outputs.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn on_anomaly_event(&self, event: &AnomalyEvent);
    async fn on_cluster_update(&self, cluster: &OutbreakCluster);
}

/// Writes every output as a structured log line.
pub struct TracingSink;

#[async_trait::async_trait]
impl AlertSink for TracingSink {
    async fn on_anomaly_event(&self, event: &AnomalyEvent) {
        if event.severity == Severity::High {
            warn!(
                animal_id = %event.animal_id,
                farm_id = %event.farm_id,
                metric = %event.metric_name,
                z = event.z_score,
                observed = event.observed_value,
                expected = event.expected_value,
                "high-severity anomaly"
            );
        } else {
            info!(
                animal_id = %event.animal_id,
                farm_id = %event.farm_id,
                metric = %event.metric_name,
                z = event.z_score,
                severity = %event.severity,
                "anomaly"
            );
        }
    }

    async fn on_cluster_update(&self, cluster: &OutbreakCluster) {
        let farms = cluster.farm_ids.iter().cloned().collect::<Vec<_>>().join(",");
        match cluster.status {
            ClusterStatus::Confirmed => warn!(
                cluster_id = %cluster.cluster_id,
                farms = %farms,
                observed = cluster.observed_count,
                expected = cluster.expected_count,
                significance = cluster.significance_score,
                severity = %cluster.severity,
                "OUTBREAK CONFIRMED"
            ),
            _ => info!(
                cluster_id = %cluster.cluster_id,
                farms = %farms,
                status = cluster.status.as_str(),
                observed = cluster.observed_count,
                significance = cluster.significance_score,
                "cluster update"
            ),
        }
    }
}

/// Keeps everything it receives in memory, in arrival order.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.received
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<AnomalyEvent> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::AnomalyEvent { event } => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn clusters(&self) -> Vec<OutbreakCluster> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::ClusterUpdate { cluster } => Some(cluster),
                _ => None,
            })
            .collect()
    }

    fn push(&self, note: Notification) {
        if let Ok(mut g) = self.received.lock() {
            g.push(note);
        }
    }
}

#[async_trait::async_trait]
impl AlertSink for RecordingSink {
    async fn on_anomaly_event(&self, event: &AnomalyEvent) {
        self.push(Notification::AnomalyEvent {
            event: event.clone(),
        });
    }

    async fn on_cluster_update(&self, cluster: &OutbreakCluster) {
        self.push(Notification::ClusterUpdate {
            cluster: cluster.clone(),
        });
    }
}

/// Deliver one notification to `sink`.
pub async fn dispatch(sink: &dyn AlertSink, note: &Notification) {
    match note {
        Notification::AnomalyEvent { event } => sink.on_anomaly_event(event).await,
        Notification::ClusterUpdate { cluster } => sink.on_cluster_update(cluster).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::event_id;
    use chrono::{TimeZone, Utc};

    fn event() -> AnomalyEvent {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        AnomalyEvent {
            id: event_id("A1", "heart_rate", ts),
            animal_id: "A1".into(),
            farm_id: "farm_001".into(),
            timestamp: ts,
            metric_name: "heart_rate".into(),
            observed_value: 96.0,
            expected_value: 70.0,
            z_score: 5.2,
            severity: Severity::High,
            suspect: false,
        }
    }

    #[tokio::test]
    async fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        let e = event();
        dispatch(&sink, &Notification::AnomalyEvent { event: e.clone() }).await;
        TracingSink.on_anomaly_event(&e).await;

        assert_eq!(sink.events(), vec![e]);
        assert!(sink.clusters().is_empty());
    }

    #[test]
    fn test_notification_wire_shape() {
        let note = Notification::AnomalyEvent { event: event() };
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["kind"], "anomaly_event");
        assert_eq!(json["event"]["severity"], "high");
        assert_eq!(note.kind(), "anomaly_event");
    }
}
