//! Outbreak-level analysis over anomaly events.

pub mod adjacency;
pub mod cluster;
pub mod poisson;

pub use cluster::{ClusterDetector, ClusterStatus, DetectorState, OutbreakCluster, TimeWindow};
