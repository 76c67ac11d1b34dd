//! Seeded synthetic herd telemetry for testing and demos.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ingest::Reading;

/// Readings per animal per metric per day, six hours apart.
pub const READINGS_PER_DAY: i64 = 4;

/// Disease signature applied to a share of one farm's animals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutbreakSpec {
    pub farm_id: String,
    /// Day offset from the simulation start.
    pub start_day: u32,
    pub duration_days: u32,
    /// Share of the farm's animals affected, 0..=1.
    pub affected_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub farms: usize,
    pub animals_per_farm: usize,
    pub days: u32,
    pub start: DateTime<Utc>,
    pub seed: u64,
    pub outbreak: Option<OutbreakSpec>,
}

/// Per-metric normal level and bounded noise half-width.
const METRICS: [(&str, f64, f64); 3] = [
    ("temperature", 38.5, 0.3),
    ("heart_rate", 70.0, 5.0),
    ("activity_level", 1.0, 0.15),
];

pub struct HerdSimulator {
    config: SimConfig,
    rng: StdRng,
}

pub fn farm_id(index: usize) -> String {
    format!("farm_{:03}", index + 1)
}

pub fn animal_id(index: usize) -> String {
    format!("ANM{:04}", index + 1)
}

impl HerdSimulator {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Generate every reading, ordered by animal, then time, then metric.
    pub fn generate(&mut self) -> Vec<Reading> {
        let cfg = self.config.clone();
        let mut out = Vec::new();

        for f in 0..cfg.farms {
            let farm = farm_id(f);
            let animals: Vec<usize> = (0..cfg.animals_per_farm)
                .map(|a| f * cfg.animals_per_farm + a)
                .collect();
            let affected = self.pick_affected(&farm, &animals);

            for &a in &animals {
                let animal = animal_id(a);
                let sick = affected.contains(&a);
                for slot in 0..i64::from(cfg.days) * READINGS_PER_DAY {
                    let ts = cfg.start + Duration::hours(slot * 24 / READINGS_PER_DAY);
                    let day = (slot / READINGS_PER_DAY) as u32;
                    let outbreak_now = sick && self.in_outbreak(day);

                    for (metric, level, spread) in METRICS {
                        let mut value = level + self.rng.gen_range(-spread..=spread);
                        if outbreak_now {
                            value = match metric {
                                "temperature" => value + 1.5,
                                "heart_rate" => value * 1.15,
                                _ => value * 0.7,
                            };
                        }
                        out.push(Reading {
                            animal_id: animal.clone(),
                            farm_id: farm.clone(),
                            timestamp: ts,
                            metric_name: metric.to_string(),
                            value,
                            suspect: false,
                        });
                    }
                }
            }
        }
        out
    }

    fn in_outbreak(&self, day: u32) -> bool {
        self.config
            .outbreak
            .as_ref()
            .is_some_and(|o| day >= o.start_day && day < o.start_day + o.duration_days)
    }

    fn pick_affected(&mut self, farm: &str, animals: &[usize]) -> Vec<usize> {
        let Some(o) = self.config.outbreak.as_ref().filter(|o| o.farm_id == farm) else {
            return Vec::new();
        };
        let n = ((animals.len() as f64) * o.affected_fraction.clamp(0.0, 1.0)).round() as usize;
        let mut pool = animals.to_vec();
        pool.shuffle(&mut self.rng);
        pool.truncate(n);
        pool
    }
}
