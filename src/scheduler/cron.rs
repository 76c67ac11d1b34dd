//! Cron-driven batch schedule.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Error, Result};

/// When the unattended batch fires.
#[derive(Debug, Clone)]
pub struct Scheduler {
    expr: String,
    schedule: CronSchedule,
}

impl Scheduler {
    /// Parse a six-field (seconds-first) cron expression.
    pub fn new(cron_expr: &str) -> Result<Self> {
        let schedule = CronSchedule::from_str(cron_expr)
            .map_err(|e| Error::Config(format!("invalid cron expression '{cron_expr}': {e}")))?;
        Ok(Self {
            expr: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Fire times within `hours` of `from`. This is strictly a dry-run
    /// preview, not the execution loop.
    pub fn preview_next_runs(&self, from: DateTime<Utc>, hours: u64) -> Vec<DateTime<Utc>> {
        let end = from + Duration::hours(hours as i64);
        self.schedule
            .after(&from)
            .take_while(|t| *t <= end)
            .collect()
    }
}
