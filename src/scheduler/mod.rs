//! Periodic unattended execution.

pub mod cron;
pub mod engine;

pub use self::cron::Scheduler;
pub use self::engine::run_daemon;
