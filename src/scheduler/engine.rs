//! Daemon loop: sleep until the next fire time, run one batch, repeat.

use std::future::Future;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::pipeline::BatchRunner;
use crate::scheduler::Scheduler;
use crate::storage::Store;

/// Run batches on `scheduler`'s fire times until `shutdown` resolves.
///
/// Each batch uses its fire time as the window close, so a late start still
/// evaluates exactly the bins that had closed by then. A failed batch is
/// logged loudly and the loop carries on; the next batch picks up from the
/// last committed state.
pub async fn run_daemon<S, F>(runner: &BatchRunner<S>, scheduler: &Scheduler, shutdown: F)
where
    S: Store,
    F: Future<Output = ()>,
{
    info!(cron = %scheduler.expr(), "scheduler started");
    tokio::pin!(shutdown);

    loop {
        let now = Utc::now();
        let Some(fire_at) = scheduler.next_after(now) else {
            warn!(cron = %scheduler.expr(), "schedule has no further fire times, stopping");
            return;
        };
        let wait = (fire_at - now).to_std().unwrap_or_default();
        info!(next_run = %fire_at, "waiting for next batch");

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        match runner.run(fire_at).await {
            Ok(report) => info!(
                window_close = %fire_at,
                events = report.events,
                clusters_changed = report.clusters_changed,
                "scheduled batch finished"
            ),
            Err(e) => error!(window_close = %fire_at, error = %e, "scheduled batch FAILED"),
        }
    }
}
