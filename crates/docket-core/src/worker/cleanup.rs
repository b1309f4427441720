//! Periodic queue maintenance: removal of old terminal tasks and requeue of
//! tasks abandoned mid-flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ports::TaskQueue;

/// Shortest period between two stale scans.
const MIN_STALE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupSchedule {
    /// Period of the `cleanup_old` pass.
    pub interval: Duration,
    /// Terminal tasks older than this are removed.
    pub max_age: Duration,
    /// In-flight tasks not updated for this long are requeued. Scanned
    /// every half of it.
    pub stale_after: Duration,
}

impl CleanupSchedule {
    fn stale_period(&self) -> Duration {
        (self.stale_after / 2).max(MIN_STALE_PERIOD)
    }
}

/// Run `cleanup_old` and `requeue_stale` on their periods until `token` is
/// cancelled. The first pass of each happens one period after the start.
pub fn spawn_cleanup_loop(
    queue: Arc<dyn TaskQueue>,
    schedule: CleanupSchedule,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?schedule, "cleanup loop started");
        let start = Instant::now();
        let mut cleanup = interval_at(start + schedule.interval, schedule.interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_period = schedule.stale_period();
        let mut stale = interval_at(start + stale_period, stale_period);
        stale.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("cleanup loop stopped");
                    break;
                }
                _ = cleanup.tick() => {
                    debug!("cleanup scan");
                    match queue.cleanup_old(schedule.max_age).await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "removed old tasks"),
                        Err(e) => error!(error = %e, "cleanup failed"),
                    }
                }
                _ = stale.tick() => {
                    debug!("stale scan");
                    if let Err(e) = queue.requeue_stale(schedule.stale_after).await {
                        error!(error = %e, "stale requeue failed");
                    }
                }
            }
        }
    })
}
