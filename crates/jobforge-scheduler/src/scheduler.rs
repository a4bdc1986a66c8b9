//! Scheduler loop - promotes scheduled jobs whose time has come.

use chrono::{DateTime, Utc};
use jobforge_db::{DbResult, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::queue::PriorityQueue;

/// Bridges time-delayed jobs from the store into the ready queue.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    queue: Arc<PriorityQueue>,
    poll_interval: Duration,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<PriorityQueue>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            queue,
            poll_interval,
            batch_size,
        }
    }

    /// Run the scheduler loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval = ?self.poll_interval, batch_size = self.batch_size, "Starting scheduler");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(0) => trace!("No scheduled jobs due"),
                        Ok(promoted) => debug!(promoted, "Promoted scheduled jobs"),
                        // The jobs are still `scheduled` in the store, so the
                        // next tick selects them again.
                        Err(e) => warn!(error = %e, "Scheduler tick failed"),
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Promote up to one batch of jobs due at `now`. Returns how many were
    /// moved into the queue.
    ///
    /// Each job is marked `pending` in the store before it is enqueued, so a
    /// crash in between leaves it recoverable rather than stuck. Jobs that
    /// left `scheduled` after the scan, e.g. by being canceled, are skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let due = self.store.get_scheduled_ready(now, self.batch_size).await?;
        let mut promoted = 0;

        for job in due {
            match self.store.promote(job.id, now).await {
                Ok(Some(job)) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, "Job is due");
                    self.queue.enqueue(job);
                    promoted += 1;
                }
                Ok(None) => debug!(job_id = %job.id, "Job is no longer scheduled, skipping"),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to promote scheduled job"),
            }
        }

        Ok(promoted)
    }
}
