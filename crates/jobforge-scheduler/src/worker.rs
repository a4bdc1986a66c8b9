//! Worker that executes jobs from the queue.

use chrono::Utc;
use futures::FutureExt;
use jobforge_core::{Error, FailureDisposition, Job, JobResult, JobStatus, Payload};
use jobforge_db::{DbError, DbResult, JobResultStore, JobStore};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::queue::PriorityQueue;
use crate::registry::{HandlerRegistry, JobContext, JobHandler};

/// Tries per store write once a handler has returned.
const STORE_WRITE_ATTEMPTS: u32 = 3;

/// A worker that dequeues jobs and runs their handlers.
pub struct Worker {
    id: String,
    queue: Arc<PriorityQueue>,
    store: Arc<dyn JobStore>,
    results: Arc<dyn JobResultStore>,
    registry: Arc<HandlerRegistry>,
    error_backoff: Duration,
    handler_timeout: Option<Duration>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<PriorityQueue>,
        store: Arc<dyn JobStore>,
        results: Arc<dyn JobResultStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            store,
            results,
            registry,
            error_backoff: Duration::from_secs(1),
            handler_timeout: None,
        }
    }

    /// Pause after a store error before the job goes back to the queue or a
    /// write is tried again.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `cancel` fires. An execution already in
    /// progress is finished before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = %self.id, "Starting worker");

        loop {
            match self.queue.dequeue(&cancel).await {
                Ok(Some(job)) => self.execute(job, &cancel).await,
                Ok(None) => continue,
                Err(_) => break,
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim `queued` in the store and run it.
    async fn execute(&self, queued: Job, cancel: &CancellationToken) {
        let job = match self.store.mark_started(queued.id, Utc::now()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %queued.id, "Job is no longer pending, skipping");
                return;
            }
            Err(DbError::NotFound(_)) => {
                debug!(job_id = %queued.id, "Job was deleted, skipping");
                return;
            }
            Err(e) => {
                warn!(job_id = %queued.id, error = %e, "Failed to claim job");
                sleep(self.error_backoff).await;
                self.queue.requeue(queued);
                return;
            }
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            attempt = job.attempts + 1
        );
        self.process(job, cancel).instrument(span).await;
    }

    async fn process(&self, job: Job, cancel: &CancellationToken) {
        let Some(handler) = self.registry.get(&job.job_type) else {
            let message = Error::NoHandler(job.job_type.clone()).to_string();
            warn!("{}", message);
            self.fail_without_attempt(job, message).await;
            return;
        };

        debug!("Running job");
        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts + 1,
            max_attempts: job.max_attempts,
            cancel: cancel.clone(),
        };

        match self.invoke(handler, ctx).await {
            Ok(output) => self.complete(job, output).await,
            Err(message) => self.retry_or_fail(job, message).await,
        }
    }

    /// Run the handler, turning errors, panics and timeouts into a failure
    /// message.
    async fn invoke(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: JobContext,
    ) -> std::result::Result<Payload, String> {
        let run = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
        let outcome = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(
                        Error::Timeout(format!("handler timed out after {:?}", limit)).to_string(),
                    );
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    async fn complete(&self, mut job: Job, output: Payload) {
        let now = Utc::now();
        if let Err(e) = job.complete(now) {
            error!(error = %e, "Invalid completion");
            return;
        }

        if let Err(e) = self
            .persist("record attempt", || {
                self.store.update_attempts(job.id, job.attempts)
            })
            .await
        {
            error!(error = %e, "Failed to record attempt");
        }
        if let Err(e) = self
            .persist("mark job completed", || self.store.mark_completed(job.id, now))
            .await
        {
            error!(error = %e, "Failed to mark job completed; job left running");
            return;
        }
        self.write_result(JobResult::success(job.id, output, now)).await;
        info!(attempts = job.attempts, "Job completed");
    }

    async fn retry_or_fail(&self, mut job: Job, message: String) {
        let now = Utc::now();
        let disposition = match job.record_failure(message.as_str(), now) {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(error = %e, "Invalid failure transition");
                return;
            }
        };

        // The counter must be durable before the job can run again.
        if let Err(e) = self
            .persist("record attempt", || {
                self.store.update_attempts(job.id, job.attempts)
            })
            .await
        {
            error!(error = %e, "Failed to record attempt; job left running");
            return;
        }

        match disposition {
            FailureDisposition::Retry => {
                if let Err(e) = self
                    .persist("return job to pending", || {
                        self.store
                            .update_status(job.id, JobStatus::Pending, Some(&message))
                    })
                    .await
                {
                    error!(error = %e, "Failed to return job to pending; job left running");
                    return;
                }
                warn!(
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %message,
                    "Job failed, retrying"
                );
                self.queue.requeue(job);
            }
            FailureDisposition::Failed => {
                if let Err(e) = self
                    .persist("mark job failed", || {
                        self.store.mark_failed(job.id, &message, now)
                    })
                    .await
                {
                    error!(error = %e, "Failed to mark job failed; job left running");
                    return;
                }
                self.write_result(JobResult::failure(job.id, message.as_str(), now))
                    .await;
                warn!(attempts = job.attempts, error = %message, "Job failed permanently");
            }
        }
    }

    /// Terminal failure that a retry cannot fix. Does not consume an attempt.
    async fn fail_without_attempt(&self, mut job: Job, message: String) {
        let now = Utc::now();
        if let Err(e) = job.fail_permanently(message.as_str(), now) {
            error!(error = %e, "Invalid failure transition");
            return;
        }
        if let Err(e) = self
            .persist("mark job failed", || {
                self.store.mark_failed(job.id, &message, now)
            })
            .await
        {
            error!(error = %e, "Failed to mark job failed; job left running");
            return;
        }
        self.write_result(JobResult::failure(job.id, message, now))
            .await;
    }

    /// Run a store write, trying again after `error_backoff` on failure. A
    /// job that no longer exists is not retried.
    async fn persist<T, F, Fut>(&self, action: &str, write: F) -> DbResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(e) if attempt < STORE_WRITE_ATTEMPTS && !matches!(e, DbError::NotFound(_)) => {
                    warn!(error = %e, attempt, "Failed to {}, trying again", action);
                    sleep(self.error_backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn write_result(&self, result: JobResult) {
        if let Err(e) = self.results.create(&result).await {
            error!(error = %e, "Failed to store job result");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
