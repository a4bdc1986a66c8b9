//! The engine: owns the queue, the handler registry, the worker pool and the
//! scheduler loop, and exposes the job submission and inspection operations.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use jobforge_config::EngineConfig;
use jobforge_core::{Error, Job, JobOptions, JobResult, JobStatus, Payload, ResourceId, Result};
use jobforge_db::{JobResultStore, JobStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::queue::PriorityQueue;
use crate::registry::{HandlerRegistry, JobHandler};
use crate::scheduler::Scheduler;
use crate::worker::Worker;

/// Tasks of a started engine.
struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Background job engine: worker pool, scheduler loop and the job operations.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    results: Arc<dyn JobResultStore>,
    queue: Arc<PriorityQueue>,
    registry: Arc<HandlerRegistry>,
    state: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        results: Arc<dyn JobResultStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        Ok(Self {
            queue: Arc::new(PriorityQueue::with_wait_timeout(config.dequeue_timeout)),
            registry: Arc::new(HandlerRegistry::new()),
            state: Mutex::new(None),
            config,
            store,
            results,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register the handler for `job_type`, replacing any previous one.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "Registering handler");
        self.registry.register(job_type, handler);
    }

    /// Start the worker pool and the scheduler loop. Returns once the tasks are
    /// spawned. A no-op while already running.
    ///
    /// The engine stops when `shutdown` fires or when [`Engine::stop`] is
    /// called. The queue is rebuilt from the store's pending jobs first.
    pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
        {
            debug!("Engine already running");
            return Ok(());
        }
        // Stopped from outside; reap the old tasks before starting again.
        if let Some(stale) = state.take() {
            join_tasks(stale.handles).await;
        }

        let recovered = self.recover().await?;
        let cancel = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.config.workers + 1);

        for i in 1..=self.config.workers {
            let name = format!("worker-{i}");
            let worker = Worker::new(
                name.as_str(),
                self.queue.clone(),
                self.store.clone(),
                self.results.clone(),
                self.registry.clone(),
            )
            .with_error_backoff(self.config.error_backoff)
            .with_handler_timeout(self.config.handler_timeout);

            let span = info_span!("worker", worker.name = %name);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(
                async move { worker.run(cancel).await }.instrument(span),
            ));
        }

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.queue.clone(),
            self.config.poll_interval,
            self.config.batch_size,
        );
        let scheduler_cancel = cancel.clone();
        handles.push(tokio::spawn(
            async move { scheduler.run(scheduler_cancel).await }.instrument(info_span!("scheduler")),
        ));

        info!(
            workers = self.config.workers,
            recovered,
            handlers = ?self.registry.job_types(),
            "Engine started"
        );
        *state = Some(Running { cancel, handles });
        Ok(())
    }

    /// Signal all loops to exit and wait until they have. In-flight handlers
    /// finish first. A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().await.take() else {
            return;
        };

        info!("Stopping engine");
        running.cancel.cancel();
        join_tasks(running.handles).await;
        info!("Engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
    }

    /// Replace the queue contents with the store's pending jobs.
    async fn recover(&self) -> Result<usize> {
        self.queue.clear();
        let now = Utc::now();
        let pending = self.store.get_pending(self.config.recovery_limit).await?;
        let mut recovered = 0;
        for job in pending.into_iter().filter(|job| job.is_ready(now)) {
            self.queue.enqueue(job);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Persist a new job and, when it is due now, enqueue it. A `delay` or
    /// `scheduled_at` option creates a `scheduled` job instead.
    pub async fn create_job(
        &self,
        job_type: impl Into<String>,
        payload: Payload,
        options: JobOptions,
    ) -> Result<Job> {
        let options = options.or_max_attempts(self.config.default_max_attempts);
        let job = Job::new(job_type, payload, &options, Utc::now())?;
        self.store.create(&job).await?;

        if job.status == JobStatus::Pending {
            self.queue.enqueue(job.clone());
        }
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            status = %job.status,
            "Job created"
        );
        Ok(job)
    }

    /// Persist a job to run at `at`. The scheduler loop enqueues it once due.
    pub async fn schedule_job(
        &self,
        job_type: impl Into<String>,
        payload: Payload,
        at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<Job> {
        self.create_job(job_type, payload, options.scheduled_at(at))
            .await
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel_job(&self, id: ResourceId) -> Result<Job> {
        let mut job = self.store.get_by_id(id).await?;
        let now = Utc::now();
        job.cancel(now)?;
        if !self.store.mark_canceled(id, now).await? {
            return Err(self.lost_race(id).await);
        }
        info!(job_id = %id, "Job canceled");
        Ok(job)
    }

    /// Put a job back to `pending` with a fresh attempt budget and enqueue it.
    pub async fn retry_job(&self, id: ResourceId) -> Result<Job> {
        let mut job = self.store.get_by_id(id).await?;
        job.reset_for_retry(Utc::now())?;
        if !self.store.reset(id, None).await? {
            return Err(self.lost_race(id).await);
        }
        self.results.delete_by_job_id(id).await?;

        self.queue.enqueue(job.clone());
        info!(job_id = %id, "Job queued for retry");
        Ok(job)
    }

    /// Like [`Engine::retry_job`], but park the job as `scheduled` at `at`.
    pub async fn reschedule_job(&self, id: ResourceId, at: DateTime<Utc>) -> Result<Job> {
        let mut job = self.store.get_by_id(id).await?;
        job.reschedule(at, Utc::now())?;
        if !self.store.reset(id, Some(at)).await? {
            return Err(self.lost_race(id).await);
        }
        self.results.delete_by_job_id(id).await?;

        info!(job_id = %id, scheduled_at = %at, "Job rescheduled");
        Ok(job)
    }

    pub async fn get_job(&self, id: ResourceId) -> Result<Job> {
        Ok(self.store.get_by_id(id).await?)
    }

    pub async fn get_result(&self, job_id: ResourceId) -> Result<JobResult> {
        Ok(self.results.get_by_job_id(job_id).await?)
    }

    pub async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.get_by_status(status, limit).await?)
    }

    pub async fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.get_by_type(job_type, limit).await?)
    }

    /// Delete a job and its result. Running jobs cannot be deleted.
    pub async fn delete_job(&self, id: ResourceId) -> Result<()> {
        let job = self.store.get_by_id(id).await?;
        if job.status == JobStatus::Running {
            return Err(Error::Conflict(format!("job {} is already running", id)));
        }
        self.results.delete_by_job_id(id).await?;
        self.store.delete(id).await?;
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Remove terminal jobs and results older than `before`. Returns the number
    /// of jobs removed.
    pub async fn cleanup_older_than(&self, before: DateTime<Utc>) -> Result<u64> {
        let results = self.results.cleanup_older_than(before).await?;
        let jobs = self.store.cleanup_older_than(before).await?;
        info!(jobs, results, before = %before, "Cleaned up old jobs");
        Ok(jobs)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// The error for a conditional write that matched no row: the job was
    /// claimed by a worker, or deleted, after it was read.
    async fn lost_race(&self, id: ResourceId) -> Error {
        match self.store.get_by_id(id).await {
            Ok(job) if job.status != JobStatus::Running => {
                Error::Conflict(format!("job {} is already {}", id, job.status))
            }
            Ok(_) => Error::Conflict(format!("job {} is already running", id)),
            Err(e) => e.into(),
        }
    }
}

async fn join_tasks(handles: Vec<JoinHandle<()>>) {
    join_all(handles).await.into_iter().for_each(|result| {
        if let Err(error) = result {
            warn!(%error, "Engine task panicked");
        }
    });
}
