//! In-memory stores.
//!
//! Used by tests and by embedders that don't need durability. Semantics match
//! the PostgreSQL stores, including the conditional status transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobforge_core::{Job, JobResult, JobStatus, ResourceId};
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{DbError, DbResult, JobResultStore, JobStore};

/// Job store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<ResourceId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    async fn modify<F>(&self, id: ResourceId, f: F) -> DbResult<()>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        f(job);
        Ok(())
    }

    /// Apply `f` only when the job exists and `guard` holds. Returns whether
    /// the job changed.
    async fn modify_if<G, F>(&self, id: ResourceId, guard: G, f: F) -> bool
    where
        G: FnOnce(&Job) -> bool + Send,
        F: FnOnce(&mut Job) + Send,
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if guard(job) => {
                f(job);
                true
            }
            _ => false,
        }
    }

    async fn select<P>(&self, predicate: P) -> Vec<Job>
    where
        P: Fn(&Job) -> bool + Send,
    {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| predicate(job))
            .cloned()
            .collect()
    }
}

fn newest_first(mut jobs: Vec<Job>, limit: usize) -> Vec<Job> {
    jobs.sort_by_key(|job| Reverse((job.created_at, job.id)));
    jobs.truncate(limit);
    jobs
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> DbResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn get_pending(&self, limit: usize) -> DbResult<Vec<Job>> {
        let mut jobs = self.select(|job| job.status == JobStatus::Pending).await;
        jobs.sort_by_key(|job| (Reverse(job.priority), job.created_at, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn get_scheduled_ready(&self, now: DateTime<Utc>, limit: usize) -> DbResult<Vec<Job>> {
        let mut jobs = self
            .select(|job| {
                job.status == JobStatus::Scheduled && job.scheduled_at.is_some_and(|at| at <= now)
            })
            .await;
        jobs.sort_by_key(|job| (job.scheduled_at, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn get_by_status(&self, status: JobStatus, limit: usize) -> DbResult<Vec<Job>> {
        let jobs = self.select(|job| job.status == status).await;
        Ok(newest_first(jobs, limit))
    }

    async fn get_by_type(&self, job_type: &str, limit: usize) -> DbResult<Vec<Job>> {
        let jobs = self.select(|job| job.job_type == job_type).await;
        Ok(newest_first(jobs, limit))
    }

    async fn update_status(
        &self,
        id: ResourceId,
        status: JobStatus,
        error: Option<&str>,
    ) -> DbResult<()> {
        let error = error.map(str::to_string);
        self.modify(id, move |job| {
            job.status = status;
            job.error = error;
            if !status.is_terminal() {
                job.completed_at = None;
            }
            job.updated_at = Utc::now();
        })
        .await
    }

    async fn update_attempts(&self, id: ResourceId, attempts: u32) -> DbResult<()> {
        self.modify(id, move |job| {
            job.attempts = attempts;
            job.updated_at = Utc::now();
        })
        .await
    }

    async fn mark_started(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at.get_or_insert(at);
        job.updated_at = at;
        Ok(Some(job.clone()))
    }

    async fn promote(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Scheduled => {
                job.status = JobStatus::Pending;
                job.updated_at = at;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_completed(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        self.modify(id, move |job| {
            job.status = JobStatus::Completed;
            job.error = None;
            job.completed_at = Some(at);
            job.updated_at = at;
        })
        .await
    }

    async fn mark_failed(&self, id: ResourceId, error: &str, at: DateTime<Utc>) -> DbResult<()> {
        let error = error.to_string();
        self.modify(id, move |job| {
            job.status = JobStatus::Failed;
            job.error = Some(error);
            job.completed_at = Some(at);
            job.updated_at = at;
        })
        .await
    }

    async fn mark_canceled(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<bool> {
        let changed = self
            .modify_if(
                id,
                |job| matches!(job.status, JobStatus::Pending | JobStatus::Scheduled),
                move |job| {
                    job.status = JobStatus::Canceled;
                    job.completed_at = Some(at);
                    job.updated_at = at;
                },
            )
            .await;
        Ok(changed)
    }

    async fn reset(
        &self,
        id: ResourceId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DbResult<bool> {
        let guard = |job: &Job| job.status != JobStatus::Running;
        let changed = self
            .modify_if(id, guard, move |job| {
                job.status = if scheduled_at.is_some() {
                    JobStatus::Scheduled
                } else {
                    JobStatus::Pending
                };
                job.scheduled_at = scheduled_at;
                job.attempts = 0;
                job.error = None;
                job.completed_at = None;
                job.updated_at = Utc::now();
            })
            .await;
        Ok(changed)
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        self.jobs.write().await.remove(&id);
        Ok(())
    }

    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut jobs = self.jobs.write().await;
        let initial = jobs.len();
        jobs.retain(|_, job| {
            let finished = job.completed_at.unwrap_or(job.updated_at);
            !(job.status.is_terminal() && finished < before)
        });
        Ok((initial - jobs.len()) as u64)
    }
}

/// Job result store backed by a map keyed by job id.
#[derive(Debug, Default)]
pub struct MemoryJobResultStore {
    results: RwLock<HashMap<ResourceId, JobResult>>,
}

impl MemoryJobResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl JobResultStore for MemoryJobResultStore {
    async fn create(&self, result: &JobResult) -> DbResult<()> {
        self.results
            .write()
            .await
            .insert(result.job_id, result.clone());
        Ok(())
    }

    async fn get_by_job_id(&self, job_id: ResourceId) -> DbResult<JobResult> {
        self.results
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("result for job {}", job_id)))
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<JobResult> {
        self.results
            .read()
            .await
            .values()
            .find(|result| result.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("result {}", id)))
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        self.results.write().await.retain(|_, result| result.id != id);
        Ok(())
    }

    async fn delete_by_job_id(&self, job_id: ResourceId) -> DbResult<()> {
        self.results.write().await.remove(&job_id);
        Ok(())
    }

    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let mut results = self.results.write().await;
        let initial = results.len();
        results.retain(|_, result| result.created_at >= before);
        Ok((initial - results.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobforge_core::{JobOptions, Payload, Priority};

    fn job(job_type: &str, options: JobOptions, created_at: DateTime<Utc>) -> Job {
        Job::new(job_type, Payload::new(), &options, created_at).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryJobStore::new();
        let job = job("echo", JobOptions::new(), Utc::now());
        store.create(&job).await.unwrap();

        assert_eq!(store.get_by_id(job.id).await.unwrap(), job);
        assert!(matches!(
            store.create(&job).await,
            Err(DbError::Duplicate(_))
        ));
        assert!(matches!(
            store.get_by_id(ResourceId::new()).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_pending_orders_by_priority_then_age() {
        let store = MemoryJobStore::new();
        let base = Utc::now();
        let old_normal = job("a", JobOptions::new(), base);
        let new_normal = job("b", JobOptions::new(), base + Duration::seconds(1));
        let urgent = job(
            "c",
            JobOptions::new().priority(Priority::Urgent),
            base + Duration::seconds(2),
        );
        let low = job(
            "d",
            JobOptions::new().priority(Priority::Low),
            base - Duration::seconds(10),
        );
        for j in [&old_normal, &new_normal, &urgent, &low] {
            store.create(j).await.unwrap();
        }

        let pending = store.get_pending(10).await.unwrap();
        let order: Vec<_> = pending.iter().map(|j| j.job_type.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);

        assert_eq!(store.get_pending(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_scheduled_ready() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let due = job(
            "due",
            JobOptions::new().scheduled_at(now - Duration::seconds(1)),
            now,
        );
        let later = job(
            "later",
            JobOptions::new().scheduled_at(now + Duration::hours(1)),
            now,
        );
        let immediate = job("immediate", JobOptions::new(), now);
        for j in [&due, &later, &immediate] {
            store.create(j).await.unwrap();
        }

        let ready = store.get_scheduled_ready(now, 100).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due.id);
    }

    #[tokio::test]
    async fn test_mark_started_is_conditional() {
        let store = MemoryJobStore::new();
        let job = job("echo", JobOptions::new(), Utc::now());
        store.create(&job).await.unwrap();

        let claimed = store.mark_started(job.id, Utc::now()).await.unwrap();
        assert_eq!(claimed.unwrap().status, JobStatus::Running);
        assert!(store.mark_started(job.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_updates() {
        let store = MemoryJobStore::new();
        let job = job("echo", JobOptions::new(), Utc::now());
        store.create(&job).await.unwrap();

        store.mark_failed(job.id, "boom", Utc::now()).await.unwrap();
        let failed = store.get_by_id(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());

        store
            .update_status(job.id, JobStatus::Pending, None)
            .await
            .unwrap();
        let pending = store.get_by_id(job.id).await.unwrap();
        assert!(pending.completed_at.is_none());
        assert!(pending.error.is_none());

        assert!(matches!(
            store.update_attempts(ResourceId::new(), 1).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset() {
        let store = MemoryJobStore::new();
        let job = job("echo", JobOptions::new(), Utc::now());
        store.create(&job).await.unwrap();
        store.update_attempts(job.id, 3).await.unwrap();
        store.mark_failed(job.id, "boom", Utc::now()).await.unwrap();

        assert!(store.reset(job.id, None).await.unwrap());
        let reset = store.get_by_id(job.id).await.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.error.is_none());

        let at = Utc::now() + Duration::minutes(1);
        assert!(store.reset(job.id, Some(at)).await.unwrap());
        let rescheduled = store.get_by_id(job.id).await.unwrap();
        assert_eq!(rescheduled.status, JobStatus::Scheduled);
        assert_eq!(rescheduled.scheduled_at, Some(at));
    }

    #[tokio::test]
    async fn test_running_job_is_not_reset_or_canceled() {
        let store = MemoryJobStore::new();
        let job = job("echo", JobOptions::new(), Utc::now());
        store.create(&job).await.unwrap();
        store.mark_started(job.id, Utc::now()).await.unwrap();

        assert!(!store.reset(job.id, None).await.unwrap());
        assert!(!store.mark_canceled(job.id, Utc::now()).await.unwrap());
        let stored = store.get_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.completed_at.is_none());

        assert!(!store.reset(ResourceId::new(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_only_touches_waiting_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let pending = job("a", JobOptions::new(), now);
        let scheduled = job(
            "b",
            JobOptions::new().scheduled_at(now + Duration::hours(1)),
            now,
        );
        store.create(&pending).await.unwrap();
        store.create(&scheduled).await.unwrap();

        assert!(store.mark_canceled(pending.id, now).await.unwrap());
        assert!(store.mark_canceled(scheduled.id, now).await.unwrap());
        // Already canceled.
        assert!(!store.mark_canceled(pending.id, now).await.unwrap());
        assert_eq!(
            store.get_by_id(scheduled.id).await.unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_promote_is_conditional() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let due = job(
            "due",
            JobOptions::new().scheduled_at(now - Duration::seconds(1)),
            now,
        );
        let canceled = job(
            "canceled",
            JobOptions::new().scheduled_at(now - Duration::seconds(1)),
            now,
        );
        store.create(&due).await.unwrap();
        store.create(&canceled).await.unwrap();
        store.mark_canceled(canceled.id, now).await.unwrap();

        let promoted = store.promote(due.id, now).await.unwrap().unwrap();
        assert_eq!(promoted.status, JobStatus::Pending);
        assert!(store.promote(due.id, now).await.unwrap().is_none());

        assert!(store.promote(canceled.id, now).await.unwrap().is_none());
        assert_eq!(
            store.get_by_id(canceled.id).await.unwrap().status,
            JobStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let old_done = job("a", JobOptions::new(), now);
        let pending = job("b", JobOptions::new(), now - Duration::days(30));
        store.create(&old_done).await.unwrap();
        store.create(&pending).await.unwrap();
        store
            .mark_completed(old_done.id, now - Duration::days(10))
            .await
            .unwrap();

        let removed = store
            .cleanup_older_than(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_by_id(pending.id).await.is_ok());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_result_store_last_write_wins() {
        let store = MemoryJobResultStore::new();
        let job_id = ResourceId::new();

        let first = JobResult::failure(job_id, "boom", Utc::now());
        store.create(&first).await.unwrap();
        let second = JobResult::success(job_id, Payload::new(), Utc::now());
        store.create(&second).await.unwrap();

        let stored = store.get_by_job_id(job_id).await.unwrap();
        assert_eq!(stored, second);
        assert_eq!(store.get_by_id(second.id).await.unwrap(), second);
        assert!(store.get_by_id(first.id).await.is_err());
        assert_eq!(store.len().await, 1);

        store.delete(second.id).await.unwrap();
        assert!(store.is_empty().await);
    }
}
