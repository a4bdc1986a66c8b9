//! Job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobforge_core::{Job, JobStatus, Payload, Priority, ResourceId};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};

use crate::{DbError, DbResult};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Durable storage for jobs. The engine is the only writer.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> DbResult<()>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<Job>;

    /// Pending jobs, highest priority first, oldest first within a priority.
    async fn get_pending(&self, limit: usize) -> DbResult<Vec<Job>>;

    /// Scheduled jobs whose time has come, earliest first.
    async fn get_scheduled_ready(&self, now: DateTime<Utc>, limit: usize) -> DbResult<Vec<Job>>;

    /// Newest first.
    async fn get_by_status(&self, status: JobStatus, limit: usize) -> DbResult<Vec<Job>>;

    /// Newest first.
    async fn get_by_type(&self, job_type: &str, limit: usize) -> DbResult<Vec<Job>>;

    /// Set status and last error. Moving to a non-terminal status clears
    /// `completed_at`.
    async fn update_status(
        &self,
        id: ResourceId,
        status: JobStatus,
        error: Option<&str>,
    ) -> DbResult<()>;

    async fn update_attempts(&self, id: ResourceId, attempts: u32) -> DbResult<()>;

    /// Move a `pending` job to `running` and return the stored record.
    ///
    /// Returns `None` without writing anything when the job is not pending,
    /// so two dispatchers racing on the same job cannot both claim it.
    async fn mark_started(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>>;

    /// Move a `scheduled` job to `pending` and return the stored record.
    ///
    /// Returns `None` without writing anything when the job is no longer
    /// scheduled, e.g. because it was canceled after it was read.
    async fn promote(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>>;

    async fn mark_completed(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()>;
    async fn mark_failed(&self, id: ResourceId, error: &str, at: DateTime<Utc>) -> DbResult<()>;

    /// Cancel a job that is still `pending` or `scheduled`. Returns whether
    /// a row changed.
    async fn mark_canceled(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<bool>;

    /// Give a job that is not `running` a fresh attempt budget. It becomes
    /// `scheduled` at `scheduled_at` when given, `pending` otherwise.
    /// Returns whether a row changed.
    async fn reset(
        &self,
        id: ResourceId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DbResult<bool>;

    async fn delete(&self, id: ResourceId) -> DbResult<()>;

    /// Delete terminal jobs that finished before `before`. Returns the count.
    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64>;
}

/// A job row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    priority: i16,
    scheduled_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let payload = match row.payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Payload::new(),
            other => {
                return Err(DbError::Decode(format!(
                    "job {} payload is not an object: {}",
                    row.id, other
                )));
            }
        };
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| DbError::Decode(e.to_string()))?;
        let priority = Priority::from_rank(row.priority)
            .ok_or_else(|| DbError::Decode(format!("unknown priority rank {}", row.priority)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| DbError::Decode(format!("negative attempts on job {}", row.id)))?;
        let max_attempts = u32::try_from(row.max_attempts)
            .map_err(|_| DbError::Decode(format!("negative max_attempts on job {}", row.id)))?;

        Ok(Job {
            id: row.id.into(),
            job_type: row.job_type,
            payload,
            status,
            priority,
            scheduled_at: row.scheduled_at,
            attempts,
            max_attempts,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_jobs(rows: Vec<JobRow>) -> DbResult<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run an update that must touch exactly the row of `id`.
    async fn execute_one(&self, id: ResourceId, query: PgQuery<'_>) -> DbResult<()> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    /// Run a conditional update. Returns whether any row matched.
    async fn execute_if(&self, query: PgQuery<'_>) -> DbResult<bool> {
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority, scheduled_at, attempts,
                max_attempts, error, started_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(serde_json::Value::Object(job.payload.clone()))
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.scheduled_at)
        .bind(to_count(job.attempts))
        .bind(to_count(job.max_attempts))
        .bind(job.error.as_deref())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {}", job.id))
            }
            other => DbError::Database(other),
        })?;
        Ok(())
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn get_pending(&self, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'pending'
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        to_jobs(rows)
    }

    async fn get_scheduled_ready(&self, now: DateTime<Utc>, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'scheduled' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        to_jobs(rows)
    }

    async fn get_by_status(&self, status: JobStatus, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        to_jobs(rows)
    }

    async fn get_by_type(&self, job_type: &str, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE job_type = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(job_type)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        to_jobs(rows)
    }

    async fn update_status(
        &self,
        id: ResourceId,
        status: JobStatus,
        error: Option<&str>,
    ) -> DbResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                error = $3,
                completed_at = CASE WHEN $4 THEN completed_at ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .bind(status.is_terminal());
        self.execute_one(id, query).await
    }

    async fn update_attempts(&self, id: ResourceId, attempts: u32) -> DbResult<()> {
        let query = sqlx::query("UPDATE jobs SET attempts = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(to_count(attempts));
        self.execute_one(id, query).await
    }

    async fn mark_started(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, $2),
                updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn promote(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'pending', updated_at = $2
            WHERE id = $1 AND status = 'scheduled'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    async fn mark_completed(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', error = NULL, completed_at = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(at);
        self.execute_one(id, query).await
    }

    async fn mark_failed(&self, id: ResourceId, error: &str, at: DateTime<Utc>) -> DbResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = $2, completed_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(at);
        self.execute_one(id, query).await
    }

    async fn mark_canceled(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<bool> {
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            "#,
        )
        .bind(id.as_uuid())
        .bind(at);
        self.execute_if(query).await
    }

    async fn reset(
        &self,
        id: ResourceId,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> DbResult<bool> {
        let status = if scheduled_at.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };
        let query = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                scheduled_at = $3,
                attempts = 0,
                error = NULL,
                completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'running'
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(scheduled_at);
        self.execute_if(query).await
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'canceled')
              AND COALESCE(completed_at, updated_at) < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
