//! Job result repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobforge_core::{JobResult, ResourceId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// Durable storage for job results. One result per job; a later write for the
/// same job replaces the earlier one.
#[async_trait]
pub trait JobResultStore: Send + Sync {
    async fn create(&self, result: &JobResult) -> DbResult<()>;
    async fn get_by_job_id(&self, job_id: ResourceId) -> DbResult<JobResult>;
    async fn get_by_id(&self, id: ResourceId) -> DbResult<JobResult>;
    async fn delete(&self, id: ResourceId) -> DbResult<()>;
    async fn delete_by_job_id(&self, job_id: ResourceId) -> DbResult<()>;
    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64>;
}

/// A job result row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobResultRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobResultRow> for JobResult {
    type Error = DbError;

    fn try_from(row: JobResultRow) -> DbResult<Self> {
        let result = match row.result {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(DbError::Decode(format!(
                    "result {} is not an object: {}",
                    row.id, other
                )));
            }
        };

        Ok(JobResult {
            id: row.id.into(),
            job_id: row.job_id.into(),
            result,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of JobResultStore.
pub struct PgJobResultStore {
    pool: PgPool,
}

impl PgJobResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobResultStore for PgJobResultStore {
    async fn create(&self, result: &JobResult) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_results (id, job_id, result, error, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE
            SET id = EXCLUDED.id,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(result.id.as_uuid())
        .bind(result.job_id.as_uuid())
        .bind(result.result.clone().map(serde_json::Value::Object))
        .bind(result.error.as_deref())
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_job_id(&self, job_id: ResourceId) -> DbResult<JobResult> {
        let row =
            sqlx::query_as::<_, JobResultRow>("SELECT * FROM job_results WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("result for job {}", job_id)))?;
        row.try_into()
    }

    async fn get_by_id(&self, id: ResourceId) -> DbResult<JobResult> {
        let row = sqlx::query_as::<_, JobResultRow>("SELECT * FROM job_results WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("result {}", id)))?;
        row.try_into()
    }

    async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM job_results WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_by_job_id(&self, job_id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM job_results WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_older_than(&self, before: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM job_results WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
