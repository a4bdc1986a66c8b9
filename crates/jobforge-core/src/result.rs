//! Outcome of a job's terminal execution attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Payload, ResourceId};

/// Written once per terminal execution: `result` on success, `error` on
/// permanent failure, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(job_id: ResourceId, result: Payload, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            job_id,
            result: Some(result),
            error: None,
            created_at: now,
        }
    }

    pub fn failure(job_id: ResourceId, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: ResourceId::new(),
            job_id,
            result: None,
            error: Some(error.into()),
            created_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
