//! The job entity and its lifecycle state machine.
//!
//! ```text
//! scheduled ──promote──▶ pending ──start──▶ running ──complete──▶ completed
//!     │                   ▲   │                │
//!     │                   └───┼──── retry ─────┤
//!     │                       │                └──── fail ──────▶ failed
//!     └──────── cancel ───────┴──────────────────────────────────▶ canceled
//! ```
//!
//! Every mutation goes through a method on [`Job`] that checks the transition
//! first, so callers cannot put a job into a state the lifecycle forbids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, ResourceId, Result};

/// Default retry ceiling for jobs that don't set one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Opaque, string-keyed job input or output.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Dispatch priority. Ordered `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Numeric rank used by relational stores; higher runs first.
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::InvalidInput(format!("unknown priority: {}", other))),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the regular lifecycle permits moving from `self` to `next`.
    ///
    /// Operator overrides (forced retry, reschedule) are checked separately by
    /// [`Job::reset_for_retry`] and [`Job::reschedule`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Pending)
                | (Running, Failed)
                | (Scheduled, Pending)
                | (Pending, Canceled)
                | (Scheduled, Canceled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "scheduled" => Ok(JobStatus::Scheduled),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// Options accepted when a job is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub priority: Priority,
    /// Retry ceiling; falls back to [`DEFAULT_MAX_ATTEMPTS`].
    pub max_attempts: Option<u32>,
    /// Run after this delay. Mutually exclusive with `scheduled_at`.
    pub delay: Option<Duration>,
    /// Run at this time. Mutually exclusive with `delay`.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Fill in `max_attempts` when the caller left it unset.
    pub fn or_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts.get_or_insert(max_attempts);
        self
    }
}

/// What a failed execution attempt led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Attempts remain; the job is `pending` again.
    Retry,
    /// The retry ceiling was reached; the job is `failed`.
    Failed,
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Payload,
    pub status: JobStatus,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a new job. It starts `scheduled` when the options carry a delay
    /// or an absolute time, `pending` otherwise.
    pub fn new(
        job_type: impl Into<String>,
        payload: Payload,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(Error::InvalidInput("job type must not be empty".to_string()));
        }

        let max_attempts = options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let scheduled_at = match (options.delay, options.scheduled_at) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidInput(
                    "delay and scheduled_at are mutually exclusive".to_string(),
                ));
            }
            (Some(delay), None) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| Error::InvalidInput(format!("invalid delay: {}", e)))?;
                let at = now
                    .checked_add_signed(delay)
                    .ok_or_else(|| Error::InvalidInput("delay out of range".to_string()))?;
                Some(at)
            }
            (None, at) => at,
        };

        let status = if scheduled_at.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };

        Ok(Self {
            id: ResourceId::new(),
            job_type,
            payload,
            status,
            priority: options.priority,
            scheduled_at,
            attempts: 0,
            max_attempts,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// A job may sit in the ready queue only when it is pending and not
    /// parked in the future.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// `scheduled → pending`, performed by the scheduler loop.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Pending, now)
    }

    /// `pending → running`. `started_at` keeps the first start time.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Running, now)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// `running → completed`; counts the attempt and clears the last error.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Completed, now)?;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Record a handler error on a running job.
    ///
    /// The attempt counter is incremented and never passes `max_attempts`; the
    /// job fails exactly when the counter reaches the ceiling.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        if self.status != JobStatus::Running {
            return Err(Error::Conflict(format!(
                "job {} is {}, not running",
                self.id, self.status
            )));
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.error = Some(error.into());

        if self.attempts >= self.max_attempts {
            self.transition(JobStatus::Failed, now)?;
            self.completed_at = Some(now);
            Ok(FailureDisposition::Failed)
        } else {
            self.transition(JobStatus::Pending, now)?;
            Ok(FailureDisposition::Retry)
        }
    }

    /// `running → failed` without consuming an attempt, for failures that a
    /// retry cannot fix (no handler registered).
    pub fn fail_permanently(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Failed, now)?;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        Ok(())
    }

    /// `pending|scheduled → canceled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            JobStatus::Running => Err(Error::Conflict(format!(
                "job {} is already running",
                self.id
            ))),
            status if status.is_terminal() => Err(Error::Conflict(format!(
                "job {} is already {}",
                self.id, status
            ))),
            _ => {
                self.transition(JobStatus::Canceled, now)?;
                self.completed_at = Some(now);
                Ok(())
            }
        }
    }

    /// Force the job back to `pending` with a fresh attempt budget.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.reset(now)?;
        self.status = JobStatus::Pending;
        self.scheduled_at = None;
        Ok(())
    }

    /// Force the job back to `scheduled` at `at` with a fresh attempt budget.
    pub fn reschedule(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        self.reset(now)?;
        self.status = JobStatus::Scheduled;
        self.scheduled_at = Some(at);
        Ok(())
    }

    fn reset(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status == JobStatus::Running {
            return Err(Error::Conflict(format!(
                "job {} is already running",
                self.id
            )));
        }
        self.attempts = 0;
        self.error = None;
        self.completed_at = None;
        self.updated_at = now;
        Ok(())
    }
}
