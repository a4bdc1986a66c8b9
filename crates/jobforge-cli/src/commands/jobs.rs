//! Job submission and inspection commands.
//!
//! These talk to the store directly. A running engine only picks up work
//! through its scheduler loop, so submitted and retried jobs are handed over
//! as `scheduled` jobs that are due immediately.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use jobforge_core::{JobOptions, JobStatus, Payload, Priority, ResourceId};

use super::{Context, print_json};

pub struct Submit {
    pub job_type: String,
    pub payload: String,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
    pub delay_secs: Option<u64>,
    pub at: Option<DateTime<Utc>>,
}

pub async fn submit(ctx: &Context, submit: Submit) -> Result<()> {
    let payload = parse_payload(&submit.payload)?;
    let at = run_at(Utc::now(), submit.delay_secs, submit.at)?;

    let mut options = JobOptions::new().priority(submit.priority);
    if let Some(max_attempts) = submit.max_attempts {
        options = options.max_attempts(max_attempts);
    }

    let engine = ctx.engine().await?;
    let job = engine
        .schedule_job(submit.job_type, payload, at, options)
        .await?;
    print_json(&job)
}

pub async fn get(ctx: &Context, id: ResourceId) -> Result<()> {
    let job = ctx.engine().await?.get_job(id).await?;
    print_json(&job)
}

pub async fn result(ctx: &Context, id: ResourceId) -> Result<()> {
    let result = ctx.engine().await?.get_result(id).await?;
    print_json(&result)
}

pub async fn list(
    ctx: &Context,
    status: Option<JobStatus>,
    job_type: Option<String>,
    limit: usize,
) -> Result<()> {
    let engine = ctx.engine().await?;
    let jobs = match job_type {
        Some(job_type) => engine.list_by_type(&job_type, limit).await?,
        None => {
            engine
                .list_by_status(status.unwrap_or(JobStatus::Pending), limit)
                .await?
        }
    };
    print_json(&jobs)
}

pub async fn cancel(ctx: &Context, id: ResourceId) -> Result<()> {
    let job = ctx.engine().await?.cancel_job(id).await?;
    print_json(&job)
}

pub async fn retry(ctx: &Context, id: ResourceId) -> Result<()> {
    let job = ctx
        .engine()
        .await?
        .reschedule_job(id, Utc::now())
        .await?;
    print_json(&job)
}

pub async fn delete(ctx: &Context, id: ResourceId) -> Result<()> {
    ctx.engine().await?.delete_job(id).await?;
    println!("Deleted job {}", id);
    Ok(())
}

pub async fn cleanup(ctx: &Context, older_than_days: u32) -> Result<()> {
    let before = Utc::now() - Duration::days(i64::from(older_than_days));
    let removed = ctx.engine().await?.cleanup_older_than(before).await?;
    println!("Removed {} jobs finished before {}", removed, before);
    Ok(())
}

fn parse_payload(raw: &str) -> Result<Payload> {
    serde_json::from_str(raw).context("Payload must be a JSON object")
}

/// When a submitted job should run.
fn run_at(
    now: DateTime<Utc>,
    delay_secs: Option<u64>,
    at: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    match (delay_secs, at) {
        (Some(_), Some(_)) => anyhow::bail!("--delay-secs and --at are mutually exclusive"),
        (Some(secs), None) => {
            let secs = i64::try_from(secs).context("Delay is too large")?;
            now.checked_add_signed(Duration::seconds(secs))
                .context("Delay is too large")
        }
        (None, Some(at)) => Ok(at),
        (None, None) => Ok(now),
    }
}
