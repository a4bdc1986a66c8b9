//! End-to-end engine behaviour against the in-memory stores.

use chrono::{Duration as ChronoDuration, Utc};
use jobforge_config::EngineConfig;
use jobforge_core::{Error, Job, JobOptions, JobStatus, Payload, Priority, ResourceId};
use jobforge_db::{JobStore, MemoryJobResultStore, MemoryJobStore};
use jobforge_scheduler::{Engine, JobContext};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> EngineConfig {
    EngineConfig {
        workers: 3,
        poll_interval: Duration::from_millis(50),
        dequeue_timeout: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn engine() -> (Engine, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(MemoryJobResultStore::new()),
        config(),
    )
    .unwrap();
    (engine, store)
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

/// Poll until the job reaches `status`, or give up after two seconds.
async fn wait_for_status(engine: &Engine, id: ResourceId, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let job = engine.get_job(id).await.unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_echo_job_completes_with_payload_as_result() {
    let (engine, _) = engine();
    engine.register_handler("echo", |ctx: JobContext| async move {
        Ok::<_, anyhow::Error>(ctx.payload)
    });
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let job = engine
        .create_job(
            "echo",
            payload(json!({"x": 1})),
            JobOptions::new().priority(Priority::High).max_attempts(3),
        )
        .await
        .unwrap();

    let done = wait_for_status(&engine, job.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 1);
    assert!(done.error.is_none());

    let result = engine.get_result(job.id).await.unwrap();
    assert_eq!(result.result, Some(payload(json!({"x": 1}))));
    assert!(result.error.is_none());

    engine.stop().await;
}

#[tokio::test]
async fn test_always_failing_job_stops_at_max_attempts() {
    let (engine, _) = engine();
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        engine.register_handler("always_fail", move |_ctx: JobContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Payload, _>(anyhow::anyhow!("nope"))
            }
        });
    }
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let job = engine
        .create_job(
            "always_fail",
            Payload::new(),
            JobOptions::new().max_attempts(2),
        )
        .await
        .unwrap();

    let failed = wait_for_status(&engine, job.id, JobStatus::Failed).await;
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.error.as_deref(), Some("nope"));

    let result = engine.get_result(job.id).await.unwrap();
    assert!(result.result.is_none());
    assert_eq!(result.error.as_deref(), Some("nope"));

    // No further executions once failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    engine.stop().await;
}

#[tokio::test]
async fn test_future_job_stays_scheduled() {
    let (engine, _) = engine();
    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = ran.clone();
        engine.register_handler("notify", move |_ctx: JobContext| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(Payload::new())
            }
        });
    }
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let at = Utc::now() + ChronoDuration::hours(1);
    let job = engine
        .schedule_job("notify", payload(json!({"to": "ops"})), at, JobOptions::new())
        .await
        .unwrap();

    let stored = engine.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Scheduled);
    assert_eq!(stored.scheduled_at, Some(at));
    assert_eq!(engine.queue_size(), 0);

    // Several scheduler ticks pass without the job running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        engine.get_job(job.id).await.unwrap().status,
        JobStatus::Scheduled
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    engine.stop().await;
}

#[tokio::test]
async fn test_scheduled_job_runs_once_due() {
    let (engine, _) = engine();
    engine.register_handler("echo", |ctx: JobContext| async move {
        Ok::<_, anyhow::Error>(ctx.payload)
    });
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let job = engine
        .create_job(
            "echo",
            Payload::new(),
            JobOptions::new().delay(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Scheduled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine.get_job(job.id).await.unwrap().status,
        JobStatus::Scheduled
    );

    let done = wait_for_status(&engine, job.id, JobStatus::Completed).await;
    let started = done.started_at.unwrap();
    assert!(started >= job.scheduled_at.unwrap());

    engine.stop().await;
}

#[tokio::test]
async fn test_unregistered_type_fails_without_retry() {
    let (engine, _) = engine();
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let job = engine
        .create_job("mystery", Payload::new(), JobOptions::new())
        .await
        .unwrap();

    let failed = wait_for_status(&engine, job.id, JobStatus::Failed).await;
    assert!(failed.error.as_deref().unwrap().contains("no handler"));

    let result = engine.get_result(job.id).await.unwrap();
    assert!(result.result.is_none());
    assert!(result.error.unwrap().contains("mystery"));

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_does_not_kill_the_pool() {
    let (engine, _) = engine();
    engine.register_handler("boom", |_ctx: JobContext| async move {
        if true {
            panic!("handler bug");
        }
        Ok::<_, anyhow::Error>(Payload::new())
    });
    engine.register_handler("echo", |ctx: JobContext| async move {
        Ok::<_, anyhow::Error>(ctx.payload)
    });
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let mut panicking = Vec::new();
    for _ in 0..5 {
        let job = engine
            .create_job("boom", Payload::new(), JobOptions::new().max_attempts(1))
            .await
            .unwrap();
        panicking.push(job.id);
    }
    let healthy = engine
        .create_job("echo", payload(json!({"ok": true})), JobOptions::new())
        .await
        .unwrap();

    for id in panicking {
        let failed = wait_for_status(&engine, id, JobStatus::Failed).await;
        assert!(failed.error.unwrap().contains("handler bug"));
    }
    wait_for_status(&engine, healthy.id, JobStatus::Completed).await;
    assert!(engine.is_running().await);

    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_runs_exactly_once() {
    let (engine, _) = engine();
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        engine.register_handler("count", move |ctx: JobContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(ctx.payload)
            }
        });
    }

    // Submitted before start, so the queue is preloaded.
    let mut ids = Vec::new();
    for i in 0..50 {
        let job = engine
            .create_job("count", payload(json!({"i": i})), JobOptions::new())
            .await
            .unwrap();
        ids.push(job.id);
    }

    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();
    for id in &ids {
        wait_for_status(&engine, *id, JobStatus::Completed).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 50);

    engine.stop().await;
}

#[tokio::test]
async fn test_cancel_rules() {
    let (engine, _) = engine();

    let pending = engine
        .create_job("echo", Payload::new(), JobOptions::new())
        .await
        .unwrap();
    let canceled = engine.cancel_job(pending.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert_eq!(
        engine.get_job(pending.id).await.unwrap().status,
        JobStatus::Canceled
    );

    // Terminal jobs cannot be canceled again.
    assert!(matches!(
        engine.cancel_job(pending.id).await,
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        engine.cancel_job(ResourceId::new()).await,
        Err(Error::NotFound(_))
    ));

    let scheduled = engine
        .schedule_job(
            "echo",
            Payload::new(),
            Utc::now() + ChronoDuration::hours(1),
            JobOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        engine.cancel_job(scheduled.id).await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn test_running_job_cannot_be_canceled_retried_or_deleted() {
    let (engine, store) = engine();
    let job = engine
        .create_job("echo", Payload::new(), JobOptions::new())
        .await
        .unwrap();
    store.mark_started(job.id, Utc::now()).await.unwrap();

    for err in [
        engine.cancel_job(job.id).await.map(|_| ()).unwrap_err(),
        engine.retry_job(job.id).await.map(|_| ()).unwrap_err(),
        engine.delete_job(job.id).await.unwrap_err(),
    ] {
        assert!(matches!(&err, Error::Conflict(msg) if msg.contains("already running")));
    }
}

#[tokio::test]
async fn test_canceled_job_never_runs_even_though_it_was_queued() {
    let (engine, _) = engine();
    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = ran.clone();
        engine.register_handler("echo", move |ctx: JobContext| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(ctx.payload)
            }
        });
    }

    let job = engine
        .create_job("echo", Payload::new(), JobOptions::new())
        .await
        .unwrap();
    engine.cancel_job(job.id).await.unwrap();
    assert_eq!(engine.queue_size(), 1);

    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.stop().await;

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(
        engine.get_job(job.id).await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn test_retry_after_terminal_failure() {
    let (engine, _) = engine();
    let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
    {
        let fail = fail.clone();
        engine.register_handler("flaky", move |ctx: JobContext| {
            let fail = fail.clone();
            async move {
                if fail.load(Ordering::SeqCst) {
                    anyhow::bail!("broken");
                }
                Ok::<_, anyhow::Error>(ctx.payload)
            }
        });
    }
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let job = engine
        .create_job("flaky", Payload::new(), JobOptions::new().max_attempts(1))
        .await
        .unwrap();
    wait_for_status(&engine, job.id, JobStatus::Failed).await;
    assert!(engine.get_result(job.id).await.unwrap().error.is_some());

    fail.store(false, Ordering::SeqCst);
    let retried = engine.retry_job(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.attempts, 0);

    let done = wait_for_status(&engine, job.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 1);
    assert!(engine.get_result(job.id).await.unwrap().is_success());

    engine.stop().await;
}

#[tokio::test]
async fn test_reschedule_parks_job_until_due() {
    let (engine, _) = engine();
    let job = engine
        .create_job("echo", Payload::new(), JobOptions::new())
        .await
        .unwrap();
    engine.cancel_job(job.id).await.unwrap();

    let at = Utc::now() + ChronoDuration::minutes(5);
    let rescheduled = engine.reschedule_job(job.id, at).await.unwrap();
    assert_eq!(rescheduled.status, JobStatus::Scheduled);

    let stored = engine.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Scheduled);
    assert_eq!(stored.scheduled_at, Some(at));
    assert_eq!(stored.attempts, 0);
    assert!(stored.completed_at.is_none());
}

#[tokio::test]
async fn test_listing_delete_and_cleanup() {
    let (engine, _) = engine();
    engine.register_handler("echo", |ctx: JobContext| async move {
        Ok::<_, anyhow::Error>(ctx.payload)
    });
    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await.unwrap();

    let done = engine
        .create_job("echo", Payload::new(), JobOptions::new())
        .await
        .unwrap();
    wait_for_status(&engine, done.id, JobStatus::Completed).await;
    engine.stop().await;

    let waiting = engine
        .create_job("report", Payload::new(), JobOptions::new())
        .await
        .unwrap();

    let completed = engine.list_by_status(JobStatus::Completed, 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done.id);
    let reports = engine.list_by_type("report", 10).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].id, waiting.id);

    // Only terminal jobs are cleaned up.
    let removed = engine
        .cleanup_older_than(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(
        engine.get_job(done.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.get_result(done.id).await,
        Err(Error::NotFound(_))
    ));

    engine.delete_job(waiting.id).await.unwrap();
    assert!(matches!(
        engine.get_job(waiting.id).await,
        Err(Error::NotFound(_))
    ));
}
