//! Run an engine in the foreground.

use anyhow::{Context as _, Result};
use jobforge_core::Payload;
use jobforge_db::run_migrations;
use jobforge_db::{PgJobResultStore, PgJobStore};
use jobforge_scheduler::{Engine, HandlerResult, JobContext};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Context;

/// Longest pause the built-in `sleep` handler accepts.
const MAX_SLEEP_MS: u64 = 10 * 60 * 1000;

pub async fn run(ctx: &Context, workers: Option<usize>) -> Result<()> {
    let mut config = ctx.engine_config()?;
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let pool = ctx.connect(&config).await?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let engine = Engine::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgJobResultStore::new(pool)),
        config,
    )?;
    register_builtin_handlers(&engine);

    let shutdown = CancellationToken::new();
    engine.start(&shutdown).await?;
    info!("Engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    shutdown.cancel();
    engine.stop().await;
    Ok(())
}

fn register_builtin_handlers(engine: &Engine) {
    engine.register_handler("echo", echo);
    engine.register_handler("sleep", sleep);
}

/// Returns the payload unchanged.
async fn echo(ctx: JobContext) -> HandlerResult {
    Ok(ctx.payload)
}

/// Waits `ms` milliseconds from the payload, or until the engine shuts down.
async fn sleep(ctx: JobContext) -> HandlerResult {
    let ms = ctx
        .payload
        .get("ms")
        .and_then(|v| v.as_u64())
        .context("payload needs a non-negative integer `ms`")?;
    if ms > MAX_SLEEP_MS {
        anyhow::bail!("ms must be at most {}", MAX_SLEEP_MS);
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        _ = ctx.cancel.cancelled() => anyhow::bail!("interrupted by shutdown"),
    }

    let mut out = Payload::new();
    out.insert("slept_ms".to_string(), json!(ms));
    Ok(out)
}
