//! Handlers and the registry that maps job types to them.

use async_trait::async_trait;
use jobforge_core::{Payload, ResourceId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// What a handler returns: the success payload stored in the job result, or
/// an error that drives the retry policy.
pub type HandlerResult = anyhow::Result<Payload>;

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: ResourceId,
    pub job_type: String,
    pub payload: Payload,
    /// 1-based number of this execution attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fires when the engine shuts down. Handlers are never interrupted;
    /// long-running ones may watch this to finish early.
    pub cancel: CancellationToken,
}

/// Executable logic for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        (self)(ctx).await
    }
}

/// Job type → handler map. Registration is last-write-wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.register_arc(job_type, Arc::new(handler));
    }

    pub fn register_arc(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
