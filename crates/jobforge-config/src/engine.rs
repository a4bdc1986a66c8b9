//! Engine configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Runtime configuration of a job engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// How often the scheduler promotes due jobs.
    pub poll_interval: Duration,
    /// Maximum number of due jobs promoted per scheduler tick.
    pub batch_size: usize,
    /// Bounded wait of a dequeue on an empty queue.
    pub dequeue_timeout: Duration,
    /// Pause after a store error in a worker.
    pub error_backoff: Duration,
    /// Per-execution handler timeout. `None` lets handlers run unbounded.
    pub handler_timeout: Option<Duration>,
    /// Retry ceiling for jobs created without one.
    pub default_max_attempts: u32,
    /// Maximum pending jobs reloaded into the queue on start.
    pub recovery_limit: usize,
    /// Store connection string, used by the binary.
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            dequeue_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            handler_timeout: None,
            default_max_attempts: 3,
            recovery_limit: 1000,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch-size", "must be at least 1"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("default-max-attempts", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll-interval-ms", "must be greater than 0"));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(invalid("dequeue-timeout-ms", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Parse an engine configuration from KDL text.
///
/// Settings not present in the document keep their defaults.
pub fn parse_engine_config(kdl: &str) -> ConfigResult<EngineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = EngineConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "engine" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        apply_engine_setting(&mut config, child)?;
                    }
                }
            }
            "database" => {
                config.database_url = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?,
                );
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}

/// Read and parse an engine configuration file.
pub fn load_engine_config(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_engine_config(&content)
}

fn apply_engine_setting(config: &mut EngineConfig, node: &KdlNode) -> ConfigResult<()> {
    let key = node.name().value();
    match key {
        "workers" => config.workers = get_usize_arg(node, key)?,
        "poll-interval-ms" => config.poll_interval = get_millis_arg(node, key)?,
        "batch-size" => config.batch_size = get_usize_arg(node, key)?,
        "dequeue-timeout-ms" => config.dequeue_timeout = get_millis_arg(node, key)?,
        "error-backoff-ms" => config.error_backoff = get_millis_arg(node, key)?,
        "handler-timeout-ms" => {
            let timeout = get_millis_arg(node, key)?;
            config.handler_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        "default-max-attempts" => {
            config.default_max_attempts = u32::try_from(get_integer_arg(node, key)?)
                .map_err(|_| invalid(key, "out of range"))?;
        }
        "recovery-limit" => config.recovery_limit = get_usize_arg(node, key)?,
        _ => {}
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_integer_arg(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    let entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    entry
        .value()
        .as_integer()
        .ok_or_else(|| invalid(field, "expected an integer"))
}

fn get_usize_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    usize::try_from(get_integer_arg(node, field)?).map_err(|_| invalid(field, "out of range"))
}

fn get_millis_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let millis =
        u64::try_from(get_integer_arg(node, field)?).map_err(|_| invalid(field, "out of range"))?;
    Ok(Duration::from_millis(millis))
}
