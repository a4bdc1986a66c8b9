//! CLI command implementations.

pub mod jobs;
pub mod run;

use anyhow::{Context as _, Result};
use jobforge_config::{EngineConfig, load_engine_config};
use jobforge_db::{PgJobResultStore, PgJobStore, PgPool, create_pool, run_migrations};
use jobforge_scheduler::Engine;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Settings shared by every command.
pub struct Context {
    pub config_path: PathBuf,
    database_url: Option<String>,
}

impl Context {
    pub fn new(config_path: PathBuf, database_url: Option<String>) -> Self {
        Self {
            config_path,
            database_url,
        }
    }

    /// Load the engine configuration. A missing file means defaults.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = if self.config_path.exists() {
            load_engine_config(&self.config_path).with_context(|| {
                format!("Failed to load config file: {}", self.config_path.display())
            })?
        } else {
            debug!(path = %self.config_path.display(), "No config file, using defaults");
            EngineConfig::default()
        };

        if let Some(url) = &self.database_url {
            config.database_url = Some(url.clone());
        }
        Ok(config)
    }

    pub async fn connect(&self, config: &EngineConfig) -> Result<PgPool> {
        let url = config.database_url.as_deref().context(
            "No database URL; pass --database-url, set JOBFORGE_DATABASE_URL or add `database` to the config",
        )?;
        create_pool(url)
            .await
            .context("Failed to connect to database")
    }

    /// An engine backed by PostgreSQL. Not started.
    pub async fn engine(&self) -> Result<Engine> {
        let config = self.engine_config()?;
        let pool = self.connect(&config).await?;
        let engine = Engine::new(
            Arc::new(PgJobStore::new(pool.clone())),
            Arc::new(PgJobResultStore::new(pool)),
            config,
        )?;
        Ok(engine)
    }
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    let config = ctx.engine_config()?;
    let pool = ctx.connect(&config).await?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Migrations applied");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    match load_engine_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            print_json(&config)
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
