//! jobforge CLI tool.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jobforge_core::{JobStatus, Priority, ResourceId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Background job engine", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, default_value = "jobforge.kdl")]
    config: PathBuf,

    /// PostgreSQL connection string, overrides the configuration file
    #[arg(long, global = true, env = "JOBFORGE_DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an engine with the built-in handlers until Ctrl-C
    Run {
        /// Override the number of workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Apply database migrations
    Migrate,
    /// Submit a job
    Submit {
        /// Job type
        job_type: String,
        /// JSON object passed to the handler
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Run after this many seconds
        #[arg(long, conflicts_with = "at")]
        delay_secs: Option<u64>,
        /// Run at this RFC 3339 time
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Show a job
    Get {
        /// Job ID
        id: ResourceId,
    },
    /// Show the result of a job
    Result {
        /// Job ID
        id: ResourceId,
    },
    /// List jobs by status or type
    List {
        #[arg(long, conflicts_with = "job_type")]
        status: Option<JobStatus>,
        #[arg(long = "type")]
        job_type: Option<String>,
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a job that has not started
    Cancel {
        /// Job ID
        id: ResourceId,
    },
    /// Run a job again with a fresh attempt budget
    Retry {
        /// Job ID
        id: ResourceId,
    },
    /// Delete a job and its result
    Delete {
        /// Job ID
        id: ResourceId,
    },
    /// Delete finished jobs older than the given age
    Cleanup {
        #[arg(long, default_value = "7")]
        older_than_days: u32,
    },
    /// Validate an engine configuration file
    Validate {
        /// Path to the configuration file, defaults to --config
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let ctx = commands::Context::new(cli.config, cli.database_url);

    match cli.command {
        Commands::Run { workers } => commands::run::run(&ctx, workers).await?,
        Commands::Migrate => commands::migrate(&ctx).await?,
        Commands::Submit {
            job_type,
            payload,
            priority,
            max_attempts,
            delay_secs,
            at,
        } => {
            let submit = commands::jobs::Submit {
                job_type,
                payload,
                priority,
                max_attempts,
                delay_secs,
                at,
            };
            commands::jobs::submit(&ctx, submit).await?;
        }
        Commands::Get { id } => commands::jobs::get(&ctx, id).await?,
        Commands::Result { id } => commands::jobs::result(&ctx, id).await?,
        Commands::List {
            status,
            job_type,
            limit,
        } => commands::jobs::list(&ctx, status, job_type, limit).await?,
        Commands::Cancel { id } => commands::jobs::cancel(&ctx, id).await?,
        Commands::Retry { id } => commands::jobs::retry(&ctx, id).await?,
        Commands::Delete { id } => commands::jobs::delete(&ctx, id).await?,
        Commands::Cleanup { older_than_days } => {
            commands::jobs::cleanup(&ctx, older_than_days).await?
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(ctx.config_path.as_path()))?
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
