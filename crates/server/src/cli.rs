//! CLI argument parsing and subcommand dispatch.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use visage_core::Config;
use visage_queue::WorkQueue;

use crate::startup;

#[derive(Parser, Debug)]
#[command(name = "visage-server", version, about = "Asynchronous face/age/gender detection service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the HTTP server and worker pool (default).
    Serve,
    /// Run one expiry sweep against the configured store and exit.
    Sweep {
        /// Override the configured maximum task age.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Print queue counts as JSON.
    QueueStats,
}

pub async fn dispatch(config: &Config, cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => startup::serve(config).await,
        Command::Sweep { max_age_hours } => {
            if config.storage.database_url.is_none() {
                warn!("no database configured; sweeping an empty in-memory store");
            }
            let max_age = max_age_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or_else(|| config.sweep.max_task_age());
            let app = startup::build_app(config).await?;
            let report = app
                .service
                .clean_old_tasks(max_age)
                .await
                .context("expiry sweep failed")?;
            info!(
                tasks = report.tasks_removed,
                artifacts = report.artifacts_deleted,
                failures = report.artifact_failures,
                "sweep finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::QueueStats => {
            let (_, queue) = startup::build_backends(config).await?;
            let counts = queue.counts().await.context("failed to read queue counts")?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
    }
}
