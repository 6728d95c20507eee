//! Backup Agent — reference binary.
//!
//! Runs the control-channel client with a minimal behavior that accepts
//! every stage and reports success. Useful for exercising an orchestrator
//! without a real data-owning service behind the agent.

use anyhow::Result;
use async_trait::async_trait;
use backup_agent::behavior::{ActionContext, AgentBehavior, RegistrationInfo, StageReporter};
use backup_agent::client::AgentClient;
use backup_agent::config::Config;
use backup_protocol::SoftwareVersion;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Orchestrator base URL (overrides config)
    #[arg(short, long)]
    orchestrator_url: Option<String>,

    /// Agent id (overrides config)
    #[arg(short, long)]
    agent_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

/// Accepts every stage; the real work lives in services that embed the
/// library with their own behavior.
struct BasicBehavior {
    agent_id: String,
    scope: String,
}

#[async_trait]
impl AgentBehavior for BasicBehavior {
    fn registration(&self) -> RegistrationInfo {
        RegistrationInfo {
            agent_id: self.agent_id.clone(),
            scope: self.scope.clone(),
            software_version: SoftwareVersion {
                product_name: "backup-agent".to_string(),
                product_number: env!("CARGO_PKG_NAME").to_string(),
                revision: env!("CARGO_PKG_VERSION").to_string(),
                production_date: String::new(),
                description: "reference agent".to_string(),
            },
        }
    }

    async fn prepare_backup(&self, ctx: &ActionContext) -> Result<String> {
        tracing::info!(backup = %ctx.backup_name, "Preparing backup");
        Ok(format!("prepared backup {}", ctx.backup_name))
    }

    async fn execute_backup(&self, ctx: &ActionContext) -> Result<String> {
        tracing::info!(backup = %ctx.backup_name, "Executing backup");
        Ok(format!("backed up {}", ctx.backup_name))
    }

    async fn post_backup(&self, ctx: &ActionContext, reporter: &StageReporter) -> Result<()> {
        tracing::info!(backup = %ctx.backup_name, "Backup post-actions");
        reporter.stage_complete(true, "post-backup complete");
        Ok(())
    }

    async fn prepare_restore(&self, ctx: &ActionContext) -> Result<String> {
        tracing::info!(backup = %ctx.backup_name, "Preparing restore");
        Ok(format!("prepared restore of {}", ctx.backup_name))
    }

    async fn execute_restore(&self, ctx: &ActionContext) -> Result<String> {
        tracing::info!(
            backup = %ctx.backup_name,
            fragments = ctx.fragments.len(),
            "Executing restore"
        );
        Ok(format!("restored {}", ctx.backup_name))
    }

    async fn post_restore(&self, ctx: &ActionContext, reporter: &StageReporter) -> Result<()> {
        tracing::info!(backup = %ctx.backup_name, "Restore post-actions");
        reporter.stage_complete(true, "post-restore complete");
        Ok(())
    }

    async fn on_cancel(&self, ctx: &ActionContext) -> Result<()> {
        tracing::info!(backup = %ctx.backup_name, "Action cancelled");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(path) = args.config {
        Config::from_file(&path)?
    } else {
        Config::default()
    };
    if let Some(url) = args.orchestrator_url {
        config.agent.orchestrator_url = url;
    }
    if let Some(id) = args.agent_id {
        config.agent.id = id;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .init();

    tracing::info!(
        "Starting backup-agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.id
    );

    let behavior = Arc::new(BasicBehavior {
        agent_id: config.agent.id.clone(),
        scope: config.agent.scope.clone(),
    });

    let shutdown = CancellationToken::new();
    let client_shutdown = shutdown.clone();
    let agent_config = config.agent.clone();
    let client = tokio::spawn(async move {
        AgentClient::new(agent_config, behavior, client_shutdown).run().await;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received SIGINT, shutting down");
    shutdown.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(3), client).await;
    Ok(())
}
