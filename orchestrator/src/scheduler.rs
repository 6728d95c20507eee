//! Periodic scheduled backups.
//!
//! Each backup manager may carry a cron schedule; every firing creates a
//! scheduled CreateBackup action through the normal admission path. A
//! rejection (something else is running) is logged and the event is skipped
//! — the next firing tries again.

use chrono::Utc;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::action::{ActionKind, CreateActionRequest};
use crate::state::AppState;

pub struct BackupScheduler {
    scheduler: JobScheduler,
}

impl BackupScheduler {
    /// Registers one cron job per manager with a schedule; returns `None`
    /// when nothing is scheduled.
    pub async fn start(state: Arc<AppState>) -> anyhow::Result<Option<Self>> {
        let scheduled: Vec<_> = state
            .managers
            .all()
            .into_iter()
            .filter_map(|m| m.scheduler.cron_schedule.clone().map(|cron| (m.id, cron)))
            .collect();
        if scheduled.is_empty() {
            return Ok(None);
        }

        let scheduler = JobScheduler::new().await?;
        for (manager_id, cron) in scheduled {
            info!(manager_id = %manager_id, cron = %cron, "Scheduling periodic backups");
            let state = state.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let state = state.clone();
                let manager_id = manager_id.clone();
                Box::pin(async move {
                    run_scheduled_backup(state, &manager_id).await;
                })
            })?;
            scheduler.add(job).await?;
        }
        scheduler.start().await?;
        Ok(Some(Self { scheduler }))
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await?;
        Ok(())
    }
}

async fn run_scheduled_backup(state: Arc<AppState>, manager_id: &str) {
    let backup_name = format!("SCHEDULED-{}", Utc::now().format("%Y%m%dT%H%M%S"));
    let request = CreateActionRequest {
        kind: ActionKind::CreateBackup,
        backup_name: backup_name.clone(),
        scheduled: true,
    };
    match state.executor.execute(manager_id, request).await {
        Ok(action) => {
            info!(
                manager_id,
                backup = %backup_name,
                action_id = %action.id,
                "Scheduled backup admitted"
            );
        }
        Err(e) => {
            warn!(manager_id, "Scheduled backup skipped: {e}");
        }
    }
}
