//! The generic run/trigger/monitor/complete/fail envelope around every
//! action kind.
//!
//! `run` owns the whole lifecycle: housekeeping pre-check, the per-backup
//! action lock, the 1-second completion poll, central exception handling and
//! resource release. Concrete jobs only implement the four kind-specific
//! hooks; dependencies arrive through the constructor, never through
//! setters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::action::{self, ActionKind, CreateActionRequest, ResultType, SharedAction};
use crate::backup::BackupLocks;
use crate::db::DbPool;
use crate::housekeeping;
use crate::manager::BackupManager;
use crate::mediator::{notify_action_completed, CmMediator, EventBroadcaster};

/// Tunables the envelope needs; split from [`crate::config::AppConfig`] so
/// jobs can be built in tests without an environment.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub housekeeping_lock_timeout_secs: u64,
    pub job_monitor_period_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            housekeeping_lock_timeout_secs: 120,
            job_monitor_period_secs: 300,
        }
    }
}

/// Everything a job shares with the envelope.
#[derive(Clone)]
pub struct JobContext {
    pub pool: DbPool,
    pub action: SharedAction,
    pub manager: BackupManager,
    pub locks: Arc<BackupLocks>,
    pub mediator: Arc<dyn CmMediator>,
    pub events: EventBroadcaster,
    pub settings: JobSettings,
}

impl JobContext {
    fn snapshot(&self) -> (String, ActionKind, String, String) {
        let a = self.action.lock().unwrap();
        (a.id.clone(), a.kind, a.backup_name.clone(), a.backup_manager_id.clone())
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn context(&self) -> &JobContext;

    /// Kind-specific start: create records, dispatch stages, begin streams.
    async fn trigger_job(&self) -> anyhow::Result<()>;

    fn did_finish(&self) -> bool;

    /// Steps to successfully complete the job. An error here fails the
    /// action like any other job-level exception.
    async fn complete_job(&self) -> anyhow::Result<()>;

    /// Steps to handle job failure.
    async fn fail(&self);

    /// Periodic liveness hook; staged jobs use it to force advancement when
    /// every agent is idle.
    fn monitor(&self) {
        let (action_id, kind, ..) = self.context().snapshot();
        info!(action_id = %action_id, "<{}> in progress", kind.as_str());
    }

    /// Actions to enqueue immediately after this job finishes.
    fn follow_up_actions(&self) -> Vec<CreateActionRequest> {
        Vec::new()
    }
}

/// Runs one job to completion and returns its chained follow-up actions.
pub async fn run(job: Arc<dyn Job>) -> Vec<CreateActionRequest> {
    let ctx = job.context().clone();
    let (action_id, kind, backup_name, manager_id) = ctx.snapshot();
    info!(action_id = %action_id, "Job starting for {} action", kind.as_str());

    // Backup-count limit check first: a full store aborts the whole action
    // before any stage machinery is touched.
    if kind.needs_housekeeping_precheck() {
        if let Err(e) = housekeeping::run_precheck(&ctx).await {
            error!(action_id = %action_id, "Housekeeping pre-check failed: {e:#}");
            fail_action(&ctx, &format!("{} Housekeeping failure", kind.as_str()), &e.to_string());
            return Vec::new();
        }
    }

    let monitor = JobMonitor::start(job.clone(), ctx.settings.job_monitor_period_secs);

    // Only one action may mutate a backup at a time; the guard releases on
    // every exit path.
    let _lock_guard = if kind.needs_backup_lock() {
        match ctx.locks.acquire(&manager_id, &backup_name, &action_id, kind.as_str()) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(action_id = %action_id, "{e}");
                job.fail().await;
                fail_action(&ctx, &e.to_string(), &e.to_string());
                ctx.mediator.reset_cm(true);
                return Vec::new();
            }
        }
    } else {
        None
    };

    match run_to_completion(job.as_ref()).await {
        Ok(()) => {
            info!(action_id = %action_id, "Successfully completing {} action", kind.as_str());
            let mut a = ctx.action.lock().unwrap();
            if a.result == ResultType::NotAvailable {
                a.result = ResultType::Success;
            }
            a.progress_percentage = 1.0;
        }
        Err(e) => {
            let reason = derive_failure_reason(&e);
            error!(action_id = %action_id, "Job failed: {e:#}");
            job.fail().await;
            fail_action(&ctx, &reason, &reason);
        }
    }

    drop(monitor);
    action::persist_shared(&ctx.pool, &ctx.action);
    ctx.mediator.reset_cm(true);
    job.follow_up_actions()
}

async fn run_to_completion(job: &dyn Job) -> anyhow::Result<()> {
    job.trigger_job().await?;
    while !job.did_finish() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    job.complete_job().await
}

/// Mark the action finished and send the completion notification. The
/// executor calls this after chained actions have been handed over, so the
/// completion event is the last thing observers see.
pub fn complete_action(ctx: &JobContext) {
    let snapshot = {
        let mut a = ctx.action.lock().unwrap();
        a.finished = true;
        a.completion_time = Some(Utc::now().to_rfc3339());
        a.clone()
    };
    action::persist_shared(&ctx.pool, &ctx.action);
    if should_notify(&snapshot.kind, snapshot.result) {
        notify_action_completed(&ctx.events, &snapshot);
    }
}

fn should_notify(kind: &ActionKind, result: ResultType) -> bool {
    matches!(kind, ActionKind::CreateBackup | ActionKind::Restore)
        && result == ResultType::Success
}

fn fail_action(ctx: &JobContext, reason: &str, additional_info: &str) {
    {
        let mut a = ctx.action.lock().unwrap();
        a.fail(reason, additional_info);
    }
    action::persist_shared(&ctx.pool, &ctx.action);
}

/// A torn-down control stream surfaces as a closed-channel error somewhere
/// in the job; report it as the agent-level event it actually is.
fn derive_failure_reason(e: &anyhow::Error) -> String {
    let text = format!("{e:#}");
    if text.contains("channel closed") || text.contains("connection closed") {
        "Agent Disconnected".to_string()
    } else {
        text
    }
}

/// Fires `monitor()` on a dedicated timer while the job runs; stops when
/// dropped.
pub struct JobMonitor {
    handle: tokio::task::JoinHandle<()>,
}

impl JobMonitor {
    pub fn start(job: Arc<dyn Job>, period_secs: u64) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(period_secs.max(1)));
            interval.tick().await; // the first tick is immediate
            loop {
                interval.tick().await;
                job.monitor();
            }
        });
        Self { handle }
    }
}

impl Drop for JobMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
