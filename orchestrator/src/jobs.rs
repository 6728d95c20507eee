//! Concrete jobs, one per action kind, and the factory that builds them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use backup_protocol::OperationKind;
use tracing::{info, warn};

use crate::action::{ActionKind, CreateActionRequest, SharedAction};
use crate::backup::{self, Backup, BackupStatus};
use crate::error::OrchestratorError;
use crate::housekeeping;
use crate::job::{Job, JobContext, JobSettings};
use crate::manager::{BackupManager, ManagerRegistry};
use crate::mediator::{CmMediator, EventBroadcaster};
use crate::registry::AgentRegistry;
use crate::stage::{StageAggregator, StageRouter};

/// Transport seam for import/export byte movement; the orchestrator core
/// never touches backup payload bytes itself.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Push a backup to the external endpoint, returning a human-readable
    /// description of where it went.
    async fn export_backup(&self, manager_id: &str, backup: &Backup) -> anyhow::Result<String>;

    /// Pull a backup from the external endpoint.
    async fn import_backup(&self, manager_id: &str, backup_name: &str) -> anyhow::Result<()>;
}

/// Default transfer client for deployments without an external endpoint.
pub struct NoopTransferClient;

#[async_trait]
impl TransferClient for NoopTransferClient {
    async fn export_backup(&self, manager_id: &str, backup: &Backup) -> anyhow::Result<String> {
        info!(manager_id, backup = %backup.name, "Export requested with no transfer endpoint configured");
        Ok(format!("export of {} acknowledged (no endpoint)", backup.name))
    }

    async fn import_backup(&self, manager_id: &str, backup_name: &str) -> anyhow::Result<()> {
        info!(manager_id, backup = backup_name, "Import requested with no transfer endpoint configured");
        Ok(())
    }
}

/// Shared dependencies handed to every job at construction time.
#[derive(Clone)]
pub struct JobDeps {
    pub pool: crate::db::DbPool,
    pub registry: Arc<AgentRegistry>,
    pub router: Arc<StageRouter>,
    pub locks: Arc<crate::backup::BackupLocks>,
    pub managers: Arc<ManagerRegistry>,
    pub mediator: Arc<dyn CmMediator>,
    pub events: EventBroadcaster,
    pub transfer: Arc<dyn TransferClient>,
    pub settings: JobSettings,
}

impl JobDeps {
    fn context(&self, manager: &BackupManager, action: SharedAction) -> JobContext {
        JobContext {
            pool: self.pool.clone(),
            action,
            manager: manager.clone(),
            locks: self.locks.clone(),
            mediator: self.mediator.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
        }
    }
}

pub struct JobFactory {
    deps: JobDeps,
}

impl JobFactory {
    pub fn new(deps: JobDeps) -> Self {
        Self { deps }
    }

    pub fn create_job(&self, manager: &BackupManager, action: SharedAction) -> Arc<dyn Job> {
        let kind = action.lock().unwrap().kind;
        let ctx = self.deps.context(manager, action);
        match kind {
            ActionKind::CreateBackup => Arc::new(CreateBackupJob::new(ctx, &self.deps)),
            ActionKind::Restore => Arc::new(RestoreJob::new(ctx, &self.deps)),
            ActionKind::DeleteBackup | ActionKind::HousekeepingDelete => {
                Arc::new(DeleteBackupJob::new(ctx))
            }
            ActionKind::Export => Arc::new(ExportJob::new(ctx, self.deps.transfer.clone())),
            ActionKind::Import => Arc::new(ImportJob::new(ctx, self.deps.transfer.clone())),
            ActionKind::Housekeeping => Arc::new(HousekeepingJob::new(ctx)),
        }
    }
}

// ── Staged jobs (multi-agent) ──

/// Common plumbing for the two jobs that fan out to agents.
struct StagedJobCore {
    registry: Arc<AgentRegistry>,
    router: Arc<StageRouter>,
    aggregator: OnceLock<Arc<StageAggregator>>,
}

impl StagedJobCore {
    fn new(deps: &JobDeps) -> Self {
        Self {
            registry: deps.registry.clone(),
            router: deps.router.clone(),
            aggregator: OnceLock::new(),
        }
    }

    fn start_stages(
        &self,
        ctx: &JobContext,
        kind: OperationKind,
    ) -> Result<Arc<StageAggregator>, OrchestratorError> {
        let agents = self.registry.agents_in_scope(&ctx.manager.id);
        if agents.is_empty() {
            return Err(OrchestratorError::NoAgentsAvailable(ctx.manager.id.clone()));
        }
        let aggregator = StageAggregator::new(
            ctx.action.clone(),
            ctx.pool.clone(),
            self.registry.clone(),
            kind,
            agents.clone(),
        );
        self.router.register(&agents, aggregator.clone());
        let _ = self.aggregator.set(aggregator.clone());
        aggregator.trigger_current();
        Ok(aggregator)
    }

    fn aggregator(&self) -> Option<&Arc<StageAggregator>> {
        self.aggregator.get()
    }

    fn finish(&self, action_id: &str) {
        self.router.unregister_action(action_id);
    }

    fn monitor(&self) {
        if let Some(agg) = self.aggregator() {
            if !agg.did_finish() {
                agg.force_advance();
            }
        }
    }
}

pub struct CreateBackupJob {
    ctx: JobContext,
    core: StagedJobCore,
}

impl CreateBackupJob {
    fn new(ctx: JobContext, deps: &JobDeps) -> Self {
        Self { ctx, core: StagedJobCore::new(deps) }
    }
}

#[async_trait]
impl Job for CreateBackupJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };

        let pool = self.ctx.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            if backup::find_by_name(&conn, &manager_id, &backup_name)?.is_some() {
                anyhow::bail!("Backup {backup_name} already exists");
            }
            backup::create(&conn, &manager_id, &backup_name, BackupStatus::Incomplete)?;
            Ok(())
        })
        .await??;

        self.core.start_stages(&self.ctx, OperationKind::Backup)?;
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.core.aggregator().map(|agg| agg.did_finish()).unwrap_or(false)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        let agg = self
            .core
            .aggregator()
            .ok_or_else(|| anyhow::anyhow!("Backup job completed without stages"))?;
        let (action_id, successful) = (agg.action_id().to_string(), agg.is_successful());
        self.core.finish(&action_id);

        let status = if successful { BackupStatus::Complete } else { BackupStatus::Corrupted };
        self.set_backup_status(status).await?;

        if !successful {
            anyhow::bail!(
                "Job {} failed at stage {}",
                action_id,
                agg.current_stage().as_str()
            );
        }
        Ok(())
    }

    async fn fail(&self) {
        if let Some(agg) = self.core.aggregator() {
            agg.fail();
            self.core.finish(&agg.action_id().to_string());
        }
        if let Err(e) = self.set_backup_status(BackupStatus::Corrupted).await {
            warn!("Failed to mark backup corrupted: {e:#}");
        }
    }

    fn monitor(&self) {
        let action_id = self.ctx.action.lock().unwrap().id.clone();
        info!(action_id = %action_id, "<CREATE_BACKUP> in progress");
        self.core.monitor();
    }

    /// Scheduled backups can chain an automatic export.
    fn follow_up_actions(&self) -> Vec<CreateActionRequest> {
        let a = self.ctx.action.lock().unwrap();
        let succeeded = a.result != crate::action::ResultType::Failure;
        if succeeded && a.scheduled && self.ctx.manager.scheduler.auto_export {
            vec![CreateActionRequest {
                kind: ActionKind::Export,
                backup_name: a.backup_name.clone(),
                scheduled: true,
            }]
        } else {
            Vec::new()
        }
    }
}

impl CreateBackupJob {
    async fn set_backup_status(&self, status: BackupStatus) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };
        let pool = self.ctx.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            backup::update_status(&conn, &manager_id, &backup_name, status)
        })
        .await?
    }
}

pub struct RestoreJob {
    ctx: JobContext,
    core: StagedJobCore,
}

impl RestoreJob {
    fn new(ctx: JobContext, deps: &JobDeps) -> Self {
        Self { ctx, core: StagedJobCore::new(deps) }
    }
}

#[async_trait]
impl Job for RestoreJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };

        let pool = self.ctx.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            let backup = backup::find_by_name(&conn, &manager_id, &backup_name)?
                .ok_or(OrchestratorError::BackupNotFound(backup_name.clone()))?;
            if backup.status != BackupStatus::Complete {
                anyhow::bail!("Backup {} is not restorable (status {:?})", backup_name, backup.status);
            }
            Ok(())
        })
        .await??;

        self.core.start_stages(&self.ctx, OperationKind::Restore)?;
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.core.aggregator().map(|agg| agg.did_finish()).unwrap_or(false)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        let agg = self
            .core
            .aggregator()
            .ok_or_else(|| anyhow::anyhow!("Restore job completed without stages"))?;
        let (action_id, successful) = (agg.action_id().to_string(), agg.is_successful());
        self.core.finish(&action_id);
        if !successful {
            anyhow::bail!(
                "Job {} failed at stage {}",
                action_id,
                agg.current_stage().as_str()
            );
        }
        Ok(())
    }

    async fn fail(&self) {
        if let Some(agg) = self.core.aggregator() {
            agg.fail();
            self.core.finish(&agg.action_id().to_string());
        }
    }

    fn monitor(&self) {
        let action_id = self.ctx.action.lock().unwrap().id.clone();
        info!(action_id = %action_id, "<RESTORE> in progress");
        self.core.monitor();
    }
}

// ── Agentless jobs ──

/// Serves DELETE_BACKUP and HOUSEKEEPING_DELETE_BACKUP; the envelope holds
/// the per-backup lock for both.
pub struct DeleteBackupJob {
    ctx: JobContext,
    done: AtomicBool,
}

impl DeleteBackupJob {
    fn new(ctx: JobContext) -> Self {
        Self { ctx, done: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Job for DeleteBackupJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };
        let pool = self.ctx.pool.clone();
        let deleted = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let conn = pool.get()?;
            backup::delete(&conn, &manager_id, &backup_name)
        })
        .await??;
        if !deleted {
            let name = self.ctx.action.lock().unwrap().backup_name.clone();
            return Err(OrchestratorError::BackupNotFound(name).into());
        }
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fail(&self) {}
}

pub struct ExportJob {
    ctx: JobContext,
    transfer: Arc<dyn TransferClient>,
    done: AtomicBool,
}

impl ExportJob {
    fn new(ctx: JobContext, transfer: Arc<dyn TransferClient>) -> Self {
        Self { ctx, transfer, done: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Job for ExportJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };
        let pool = self.ctx.pool.clone();
        let lookup_manager = manager_id.clone();
        let backup = tokio::task::spawn_blocking(move || -> anyhow::Result<Backup> {
            let conn = pool.get()?;
            let backup = backup::find_by_name(&conn, &lookup_manager, &backup_name)?
                .ok_or(OrchestratorError::BackupNotFound(backup_name.clone()))?;
            if backup.status != BackupStatus::Complete {
                anyhow::bail!("Backup {} is not exportable (status {:?})", backup_name, backup.status);
            }
            Ok(backup)
        })
        .await??;

        let detail = self.transfer.export_backup(&manager_id, &backup).await?;
        self.ctx.action.lock().unwrap().additional_info = detail;
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fail(&self) {}
}

pub struct ImportJob {
    ctx: JobContext,
    transfer: Arc<dyn TransferClient>,
    done: AtomicBool,
}

impl ImportJob {
    fn new(ctx: JobContext, transfer: Arc<dyn TransferClient>) -> Self {
        Self { ctx, transfer, done: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Job for ImportJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let (backup_name, manager_id) = {
            let a = self.ctx.action.lock().unwrap();
            (a.backup_name.clone(), a.backup_manager_id.clone())
        };
        self.transfer.import_backup(&manager_id, &backup_name).await?;

        let pool = self.ctx.pool.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            if backup::find_by_name(&conn, &manager_id, &backup_name)?.is_none() {
                backup::create(&conn, &manager_id, &backup_name, BackupStatus::Complete)?;
            } else {
                backup::update_status(&conn, &manager_id, &backup_name, BackupStatus::Complete)?;
            }
            Ok(())
        })
        .await??;

        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fail(&self) {}
}

/// Standalone housekeeping: selects the backups beyond the limit and chains
/// one HousekeepingDelete per candidate instead of deleting inline.
pub struct HousekeepingJob {
    ctx: JobContext,
    chained: Mutex<Vec<CreateActionRequest>>,
    done: AtomicBool,
}

impl HousekeepingJob {
    fn new(ctx: JobContext) -> Self {
        Self { ctx, chained: Mutex::new(Vec::new()), done: AtomicBool::new(false) }
    }
}

#[async_trait]
impl Job for HousekeepingJob {
    fn context(&self) -> &JobContext {
        &self.ctx
    }

    async fn trigger_job(&self) -> anyhow::Result<()> {
        let manager = self.ctx.manager.clone();
        let pool = self.ctx.pool.clone();
        let candidates = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            let conn = pool.get()?;
            housekeeping::auto_deletion_candidates(
                &conn,
                &manager.id,
                manager.housekeeping.max_stored_backups,
            )
        })
        .await??;

        info!(
            manager_id = %self.ctx.manager.id,
            count = candidates.len(),
            "Housekeeping selected backups for deletion"
        );
        *self.chained.lock().unwrap() = candidates
            .into_iter()
            .map(|name| CreateActionRequest {
                kind: ActionKind::HousekeepingDelete,
                backup_name: name,
                scheduled: false,
            })
            .collect();
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn did_finish(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn complete_job(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fail(&self) {}

    fn monitor(&self) {
        info!("<HOUSEKEEPING> waiting for backups to be deleted");
    }

    fn follow_up_actions(&self) -> Vec<CreateActionRequest> {
        self.chained.lock().unwrap().clone()
    }
}
