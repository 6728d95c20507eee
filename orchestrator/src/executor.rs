//! Queueing job executor — admission, serialization and limited parallelism.
//!
//! Functions:
//! - rejects conflicting concurrent requests instead of queueing them
//! - guarantees at most one running action per lane, using queue membership
//!   as the running-state signal: the front item is peeked, never popped,
//!   until its job has fully finished
//! - supports "tail call" behaviour — jobs chaining other actions after they
//!   finish (auto-export, cascading housekeeping deletes), executed before
//!   any unrelated newly-admitted action
//! - in limited-parallel mode, runs a main lane (backup/restore/delete/
//!   housekeeping) next to an sftp lane (import/export) under an explicit
//!   conflict-predicate table

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::action::{self, Action, ActionKind, CreateActionRequest, SharedAction};
use crate::config::ExecutionMode;
use crate::error::OrchestratorError;
use crate::job;
use crate::jobs::{JobDeps, JobFactory};
use crate::manager::{BackupManager, ManagerRegistry};

/// Pairs an action with the backup-manager context needed to run it; lives
/// only inside the queue.
#[derive(Clone)]
pub struct JobQueueItem {
    pub manager: BackupManager,
    pub action: SharedAction,
}

impl JobQueueItem {
    fn action_id(&self) -> String {
        self.action.lock().unwrap().id.clone()
    }

    fn action_snapshot(&self) -> Action {
        self.action.lock().unwrap().clone()
    }
}

struct Lane {
    name: &'static str,
    queue: Mutex<VecDeque<JobQueueItem>>,
    notify: Notify,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Lane {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            worker: Mutex::new(None),
        })
    }

    fn front(&self) -> Option<JobQueueItem> {
        self.queue.lock().unwrap().front().cloned()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    fn push(&self, item: JobQueueItem) {
        self.queue.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    fn remove(&self, action_id: &str) {
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|item| item.action_id() != action_id);
        if queue.len() == before {
            // Failure here is *extremely* surprising, so log it as a warning.
            warn!(lane = self.name, action_id, "Expected to remove job from queue, but it wasn't there");
        }
    }
}

pub struct QueueingExecutor {
    mode: ExecutionMode,
    factory: Arc<JobFactory>,
    deps: JobDeps,
    managers: Arc<ManagerRegistry>,
    main: Arc<Lane>,
    sftp: Option<Arc<Lane>>,
    /// Serializes the admit-or-reject decision so two callers can never both
    /// observe an empty queue.
    admission: tokio::sync::Mutex<()>,
    workers_enabled: bool,
}

impl QueueingExecutor {
    pub fn new(mode: ExecutionMode, deps: JobDeps, managers: Arc<ManagerRegistry>) -> Arc<Self> {
        Self::build(mode, deps, managers, true)
    }

    /// Admission-only executor for tests: queues fill but nothing runs.
    #[cfg(test)]
    pub(crate) fn new_without_workers(
        mode: ExecutionMode,
        deps: JobDeps,
        managers: Arc<ManagerRegistry>,
    ) -> Arc<Self> {
        Self::build(mode, deps, managers, false)
    }

    fn build(
        mode: ExecutionMode,
        deps: JobDeps,
        managers: Arc<ManagerRegistry>,
        workers_enabled: bool,
    ) -> Arc<Self> {
        let executor = Arc::new(Self {
            mode,
            factory: Arc::new(JobFactory::new(deps.clone())),
            deps,
            managers,
            main: Lane::new("main"),
            sftp: match mode {
                ExecutionMode::LimitedParallel => Some(Lane::new("sftp")),
                ExecutionMode::StrictSerial => None,
            },
            admission: tokio::sync::Mutex::new(()),
            workers_enabled,
        });
        if workers_enabled {
            executor.ensure_workers();
        }
        executor
    }

    /// Admits an action or rejects it with a conflict error. The action is
    /// persisted to the durable log (and reported to the configuration
    /// mediator) before it is queued, so a crash after admission never loses
    /// the record.
    pub async fn execute(
        self: &Arc<Self>,
        manager_id: &str,
        request: CreateActionRequest,
    ) -> Result<Action, OrchestratorError> {
        let manager = self.managers.get(manager_id).ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!("Unknown backup manager {manager_id}"))
        })?;
        let new_action = Action::new(manager_id, &request);

        let _admit = self.admission.lock().await;
        let main_front = self.main.front().map(|i| i.action_snapshot());
        let sftp_front = self
            .sftp
            .as_ref()
            .and_then(|lane| lane.front())
            .map(|i| i.action_snapshot());
        admission_decision(self.mode, main_front.as_ref(), sftp_front.as_ref(), &new_action, &self.managers)?;

        self.persist_admitted(&new_action).await?;

        let lane = self.lane_for(new_action.kind);
        info!(
            action_id = %new_action.id,
            kind = new_action.kind.as_str(),
            lane = lane.name,
            "Action admitted"
        );
        lane.push(JobQueueItem {
            manager,
            action: action::shared(new_action.clone()),
        });
        if self.workers_enabled {
            self.ensure_workers();
        }
        Ok(new_action)
    }

    /// Action ids of the jobs currently at the lane fronts, i.e. running or
    /// about to run.
    pub fn running_action_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(item) = self.main.front() {
            ids.push(item.action_id());
        }
        if let Some(item) = self.sftp.as_ref().and_then(|lane| lane.front()) {
            ids.push(item.action_id());
        }
        ids
    }

    pub fn is_idle(&self) -> bool {
        self.main.is_empty() && self.sftp.as_ref().map(|l| l.is_empty()).unwrap_or(true)
    }

    fn lane_for(&self, kind: ActionKind) -> Arc<Lane> {
        match (&self.sftp, kind.is_import_or_export()) {
            (Some(sftp), true) => sftp.clone(),
            _ => self.main.clone(),
        }
    }

    /// Chained follow-up actions land in the import/export lane (or the one
    /// main lane in strict mode), ahead of any unrelated new admission.
    fn post_exec_lane(&self) -> Arc<Lane> {
        self.sftp.clone().unwrap_or_else(|| self.main.clone())
    }

    async fn persist_admitted(&self, new_action: &Action) -> Result<(), OrchestratorError> {
        if !new_action.kind.is_part_of_housekeeping() {
            self.deps.mediator.enqueue_progress_report(new_action);
        }
        let pool = self.deps.pool.clone();
        let snapshot = new_action.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            action::persist(&conn, &snapshot)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(e.into()))??;
        Ok(())
    }

    /// Check whether the lane workers are running; restart any that died.
    fn ensure_workers(self: &Arc<Self>) {
        self.ensure_worker(self.main.clone(), self.post_exec_lane());
        if let Some(sftp) = &self.sftp {
            self.ensure_worker(sftp.clone(), sftp.clone());
        }
    }

    fn ensure_worker(self: &Arc<Self>, lane: Arc<Lane>, post_lane: Arc<Lane>) {
        let mut worker = lane.worker.lock().unwrap();
        let alive = worker.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if alive {
            return;
        }
        info!(lane = lane.name, "Starting lane execute loop");
        let executor = self.clone();
        let loop_lane = lane.clone();
        *worker = Some(tokio::spawn(async move {
            executor.execute_loop(loop_lane, post_lane).await;
        }));
    }

    /// Lane execute loop. The front item is peeked, not popped, so the lane
    /// reads as busy for the whole duration of the job; removal happens only
    /// after chained actions are queued and the action is marked complete.
    async fn execute_loop(self: Arc<Self>, lane: Arc<Lane>, post_lane: Arc<Lane>) {
        loop {
            let Some(item) = lane.front() else {
                lane.notify.notified().await;
                continue;
            };
            let action_id = item.action_id();
            info!(lane = lane.name, action_id = %action_id, "Action is running");

            let job = self.factory.create_job(&item.manager, item.action.clone());
            let follow_ups = job::run(job.clone()).await;

            for request in follow_ups {
                if let Err(e) = self.enqueue_chained(&item.manager, &post_lane, request).await {
                    error!(action_id = %action_id, "Failed to enqueue chained action: {e}");
                }
            }

            job::complete_action(job.context());
            lane.remove(&action_id);
            info!(lane = lane.name, action_id = %action_id, "Action removed from execution queue");
        }
    }

    async fn enqueue_chained(
        &self,
        manager: &BackupManager,
        post_lane: &Arc<Lane>,
        request: CreateActionRequest,
    ) -> Result<(), OrchestratorError> {
        let chained = Action::new(&manager.id, &request);
        info!(
            action_id = %chained.id,
            kind = chained.kind.as_str(),
            lane = post_lane.name,
            "Queueing chained follow-up action"
        );
        self.persist_admitted(&chained).await?;
        post_lane.push(JobQueueItem {
            manager: manager.clone(),
            action: action::shared(chained),
        });
        Ok(())
    }
}

/// The admit-or-reject decision. Kept as one function so the parallel-safety
/// predicate table stays in one reviewable place.
fn admission_decision(
    mode: ExecutionMode,
    main_front: Option<&Action>,
    sftp_front: Option<&Action>,
    new_action: &Action,
    managers: &ManagerRegistry,
) -> Result<(), OrchestratorError> {
    match mode {
        ExecutionMode::StrictSerial => {
            if let Some(running) = main_front {
                return Err(reject(new_action, &[running], false));
            }
            Ok(())
        }
        ExecutionMode::LimitedParallel => match (main_front, sftp_front) {
            (None, None) => Ok(()),
            (None, Some(running)) => {
                if is_valid_parallel_create_backup(running, new_action)
                    || is_valid_import_restore(running, new_action, managers)
                {
                    Ok(())
                } else {
                    Err(reject(new_action, &[running], true))
                }
            }
            (Some(running), None) => {
                if is_valid_parallel_export(running, new_action)
                    || is_valid_import_restore(running, new_action, managers)
                {
                    Ok(())
                } else {
                    Err(reject(new_action, &[running], true))
                }
            }
            (Some(main_running), Some(sftp_running)) => {
                Err(reject(new_action, &[main_running, sftp_running], true))
            }
        },
    }
}

fn reject(new_action: &Action, running: &[&Action], parallel: bool) -> OrchestratorError {
    let ids: Vec<&str> = running.iter().map(|a| a.id.as_str()).collect();
    let mut message = format!(
        "{} action did not execute because another action [{}] is already running.",
        new_action.kind.as_str(),
        ids.join(",")
    );
    if parallel {
        message.push_str(&format!(
            " {} cannot be executed in parallel as a conflict scenario was detected.",
            new_action.kind.as_str()
        ));
    }
    OrchestratorError::AnotherActionRunning(message)
}

/// A running CreateBackup admits an Export targeting a different backup name
/// on the same backup manager.
fn is_valid_parallel_export(running: &Action, new_action: &Action) -> bool {
    running.kind == ActionKind::CreateBackup
        && new_action.kind == ActionKind::Export
        && same_manager_different_backup(running, new_action)
}

/// The mirror image: a running Export admits a CreateBackup for a different
/// backup name on the same manager.
fn is_valid_parallel_create_backup(running: &Action, new_action: &Action) -> bool {
    running.kind == ActionKind::Export
        && new_action.kind == ActionKind::CreateBackup
        && same_manager_different_backup(running, new_action)
}

/// Restore ∥ Import, either order. Same manager needs different backup
/// names; different managers are fine except kin sharing a backup name, or a
/// configuration-manager pair (the conflicting action is a Restore by
/// construction of the pair).
fn is_valid_import_restore(
    running: &Action,
    new_action: &Action,
    managers: &ManagerRegistry,
) -> bool {
    let is_pair = (running.kind == ActionKind::Restore && new_action.kind == ActionKind::Import)
        || (running.kind == ActionKind::Import && new_action.kind == ActionKind::Restore);
    if !is_pair {
        return false;
    }

    if running.backup_manager_id == new_action.backup_manager_id {
        return running.backup_name != new_action.backup_name;
    }

    let kin = managers.are_kin(&running.backup_manager_id, &new_action.backup_manager_id);
    if kin && running.backup_name == new_action.backup_name {
        return false;
    }
    if managers.are_config_pair(&running.backup_manager_id, &new_action.backup_manager_id) {
        return false;
    }
    true
}

fn same_manager_different_backup(a: &Action, b: &Action) -> bool {
    a.backup_manager_id == b.backup_manager_id && a.backup_name != b.backup_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{self, BackupLocks, BackupStatus};
    use crate::db;
    use crate::job::JobSettings;
    use crate::jobs::NoopTransferClient;
    use crate::manager::BackupManager;
    use crate::mediator::{EventBroadcaster, LoggingMediator};
    use crate::registry::AgentRegistry;
    use crate::stage::StageRouter;
    use std::time::Duration;

    fn deps() -> (JobDeps, Arc<ManagerRegistry>, tempfile::TempDir) {
        let (pool, dir) = db::test_pool();
        let events = EventBroadcaster::new();
        let managers = ManagerRegistry::new();
        let deps = JobDeps {
            pool,
            registry: Arc::new(AgentRegistry::new()),
            router: StageRouter::new(),
            locks: BackupLocks::new(),
            managers: managers.clone(),
            mediator: Arc::new(LoggingMediator::new(events.clone())),
            events,
            transfer: Arc::new(NoopTransferClient),
            settings: JobSettings::default(),
        };
        (deps, managers, dir)
    }

    fn request(kind: ActionKind, backup_name: &str) -> CreateActionRequest {
        CreateActionRequest {
            kind,
            backup_name: backup_name.to_string(),
            scheduled: false,
        }
    }

    async fn wait_until_idle(executor: &QueueingExecutor) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !executor.is_idle() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("executor did not drain in time");
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_second_action_without_queue_mutation() {
        let (deps, managers, _dir) = deps();
        let executor =
            QueueingExecutor::new_without_workers(ExecutionMode::StrictSerial, deps, managers);

        let first = executor
            .execute("DEFAULT", request(ActionKind::CreateBackup, "b1"))
            .await
            .unwrap();

        let second = executor
            .execute("DEFAULT", request(ActionKind::Restore, "b2"))
            .await;
        match second {
            Err(OrchestratorError::AnotherActionRunning(msg)) => {
                assert!(msg.contains(&first.id));
            }
            other => panic!("expected admission conflict, got {other:?}"),
        }
        assert_eq!(executor.running_action_ids(), vec![first.id]);
    }

    #[tokio::test]
    async fn test_parallel_mode_export_predicate() {
        let (deps, managers, _dir) = deps();
        let executor =
            QueueingExecutor::new_without_workers(ExecutionMode::LimitedParallel, deps, managers);

        executor
            .execute("DEFAULT", request(ActionKind::CreateBackup, "A"))
            .await
            .unwrap();

        // Same backup name: conflict.
        let conflict = executor
            .execute("DEFAULT", request(ActionKind::Export, "A"))
            .await;
        assert!(matches!(conflict, Err(OrchestratorError::AnotherActionRunning(_))));

        // Different backup name on the same manager: safe.
        executor
            .execute("DEFAULT", request(ActionKind::Export, "B"))
            .await
            .unwrap();

        // Both lanes busy now: everything else is rejected.
        let third = executor
            .execute("DEFAULT", request(ActionKind::Housekeeping, ""))
            .await;
        assert!(matches!(third, Err(OrchestratorError::AnotherActionRunning(_))));
    }

    #[tokio::test]
    async fn test_parallel_mode_import_restore_predicates() {
        let (deps, managers, _dir) = deps();
        managers.insert(BackupManager::new("subscriber-data"));
        let mut child = BackupManager::new("subscriber-data-v1");
        child.parent = Some("subscriber-data".to_string());
        managers.insert(child);
        managers.insert(BackupManager::new("subscriber-data-cfg"));

        let executor = QueueingExecutor::new_without_workers(
            ExecutionMode::LimitedParallel,
            deps,
            managers.clone(),
        );
        executor
            .execute("subscriber-data", request(ActionKind::Restore, "b1"))
            .await
            .unwrap();

        // Same manager, same backup: conflict.
        assert!(executor
            .execute("subscriber-data", request(ActionKind::Import, "b1"))
            .await
            .is_err());

        // Kin manager sharing the backup name: conflict.
        assert!(executor
            .execute("subscriber-data-v1", request(ActionKind::Import, "b1"))
            .await
            .is_err());

        // Config-manager pair: conflict regardless of name.
        assert!(executor
            .execute("subscriber-data-cfg", request(ActionKind::Import, "other"))
            .await
            .is_err());

        // Same manager, different backup: safe.
        executor
            .execute("subscriber-data", request(ActionKind::Import, "b2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrelated_cross_manager_import_is_admitted() {
        let (deps, managers, _dir) = deps();
        managers.insert(BackupManager::new("subscriber-data"));
        managers.insert(BackupManager::new("session-data"));
        let executor = QueueingExecutor::new_without_workers(
            ExecutionMode::LimitedParallel,
            deps,
            managers,
        );

        executor
            .execute("subscriber-data", request(ActionKind::Restore, "b1"))
            .await
            .unwrap();
        executor
            .execute("session-data", request(ActionKind::Import, "b1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_housekeeping_chains_deletes_and_drains() {
        let (deps, managers, _dir) = deps();
        {
            let conn = deps.pool.get().unwrap();
            for name in ["old-1", "old-2", "keep"] {
                backup::create(&conn, "DEFAULT", name, BackupStatus::Complete).unwrap();
            }
        }
        let mut manager = BackupManager::new("DEFAULT");
        manager.housekeeping.max_stored_backups = 1;
        managers.insert(manager);

        let pool = deps.pool.clone();
        let executor = QueueingExecutor::new(ExecutionMode::StrictSerial, deps, managers);
        let action = executor
            .execute("DEFAULT", request(ActionKind::Housekeeping, ""))
            .await
            .unwrap();
        wait_until_idle(&executor).await;

        let conn = pool.get().unwrap();
        let remaining = backup::find_by_manager(&conn, "DEFAULT").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "keep");

        let logged = action::find_by_id(&conn, &action.id).unwrap().unwrap();
        assert!(logged.finished);
        assert_eq!(logged.result, crate::action::ResultType::Success);

        // The chained HOUSEKEEPING_DELETE actions hit the log too.
        let all = action::find_by_manager(&conn, "DEFAULT").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_create_backup_aborts_when_housekeeping_cannot_make_room() {
        let (deps, managers, _dir) = deps();
        {
            let conn = deps.pool.get().unwrap();
            backup::create(&conn, "DEFAULT", "old", BackupStatus::Complete).unwrap();
        }
        let mut manager = BackupManager::new("DEFAULT");
        manager.housekeeping.max_stored_backups = 1;
        manager.housekeeping.auto_delete = false;
        managers.insert(manager);

        let pool = deps.pool.clone();
        let executor = QueueingExecutor::new(ExecutionMode::StrictSerial, deps, managers);
        let admitted = executor
            .execute("DEFAULT", request(ActionKind::CreateBackup, "b-new"))
            .await
            .unwrap();
        wait_until_idle(&executor).await;

        let conn = pool.get().unwrap();
        let logged = action::find_by_id(&conn, &admitted.id).unwrap().unwrap();
        assert!(logged.finished);
        assert_eq!(logged.result, crate::action::ResultType::Failure);
        assert!(logged.additional_info.contains("auto-delete is disabled"));

        // The pre-check aborted before any stage machinery: no backup record
        // for the aborted action, the existing backup untouched.
        assert!(backup::find_by_name(&conn, "DEFAULT", "b-new").unwrap().is_none());
        assert!(backup::find_by_name(&conn, "DEFAULT", "old").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_admitted_action_is_persisted_before_running() {
        let (deps, managers, _dir) = deps();
        let pool = deps.pool.clone();
        let executor =
            QueueingExecutor::new_without_workers(ExecutionMode::StrictSerial, deps, managers);

        let admitted = executor
            .execute("DEFAULT", request(ActionKind::CreateBackup, "b1"))
            .await
            .unwrap();

        // Workers never ran, yet the action log already has the record.
        let conn = pool.get().unwrap();
        let logged = action::find_by_id(&conn, &admitted.id).unwrap().unwrap();
        assert!(!logged.finished);
        assert_eq!(logged.kind, ActionKind::CreateBackup);
    }
}
