//! Housekeeping — keeping each backup manager under its backup-count limit.
//!
//! Two entry points: the pre-check that runs synchronously before a
//! CreateBackup/Import job starts (making room for the incoming backup), and
//! candidate selection for the standalone Housekeeping action, which chains
//! HousekeepingDelete actions instead of deleting inline.

use std::time::Duration;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::backup::{self, BackupStatus};
use crate::error::OrchestratorError;
use crate::job::JobContext;
use crate::manager::BackupManager;

/// Completed backups that must go for the manager to hold at most
/// `max_remaining` of them, oldest first.
pub fn auto_deletion_candidates(
    conn: &Connection,
    manager_id: &str,
    max_remaining: u32,
) -> anyhow::Result<Vec<String>> {
    let completed: Vec<_> = backup::find_by_manager(conn, manager_id)?
        .into_iter()
        .filter(|b| b.status == BackupStatus::Complete)
        .collect();
    if completed.len() <= max_remaining as usize {
        return Ok(Vec::new());
    }
    let excess = completed.len() - max_remaining as usize;
    Ok(completed.into_iter().take(excess).map(|b| b.name).collect())
}

pub fn limit_reached(conn: &Connection, manager: &BackupManager) -> anyhow::Result<bool> {
    let count = backup::count_completed(conn, &manager.id)?;
    Ok(count >= manager.housekeeping.max_stored_backups)
}

/// Pre-check for CreateBackup/Import: when the limit is reached, delete the
/// oldest backups synchronously to make room for the incoming one. Every
/// delete runs under the per-backup action lock with a bounded wait; a
/// timeout or failed delete aborts the enclosing action.
pub async fn run_precheck(ctx: &JobContext) -> Result<(), OrchestratorError> {
    let manager = ctx.manager.clone();
    let pool = ctx.pool.clone();
    let action_id = ctx.action.lock().unwrap().id.clone();

    let manager_for_check = manager.clone();
    let reached = tokio::task::spawn_blocking({
        let pool = pool.clone();
        move || -> anyhow::Result<bool> {
            let conn = pool.get()?;
            limit_reached(&conn, &manager_for_check)
        }
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.into()))??;

    if !reached {
        return Ok(());
    }
    if !manager.housekeeping.auto_delete {
        return Err(OrchestratorError::InvalidRequest(format!(
            "Maximum number of backups ({}) reached for backup manager {} and auto-delete is disabled",
            manager.housekeeping.max_stored_backups, manager.id
        )));
    }

    // Room for the incoming backup: keep one slot free.
    let keep = manager.housekeeping.max_stored_backups.saturating_sub(1);
    let candidates = tokio::task::spawn_blocking({
        let pool = pool.clone();
        let manager_id = manager.id.clone();
        move || -> anyhow::Result<Vec<String>> {
            let conn = pool.get()?;
            auto_deletion_candidates(&conn, &manager_id, keep)
        }
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.into()))??;

    info!(
        manager_id = %manager.id,
        count = candidates.len(),
        "Housekeeping pre-check deleting oldest backups"
    );

    let timeout = Duration::from_secs(ctx.settings.housekeeping_lock_timeout_secs);
    for name in candidates {
        let _guard = ctx
            .locks
            .acquire_with_timeout(&manager.id, &name, &action_id, "HOUSEKEEPING_DELETE_BACKUP", timeout)
            .await?;

        let deleted = tokio::task::spawn_blocking({
            let pool = pool.clone();
            let manager_id = manager.id.clone();
            let name = name.clone();
            move || -> anyhow::Result<bool> {
                let conn = pool.get()?;
                backup::delete(&conn, &manager_id, &name)
            }
        })
        .await
        .map_err(|e| OrchestratorError::Internal(e.into()))??;

        if deleted {
            info!(backup = %name, manager_id = %manager.id, "Housekeeping deleted backup");
        } else {
            warn!(backup = %name, "Housekeeping candidate vanished before deletion");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seed(conn: &Connection, manager: &str, names: &[&str]) {
        for name in names {
            backup::create(conn, manager, name, BackupStatus::Complete).unwrap();
        }
    }

    #[test]
    fn test_candidates_are_oldest_beyond_limit() {
        let (pool, _dir) = db::test_pool();
        let conn = pool.get().unwrap();
        seed(&conn, "DEFAULT", &["b1", "b2", "b3"]);

        let candidates = auto_deletion_candidates(&conn, "DEFAULT", 1).unwrap();
        assert_eq!(candidates, vec!["b1".to_string(), "b2".to_string()]);

        assert!(auto_deletion_candidates(&conn, "DEFAULT", 3).unwrap().is_empty());
    }

    #[test]
    fn test_incomplete_backups_do_not_count_toward_limit() {
        let (pool, _dir) = db::test_pool();
        let conn = pool.get().unwrap();
        backup::create(&conn, "DEFAULT", "partial", BackupStatus::Incomplete).unwrap();

        let mut manager = BackupManager::new("DEFAULT");
        manager.housekeeping.max_stored_backups = 1;
        assert!(!limit_reached(&conn, &manager).unwrap());
    }

    fn precheck_context(
        pool: crate::db::DbPool,
        manager: BackupManager,
    ) -> crate::job::JobContext {
        use crate::action::{shared, Action, ActionKind, CreateActionRequest};
        use crate::mediator::{EventBroadcaster, LoggingMediator};
        use std::sync::Arc;

        let events = EventBroadcaster::new();
        crate::job::JobContext {
            pool,
            action: shared(Action::new(
                &manager.id,
                &CreateActionRequest {
                    kind: ActionKind::CreateBackup,
                    backup_name: "incoming".to_string(),
                    scheduled: false,
                },
            )),
            manager,
            locks: crate::backup::BackupLocks::new(),
            mediator: Arc::new(LoggingMediator::new(events.clone())),
            events,
            settings: crate::job::JobSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_precheck_makes_room_by_deleting_oldest() {
        let (pool, _dir) = db::test_pool();
        {
            let conn = pool.get().unwrap();
            seed(&conn, "DEFAULT", &["old-1", "old-2"]);
        }
        let mut manager = BackupManager::new("DEFAULT");
        manager.housekeeping.max_stored_backups = 1;

        run_precheck(&precheck_context(pool.clone(), manager)).await.unwrap();

        let conn = pool.get().unwrap();
        assert!(backup::find_by_manager(&conn, "DEFAULT").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_precheck_fails_when_auto_delete_disabled() {
        let (pool, _dir) = db::test_pool();
        {
            let conn = pool.get().unwrap();
            seed(&conn, "DEFAULT", &["old-1"]);
        }
        let mut manager = BackupManager::new("DEFAULT");
        manager.housekeeping.max_stored_backups = 1;
        manager.housekeeping.auto_delete = false;

        let result = run_precheck(&precheck_context(pool.clone(), manager)).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidRequest(_))));

        // Nothing was deleted.
        let conn = pool.get().unwrap();
        assert_eq!(backup::find_by_manager(&conn, "DEFAULT").unwrap().len(), 1);
    }
}
