//! Backup inventory and the per-backup action lock.
//!
//! A backup may be locked by at most one action at a time. The lock lives in
//! memory (it describes runtime exclusivity, not durable state) and is
//! released by dropping the guard, so every exit path of a job — success,
//! failure or panic unwind — releases it.

use backup_protocol::Fragment;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Still being created.
    Incomplete,
    Complete,
    Corrupted,
}

impl BackupStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Incomplete => "incomplete",
            BackupStatus::Complete => "complete",
            BackupStatus::Corrupted => "corrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub backup_manager_id: String,
    pub name: String,
    pub status: BackupStatus,
    pub fragments: Vec<Fragment>,
    pub creation_time: String,
}

fn row_to_backup(row: &Row) -> rusqlite::Result<Backup> {
    let status: String = row.get("status")?;
    let fragments_json: String = row.get("fragments")?;
    Ok(Backup {
        id: row.get("id")?,
        backup_manager_id: row.get("backup_manager_id")?,
        name: row.get("name")?,
        status: match status.as_str() {
            "complete" => BackupStatus::Complete,
            "corrupted" => BackupStatus::Corrupted,
            _ => BackupStatus::Incomplete,
        },
        fragments: serde_json::from_str(&fragments_json).unwrap_or_default(),
        creation_time: row.get("creation_time")?,
    })
}

pub fn create(
    conn: &Connection,
    manager_id: &str,
    name: &str,
    status: BackupStatus,
) -> anyhow::Result<Backup> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backups (id, backup_manager_id, name, status, creation_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, manager_id, name, status.as_str(), now],
    )?;
    find_by_name(conn, manager_id, name)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup"))
}

pub fn find_by_name(
    conn: &Connection,
    manager_id: &str,
    name: &str,
) -> anyhow::Result<Option<Backup>> {
    let mut stmt =
        conn.prepare("SELECT * FROM backups WHERE backup_manager_id = ? AND name = ?")?;
    let mut rows = stmt.query_map(params![manager_id, name], row_to_backup)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_manager(conn: &Connection, manager_id: &str) -> anyhow::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE backup_manager_id = ? ORDER BY creation_time ASC",
    )?;
    let rows = stmt.query_map(params![manager_id], row_to_backup)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn update_status(
    conn: &Connection,
    manager_id: &str,
    name: &str,
    status: BackupStatus,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backups SET status = ? WHERE backup_manager_id = ? AND name = ?",
        params![status.as_str(), manager_id, name],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, manager_id: &str, name: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "DELETE FROM backups WHERE backup_manager_id = ? AND name = ?",
        params![manager_id, name],
    )?;
    Ok(changes > 0)
}

pub fn count_completed(conn: &Connection, manager_id: &str) -> anyhow::Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM backups WHERE backup_manager_id = ? AND status = 'complete'",
        params![manager_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ── Action lock ──

type LockKey = (String, String);

/// Runtime map of (manager, backup) → owning action id.
#[derive(Debug, Default)]
pub struct BackupLocks {
    inner: DashMap<LockKey, String>,
}

impl BackupLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock, or fail naming the action currently holding it.
    pub fn acquire(
        self: &Arc<Self>,
        manager_id: &str,
        backup_name: &str,
        action_id: &str,
        action_kind: &str,
    ) -> Result<BackupLockGuard, OrchestratorError> {
        let key = (manager_id.to_string(), backup_name.to_string());
        match self.inner.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(OrchestratorError::AnotherActionRunning(format!(
                    "Failed to run {} on backup {} as another action {} is running on backup {}",
                    action_kind,
                    backup_name,
                    e.get(),
                    backup_name
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(action_id.to_string());
                Ok(BackupLockGuard {
                    locks: self.clone(),
                    key,
                    action_id: action_id.to_string(),
                })
            }
        }
    }

    /// Acquire with a bounded wait; housekeeping deletes must fail after the
    /// configured timeout rather than block the lane forever.
    pub async fn acquire_with_timeout(
        self: &Arc<Self>,
        manager_id: &str,
        backup_name: &str,
        action_id: &str,
        action_kind: &str,
        timeout: Duration,
    ) -> Result<BackupLockGuard, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.acquire(manager_id, backup_name, action_id, action_kind) {
                Ok(guard) => return Ok(guard),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => {
                    return Err(OrchestratorError::HousekeepingTimeout {
                        seconds: timeout.as_secs(),
                        backup: backup_name.to_string(),
                    })
                }
            }
        }
    }

    pub fn holder(&self, manager_id: &str, backup_name: &str) -> Option<String> {
        self.inner
            .get(&(manager_id.to_string(), backup_name.to_string()))
            .map(|e| e.clone())
    }
}

/// Releases the lock on drop; only the owning action can release it.
#[derive(Debug)]
pub struct BackupLockGuard {
    locks: Arc<BackupLocks>,
    key: LockKey,
    action_id: String,
}

impl Drop for BackupLockGuard {
    fn drop(&mut self) {
        self.locks
            .inner
            .remove_if(&self.key, |_, holder| holder == &self.action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let locks = BackupLocks::new();

        let guard = locks.acquire("DEFAULT", "b1", "action-1", "RESTORE").unwrap();
        let conflict = locks.acquire("DEFAULT", "b1", "action-2", "EXPORT");
        match conflict {
            Err(OrchestratorError::AnotherActionRunning(msg)) => {
                assert!(msg.contains("action-1"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // A different backup on the same manager locks independently.
        let _other = locks.acquire("DEFAULT", "b2", "action-2", "EXPORT").unwrap();

        drop(guard);
        locks.acquire("DEFAULT", "b1", "action-3", "DELETE_BACKUP").unwrap();
    }

    #[tokio::test]
    async fn test_lock_timeout_names_duration() {
        let locks = BackupLocks::new();
        let _held = locks.acquire("DEFAULT", "b1", "action-1", "RESTORE").unwrap();

        let result = locks
            .acquire_with_timeout(
                "DEFAULT",
                "b1",
                "action-2",
                "HOUSEKEEPING_DELETE_BACKUP",
                Duration::from_millis(250),
            )
            .await;
        match result {
            Err(OrchestratorError::HousekeepingTimeout { backup, .. }) => {
                assert_eq!(backup, "b1");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
