//! Actions — one orchestrator-level operation request each.
//!
//! An action is created once per request, mutated by the job engine while it
//! runs, and written to the durable action log on every significant
//! mutation. Identity fields never change after creation.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::db::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "CREATE_BACKUP")]
    CreateBackup,
    #[serde(rename = "RESTORE")]
    Restore,
    #[serde(rename = "DELETE_BACKUP")]
    DeleteBackup,
    #[serde(rename = "IMPORT")]
    Import,
    #[serde(rename = "EXPORT")]
    Export,
    #[serde(rename = "HOUSEKEEPING")]
    Housekeeping,
    #[serde(rename = "HOUSEKEEPING_DELETE_BACKUP")]
    HousekeepingDelete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateBackup => "CREATE_BACKUP",
            ActionKind::Restore => "RESTORE",
            ActionKind::DeleteBackup => "DELETE_BACKUP",
            ActionKind::Import => "IMPORT",
            ActionKind::Export => "EXPORT",
            ActionKind::Housekeeping => "HOUSEKEEPING",
            ActionKind::HousekeepingDelete => "HOUSEKEEPING_DELETE_BACKUP",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "CREATE_BACKUP" => ActionKind::CreateBackup,
            "RESTORE" => ActionKind::Restore,
            "DELETE_BACKUP" => ActionKind::DeleteBackup,
            "IMPORT" => ActionKind::Import,
            "EXPORT" => ActionKind::Export,
            "HOUSEKEEPING" => ActionKind::Housekeeping,
            "HOUSEKEEPING_DELETE_BACKUP" => ActionKind::HousekeepingDelete,
            _ => return None,
        })
    }

    pub fn is_import_or_export(&self) -> bool {
        matches!(self, ActionKind::Import | ActionKind::Export)
    }

    /// Kinds that must hold the per-backup action lock while running.
    pub fn needs_backup_lock(&self) -> bool {
        matches!(
            self,
            ActionKind::DeleteBackup
                | ActionKind::Export
                | ActionKind::Restore
                | ActionKind::HousekeepingDelete
        )
    }

    /// Kinds that run the housekeeping pre-check before starting.
    pub fn needs_housekeeping_precheck(&self) -> bool {
        matches!(self, ActionKind::CreateBackup | ActionKind::Import)
    }

    /// Housekeeping-internal kinds never report progress to the mediator.
    pub fn is_part_of_housekeeping(&self) -> bool {
        matches!(self, ActionKind::HousekeepingDelete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultType {
    NotAvailable,
    Success,
    Failure,
}

impl ResultType {
    fn as_str(&self) -> &'static str {
        match self {
            ResultType::NotAvailable => "not-available",
            ResultType::Success => "success",
            ResultType::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub backup_manager_id: String,
    pub kind: ActionKind,
    pub backup_name: String,
    pub scheduled: bool,
    pub result: ResultType,
    pub finished: bool,
    pub progress_percentage: f64,
    pub progress_info: String,
    pub additional_info: String,
    pub start_time: String,
    pub completion_time: Option<String>,
}

/// What a caller (REST adapter, scheduler, chained job) asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionRequest {
    pub kind: ActionKind,
    pub backup_name: String,
    #[serde(default)]
    pub scheduled: bool,
}

impl Action {
    pub fn new(backup_manager_id: &str, request: &CreateActionRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            backup_manager_id: backup_manager_id.to_string(),
            kind: request.kind,
            backup_name: request.backup_name.clone(),
            scheduled: request.scheduled,
            result: ResultType::NotAvailable,
            finished: false,
            progress_percentage: 0.0,
            progress_info: String::new(),
            additional_info: String::new(),
            start_time: Utc::now().to_rfc3339(),
            completion_time: None,
        }
    }

    pub fn fail(&mut self, reason: &str, additional_info: &str) {
        self.result = ResultType::Failure;
        self.additional_info = additional_info.to_string();
        if !reason.is_empty() && reason != additional_info {
            self.progress_info = reason.to_string();
        }
    }
}

/// An action shared between the executor, the running job and the stage
/// aggregator. Mutations go through the mutex; every significant one is
/// followed by a [`persist`] call.
pub type SharedAction = Arc<Mutex<Action>>;

pub fn shared(action: Action) -> SharedAction {
    Arc::new(Mutex::new(action))
}

fn row_to_action(row: &Row) -> rusqlite::Result<Action> {
    let kind_str: String = row.get("kind")?;
    let result_str: String = row.get("result")?;
    let state: String = row.get("state")?;
    Ok(Action {
        id: row.get("id")?,
        backup_manager_id: row.get("backup_manager_id")?,
        kind: ActionKind::from_str(&kind_str).unwrap_or(ActionKind::Housekeeping),
        backup_name: row.get("backup_name")?,
        scheduled: row.get::<_, i64>("scheduled")? != 0,
        result: match result_str.as_str() {
            "success" => ResultType::Success,
            "failure" => ResultType::Failure,
            _ => ResultType::NotAvailable,
        },
        finished: state == "finished",
        progress_percentage: row.get("progress_percentage")?,
        progress_info: row.get("progress_info")?,
        additional_info: row.get("additional_info")?,
        start_time: row.get("start_time")?,
        completion_time: row.get("completion_time")?,
    })
}

/// Upsert — the action log sees the action before it is queued and after
/// every mutation, so insert-or-replace keeps one row per action id.
pub fn persist(conn: &Connection, action: &Action) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO actions (id, backup_manager_id, kind, backup_name, scheduled, result,
                              state, progress_percentage, progress_info, additional_info,
                              start_time, completion_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
           result = excluded.result,
           state = excluded.state,
           progress_percentage = excluded.progress_percentage,
           progress_info = excluded.progress_info,
           additional_info = excluded.additional_info,
           completion_time = excluded.completion_time",
        params![
            action.id,
            action.backup_manager_id,
            action.kind.as_str(),
            action.backup_name,
            action.scheduled as i64,
            action.result.as_str(),
            if action.finished { "finished" } else { "running" },
            action.progress_percentage,
            action.progress_info,
            action.additional_info,
            action.start_time,
            action.completion_time,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Action>> {
    let mut stmt = conn.prepare("SELECT * FROM actions WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_action)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_by_manager(conn: &Connection, manager_id: &str) -> anyhow::Result<Vec<Action>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM actions WHERE backup_manager_id = ? ORDER BY start_time DESC",
    )?;
    let rows = stmt.query_map(params![manager_id], row_to_action)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Persist the shared action through the pool, logging instead of failing:
/// the log write must never take a running job down with it.
pub fn persist_shared(pool: &DbPool, action: &SharedAction) {
    let snapshot = action.lock().unwrap().clone();
    match pool.get() {
        Ok(conn) => {
            if let Err(e) = persist(&conn, &snapshot) {
                tracing::warn!(action_id = %snapshot.id, "Failed to persist action: {e:#}");
            }
        }
        Err(e) => tracing::warn!("Failed to get DB connection for action persist: {e}"),
    }
}

/// Append one immutable per-(agent, stage) audit record.
pub fn record_agent_stage(
    pool: &DbPool,
    action_id: &str,
    agent_id: &str,
    stage: &str,
    outcome: &str,
) {
    let write = || -> anyhow::Result<()> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO agent_stage_infos (action_id, agent_id, stage, outcome, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action_id, agent_id, stage, outcome, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    };
    if let Err(e) = write() {
        tracing::warn!(action_id, agent_id, "Failed to record agent stage info: {e:#}");
    }
}
