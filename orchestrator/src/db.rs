//! SQLite pool and schema for the durable action log and backup inventory.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS actions (
  id TEXT PRIMARY KEY,
  backup_manager_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  backup_name TEXT NOT NULL,
  scheduled INTEGER NOT NULL DEFAULT 0,
  result TEXT NOT NULL DEFAULT 'not-available'
    CHECK(result IN ('not-available','success','failure')),
  state TEXT NOT NULL DEFAULT 'running' CHECK(state IN ('running','finished')),
  progress_percentage REAL NOT NULL DEFAULT 0.0,
  progress_info TEXT NOT NULL DEFAULT '',
  additional_info TEXT NOT NULL DEFAULT '',
  start_time TEXT NOT NULL,
  completion_time TEXT
);

CREATE TABLE IF NOT EXISTS backups (
  id TEXT PRIMARY KEY,
  backup_manager_id TEXT NOT NULL,
  name TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'incomplete'
    CHECK(status IN ('incomplete','complete','corrupted')),
  fragments TEXT NOT NULL DEFAULT '[]',
  creation_time TEXT NOT NULL,
  UNIQUE(backup_manager_id, name)
);

CREATE TABLE IF NOT EXISTS agent_stage_infos (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  action_id TEXT NOT NULL,
  agent_id TEXT NOT NULL,
  stage TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK(outcome IN ('successful','failed','disconnected')),
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_actions_manager ON actions(backup_manager_id);
CREATE INDEX IF NOT EXISTS idx_backups_manager ON backups(backup_manager_id);
CREATE INDEX IF NOT EXISTS idx_stage_infos_action ON agent_stage_infos(action_id);
"#;

pub fn create_pool(db_path: &str) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder().max_size(4).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;

    Ok(pool)
}

/// Idempotent schema creation; safe to run on every start.
pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
pub fn test_pool() -> (DbPool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let pool = create_pool(path.to_str().unwrap()).expect("pool");
    migrate(&pool).expect("migrate");
    (pool, dir)
}
