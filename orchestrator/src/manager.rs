//! Backup managers — named scopes under which backups and their
//! housekeeping policy live.
//!
//! A manager can be virtual (a child carved out of a parent's scope) or the
//! designated configuration manager of another (id convention: the parent id
//! with a `-cfg` suffix). Both relationships feed the parallel-admission
//! predicates.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_MANAGER_ID: &str = "DEFAULT";

const CONFIG_MANAGER_SUFFIX: &str = "-cfg";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingPolicy {
    pub auto_delete: bool,
    pub max_stored_backups: u32,
}

impl Default for HousekeepingPolicy {
    fn default() -> Self {
        Self { auto_delete: true, max_stored_backups: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Cron expression for periodic scheduled backups, if any.
    pub cron_schedule: Option<String>,
    /// Enqueue an export of every scheduled backup once it completes.
    pub auto_export: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { cron_schedule: None, auto_export: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManager {
    pub id: String,
    /// Parent manager id for virtual (child) managers.
    pub parent: Option<String>,
    #[serde(default)]
    pub housekeeping: HousekeepingPolicy,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl BackupManager {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: None,
            housekeeping: HousekeepingPolicy::default(),
            scheduler: SchedulerSettings::default(),
        }
    }

    /// The manager this one holds configuration backups for, if it is a
    /// configuration manager.
    pub fn config_manager_of(&self) -> Option<&str> {
        self.id.strip_suffix(CONFIG_MANAGER_SUFFIX)
    }
}

/// In-memory registry of known managers. Managers appear when configured at
/// startup or when an agent registers with a scope no manager exists for
/// yet.
pub struct ManagerRegistry {
    managers: DashMap<String, BackupManager>,
}

impl ManagerRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Self { managers: DashMap::new() };
        registry
            .managers
            .insert(DEFAULT_MANAGER_ID.to_string(), BackupManager::new(DEFAULT_MANAGER_ID));
        Arc::new(registry)
    }

    pub fn get(&self, id: &str) -> Option<BackupManager> {
        self.managers.get(id).map(|m| m.clone())
    }

    pub fn insert(&self, manager: BackupManager) {
        self.managers.insert(manager.id.clone(), manager);
    }

    /// Resolve an agent scope to a manager, creating it on first sight.
    /// An empty scope means the default manager.
    pub fn ensure_for_scope(&self, scope: &str) -> BackupManager {
        let id = if scope.is_empty() { DEFAULT_MANAGER_ID } else { scope };
        self.managers
            .entry(id.to_string())
            .or_insert_with(|| BackupManager::new(id))
            .clone()
    }

    pub fn all(&self) -> Vec<BackupManager> {
        self.managers.iter().map(|m| m.clone()).collect()
    }

    /// Parent and virtual child count as kin, in either direction.
    pub fn are_kin(&self, a: &str, b: &str) -> bool {
        let parent_of = |id: &str| self.get(id).and_then(|m| m.parent);
        parent_of(a).as_deref() == Some(b) || parent_of(b).as_deref() == Some(a)
    }

    /// True if one manager is the designated configuration manager of the
    /// other, in either direction.
    pub fn are_config_pair(&self, a: &str, b: &str) -> bool {
        let config_of = |id: &str| {
            self.get(id)
                .and_then(|m| m.config_manager_of().map(str::to_string))
        };
        config_of(a).as_deref() == Some(b) || config_of(b).as_deref() == Some(a)
    }
}
