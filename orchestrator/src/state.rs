use std::sync::Arc;

use crate::backup::BackupLocks;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::executor::QueueingExecutor;
use crate::job::JobSettings;
use crate::jobs::{JobDeps, NoopTransferClient};
use crate::manager::ManagerRegistry;
use crate::mediator::{EventBroadcaster, LoggingMediator};
use crate::registry::AgentRegistry;
use crate::stage::StageRouter;

pub struct AppState {
    pub config: AppConfig,
    pub pool: DbPool,
    pub agents: Arc<AgentRegistry>,
    pub managers: Arc<ManagerRegistry>,
    pub router: Arc<StageRouter>,
    pub events: EventBroadcaster,
    pub executor: Arc<QueueingExecutor>,
}

impl AppState {
    pub fn new(config: AppConfig, pool: DbPool) -> Arc<Self> {
        let agents = Arc::new(AgentRegistry::new());
        let managers = ManagerRegistry::new();
        let router = StageRouter::new();
        let events = EventBroadcaster::new();
        let deps = JobDeps {
            pool: pool.clone(),
            registry: agents.clone(),
            router: router.clone(),
            locks: BackupLocks::new(),
            managers: managers.clone(),
            mediator: Arc::new(LoggingMediator::new(events.clone())),
            events: events.clone(),
            transfer: Arc::new(NoopTransferClient),
            settings: JobSettings {
                housekeeping_lock_timeout_secs: config.housekeeping_lock_timeout_secs,
                job_monitor_period_secs: config.job_monitor_period_secs,
            },
        };
        let executor = QueueingExecutor::new(config.execution_mode, deps, managers.clone());

        Arc::new(Self {
            config,
            pool,
            agents,
            managers,
            router,
            events,
            executor,
        })
    }
}
