//! Action-level stage aggregation.
//!
//! One [`StageAggregator`] exists per running multi-agent action. It fans
//! the action out to every participating agent, collects their
//! stage-complete reports, and advances the action-level stage only once
//! every tracked agent has reported. Reports arrive from each agent's socket
//! task, so all mutation goes through one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use backup_protocol::{ControlMessage, OperationKind};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::action::{self, SharedAction};
use crate::backup;
use crate::db::DbPool;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStageName {
    Preparation,
    Execution,
    PostAction,
    Complete,
    Failed,
}

impl JobStageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStageName::Preparation => "preparation",
            JobStageName::Execution => "execution",
            JobStageName::PostAction => "post-action",
            JobStageName::Complete => "complete",
            JobStageName::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, JobStageName::Complete | JobStageName::Failed)
    }

    /// 1-based order of the non-final stages, for progress computation.
    fn order(&self) -> u32 {
        match self {
            JobStageName::Preparation => 1,
            JobStageName::Execution => 2,
            JobStageName::PostAction | JobStageName::Complete | JobStageName::Failed => 3,
        }
    }
}

const NON_FINAL_STAGES: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentProgress {
    InProgress,
    Successful,
    Failed,
    Disconnected,
}

impl AgentProgress {
    fn reported(&self) -> bool {
        !matches!(self, AgentProgress::InProgress)
    }

    fn outcome_str(&self) -> &'static str {
        match self {
            AgentProgress::Successful => "successful",
            AgentProgress::Failed => "failed",
            AgentProgress::Disconnected => "disconnected",
            AgentProgress::InProgress => "in-progress",
        }
    }
}

struct Inner {
    stage: JobStageName,
    /// Per-agent progress within the current stage.
    agents: HashMap<String, AgentProgress>,
    /// Agents still participating; a disconnected agent leaves this list so
    /// later stages no longer wait for it.
    tracked: Vec<String>,
}

pub struct StageAggregator {
    action: SharedAction,
    action_id: String,
    manager_id: String,
    backup_name: String,
    kind: OperationKind,
    pool: DbPool,
    registry: Arc<AgentRegistry>,
    inner: Mutex<Inner>,
}

impl StageAggregator {
    pub fn new(
        action: SharedAction,
        pool: DbPool,
        registry: Arc<AgentRegistry>,
        kind: OperationKind,
        agent_ids: Vec<String>,
    ) -> Arc<Self> {
        let (action_id, manager_id, backup_name) = {
            let a = action.lock().unwrap();
            (a.id.clone(), a.backup_manager_id.clone(), a.backup_name.clone())
        };
        let agents = agent_ids
            .iter()
            .map(|id| (id.clone(), AgentProgress::InProgress))
            .collect();
        Arc::new(Self {
            action,
            action_id,
            manager_id,
            backup_name,
            kind,
            pool,
            registry,
            inner: Mutex::new(Inner {
                stage: JobStageName::Preparation,
                agents,
                tracked: agent_ids,
            }),
        })
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn current_stage(&self) -> JobStageName {
        self.inner.lock().unwrap().stage
    }

    pub fn did_finish(&self) -> bool {
        self.current_stage().is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.current_stage() == JobStageName::Complete
    }

    /// Starts the first stage by dispatching preparation to every agent.
    pub fn trigger_current(&self) {
        let inner = self.inner.lock().unwrap();
        self.send_stage_messages(&inner);
    }

    /// Record one agent's stage outcome. Advances the action-level stage
    /// once every tracked agent has reported for the current stage.
    pub fn update_progress(&self, agent_id: &str, success: bool, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stage.is_terminal() {
            debug!(agent_id, "Stage report after terminal stage, ignoring");
            return;
        }
        if !inner.agents.contains_key(agent_id) {
            warn!(agent_id, action_id = %self.action_id, "Stage report from untracked agent");
            return;
        }

        let outcome = if success { AgentProgress::Successful } else { AgentProgress::Failed };
        info!(
            agent_id,
            success,
            stage = inner.stage.as_str(),
            action_id = %self.action_id,
            "Updating agent stage progress"
        );
        self.record_stage_info(inner.stage, agent_id, outcome);
        inner.agents.insert(agent_id.to_string(), outcome);

        if !success {
            let mut a = self.action.lock().unwrap();
            let entry = format!(
                "{{Agent: {} failed at Stage: {}, {}}}",
                agent_id,
                inner.stage.as_str(),
                message
            );
            if a.progress_info.is_empty() {
                a.progress_info = entry;
            } else {
                a.progress_info = format!("{}, {}", a.progress_info, entry);
            }
        }

        self.advance_if_all_reported(&mut inner);
        self.persist_progress(&inner);
    }

    /// A permanently silent agent never blocks advancement: its contribution
    /// becomes Disconnected and counts as reported, and later stages stop
    /// tracking it.
    pub fn handle_agent_disconnecting(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stage.is_terminal() || !inner.agents.contains_key(agent_id) {
            return;
        }
        info!(agent_id, action_id = %self.action_id, "Agent disconnected mid-action");
        self.record_stage_info(inner.stage, agent_id, AgentProgress::Disconnected);
        inner.agents.insert(agent_id.to_string(), AgentProgress::Disconnected);
        inner.tracked.retain(|id| id != agent_id);

        self.advance_if_all_reported(&mut inner);
        self.persist_progress(&inner);
    }

    /// Monitor hook: advance when nothing is in progress, guarding against a
    /// silently-dropped final report.
    pub fn force_advance(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stage.is_terminal() {
            return;
        }
        let idle = inner.agents.values().all(AgentProgress::reported);
        if idle {
            info!(
                stage = inner.stage.as_str(),
                action_id = %self.action_id,
                "No agents in progress, forcing stage advancement"
            );
            self.advance_if_all_reported(&mut inner);
            self.persist_progress(&inner);
        } else {
            let waiting: Vec<&String> = inner
                .agents
                .iter()
                .filter(|(_, p)| !p.reported())
                .map(|(id, _)| id)
                .collect();
            info!(?waiting, stage = inner.stage.as_str(), "Stage waiting for agents");
        }
    }

    /// External failure: drive every agent entry to a terminal outcome and
    /// cancel the fleet without waiting for round-trips.
    pub fn fail(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stage == JobStageName::Failed {
            return;
        }
        let pending: Vec<String> = inner
            .agents
            .iter()
            .filter(|(_, p)| !p.reported())
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in pending {
            self.record_stage_info(inner.stage, &agent_id, AgentProgress::Failed);
            inner.agents.insert(agent_id, AgentProgress::Failed);
        }
        inner.stage = JobStageName::Failed;
        self.send_stage_messages(&inner);
        self.persist_progress(&inner);
    }

    /// Serve the recorded fragment list of the backup under restore to one
    /// agent.
    pub fn handle_dependency_request(&self, agent_id: &str) {
        let fragments = match self.pool.get().ok().and_then(|conn| {
            backup::find_by_name(&conn, &self.manager_id, &self.backup_name).ok().flatten()
        }) {
            Some(backup) => backup.fragments,
            None => {
                warn!(
                    backup = %self.backup_name,
                    "Dependency request for unknown backup"
                );
                return;
            }
        };
        for fragment in fragments {
            self.registry
                .send_to_agent(agent_id, ControlMessage::FragmentListEntry { fragment });
        }
    }

    fn advance_if_all_reported(&self, inner: &mut Inner) {
        if inner.stage.is_terminal() {
            return;
        }
        if !inner.agents.values().all(AgentProgress::reported) {
            return;
        }

        let successful = inner
            .agents
            .values()
            .all(|p| *p == AgentProgress::Successful);
        info!(
            stage = inner.stage.as_str(),
            successful,
            action_id = %self.action_id,
            "Stage finished"
        );

        let next = if !successful {
            JobStageName::Failed
        } else {
            match inner.stage {
                JobStageName::Preparation => JobStageName::Execution,
                JobStageName::Execution => JobStageName::PostAction,
                JobStageName::PostAction => JobStageName::Complete,
                terminal => terminal,
            }
        };

        inner.stage = next;
        if !next.is_terminal() {
            // Fresh progress map for the new stage, tracked agents only.
            inner.agents = inner
                .tracked
                .iter()
                .map(|id| (id.clone(), AgentProgress::InProgress))
                .collect();
        }
        self.send_stage_messages(inner);
    }

    fn send_stage_messages(&self, inner: &Inner) {
        let message = match inner.stage {
            JobStageName::Preparation => ControlMessage::Preparation {
                kind: self.kind,
                backup_name: self.backup_name.clone(),
                fragments: vec![],
            },
            JobStageName::Execution => ControlMessage::Execution { kind: self.kind },
            JobStageName::PostAction => ControlMessage::PostActions { kind: self.kind },
            // Completion releases the agents back to WaitingForAction.
            JobStageName::Complete => ControlMessage::PostActions { kind: self.kind },
            JobStageName::Failed => ControlMessage::Cancel { kind: self.kind },
        };
        for agent_id in &inner.tracked {
            if !self.registry.send_to_agent(agent_id, message.clone()) {
                debug!(agent_id, "Agent unreachable while sending stage message");
            }
        }
    }

    fn record_stage_info(&self, stage: JobStageName, agent_id: &str, outcome: AgentProgress) {
        action::record_agent_stage(
            &self.pool,
            &self.action_id,
            agent_id,
            stage.as_str(),
            outcome.outcome_str(),
        );
    }

    /// Progress is a non-decreasing function of stages completed; persisted
    /// on every update so a crash mid-action leaves an accurate percentage.
    fn persist_progress(&self, inner: &Inner) {
        let computed = match inner.stage {
            JobStageName::Complete => 1.0,
            JobStageName::Failed => self.action.lock().unwrap().progress_percentage,
            stage => {
                let total = inner.agents.len().max(1) as f64;
                let successful = inner
                    .agents
                    .values()
                    .filter(|p| **p == AgentProgress::Successful)
                    .count() as f64;
                let previous = (stage.order() - 1) as f64 / NON_FINAL_STAGES;
                let current = successful / total / NON_FINAL_STAGES;
                ((previous + current) * 100.0).round() / 100.0
            }
        };
        {
            let mut a = self.action.lock().unwrap();
            if computed > a.progress_percentage {
                a.progress_percentage = computed;
            }
        }
        action::persist_shared(&self.pool, &self.action);
    }
}

/// Routes incoming agent messages to the aggregator of the action the agent
/// is currently working on.
pub struct StageRouter {
    routes: DashMap<String, Arc<StageAggregator>>,
}

impl StageRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { routes: DashMap::new() })
    }

    pub fn register(&self, agent_ids: &[String], aggregator: Arc<StageAggregator>) {
        for agent_id in agent_ids {
            self.routes.insert(agent_id.clone(), aggregator.clone());
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<StageAggregator>> {
        self.routes.get(agent_id).map(|e| e.clone())
    }

    pub fn unregister_action(&self, action_id: &str) {
        self.routes.retain(|_, agg| agg.action_id() != action_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionKind, CreateActionRequest};
    use crate::db;
    use crate::registry::AgentConnection;
    use backup_protocol::{ApiVersion, SoftwareVersion};
    use tokio::sync::mpsc;

    fn software_version() -> SoftwareVersion {
        SoftwareVersion {
            product_name: "test".to_string(),
            product_number: "0".to_string(),
            revision: "R1".to_string(),
            production_date: "2026-01-01".to_string(),
            description: String::new(),
        }
    }

    fn registry_with_agents(
        ids: &[&str],
    ) -> (Arc<AgentRegistry>, Vec<mpsc::UnboundedReceiver<ControlMessage>>) {
        let registry = Arc::new(AgentRegistry::new());
        let mut receivers = vec![];
        for id in ids {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register(AgentConnection {
                agent_id: id.to_string(),
                api_version: ApiVersion::V4,
                scope: String::new(),
                software_version: software_version(),
                tx,
            });
            receivers.push(rx);
        }
        (registry, receivers)
    }

    fn aggregator_with(
        ids: &[&str],
    ) -> (
        Arc<StageAggregator>,
        SharedAction,
        Vec<mpsc::UnboundedReceiver<ControlMessage>>,
        crate::db::DbPool,
        tempfile::TempDir,
    ) {
        let (pool, dir) = db::test_pool();
        let (registry, receivers) = registry_with_agents(ids);
        let action = crate::action::shared(Action::new(
            "DEFAULT",
            &CreateActionRequest {
                kind: ActionKind::CreateBackup,
                backup_name: "b1".to_string(),
                scheduled: false,
            },
        ));
        let agg = StageAggregator::new(
            action.clone(),
            pool.clone(),
            registry,
            OperationKind::Backup,
            ids.iter().map(|s| s.to_string()).collect(),
        );
        (agg, action, receivers, pool, dir)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ControlMessage>) -> Vec<ControlMessage> {
        let mut out = vec![];
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_stage_advances_only_after_all_agents_report() {
        let (agg, _action, mut rxs, _pool, _dir) = aggregator_with(&["a1", "a2"]);
        agg.trigger_current();
        assert_eq!(agg.current_stage(), JobStageName::Preparation);

        agg.update_progress("a1", true, "ok");
        assert_eq!(agg.current_stage(), JobStageName::Preparation);

        agg.update_progress("a2", true, "ok");
        assert_eq!(agg.current_stage(), JobStageName::Execution);

        // Both agents got Preparation then Execution.
        for rx in rxs.iter_mut() {
            let msgs = drain(rx);
            assert!(matches!(msgs[0], ControlMessage::Preparation { .. }));
            assert!(matches!(msgs[1], ControlMessage::Execution { .. }));
        }
    }

    #[test]
    fn test_full_backup_cycle_reaches_complete_with_full_progress() {
        let (agg, action, _rxs, _pool, _dir) = aggregator_with(&["a1"]);
        agg.trigger_current();

        agg.update_progress("a1", true, "prepared");
        assert_eq!(agg.current_stage(), JobStageName::Execution);
        agg.update_progress("a1", true, "executed");
        assert_eq!(agg.current_stage(), JobStageName::PostAction);
        agg.update_progress("a1", true, "post done");

        assert_eq!(agg.current_stage(), JobStageName::Complete);
        assert!(agg.did_finish());
        assert!(agg.is_successful());
        assert!((action.lock().unwrap().progress_percentage - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disconnect_does_not_block_advancement() {
        let (agg, _action, _rxs, _pool, _dir) = aggregator_with(&["a1", "a2", "a3"]);
        agg.trigger_current();

        agg.handle_agent_disconnecting("a2");
        assert_eq!(agg.current_stage(), JobStageName::Preparation);

        agg.update_progress("a1", true, "ok");
        agg.update_progress("a3", true, "ok");

        // All reported; the stage advanced (into Failed, because one
        // contribution is Disconnected) instead of waiting forever.
        assert!(agg.did_finish());
        assert!(!agg.is_successful());
    }

    #[test]
    fn test_failed_report_routes_to_failed_stage_and_cancels() {
        let (agg, action, mut rxs, _pool, _dir) = aggregator_with(&["a1", "a2"]);
        agg.trigger_current();

        agg.update_progress("a1", false, "disk full");
        agg.update_progress("a2", true, "ok");

        assert_eq!(agg.current_stage(), JobStageName::Failed);
        assert!(action.lock().unwrap().progress_info.contains("disk full"));
        let msgs = drain(&mut rxs[0]);
        assert!(matches!(msgs.last(), Some(ControlMessage::Cancel { .. })));
    }

    #[test]
    fn test_progress_is_monotone() {
        let (agg, action, _rxs, _pool, _dir) = aggregator_with(&["a1", "a2"]);
        agg.trigger_current();

        let mut last = 0.0;
        agg.update_progress("a1", true, "ok");
        for _ in 0..1 {
            let p = action.lock().unwrap().progress_percentage;
            assert!(p >= last);
            last = p;
        }
        agg.update_progress("a2", true, "ok");
        let p = action.lock().unwrap().progress_percentage;
        assert!(p >= last, "progress decreased: {p} < {last}");
        // One stage of three completed.
        assert!((p - 0.33).abs() < 0.01);
    }

    #[test]
    fn test_external_fail_forces_terminal_outcomes() {
        let (agg, _action, mut rxs, _pool, _dir) = aggregator_with(&["a1", "a2"]);
        agg.trigger_current();
        agg.update_progress("a1", true, "ok");

        agg.fail();
        assert_eq!(agg.current_stage(), JobStageName::Failed);
        assert!(agg.did_finish());
        let msgs = drain(&mut rxs[1]);
        assert!(matches!(msgs.last(), Some(ControlMessage::Cancel { .. })));
    }

    #[test]
    fn test_force_advance_when_idle() {
        let (agg, _action, _rxs, _pool, _dir) = aggregator_with(&[]);
        // No agents tracked at all: the monitor can still push the stage
        // forward instead of hanging the job.
        agg.force_advance();
        assert_eq!(agg.current_stage(), JobStageName::Execution);
    }

    #[test]
    fn test_router_routes_and_unregisters() {
        let (agg, _action, _rxs, _pool, _dir) = aggregator_with(&["a1"]);
        let router = StageRouter::new();
        router.register(&["a1".to_string()], agg.clone());
        assert!(router.get("a1").is_some());
        router.unregister_action(agg.action_id());
        assert!(router.get("a1").is_none());
    }
}
