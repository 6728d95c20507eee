//! Per-action lifecycle state machine.
//!
//! The machine is driven exclusively by control messages from the
//! orchestrator plus the local `finish_action` signal. Transitions follow a
//! closed table; entry effects (behavior hooks, stage-complete reports) run
//! once on entry to a *new* state, never when a duplicate message re-selects
//! the current state.

use std::sync::Arc;

use backup_protocol::{ControlMessage, Fragment, OperationKind, StageComplete};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::behavior::{ActionContext, AgentBehavior, StageReporter};

/// Lifecycle states of the action currently assigned to this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    WaitingForAction,
    BackupPreparation,
    BackupExecution,
    PostBackup,
    RestorePreparation,
    RestoreExecution,
    RestorePostAction,
    CancelAction,
    FinishedAction,
}

pub struct AgentStateMachine {
    agent_id: String,
    behavior: Arc<dyn AgentBehavior>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
    state: AgentState,
    kind: OperationKind,
    ctx: ActionContext,
}

impl AgentStateMachine {
    pub fn new(
        behavior: Arc<dyn AgentBehavior>,
        outbound: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        let agent_id = behavior.registration().agent_id;
        Self {
            agent_id,
            behavior,
            outbound,
            state: AgentState::WaitingForAction,
            kind: OperationKind::Backup,
            ctx: ActionContext::default(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Discards any in-flight action state. Used when the control channel is
    /// re-established: reconnection is an explicit cancel-and-restart, never
    /// a resume.
    pub fn reset(&mut self) {
        if self.state != AgentState::WaitingForAction {
            info!(state = ?self.state, "Discarding in-flight action state on channel reset");
        }
        self.state = AgentState::WaitingForAction;
        self.ctx = ActionContext::default();
    }

    /// Applies one control message from the orchestrator.
    pub async fn process(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Preparation { kind, backup_name, fragments } => {
                self.on_preparation(kind, backup_name, fragments).await;
            }
            ControlMessage::Execution { .. } => self.on_execution().await,
            ControlMessage::PostActions { .. } => self.on_post_actions().await,
            ControlMessage::Cancel { .. } => self.on_cancel().await,
            ControlMessage::FragmentListEntry { fragment } => self.on_fragment(fragment),
            other => {
                debug!(message = ?other, "No transition for message, ignoring");
            }
        }
    }

    async fn on_preparation(
        &mut self,
        kind: OperationKind,
        backup_name: String,
        fragments: Vec<Fragment>,
    ) {
        match self.state {
            // A fresh dispatch, or a new cycle after a finished/post stage.
            AgentState::WaitingForAction
            | AgentState::FinishedAction
            | AgentState::PostBackup
            | AgentState::RestorePostAction => {
                self.kind = kind;
                self.ctx = ActionContext { backup_name, fragments };
                let next = match kind {
                    OperationKind::Backup => AgentState::BackupPreparation,
                    OperationKind::Restore => AgentState::RestorePreparation,
                };
                self.enter(next).await;
            }
            _ => debug!(state = ?self.state, "Preparation ignored in current state"),
        }
    }

    async fn on_execution(&mut self) {
        match self.state {
            AgentState::BackupPreparation => self.enter(AgentState::BackupExecution).await,
            AgentState::RestorePreparation => self.enter(AgentState::RestoreExecution).await,
            // Re-triggering a running execution is safe and does nothing.
            AgentState::BackupExecution | AgentState::RestoreExecution => {}
            _ => debug!(state = ?self.state, "Execution ignored in current state"),
        }
    }

    async fn on_post_actions(&mut self) {
        match self.state {
            AgentState::BackupExecution => self.enter(AgentState::PostBackup).await,
            AgentState::RestoreExecution => self.enter(AgentState::RestorePostAction).await,
            // Post-actions before execution skips execution entirely; after a
            // post stage or a finished action it closes the cycle.
            AgentState::BackupPreparation
            | AgentState::RestorePreparation
            | AgentState::PostBackup
            | AgentState::RestorePostAction
            | AgentState::FinishedAction => self.state = AgentState::WaitingForAction,
            AgentState::WaitingForAction | AgentState::CancelAction => {
                debug!(state = ?self.state, "Post-actions ignored in current state");
            }
        }
    }

    async fn on_cancel(&mut self) {
        match self.state {
            AgentState::BackupPreparation
            | AgentState::BackupExecution
            | AgentState::RestorePreparation
            | AgentState::RestoreExecution
            | AgentState::FinishedAction => self.enter(AgentState::CancelAction).await,
            // Cancelling a completed-but-unacknowledged cycle just releases it.
            AgentState::PostBackup | AgentState::RestorePostAction => {
                self.state = AgentState::WaitingForAction;
            }
            AgentState::CancelAction => {}
            AgentState::WaitingForAction => {
                debug!("Cancel ignored, no action in progress");
            }
        }
    }

    fn on_fragment(&mut self, fragment: Fragment) {
        // Fragments accumulate silently during restore preparation; no
        // re-trigger, the preparation hook already ran.
        if self.state == AgentState::RestorePreparation {
            debug!(fragment_id = %fragment.fragment_id, "Collected restore fragment");
            self.ctx.fragments.push(fragment);
        } else {
            debug!(state = ?self.state, "Fragment entry ignored in current state");
        }
    }

    /// Finishes the current action locally. From an active stage this
    /// reports a failed stage-complete (the action did not run to a clean
    /// end); from cancellation it runs the cancel hook and goes quiet.
    pub async fn finish_action(&mut self) {
        match self.state {
            AgentState::WaitingForAction | AgentState::FinishedAction => {}
            AgentState::CancelAction => {
                if let Err(e) = self.behavior.on_cancel(&self.ctx).await {
                    warn!("Cancel hook failed: {e:#}");
                    self.send_stage_complete(false, format!("{e:#}"));
                }
                self.state = AgentState::WaitingForAction;
            }
            _ => {
                self.send_stage_complete(false, "Action finished before completion".to_string());
                self.state = AgentState::FinishedAction;
            }
        }
    }

    async fn enter(&mut self, next: AgentState) {
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
        self.trigger().await;
    }

    /// Entry effect of the current state. Only preparation, execution and
    /// cancel states report a stage-complete on their own; post-action
    /// states hand the behavior a reporter and stay silent otherwise.
    async fn trigger(&mut self) {
        match self.state {
            AgentState::BackupPreparation => {
                let result = self.behavior.prepare_backup(&self.ctx).await;
                self.send_stage_result(result);
            }
            AgentState::BackupExecution => {
                let result = self.behavior.execute_backup(&self.ctx).await;
                self.send_stage_result(result);
            }
            AgentState::PostBackup => {
                let reporter = self.reporter();
                if let Err(e) = self.behavior.post_backup(&self.ctx, &reporter).await {
                    self.send_stage_complete(false, format!("{e:#}"));
                }
            }
            AgentState::RestorePreparation => {
                if self.ctx.fragments.is_empty() {
                    self.send(ControlMessage::RequestDependencies {
                        agent_id: self.agent_id.clone(),
                    });
                }
                let result = self.behavior.prepare_restore(&self.ctx).await;
                self.send_stage_result(result);
            }
            AgentState::RestoreExecution => {
                let result = self.behavior.execute_restore(&self.ctx).await;
                self.send_stage_result(result);
            }
            AgentState::RestorePostAction => {
                let reporter = self.reporter();
                if let Err(e) = self.behavior.post_restore(&self.ctx, &reporter).await {
                    self.send_stage_complete(false, format!("{e:#}"));
                }
            }
            AgentState::CancelAction => {
                self.send_stage_complete(true, "action cancelled".to_string());
            }
            AgentState::WaitingForAction | AgentState::FinishedAction => {}
        }
    }

    fn reporter(&self) -> StageReporter {
        StageReporter::new(self.agent_id.clone(), self.kind, self.outbound.clone())
    }

    fn send_stage_result(&self, result: anyhow::Result<String>) {
        match result {
            Ok(message) => self.send_stage_complete(true, message),
            // Hook failures become failed stage reports, never stream errors.
            Err(e) => self.send_stage_complete(false, format!("{e:#}")),
        }
    }

    fn send_stage_complete(&self, success: bool, message: String) {
        self.send(ControlMessage::StageComplete {
            kind: self.kind,
            payload: StageComplete {
                agent_id: self.agent_id.clone(),
                success,
                message,
            },
        });
    }

    fn send(&self, message: ControlMessage) {
        if self.outbound.send(message).is_err() {
            warn!("Control channel closed, dropping outbound message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backup_protocol::SoftwareVersion;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBehavior {
        calls: Mutex<Vec<String>>,
        fail_prepare: AtomicBool,
        report_from_post: AtomicBool,
        seen_fragments: Mutex<usize>,
    }

    impl RecordingBehavior {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentBehavior for RecordingBehavior {
        fn registration(&self) -> crate::behavior::RegistrationInfo {
            crate::behavior::RegistrationInfo {
                agent_id: "test-agent".to_string(),
                scope: String::new(),
                software_version: SoftwareVersion {
                    product_name: "test".to_string(),
                    product_number: "0".to_string(),
                    revision: "R1".to_string(),
                    production_date: "2026-01-01".to_string(),
                    description: String::new(),
                },
            }
        }

        async fn prepare_backup(&self, _ctx: &ActionContext) -> anyhow::Result<String> {
            self.record("prepare_backup");
            if self.fail_prepare.load(Ordering::SeqCst) {
                anyhow::bail!("prepare exploded");
            }
            Ok("prepared".to_string())
        }

        async fn execute_backup(&self, _ctx: &ActionContext) -> anyhow::Result<String> {
            self.record("execute_backup");
            Ok("backed up".to_string())
        }

        async fn post_backup(
            &self,
            _ctx: &ActionContext,
            reporter: &StageReporter,
        ) -> anyhow::Result<()> {
            self.record("post_backup");
            if self.report_from_post.load(Ordering::SeqCst) {
                reporter.stage_complete(true, "post done");
            }
            Ok(())
        }

        async fn prepare_restore(&self, _ctx: &ActionContext) -> anyhow::Result<String> {
            self.record("prepare_restore");
            Ok("ready".to_string())
        }

        async fn execute_restore(&self, ctx: &ActionContext) -> anyhow::Result<String> {
            self.record("execute_restore");
            *self.seen_fragments.lock().unwrap() = ctx.fragments.len();
            Ok("restored".to_string())
        }

        async fn post_restore(
            &self,
            _ctx: &ActionContext,
            _reporter: &StageReporter,
        ) -> anyhow::Result<()> {
            self.record("post_restore");
            Ok(())
        }

        async fn on_cancel(&self, _ctx: &ActionContext) -> anyhow::Result<()> {
            self.record("on_cancel");
            Ok(())
        }
    }

    fn machine() -> (
        AgentStateMachine,
        Arc<RecordingBehavior>,
        mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let behavior = Arc::new(RecordingBehavior::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentStateMachine::new(behavior.clone(), tx), behavior, rx)
    }

    fn preparation(kind: OperationKind) -> ControlMessage {
        ControlMessage::Preparation {
            kind,
            backup_name: "b1".to_string(),
            fragments: vec![],
        }
    }

    fn next_stage_complete(rx: &mut mpsc::UnboundedReceiver<ControlMessage>) -> StageComplete {
        loop {
            match rx.try_recv().expect("expected an outbound message") {
                ControlMessage::StageComplete { payload, .. } => return payload,
                _ => continue,
            }
        }
    }

    fn assert_no_outbound(rx: &mut mpsc::UnboundedReceiver<ControlMessage>) {
        assert!(rx.try_recv().is_err(), "expected no outbound message");
    }

    #[tokio::test]
    async fn test_backup_cycle_follows_transition_table() {
        let (mut m, behavior, mut rx) = machine();

        m.process(preparation(OperationKind::Backup)).await;
        assert_eq!(m.state(), AgentState::BackupPreparation);
        let sc = next_stage_complete(&mut rx);
        assert!(sc.success);
        assert_eq!(sc.message, "prepared");

        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::BackupExecution);
        assert!(next_stage_complete(&mut rx).success);

        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::PostBackup);
        // Post-action stage does not report unless the hook does.
        assert_no_outbound(&mut rx);

        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::WaitingForAction);

        assert_eq!(
            behavior.calls(),
            vec!["prepare_backup", "execute_backup", "post_backup"]
        );
    }

    #[tokio::test]
    async fn test_prepare_failure_reports_failed_stage() {
        let (mut m, behavior, mut rx) = machine();
        behavior.fail_prepare.store(true, Ordering::SeqCst);

        m.process(preparation(OperationKind::Backup)).await;
        assert_eq!(m.state(), AgentState::BackupPreparation);
        let sc = next_stage_complete(&mut rx);
        assert!(!sc.success);
        assert!(sc.message.contains("prepare exploded"));
    }

    #[tokio::test]
    async fn test_post_hook_can_report_explicitly() {
        let (mut m, behavior, mut rx) = machine();
        behavior.report_from_post.store(true, Ordering::SeqCst);

        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        next_stage_complete(&mut rx);
        next_stage_complete(&mut rx);

        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        let sc = next_stage_complete(&mut rx);
        assert!(sc.success);
        assert_eq!(sc.message, "post done");
    }

    #[tokio::test]
    async fn test_execution_retrigger_is_idempotent() {
        let (mut m, behavior, mut rx) = machine();

        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;

        assert_eq!(m.state(), AgentState::BackupExecution);
        let executions = behavior
            .calls()
            .iter()
            .filter(|c| c.as_str() == "execute_backup")
            .count();
        assert_eq!(executions, 1);
        next_stage_complete(&mut rx);
        next_stage_complete(&mut rx);
        assert_no_outbound(&mut rx);
    }

    #[tokio::test]
    async fn test_post_actions_before_execution_skips_to_waiting() {
        let (mut m, _, _rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::WaitingForAction);
    }

    #[tokio::test]
    async fn test_cancel_from_active_states() {
        for setup in [
            vec![preparation(OperationKind::Backup)],
            vec![
                preparation(OperationKind::Backup),
                ControlMessage::Execution { kind: OperationKind::Backup },
            ],
            vec![preparation(OperationKind::Restore)],
            vec![
                preparation(OperationKind::Restore),
                ControlMessage::Execution { kind: OperationKind::Restore },
            ],
        ] {
            let (mut m, _, _rx) = machine();
            for msg in setup {
                m.process(msg).await;
            }
            m.process(ControlMessage::Cancel { kind: OperationKind::Backup }).await;
            assert_eq!(m.state(), AgentState::CancelAction);
        }
    }

    #[tokio::test]
    async fn test_cancel_from_post_stage_returns_to_waiting() {
        let (mut m, _, _rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::PostBackup);

        m.process(ControlMessage::Cancel { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::WaitingForAction);
    }

    #[tokio::test]
    async fn test_cancelled_restore_never_reaches_post_action() {
        let (mut m, behavior, mut rx) = machine();
        m.process(preparation(OperationKind::Restore)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Restore }).await;
        assert_eq!(m.state(), AgentState::RestoreExecution);

        m.process(ControlMessage::Cancel { kind: OperationKind::Restore }).await;
        assert_eq!(m.state(), AgentState::CancelAction);

        // A late post-actions message must not revive the restore.
        m.process(ControlMessage::PostActions { kind: OperationKind::Restore }).await;
        assert_eq!(m.state(), AgentState::CancelAction);
        assert!(!behavior.calls().contains(&"post_restore".to_string()));

        m.finish_action().await;
        assert_eq!(m.state(), AgentState::WaitingForAction);
        assert!(behavior.calls().contains(&"on_cancel".to_string()));

        // Entry to CancelAction reported; finish from CancelAction did not.
        let mut reports = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let ControlMessage::StageComplete { payload, .. } = msg {
                reports.push(payload);
            }
        }
        assert!(reports.last().unwrap().message.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_finish_action_from_active_state_reports_failure() {
        let (mut m, _, mut rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        next_stage_complete(&mut rx);

        m.finish_action().await;
        assert_eq!(m.state(), AgentState::FinishedAction);
        let sc = next_stage_complete(&mut rx);
        assert!(!sc.success);

        // Finishing again stays put and stays silent.
        m.finish_action().await;
        assert_eq!(m.state(), AgentState::FinishedAction);
        assert_no_outbound(&mut rx);
    }

    #[tokio::test]
    async fn test_finish_action_from_waiting_is_a_no_op() {
        let (mut m, _, mut rx) = machine();
        m.finish_action().await;
        assert_eq!(m.state(), AgentState::WaitingForAction);
        assert_no_outbound(&mut rx);
    }

    #[tokio::test]
    async fn test_finished_action_redispatches_on_preparation() {
        let (mut m, _, _rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        m.finish_action().await;
        assert_eq!(m.state(), AgentState::FinishedAction);

        m.process(preparation(OperationKind::Restore)).await;
        assert_eq!(m.state(), AgentState::RestorePreparation);
    }

    #[tokio::test]
    async fn test_restore_fragments_accumulate_without_retrigger() {
        let (mut m, behavior, mut rx) = machine();
        m.process(preparation(OperationKind::Restore)).await;
        assert_eq!(m.state(), AgentState::RestorePreparation);

        // Empty fragment list on preparation asks for the dependency list.
        match rx.try_recv().unwrap() {
            ControlMessage::RequestDependencies { agent_id } => {
                assert_eq!(agent_id, "test-agent");
            }
            other => panic!("expected dependency request, got {other:?}"),
        }
        next_stage_complete(&mut rx);

        for i in 0..2 {
            m.process(ControlMessage::FragmentListEntry {
                fragment: Fragment {
                    fragment_id: format!("f{i}"),
                    version: "1".to_string(),
                    size_in_bytes: 64,
                },
            })
            .await;
        }
        assert_eq!(m.state(), AgentState::RestorePreparation);
        let prepares = behavior
            .calls()
            .iter()
            .filter(|c| c.as_str() == "prepare_restore")
            .count();
        assert_eq!(prepares, 1);

        m.process(ControlMessage::Execution { kind: OperationKind::Restore }).await;
        assert_eq!(*behavior.seen_fragments.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_post_backup_starts_new_cycle_on_preparation() {
        let (mut m, _, _rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        m.process(ControlMessage::PostActions { kind: OperationKind::Backup }).await;
        assert_eq!(m.state(), AgentState::PostBackup);

        m.process(preparation(OperationKind::Backup)).await;
        assert_eq!(m.state(), AgentState::BackupPreparation);
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_action() {
        let (mut m, _, _rx) = machine();
        m.process(preparation(OperationKind::Backup)).await;
        m.process(ControlMessage::Execution { kind: OperationKind::Backup }).await;
        m.reset();
        assert_eq!(m.state(), AgentState::WaitingForAction);
    }
}
