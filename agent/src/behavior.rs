//! The hook seam between the action state machine and application code.
//!
//! An application embeds this crate, implements [`AgentBehavior`] for its
//! own data, and hands the implementation to [`crate::client::AgentClient`].
//! The state machine calls the hooks as control messages arrive; the hooks
//! never talk to the stream directly except through the [`StageReporter`]
//! given to the post-action hooks.

use async_trait::async_trait;
use backup_protocol::{ControlMessage, Fragment, OperationKind, SoftwareVersion, StageComplete};
use tokio::sync::mpsc;

/// Identity an agent declares when registering.
#[derive(Debug, Clone)]
pub struct RegistrationInfo {
    pub agent_id: String,
    /// Backup-manager scope; empty means the default manager.
    pub scope: String,
    pub software_version: SoftwareVersion,
}

/// Context of the action currently assigned to this agent.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub backup_name: String,
    /// Fragment list collected during restore preparation; empty for backups.
    pub fragments: Vec<Fragment>,
}

/// Handle for sending a stage-complete report from inside a post-action
/// hook. Preparation, execution and cancel stages report automatically; the
/// post-action stages only report when the hook decides to.
#[derive(Clone)]
pub struct StageReporter {
    agent_id: String,
    kind: OperationKind,
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl StageReporter {
    pub(crate) fn new(
        agent_id: String,
        kind: OperationKind,
        outbound: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self { agent_id, kind, outbound }
    }

    pub fn stage_complete(&self, success: bool, message: impl Into<String>) {
        let msg = ControlMessage::StageComplete {
            kind: self.kind,
            payload: StageComplete {
                agent_id: self.agent_id.clone(),
                success,
                message: message.into(),
            },
        };
        if self.outbound.send(msg).is_err() {
            tracing::warn!("Control channel closed, dropping stage-complete report");
        }
    }
}

/// Application hooks for each lifecycle stage.
///
/// Hooks returning `Ok(message)` produce a successful stage-complete with
/// that message; an `Err` is absorbed by the state machine and reported as a
/// failed stage-complete. A hook error never tears down the control stream.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn registration(&self) -> RegistrationInfo;

    async fn prepare_backup(&self, ctx: &ActionContext) -> anyhow::Result<String>;

    async fn execute_backup(&self, ctx: &ActionContext) -> anyhow::Result<String>;

    /// Runs after backup execution. Report through `reporter` if the
    /// orchestrator should hear about it; staying silent is valid.
    async fn post_backup(&self, ctx: &ActionContext, reporter: &StageReporter)
        -> anyhow::Result<()>;

    async fn prepare_restore(&self, ctx: &ActionContext) -> anyhow::Result<String>;

    async fn execute_restore(&self, ctx: &ActionContext) -> anyhow::Result<String>;

    async fn post_restore(&self, ctx: &ActionContext, reporter: &StageReporter)
        -> anyhow::Result<()>;

    /// Called when a cancelled action is being finished off locally.
    async fn on_cancel(&self, ctx: &ActionContext) -> anyhow::Result<()>;
}
