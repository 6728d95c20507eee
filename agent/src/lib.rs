//! Agent-side half of the backup/restore control protocol.
//!
//! Applications embed this crate: implement [`behavior::AgentBehavior`] for
//! the data you own, then run [`client::AgentClient`] against the
//! orchestrator. The crate owns the action state machine, the registration
//! handshake (including API-version downgrade) and reconnection.

pub mod behavior;
pub mod client;
pub mod config;
pub mod state;

pub use behavior::{ActionContext, AgentBehavior, RegistrationInfo, StageReporter};
pub use client::AgentClient;
pub use state::{AgentState, AgentStateMachine};
