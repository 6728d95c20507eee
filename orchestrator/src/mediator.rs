//! External collaborators: the configuration mediator and the event bus.
//!
//! Both are fire-and-forget from the job engine's perspective — a failure
//! here is logged and never fails the job.

use crate::action::Action;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Seam to the external configuration system. The engine pushes progress
/// reports as actions mutate and asks for a derived-configuration reset
/// after every job completion or failure.
pub trait CmMediator: Send + Sync {
    fn enqueue_progress_report(&self, action: &Action);

    /// Asynchronously reset derived configuration state. `validate_config`
    /// asks the mediator to skip the reset when the configuration is already
    /// present.
    fn reset_cm(&self, validate_config: bool);
}

/// Default mediator: logs and mirrors progress onto the event bus.
pub struct LoggingMediator {
    events: EventBroadcaster,
}

impl LoggingMediator {
    pub fn new(events: EventBroadcaster) -> Self {
        Self { events }
    }
}

impl CmMediator for LoggingMediator {
    fn enqueue_progress_report(&self, action: &Action) {
        debug!(
            action_id = %action.id,
            progress = action.progress_percentage,
            "Progress report enqueued"
        );
        self.events.broadcast(
            "action:progress",
            serde_json::json!({
                "actionId": action.id,
                "backupManagerId": action.backup_manager_id,
                "kind": action.kind,
                "progressPercentage": action.progress_percentage,
            }),
        );
    }

    fn reset_cm(&self, validate_config: bool) {
        debug!(validate_config, "Configuration reset requested");
    }
}

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

/// Broadcast bus for action/agent lifecycle events. Subscribers come and go;
/// broadcasting with no receiver is not an error.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn broadcast(&self, event: &str, payload: Value) {
        let msg = serde_json::json!({ "type": event, "payload": payload }).to_string();
        if let Err(e) = self.tx.send(msg) {
            debug!("No event subscribers: {e}");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion notifications ride the same bus; a send failure is logged and
/// swallowed so notification problems can never fail an action.
pub fn notify_action_completed(events: &EventBroadcaster, action: &Action) {
    let payload = match serde_json::to_value(action) {
        Ok(v) => v,
        Err(e) => {
            warn!(action_id = %action.id, "Failed to serialize completion notification: {e}");
            return;
        }
    };
    events.broadcast("action:completed", payload);
}
