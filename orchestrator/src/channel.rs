//! Orchestrator side of the per-agent control channel.
//!
//! One WebSocket per agent. The socket task registers the agent on its
//! Register message, then routes stage reports and dependency requests to
//! the aggregator of whatever action the agent is currently part of. Socket
//! teardown is an agent-disconnect event, which the aggregator absorbs
//! rather than waiting on a silent peer.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use backup_protocol::{ControlMessage, RegistrationError};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::registry::AgentConnection;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    let mut agent_id: Option<String> = None;

    // Forward outgoing control messages to the agent.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Failed to serialize control message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: ControlMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Unparseable agent message: {e} (raw: {text})");
                continue;
            }
        };

        match parsed {
            ControlMessage::Register(register) => {
                if register.agent_id.is_empty() {
                    let _ = tx.send(ControlMessage::RegisterError {
                        error: RegistrationError::Rejected("agent_id is required".to_string()),
                    });
                    continue;
                }
                // Downgrade dance: an agent declaring a newer version than
                // this orchestrator speaks is told to step down.
                if register.api_version > state.config.max_api_version {
                    warn!(
                        agent_id = %register.agent_id,
                        version = %register.api_version,
                        "Rejecting registration with unsupported API version"
                    );
                    let _ = tx.send(ControlMessage::RegisterError {
                        error: RegistrationError::UnsupportedApiVersion,
                    });
                    continue;
                }

                // Re-registration on a live channel is fine; the retry loop
                // on the agent side stops at the first acknowledgement.
                let manager = state.managers.ensure_for_scope(&register.scope);
                info!(
                    agent_id = %register.agent_id,
                    api_version = %register.api_version,
                    scope = %register.scope,
                    manager_id = %manager.id,
                    "Agent registered"
                );
                state.agents.register(AgentConnection {
                    agent_id: register.agent_id.clone(),
                    api_version: register.api_version,
                    scope: register.scope.clone(),
                    software_version: register.software_version.clone(),
                    tx: tx.clone(),
                });
                agent_id = Some(register.agent_id.clone());

                let _ = tx.send(ControlMessage::RegisterAck {
                    message: format!("Registered {}", register.agent_id),
                });
                state.events.broadcast(
                    "agent:connected",
                    serde_json::json!({
                        "agentId": register.agent_id,
                        "apiVersion": register.api_version,
                        "scope": register.scope,
                    }),
                );
            }

            ControlMessage::StageComplete { payload, .. } => {
                match state.router.get(&payload.agent_id) {
                    Some(aggregator) => {
                        // Aggregator mutation is synchronous and touches the
                        // database; keep it off the socket task's reactor.
                        let report = payload.clone();
                        let _ = tokio::task::spawn_blocking(move || {
                            aggregator.update_progress(
                                &report.agent_id,
                                report.success,
                                &report.message,
                            );
                        })
                        .await;
                    }
                    None => {
                        warn!(
                            agent_id = %payload.agent_id,
                            "Stage report with no action in progress"
                        );
                    }
                }
            }

            ControlMessage::RequestDependencies { agent_id } => {
                if let Some(aggregator) = state.router.get(&agent_id) {
                    let _ = tokio::task::spawn_blocking(move || {
                        aggregator.handle_dependency_request(&agent_id);
                    })
                    .await;
                }
            }

            other => {
                warn!(message = ?other, "Unexpected message on agent channel");
            }
        }
    }

    // Cleanup on disconnect.
    if let Some(id) = agent_id {
        info!(agent_id = %id, "Agent disconnected");
        state.agents.unregister(&id);
        if let Some(aggregator) = state.router.get(&id) {
            let agent = id.clone();
            let _ = tokio::task::spawn_blocking(move || {
                aggregator.handle_agent_disconnecting(&agent);
            })
            .await;
        }
        state
            .events
            .broadcast("agent:disconnected", serde_json::json!({ "agentId": id }));
    }

    send_task.abort();
}
