//! Control-channel client — connects to the orchestrator.
//!
//! The agent initiates and maintains one persistent WebSocket connection to
//! the orchestrator at `ws://{orchestrator_url}/ws/agent`. Every connection
//! starts from a clean WaitingForAction state (reconnection is a
//! cancel-and-restart, not a resume) and opens with the registration
//! handshake:
//! - Register is re-sent on a fixed cadence until the orchestrator answers;
//!   `seconds_to_retry_ack = 0` disables the retry (send-once).
//! - Any non-error message from the orchestrator counts as acceptance and
//!   stops the retry.
//! - An unsupported-API-version error downgrades the declared version one
//!   step and re-registers immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backup_protocol::{ApiVersion, ControlMessage, Register, RegistrationError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::behavior::AgentBehavior;
use crate::config::AgentConfig;
use crate::state::AgentStateMachine;

pub struct AgentClient {
    config: AgentConfig,
    behavior: Arc<dyn AgentBehavior>,
    shutdown: CancellationToken,
    api_version: ApiVersion,
}

impl AgentClient {
    pub fn new(
        config: AgentConfig,
        behavior: Arc<dyn AgentBehavior>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            behavior,
            shutdown,
            api_version: ApiVersion::latest(),
        }
    }

    /// Runs the client with automatic reconnection. The declared API version
    /// survives reconnects, so a downgraded agent stays downgraded.
    pub async fn run(&mut self) {
        let mut backoff_ms: u64 = 1000;
        let max_backoff_ms: u64 = 30000;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Control-channel client shutting down");
                return;
            }

            match self.connect_and_run().await {
                Ok(()) => {
                    info!("Control channel closed normally");
                    backoff_ms = 1000;
                }
                Err(e) => {
                    warn!("Control channel error: {e:#}");
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            info!("Reconnecting in {}ms...", backoff_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = self.shutdown.cancelled() => return,
            }

            backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
        }
    }

    fn register_message(&self) -> ControlMessage {
        let info = self.behavior.registration();
        ControlMessage::Register(Register {
            agent_id: info.agent_id,
            api_version: self.api_version,
            scope: info.scope,
            software_version: info.software_version,
        })
    }

    async fn connect_and_run(&mut self) -> anyhow::Result<()> {
        let ws_url = self
            .config
            .orchestrator_url
            .replace("http://", "ws://")
            .replace("https://", "wss://");
        let url = format!("{}/ws/agent", ws_url.trim_end_matches('/'));

        info!("Connecting to orchestrator control channel: {}", url);
        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        info!("Control channel established");

        // Fresh machine per connection: any action in flight when the stream
        // dropped is abandoned, never resumed.
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let mut machine = AgentStateMachine::new(self.behavior.clone(), outbound_tx);

        let json = serde_json::to_string(&self.register_message())
            .context("serialize registration")?;
        write.send(Message::Text(json.into())).await?;
        info!(api_version = %self.api_version, "Registration message sent");

        let retry_secs = self.config.seconds_to_retry_ack;
        let mut awaiting_ack = true;

        loop {
            // The timer restarts every pass, so the registration is re-sent
            // only after a full quiet interval with no acknowledgement.
            let retry_timer = tokio::time::sleep(Duration::from_secs(retry_secs.max(1)));
            tokio::pin!(retry_timer);

            tokio::select! {
                _ = &mut retry_timer, if awaiting_ack && retry_secs > 0 => {
                    warn!("No response from orchestrator, re-sending registration");
                    let json = serde_json::to_string(&self.register_message())?;
                    write.send(Message::Text(json.into())).await?;
                }

                outgoing = outbound_rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    let json = serde_json::to_string(&msg)?;
                    if write.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let msg: ControlMessage = match serde_json::from_str(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    warn!("Unparseable control message: {e} (raw: {text})");
                                    continue;
                                }
                            };
                            match msg {
                                ControlMessage::RegisterAck { message } => {
                                    info!("Registration acknowledged: {message}");
                                    awaiting_ack = false;
                                }
                                ControlMessage::RegisterError {
                                    error: RegistrationError::UnsupportedApiVersion,
                                } => {
                                    let Some(older) = self.api_version.downgrade() else {
                                        anyhow::bail!(
                                            "Orchestrator rejected API version {} and no older \
                                             version is available",
                                            self.api_version
                                        );
                                    };
                                    warn!(
                                        "API version {} unsupported, downgrading to {}",
                                        self.api_version, older
                                    );
                                    self.api_version = older;
                                    let json = serde_json::to_string(&self.register_message())?;
                                    write.send(Message::Text(json.into())).await?;
                                    awaiting_ack = true;
                                }
                                ControlMessage::RegisterError {
                                    error: RegistrationError::Rejected(reason),
                                } => {
                                    anyhow::bail!("Registration rejected: {reason}");
                                }
                                other => {
                                    // The orchestrator is clearly talking to
                                    // us; an explicit ack is no longer owed.
                                    awaiting_ack = false;
                                    machine.process(other).await;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Orchestrator closed the control channel");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("Control channel read error: {e}");
                            return Err(e.into());
                        }
                        _ => {}
                    }
                }

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, closing control channel");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        machine.reset();
        Ok(())
    }
}
