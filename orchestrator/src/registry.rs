//! Registry of connected agents and their outbound control-channel senders.

use backup_protocol::{ApiVersion, ControlMessage, SoftwareVersion};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct AgentConnection {
    pub agent_id: String,
    pub api_version: ApiVersion,
    pub scope: String,
    pub software_version: SoftwareVersion,
    pub tx: mpsc::UnboundedSender<ControlMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub api_version: ApiVersion,
    pub scope: String,
}

pub struct AgentRegistry {
    agents: DashMap<String, AgentConnection>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: DashMap::new() }
    }

    pub fn register(&self, connection: AgentConnection) {
        // A re-registering agent replaces its old connection; dropping the
        // old sender closes the stale socket task.
        if let Some((_, old)) = self.agents.remove(&connection.agent_id) {
            drop(old);
        }
        self.agents.insert(connection.agent_id.clone(), connection);
    }

    pub fn unregister(&self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Agents participating in the given backup manager. An agent with an
    /// empty scope participates in the default manager only.
    pub fn agents_in_scope(&self, manager_id: &str) -> Vec<String> {
        self.agents
            .iter()
            .filter(|entry| {
                let scope = &entry.value().scope;
                if scope.is_empty() {
                    manager_id == crate::manager::DEFAULT_MANAGER_ID
                } else {
                    scope == manager_id
                }
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connected_agents(&self) -> Vec<AgentSummary> {
        self.agents
            .iter()
            .map(|entry| {
                let conn = entry.value();
                AgentSummary {
                    agent_id: conn.agent_id.clone(),
                    api_version: conn.api_version,
                    scope: conn.scope.clone(),
                }
            })
            .collect()
    }

    pub fn send_to_agent(&self, agent_id: &str, message: ControlMessage) -> bool {
        if let Some(agent) = self.agents.get(agent_id) {
            agent.tx.send(message).is_ok()
        } else {
            false
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
