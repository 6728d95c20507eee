//! Control-stream message types.
//!
//! One persistent, ordered, bidirectional stream exists per agent. Every
//! state transition on either side is driven by exactly one of the messages
//! defined here; the stream carries nothing else. Backup payload bytes move
//! over a separate data path and never appear on the control stream.

use serde::{Deserialize, Serialize};

/// Control-stream API versions, oldest first.
///
/// Ordering matters: registration starts at [`ApiVersion::latest`] and walks
/// down one step at a time when the orchestrator rejects the declared
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApiVersion {
    #[serde(rename = "2.0")]
    V2,
    #[serde(rename = "3.0")]
    V3,
    #[serde(rename = "4.0")]
    V4,
}

impl ApiVersion {
    pub fn latest() -> Self {
        ApiVersion::V4
    }

    /// The next older version, or `None` at the floor.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            ApiVersion::V4 => Some(ApiVersion::V3),
            ApiVersion::V3 => Some(ApiVersion::V2),
            ApiVersion::V2 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "2.0",
            ApiVersion::V3 => "3.0",
            ApiVersion::V4 => "4.0",
        }
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation an action message belongs to. Every stage message carries
/// this tag so a late or duplicated message can never be applied to the
/// wrong kind of action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

/// Software version metadata an agent declares when registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareVersion {
    pub product_name: String,
    pub product_number: String,
    pub revision: String,
    pub production_date: String,
    #[serde(default)]
    pub description: String,
}

/// Registration handshake payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub agent_id: String,
    pub api_version: ApiVersion,
    /// Backup-manager scope the agent participates in. Empty string means
    /// the default manager.
    #[serde(default)]
    pub scope: String,
    pub software_version: SoftwareVersion,
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum RegistrationError {
    /// The declared API version is not supported; the agent should downgrade
    /// and re-register.
    #[serde(rename = "unsupported-api-version")]
    UnsupportedApiVersion,
    #[serde(rename = "rejected")]
    Rejected(String),
}

/// One restorable fragment of a backup, produced during backup execution and
/// handed back to the agent during restore preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub fragment_id: String,
    pub version: String,
    pub size_in_bytes: u64,
}

/// Per-agent stage outcome report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageComplete {
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// The control-stream vocabulary, both directions.
///
/// Orchestrator → agent: `RegisterAck`, `RegisterError`, `Preparation`,
/// `Execution`, `PostActions`, `Cancel`, `FragmentListEntry`.
/// Agent → orchestrator: `Register`, `StageComplete`, `RequestDependencies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    #[serde(rename = "agent:register")]
    Register(Register),

    #[serde(rename = "agent:register:ack")]
    RegisterAck {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "agent:register:error")]
    RegisterError { error: RegistrationError },

    /// Opens a new action cycle on the agent. A restore preparation with an
    /// empty fragment list tells the agent to ask for the list via
    /// `RequestDependencies` and wait for `FragmentListEntry` messages.
    #[serde(rename = "stage:preparation")]
    Preparation {
        kind: OperationKind,
        backup_name: String,
        #[serde(default)]
        fragments: Vec<Fragment>,
    },

    #[serde(rename = "stage:execution")]
    Execution { kind: OperationKind },

    #[serde(rename = "stage:post-actions")]
    PostActions { kind: OperationKind },

    #[serde(rename = "action:cancel")]
    Cancel { kind: OperationKind },

    #[serde(rename = "stage:complete")]
    StageComplete {
        kind: OperationKind,
        #[serde(flatten)]
        payload: StageComplete,
    },

    #[serde(rename = "restore:fragment")]
    FragmentListEntry { fragment: Fragment },

    #[serde(rename = "restore:request-dependencies")]
    RequestDependencies { agent_id: String },
}

impl ControlMessage {
    /// True for every message except the registration handshake — used by
    /// the agent to decide whether an in-flight registration retry can stop.
    pub fn is_post_registration(&self) -> bool {
        !matches!(
            self,
            ControlMessage::Register(_) | ControlMessage::RegisterError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register() -> Register {
        Register {
            agent_id: "payments-db".to_string(),
            api_version: ApiVersion::V4,
            scope: "configuration-data".to_string(),
            software_version: SoftwareVersion {
                product_name: "payments".to_string(),
                product_number: "APR 201 34".to_string(),
                revision: "R1A".to_string(),
                production_date: "2026-01-12".to_string(),
                description: String::new(),
            },
        }
    }

    #[test]
    fn test_register_round_trip() {
        let msg = ControlMessage::Register(register());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("agent:register"));
        assert!(json.contains("\"4.0\""));
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_stage_complete_wire_shape() {
        let msg = ControlMessage::StageComplete {
            kind: OperationKind::Backup,
            payload: StageComplete {
                agent_id: "payments-db".to_string(),
                success: false,
                message: "disk full".to_string(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("stage:complete"));
        assert!(json.contains("disk full"));

        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlMessage::StageComplete { kind, payload } => {
                assert_eq!(kind, OperationKind::Backup);
                assert!(!payload.success);
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_preparation_defaults_empty_fragments() {
        let json = r#"{"type":"stage:preparation","payload":{"kind":"restore","backup_name":"nightly-01"}}"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ControlMessage::Preparation { kind, backup_name, fragments } => {
                assert_eq!(kind, OperationKind::Restore);
                assert_eq!(backup_name, "nightly-01");
                assert!(fragments.is_empty());
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_api_version_downgrade_is_single_step() {
        assert_eq!(ApiVersion::V4.downgrade(), Some(ApiVersion::V3));
        assert_eq!(ApiVersion::V3.downgrade(), Some(ApiVersion::V2));
        assert_eq!(ApiVersion::V2.downgrade(), None);
    }
}
