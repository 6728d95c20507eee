use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    /// Another action is running and the requested one cannot join it.
    #[error("{0}")]
    AnotherActionRunning(String),

    #[error("No registered agents available for backup manager {0}")]
    NoAgentsAvailable(String),

    #[error("Backup {0} not found")]
    BackupNotFound(String),

    #[error("Housekeeping delete of backup {backup} timed out after {seconds} seconds")]
    HousekeepingTimeout { seconds: u64, backup: String },

    #[error("{0}")]
    JobFailed(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            OrchestratorError::AnotherActionRunning(m) => (StatusCode::CONFLICT, m.clone()),
            OrchestratorError::NoAgentsAvailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            OrchestratorError::BackupNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            OrchestratorError::HousekeepingTimeout { .. } => {
                (StatusCode::CONFLICT, self.to_string())
            }
            OrchestratorError::JobFailed(m) | OrchestratorError::InvalidRequest(m) => {
                (StatusCode::UNPROCESSABLE_ENTITY, m.clone())
            }
            OrchestratorError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
