//! Thin REST adapter: construct an action, hand it to the executor.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::action::{self, Action, CreateActionRequest};
use crate::backup::{self, Backup};
use crate::channel;
use crate::error::OrchestratorError;
use crate::registry::AgentSummary;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/agent", get(channel::ws_handler))
        .route("/api/agents", get(list_agents))
        .route(
            "/api/backup-managers/{manager_id}/actions",
            post(create_action).get(list_actions),
        )
        .route("/api/backup-managers/{manager_id}/actions/{action_id}", get(get_action))
        .route("/api/backup-managers/{manager_id}/backups", get(list_backups))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_action(
    State(state): State<Arc<AppState>>,
    Path(manager_id): Path<String>,
    Json(request): Json<CreateActionRequest>,
) -> Result<(StatusCode, Json<Action>), OrchestratorError> {
    let action = state.executor.execute(&manager_id, request).await?;
    Ok((StatusCode::CREATED, Json(action)))
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Path(manager_id): Path<String>,
) -> Result<Json<Vec<Action>>, OrchestratorError> {
    let pool = state.pool.clone();
    let actions = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Action>> {
        let conn = pool.get()?;
        action::find_by_manager(&conn, &manager_id)
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.into()))??;
    Ok(Json(actions))
}

async fn get_action(
    State(state): State<Arc<AppState>>,
    Path((manager_id, action_id)): Path<(String, String)>,
) -> Result<Json<Action>, OrchestratorError> {
    let pool = state.pool.clone();
    let found = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Action>> {
        let conn = pool.get()?;
        action::find_by_id(&conn, &action_id)
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.into()))??;
    match found {
        Some(action) if action.backup_manager_id == manager_id => Ok(Json(action)),
        _ => Err(OrchestratorError::InvalidRequest("Action not found".to_string())),
    }
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(manager_id): Path<String>,
) -> Result<Json<Vec<Backup>>, OrchestratorError> {
    let pool = state.pool.clone();
    let backups = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Backup>> {
        let conn = pool.get()?;
        backup::find_by_manager(&conn, &manager_id)
    })
    .await
    .map_err(|e| OrchestratorError::Internal(e.into()))??;
    Ok(Json(backups))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentSummary>> {
    Json(state.agents.connected_agents())
}
