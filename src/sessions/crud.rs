//! Session endpoints: resume, save and clear.

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};

use crate::handlers::ApiError;
use crate::state::AppState;

use super::{
    dashboard_or_default, validate_messages, validate_session_id, ClearSessionRequest,
    ClearSessionResponse, SaveSessionRequest, SessionEnvelope, SessionQuery,
};

/// GET /api/metis/sessions?dashboard=accurate-sales
#[utoipa::path(get, path = "/api/metis/sessions", tag = "sessions",
    params(
        ("dashboard" = Option<String>, Query, description = "Dashboard identity (default accurate-sales)"),
    ),
    responses(
        (status = 200, description = "Most recently updated session, or null", body = SessionEnvelope),
        (status = 500, description = "Store unavailable", body = Value)
    )
)]
pub async fn get_session(
    State(state): State<AppState>,
    Query(params): Query<SessionQuery>,
) -> Result<Json<SessionEnvelope>, ApiError> {
    let dashboard = dashboard_or_default(params.dashboard.as_deref());
    let session = state
        .sessions
        .resume(&dashboard)
        .await
        .map_err(|e| ApiError::Internal(format!("resume session for {dashboard}: {e}")))?;
    Ok(Json(SessionEnvelope { session }))
}

/// POST /api/metis/sessions: create or replace a session.
#[utoipa::path(post, path = "/api/metis/sessions", tag = "sessions",
    request_body = SaveSessionRequest,
    responses(
        (status = 200, description = "Session saved", body = Value),
        (status = 400, description = "Missing id or messages", body = Value),
        (status = 500, description = "Store unavailable", body = Value)
    )
)]
pub async fn save_session(
    State(state): State<AppState>,
    Json(req): Json<SaveSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    validate_session_id(&req.id).map_err(ApiError::BadRequest)?;
    let messages = req
        .messages
        .ok_or_else(|| ApiError::BadRequest("messages are required".to_string()))?;
    validate_messages(&messages).map_err(ApiError::BadRequest)?;

    let id = req.id.trim();
    let dashboard = dashboard_or_default(req.dashboard.as_deref());
    state
        .sessions
        .upsert(id, &dashboard, &messages)
        .await
        .map_err(|e| ApiError::Internal(format!("save session {id}: {e}")))?;

    tracing::info!(session_id = %id, dashboard = %dashboard, messages = messages.len(), "sessions: saved");
    Ok(Json(json!({ "ok": true })))
}

/// POST /api/metis/sessions/clear: end the current conversation.
#[utoipa::path(post, path = "/api/metis/sessions/clear", tag = "sessions",
    request_body = ClearSessionRequest,
    responses(
        (status = 200, description = "Session cleared; use session_id for the next exchange", body = ClearSessionResponse),
        (status = 400, description = "Missing id", body = Value),
        (status = 500, description = "Store unavailable", body = Value)
    )
)]
pub async fn clear_session(
    State(state): State<AppState>,
    Json(req): Json<ClearSessionRequest>,
) -> Result<Json<ClearSessionResponse>, ApiError> {
    validate_session_id(&req.id).map_err(ApiError::BadRequest)?;
    let previous_id = req.id.trim().to_string();
    let dashboard = dashboard_or_default(req.dashboard.as_deref());

    let session_id = state
        .save_queue
        .clear(&previous_id, &dashboard)
        .await
        .map_err(|e| ApiError::Internal(format!("clear session {previous_id}: {e}")))?;

    tracing::info!(previous_id = %previous_id, session_id = %session_id, "sessions: cleared");
    Ok(Json(ClearSessionResponse {
        ok: true,
        previous_id,
        session_id,
    }))
}
