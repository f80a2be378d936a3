//! Resumable assistant sessions.
//!
//! One live conversation per dashboard identity. The store keeps the full
//! message list as the UI renders it; the chat endpoint appends finished
//! exchanges through the background [`SaveQueue`].

mod crud;
mod queue;
mod store;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::ChatMessage;
use crate::state::AppState;

// Re-export handlers AND utoipa-generated __path_* types for lib.rs.
pub use crud::*;
pub use queue::{SaveJob, SaveQueue, SAVE_QUEUE_CAPACITY};
pub use store::{MemorySessionStore, PgSessionStore, SessionStore, StoreError};

pub(crate) const MAX_SESSION_ID_LENGTH: usize = 128;
pub(crate) const MAX_MESSAGE_LENGTH: usize = 50_000;
pub(crate) const MAX_MESSAGES_PER_SESSION: usize = 1_000;

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatSession {
    pub id: String,
    pub dashboard: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionEnvelope {
    pub session: Option<ChatSession>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub dashboard: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveSessionRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dashboard: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClearSessionRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dashboard: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearSessionResponse {
    pub ok: bool,
    pub previous_id: String,
    pub session_id: String,
}

// ============================================================================
// Validation shared with the chat endpoint
// ============================================================================

/// Session ids are opaque but bounded.
pub(crate) fn validate_session_id(id: &str) -> Result<(), String> {
    let id = id.trim();
    if id.is_empty() {
        return Err("Session id is required".to_string());
    }
    if id.chars().count() > MAX_SESSION_ID_LENGTH {
        return Err(format!(
            "Session id exceeds maximum length of {} characters",
            MAX_SESSION_ID_LENGTH
        ));
    }
    Ok(())
}

/// Rejects oversized message lists and text parts.
pub(crate) fn validate_messages(messages: &[ChatMessage]) -> Result<(), String> {
    if messages.len() > MAX_MESSAGES_PER_SESSION {
        return Err(format!(
            "Too many messages (max {})",
            MAX_MESSAGES_PER_SESSION
        ));
    }
    for msg in messages {
        if msg.plain_text().len() > MAX_MESSAGE_LENGTH {
            return Err(format!(
                "Message {} exceeds maximum length of {} bytes",
                msg.id, MAX_MESSAGE_LENGTH
            ));
        }
    }
    Ok(())
}

pub(crate) fn dashboard_or_default(dashboard: Option<&str>) -> String {
    dashboard
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(crate::config::DEFAULT_DASHBOARD)
        .to_string()
}

// ============================================================================
// Route builder: merge this into the main Router
// ============================================================================

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/metis/sessions", get(get_session).post(save_session))
        .route("/api/metis/sessions/clear", post(clear_session))
}
