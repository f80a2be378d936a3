//! Session persistence behind a small trait so the chat path and tests can
//! swap Postgres for an in-process map.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ChatSession;
use crate::models::ChatMessage;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("session writer has stopped")]
    WriterStopped,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Most recently updated session for `dashboard`, if any.
    async fn resume(&self, dashboard: &str) -> Result<Option<ChatSession>, StoreError>;

    /// Create or replace the session `id`. Writing the same content twice is
    /// a no-op: `updated_at` only moves when something changed.
    async fn upsert(
        &self,
        id: &str,
        dashboard: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError>;

    /// End `old_id` by storing an empty message list, then mint the id the
    /// next exchange should use.
    async fn clear(&self, old_id: &str, dashboard: &str) -> Result<String, StoreError> {
        self.upsert(old_id, dashboard, &[]).await?;
        Ok(fresh_id(old_id))
    }
}

fn fresh_id(old_id: &str) -> String {
    loop {
        let id = Uuid::new_v4().to_string();
        if id != old_id {
            return id;
        }
    }
}

// ============================================================================
// Postgres
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    dashboard: String,
    messages: SqlJson<Vec<ChatMessage>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SessionRow> for ChatSession {
    fn from(row: SessionRow) -> Self {
        ChatSession {
            id: row.id,
            dashboard: row.dashboard,
            messages: row.messages.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct PgSessionStore {
    db: PgPool,
}

impl PgSessionStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn resume(&self, dashboard: &str) -> Result<Option<ChatSession>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT id, dashboard, messages, created_at, updated_at \
             FROM metis_sessions WHERE dashboard = $1 \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(dashboard)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(ChatSession::from))
    }

    async fn upsert(
        &self,
        id: &str,
        dashboard: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metis_sessions (id, dashboard, messages, created_at, updated_at) \
             VALUES ($1, $2, $3, NOW(), NOW()) \
             ON CONFLICT (id) DO UPDATE SET \
                dashboard = EXCLUDED.dashboard, \
                messages = EXCLUDED.messages, \
                updated_at = NOW() \
             WHERE metis_sessions.messages IS DISTINCT FROM EXCLUDED.messages \
                OR metis_sessions.dashboard IS DISTINCT FROM EXCLUDED.dashboard",
        )
        .bind(id)
        .bind(dashboard)
        .bind(SqlJson(messages))
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

struct StoredSession {
    session: ChatSession,
    /// Write order; breaks `updated_at` ties between sessions.
    seq: u64,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, StoredSession>,
    next_seq: u64,
}

/// Process-local store for development and tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<MemoryInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn resume(&self, dashboard: &str) -> Result<Option<ChatSession>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.session.dashboard == dashboard)
            .max_by_key(|s| (s.session.updated_at, s.seq))
            .map(|s| s.session.clone()))
    }

    async fn upsert(
        &self,
        id: &str,
        dashboard: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let now = Utc::now();

        match inner.sessions.get_mut(id) {
            Some(stored) => {
                let s = &mut stored.session;
                if s.messages != messages || s.dashboard != dashboard {
                    s.messages = messages.to_vec();
                    s.dashboard = dashboard.to_string();
                    s.updated_at = now;
                    stored.seq = seq;
                }
            }
            None => {
                inner.sessions.insert(
                    id.to_string(),
                    StoredSession {
                        session: ChatSession {
                            id: id.to_string(),
                            dashboard: dashboard.to_string(),
                            messages: messages.to_vec(),
                            created_at: now,
                            updated_at: now,
                        },
                        seq,
                    },
                );
            }
        }
        Ok(())
    }
}
