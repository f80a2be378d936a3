// ---------------------------------------------------------------------------
// handlers/chat.rs: POST /api/metis/chat (SSE)
// ---------------------------------------------------------------------------

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use uuid::Uuid;

use crate::gateway::{AssistantTranscript, ChatEvent, GatewayError};
use crate::models::{ChatMessage, ChatRequest};
use crate::sessions::{
    dashboard_or_default, validate_messages, validate_session_id, SaveJob, SaveQueue,
};
use crate::state::AppState;

use super::{ApiError, ApiErrorWithDetails};

pub const MODEL_HEADER: &str = "x-metis-model";
pub const MODEL_NAME_HEADER: &str = "x-metis-model-name";

/// Where a finished exchange goes once the stream completes.
struct PendingSave {
    session_id: String,
    dashboard: String,
    history: Vec<ChatMessage>,
    queue: SaveQueue,
}

#[utoipa::path(post, path = "/api/metis/chat", tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Server-sent events, one JSON ChatEvent per `data:` line. \
            Headers X-Metis-Model / X-Metis-Model-Name name the serving candidate.",
            content_type = "text/event-stream", body = ChatEvent),
        (status = 400, description = "Empty or oversized conversation", body = serde_json::Value),
        (status = 503, description = "Every model candidate failed before producing output", body = serde_json::Value)
    )
)]
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiErrorWithDetails> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()).into());
    }
    validate_messages(&req.messages).map_err(ApiError::BadRequest)?;
    if let Some(id) = &req.session_id {
        validate_session_id(id).map_err(ApiError::BadRequest)?;
    }

    let chat = state
        .gateway
        .open(&req.messages, req.dashboard_context.as_ref())
        .await
        .map_err(|e| match e {
            GatewayError::Exhausted { attempts, last_error } => ApiError::Unavailable(
                "All assistant models are unavailable right now. Please try again shortly."
                    .to_string(),
            )
            .with_details(json!({ "last_error": last_error, "attempts": attempts })),
        })?;

    if !chat.attempts.is_empty() {
        tracing::info!(
            model = %chat.candidate.id,
            skipped = chat.attempts.len(),
            "chat: served by fallback candidate"
        );
    }

    let save = req.session_id.map(|id| PendingSave {
        session_id: id.trim().to_string(),
        dashboard: dashboard_or_default(req.dashboard.as_deref()),
        history: req.messages,
        queue: state.save_queue.clone(),
    });

    let body = record_exchange(chat.events, save).map(|ev| {
        Ok::<_, Infallible>(Event::default().json_data(&ev).unwrap_or_default())
    });

    let mut response = Sse::new(body)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(v) = HeaderValue::from_str(&chat.candidate.id) {
        headers.insert(HeaderName::from_static(MODEL_HEADER), v);
    }
    if let Ok(v) = HeaderValue::from_str(&chat.candidate.name) {
        headers.insert(HeaderName::from_static(MODEL_NAME_HEADER), v);
    }
    Ok(response)
}

/// Forward events unchanged while rebuilding the assistant message. When the
/// response finishes cleanly and a session was named, the full exchange is
/// queued for saving before the `finish` event goes out. A dropped stream
/// (client disconnect) never saves.
fn record_exchange(
    mut events: BoxStream<'static, ChatEvent>,
    mut save: Option<PendingSave>,
) -> impl Stream<Item = ChatEvent> + Send + 'static {
    stream! {
        let mut transcript = AssistantTranscript::default();
        while let Some(event) = events.next().await {
            transcript.record(&event);
            if matches!(event, ChatEvent::Finish { .. }) && transcript.is_complete() {
                if let Some(save) = save.take() {
                    let done = std::mem::take(&mut transcript);
                    let mut messages = save.history;
                    messages.push(done.into_message(Uuid::new_v4().to_string()));
                    save.queue.enqueue(SaveJob {
                        id: save.session_id,
                        dashboard: save.dashboard,
                        messages,
                    });
                }
            }
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures_util::stream;

    use crate::gateway::FinishReason;
    use crate::models::MessageRole;
    use crate::sessions::{MemorySessionStore, SessionStore, SAVE_QUEUE_CAPACITY};

    fn opening() -> Vec<ChatEvent> {
        vec![
            ChatEvent::Start {
                model: "acme/alpha:free".into(),
                model_name: "alpha".into(),
                provider: "acme".into(),
            },
            ChatEvent::TextDelta { delta: "Omzet naik ".into() },
        ]
    }

    fn pending_save(queue: &SaveQueue) -> PendingSave {
        PendingSave {
            session_id: "sess-1".into(),
            dashboard: "accurate-sales".into(),
            history: vec![ChatMessage::text("u1", MessageRole::User, "Omzet bulan ini?")],
            queue: queue.clone(),
        }
    }

    /// Waits until a marker job on another dashboard lands, so every job
    /// queued before it has been handled.
    async fn drain(queue: &SaveQueue, store: &MemorySessionStore) {
        assert!(queue.enqueue(SaveJob {
            id: "marker".into(),
            dashboard: "marker".into(),
            messages: Vec::new(),
        }));
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.resume("marker").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn finished_exchange_is_saved() {
        let store = Arc::new(MemorySessionStore::new());
        let queue = SaveQueue::spawn(store.clone(), SAVE_QUEUE_CAPACITY);
        let mut events = opening();
        events.push(ChatEvent::StepFinish { step: 1 });
        events.push(ChatEvent::Finish { reason: FinishReason::Stop, steps: 1 });

        let forwarded: Vec<ChatEvent> =
            record_exchange(stream::iter(events.clone()).boxed(), Some(pending_save(&queue)))
                .collect()
                .await;
        assert_eq!(forwarded, events);

        drain(&queue, &store).await;
        let saved = store.resume("accurate-sales").await.unwrap().unwrap();
        assert_eq!(saved.id, "sess-1");
        assert_eq!(saved.messages.len(), 2);
        assert_eq!(saved.messages[1].plain_text(), "Omzet naik ");
    }

    #[tokio::test]
    async fn dropped_stream_saves_nothing() {
        let store = Arc::new(MemorySessionStore::new());
        let queue = SaveQueue::spawn(store.clone(), SAVE_QUEUE_CAPACITY);
        let events = stream::iter(opening()).chain(stream::pending()).boxed();

        let mut recorded = Box::pin(record_exchange(events, Some(pending_save(&queue))));
        assert!(matches!(recorded.next().await, Some(ChatEvent::Start { .. })));
        assert!(matches!(recorded.next().await, Some(ChatEvent::TextDelta { .. })));
        drop(recorded);

        drain(&queue, &store).await;
        assert!(store.resume("accurate-sales").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errored_stream_saves_nothing() {
        let store = Arc::new(MemorySessionStore::new());
        let queue = SaveQueue::spawn(store.clone(), SAVE_QUEUE_CAPACITY);
        let mut events = opening();
        events.push(ChatEvent::Error { message: "stream error: connection reset".into() });

        let _: Vec<ChatEvent> =
            record_exchange(stream::iter(events).boxed(), Some(pending_save(&queue)))
                .collect()
                .await;

        drain(&queue, &store).await;
        assert!(store.resume("accurate-sales").await.unwrap().is_none());
    }
}
