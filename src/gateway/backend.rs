//! Seam between the gateway and whatever actually runs the model.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::model_registry::ModelCandidate;
use crate::tools::ToolSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited by backend")]
    RateLimited,

    #[error("timed out waiting for backend")]
    Timeout,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("backend produced no output")]
    EmptyResponse,
}

/// A tool call as requested by the model. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Provider-neutral conversation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelMessage {
    System { content: String },
    User { content: String },
    Assistant { content: String, tool_calls: Vec<ToolCallRequest> },
    Tool { call_id: String, content: String },
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSpec>,
}

/// Incremental output of a single model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    TextDelta(String),
    /// Emitted once the call's arguments are complete.
    ToolCall(ToolCallRequest),
    Finish,
}

pub type TurnStream = BoxStream<'static, Result<TurnEvent, BackendError>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start one streaming turn for `candidate`. Connection and status
    /// failures surface here; anything later arrives as an `Err` item.
    async fn open_turn(
        &self,
        candidate: &ModelCandidate,
        request: &TurnRequest,
    ) -> Result<TurnStream, BackendError>;
}
