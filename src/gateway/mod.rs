//! Fallback streaming gateway.
//!
//! Candidates from the [`ModelRoster`] are tried strictly in order, one at a
//! time. A candidate is committed the moment its first event arrives; from
//! then on its stream is forwarded to the caller and failures end the stream
//! with an `error` event instead of falling back. Only failures *before* any
//! output move on to the next candidate.
//!
//! Within the committed attempt the tool loop runs as an explicit state
//! machine bounded by the step budget:
//!
//! ```text
//! AwaitingModelTurn ──tool calls──▶ ExecuteTools ──▶ AwaitingModelTurn
//!        │                                               (step + 1)
//!        └──no calls / budget spent──▶ Done ──▶ finish event
//! ```

pub mod backend;
pub mod events;
pub mod openrouter;


use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

pub use backend::{
    BackendError, ModelBackend, ModelMessage, ToolCallRequest, TurnEvent, TurnRequest, TurnStream,
};
pub use events::{AssistantTranscript, ChatEvent, FinishReason};

use crate::config::AssistantLimits;
use crate::model_registry::{ModelCandidate, ModelRoster};
use crate::models::{ChatMessage, DashboardContext, MessagePart, MessageRole};
use crate::prompt::{PromptComposer, PromptKnowledge};
use crate::query_guard::QueryGuard;
use crate::tools;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A candidate that failed before producing any output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AttemptFailure {
    pub model: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("all {count} model candidates failed; last error: {last_error}", count = .attempts.len())]
    Exhausted {
        attempts: Vec<AttemptFailure>,
        last_error: String,
    },
}

/// A committed response: who is serving it and the events to forward.
pub struct ChatStream {
    pub candidate: ModelCandidate,
    /// Candidates that failed before this one committed.
    pub attempts: Vec<AttemptFailure>,
    pub events: BoxStream<'static, ChatEvent>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct FallbackGateway {
    roster: ModelRoster,
    backend: Arc<dyn ModelBackend>,
    guard: Arc<QueryGuard>,
    composer: PromptComposer,
    limits: AssistantLimits,
}

impl FallbackGateway {
    pub fn new(
        roster: ModelRoster,
        backend: Arc<dyn ModelBackend>,
        guard: Arc<QueryGuard>,
        limits: AssistantLimits,
    ) -> Self {
        Self {
            composer: PromptComposer::new(PromptKnowledge::default(), limits.row_cap),
            roster,
            backend,
            guard,
            limits,
        }
    }

    pub fn roster(&self) -> &ModelRoster {
        &self.roster
    }

    /// Compose the instructions, then walk the roster until one candidate
    /// produces output.
    pub async fn open(
        &self,
        messages: &[ChatMessage],
        ctx: Option<&DashboardContext>,
    ) -> Result<ChatStream, GatewayError> {
        let mut history = vec![ModelMessage::System {
            content: self.composer.compose(ctx),
        }];
        history.extend(to_model_messages(messages));
        let request = TurnRequest {
            messages: history,
            tools: tools::tool_specs(),
        };

        let mut attempts = Vec::new();
        for candidate in self.roster.iter() {
            let error = match first_output(
                self.backend.as_ref(),
                candidate,
                &request,
                self.limits.first_output_timeout,
            )
            .await
            {
                Ok(Peek::Output(first, turn)) => {
                    tracing::info!(
                        model = %candidate.id,
                        failed_before = attempts.len(),
                        "gateway: serving with candidate"
                    );
                    let attempt = Attempt {
                        candidate: candidate.clone(),
                        backend: Arc::clone(&self.backend),
                        guard: Arc::clone(&self.guard),
                        request,
                        limits: self.limits.clone(),
                    };
                    return Ok(ChatStream {
                        candidate: candidate.clone(),
                        attempts,
                        events: attempt.run(first, turn),
                    });
                }
                Ok(Peek::Empty) => BackendError::EmptyResponse,
                Err(e) => e,
            };
            tracing::warn!(model = %candidate.id, "gateway: candidate failed before output: {}", error);
            attempts.push(AttemptFailure {
                model: candidate.id.clone(),
                error: error.to_string(),
            });
        }

        let last_error = attempts
            .last()
            .map(|a| a.error.clone())
            .unwrap_or_else(|| "no model candidates configured".to_string());
        tracing::error!(attempts = attempts.len(), "gateway: all candidates failed: {}", last_error);
        Err(GatewayError::Exhausted { attempts, last_error })
    }
}

/// First look at a freshly opened turn.
enum Peek {
    Output(TurnEvent, TurnStream),
    /// The turn finished (or closed) without producing anything.
    Empty,
}

/// Open a turn and wait for its first event, all within `timeout`.
async fn first_output(
    backend: &dyn ModelBackend,
    candidate: &ModelCandidate,
    request: &TurnRequest,
    timeout: Duration,
) -> Result<Peek, BackendError> {
    tokio::time::timeout(timeout, open_and_peek(backend, candidate, request))
        .await
        .unwrap_or(Err(BackendError::Timeout))
}

async fn open_and_peek(
    backend: &dyn ModelBackend,
    candidate: &ModelCandidate,
    request: &TurnRequest,
) -> Result<Peek, BackendError> {
    let mut turn = backend.open_turn(candidate, request).await?;
    match turn.next().await {
        Some(Ok(TurnEvent::Finish)) | None => Ok(Peek::Empty),
        Some(Ok(event)) => Ok(Peek::Output(event, turn)),
        Some(Err(e)) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Committed attempt
// ---------------------------------------------------------------------------

enum LoopState {
    AwaitingModelTurn {
        step: usize,
        turn: TurnStream,
        first: Option<TurnEvent>,
    },
    ExecuteTools {
        step: usize,
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    Done {
        reason: FinishReason,
        steps: usize,
    },
    Failed,
}

struct Attempt {
    candidate: ModelCandidate,
    backend: Arc<dyn ModelBackend>,
    guard: Arc<QueryGuard>,
    request: TurnRequest,
    limits: AssistantLimits,
}

impl Attempt {
    fn run(self, first: TurnEvent, turn: TurnStream) -> BoxStream<'static, ChatEvent> {
        let Attempt { candidate, backend, guard, mut request, limits } = self;

        Box::pin(stream! {
            yield ChatEvent::Start {
                model: candidate.id.clone(),
                model_name: candidate.name.clone(),
                provider: candidate.provider.clone(),
            };

            let mut state = LoopState::AwaitingModelTurn { step: 1, turn, first: Some(first) };
            loop {
                state = match state {
                    LoopState::AwaitingModelTurn { step, mut turn, mut first } => {
                        let mut text = String::new();
                        let mut calls = Vec::new();
                        let mut failure = None;
                        loop {
                            let next = match first.take() {
                                Some(event) => Some(Ok(event)),
                                None => tokio::time::timeout(limits.stream_idle_timeout, turn.next())
                                    .await
                                    .unwrap_or(Some(Err(BackendError::Timeout))),
                            };
                            match next {
                                Some(Ok(TurnEvent::TextDelta(delta))) => {
                                    text.push_str(&delta);
                                    yield ChatEvent::TextDelta { delta };
                                }
                                Some(Ok(TurnEvent::ToolCall(call))) => calls.push(call),
                                Some(Ok(TurnEvent::Finish)) | None => break,
                                Some(Err(e)) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }

                        if let Some(e) = failure {
                            tracing::warn!(model = %candidate.id, step, "gateway: stream failed after commit: {}", e);
                            yield ChatEvent::Error { message: e.to_string() };
                            LoopState::Failed
                        } else {
                            yield ChatEvent::StepFinish { step };
                            if calls.is_empty() {
                                LoopState::Done { reason: FinishReason::Stop, steps: step }
                            } else if step >= limits.step_budget {
                                tracing::warn!(
                                    model = %candidate.id,
                                    pending = calls.len(),
                                    "gateway: step budget of {} spent, finishing without tool results",
                                    limits.step_budget
                                );
                                LoopState::Done { reason: FinishReason::StepBudget, steps: step }
                            } else {
                                LoopState::ExecuteTools { step, text, calls }
                            }
                        }
                    }

                    LoopState::ExecuteTools { step, text, calls } => {
                        request.messages.push(ModelMessage::Assistant {
                            content: text,
                            tool_calls: calls.clone(),
                        });
                        for call in calls {
                            let parsed = tools::parse_arguments(&call.arguments);
                            let input = parsed
                                .clone()
                                .unwrap_or_else(|_| Value::String(call.arguments.clone()));
                            yield ChatEvent::ToolCall {
                                call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                input,
                            };

                            let output = match parsed {
                                Ok(args) => tools::execute_tool(&guard, &call.name, &args).await,
                                Err(msg) => tools::tool_failure(&msg),
                            };
                            request.messages.push(ModelMessage::Tool {
                                call_id: call.id.clone(),
                                content: output.to_string(),
                            });
                            yield ChatEvent::ToolResult {
                                call_id: call.id,
                                tool_name: call.name,
                                output,
                            };
                        }

                        match first_output(backend.as_ref(), &candidate, &request, limits.first_output_timeout).await {
                            Ok(Peek::Output(first, turn)) => LoopState::AwaitingModelTurn {
                                step: step + 1,
                                turn,
                                first: Some(first),
                            },
                            // Nothing more to say after the tool results.
                            Ok(Peek::Empty) => {
                                yield ChatEvent::StepFinish { step: step + 1 };
                                LoopState::Done { reason: FinishReason::Stop, steps: step + 1 }
                            }
                            Err(e) => {
                                tracing::warn!(model = %candidate.id, step, "gateway: follow-up turn failed: {}", e);
                                yield ChatEvent::Error { message: e.to_string() };
                                LoopState::Failed
                            }
                        }
                    }

                    LoopState::Done { reason, steps } => {
                        tracing::info!(model = %candidate.id, steps, ?reason, "gateway: response finished");
                        yield ChatEvent::Finish { reason, steps };
                        break;
                    }

                    LoopState::Failed => break,
                };
            }
        })
    }
}

// ---------------------------------------------------------------------------
// History conversion
// ---------------------------------------------------------------------------

/// Convert UI messages into provider-neutral ones. Assistant tool
/// invocations become an assistant message carrying the calls followed by
/// one tool message per result. Invocations without a result are dropped
/// since a call with no answer can't be replayed.
pub(crate) fn to_model_messages(messages: &[ChatMessage]) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    for msg in messages {
        match msg.role {
            MessageRole::User => {
                let text = msg.plain_text();
                if !text.trim().is_empty() {
                    out.push(ModelMessage::User { content: text });
                }
            }
            MessageRole::Assistant | MessageRole::Tool => push_assistant_parts(&msg.parts, &mut out),
        }
    }
    out
}

fn push_assistant_parts(parts: &[MessagePart], out: &mut Vec<ModelMessage>) {
    let mut text = String::new();
    let mut calls: Vec<(ToolCallRequest, String)> = Vec::new();
    for part in parts {
        match part {
            MessagePart::Text { text: t } => {
                if !calls.is_empty() {
                    flush_assistant(&mut text, &mut calls, out);
                }
                text.push_str(t);
            }
            MessagePart::ToolInvocation {
                call_id,
                tool_name,
                input,
                output: Some(output),
            } => calls.push((
                ToolCallRequest {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    arguments: input.to_string(),
                },
                output.to_string(),
            )),
            MessagePart::ToolInvocation { output: None, .. } => {}
        }
    }
    flush_assistant(&mut text, &mut calls, out);
}

fn flush_assistant(
    text: &mut String,
    calls: &mut Vec<(ToolCallRequest, String)>,
    out: &mut Vec<ModelMessage>,
) {
    if text.trim().is_empty() && calls.is_empty() {
        text.clear();
        return;
    }
    let calls = std::mem::take(calls);
    out.push(ModelMessage::Assistant {
        content: std::mem::take(text),
        tool_calls: calls.iter().map(|(c, _)| c.clone()).collect(),
    });
    out.extend(calls.into_iter().map(|(c, result)| ModelMessage::Tool {
        call_id: c.id,
        content: result,
    }));
}
