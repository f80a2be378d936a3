use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::models::{ChatMessage, MessagePart, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced a final answer.
    Stop,
    /// The step budget ran out while the model still wanted tools.
    StepBudget,
}

/// One server-sent event of a chat response.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Start {
        model: String,
        model_name: String,
        provider: String,
    },
    TextDelta {
        delta: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        #[schema(value_type = Object)]
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        #[schema(value_type = Object)]
        output: Value,
    },
    StepFinish {
        step: usize,
    },
    Error {
        message: String,
    },
    Finish {
        reason: FinishReason,
        steps: usize,
    },
}

#[cfg(test)]
impl ChatEvent {
    pub(crate) fn event_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::StepFinish { .. } => "step_finish",
            Self::Error { .. } => "error",
            Self::Finish { .. } => "finish",
        }
    }
}

/// Rebuilds the assistant message from the events it was streamed as, so the
/// finished exchange can be persisted in the same shape the UI renders.
#[derive(Debug, Default)]
pub struct AssistantTranscript {
    parts: Vec<MessagePart>,
    finished: bool,
    failed: bool,
}

impl AssistantTranscript {
    pub fn record(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::TextDelta { delta } => match self.parts.last_mut() {
                Some(MessagePart::Text { text }) => text.push_str(delta),
                _ => self.parts.push(MessagePart::Text { text: delta.clone() }),
            },
            ChatEvent::ToolCall { call_id, tool_name, input } => {
                self.parts.push(MessagePart::ToolInvocation {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                    output: None,
                });
            }
            ChatEvent::ToolResult { call_id, output, .. } => {
                let pending = self.parts.iter_mut().rev().find_map(|p| match p {
                    MessagePart::ToolInvocation { call_id: id, output: out, .. } if *id == *call_id => {
                        Some(out)
                    }
                    _ => None,
                });
                if let Some(slot) = pending {
                    *slot = Some(output.clone());
                }
            }
            ChatEvent::Error { .. } => self.failed = true,
            ChatEvent::Finish { .. } => self.finished = true,
            ChatEvent::Start { .. } | ChatEvent::StepFinish { .. } => {}
        }
    }

    /// True once a `finish` event was seen and nothing failed.
    pub fn is_complete(&self) -> bool {
        self.finished && !self.failed
    }

    pub fn into_message(self, id: String) -> ChatMessage {
        ChatMessage {
            id,
            role: MessageRole::Assistant,
            parts: self.parts,
        }
    }
}
