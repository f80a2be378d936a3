// Metis backend: OpenRouter model backend
//
// OpenAI-compatible `/chat/completions` with `stream: true`. Text deltas are
// forwarded as soon as they arrive; tool-call fragments are stitched together
// by index and released when the model finishes the turn.

use std::collections::BTreeMap;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::backend::{
    BackendError, ModelBackend, ModelMessage, ToolCallRequest, TurnEvent, TurnRequest, TurnStream,
};
use crate::model_registry::ModelCandidate;
use crate::tools::ToolSpec;

/// Max characters of an error body kept for logs and attempt reports.
const ERROR_BODY_LIMIT: usize = 500;

pub struct OpenRouterBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenRouterBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        // No overall timeout: the gateway bounds first output and idle gaps itself.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelBackend for OpenRouterBackend {
    async fn open_turn(
        &self,
        candidate: &ModelCandidate,
        request: &TurnRequest,
    ) -> Result<TurnStream, BackendError> {
        let body = request_body(&candidate.id, request);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("X-Title", "Metis")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(BackendError::RateLimited);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate_chars(&text, ERROR_BODY_LIMIT),
            });
        }

        let mut bytes = resp.bytes_stream();
        let events = stream! {
            let mut parser = CompletionStreamParser::default();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(b) => {
                        for ev in parser.feed(&b) {
                            yield ev;
                        }
                    }
                    Err(e) => {
                        yield Err(BackendError::Stream(e.to_string()));
                        return;
                    }
                }
            }
            for ev in parser.finish() {
                yield ev;
            }
        };
        Ok(Box::pin(events))
    }
}

// ── Request encoding ─────────────────────────────────────────────────────────

pub(crate) fn request_body(model: &str, request: &TurnRequest) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "messages": request.messages.iter().map(message_json).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(tool_json).collect::<Vec<_>>().into();
        body["tool_choice"] = json!("auto");
    }
    body
}

fn message_json(msg: &ModelMessage) -> Value {
    match msg {
        ModelMessage::System { content } => json!({ "role": "system", "content": content }),
        ModelMessage::User { content } => json!({ "role": "user", "content": content }),
        ModelMessage::Assistant { content, tool_calls } if tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": content })
        }
        ModelMessage::Assistant { content, tool_calls } => json!({
            "role": "assistant",
            "content": if content.is_empty() { Value::Null } else { json!(content) },
            "tool_calls": tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments },
            })).collect::<Vec<_>>(),
        }),
        ModelMessage::Tool { call_id, content } => {
            json!({ "role": "tool", "tool_call_id": call_id, "content": content })
        }
    }
}

fn tool_json(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

// ── Stream decoding ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for `text/event-stream` completion chunks.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct CompletionStreamParser {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finished: bool,
    done: bool,
}

impl CompletionStreamParser {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<Result<TurnEvent, BackendError>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Drain whatever is left once the body ends.
    pub(crate) fn finish(&mut self) -> Vec<Result<TurnEvent, BackendError>> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest);
            for line in rest.lines() {
                self.handle_line(line, &mut events);
            }
        }
        // Some providers close the stream without a finish_reason.
        if !self.finished && (!self.tool_calls.is_empty() || self.done) {
            self.finish_turn(&mut events);
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<Result<TurnEvent, BackendError>>) {
        if line.is_empty() || line.starts_with(':') || self.finished {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("openrouter: skipping undecodable chunk: {}", e);
                return;
            }
        };

        if let Some(err) = chunk.get("error") {
            events.push(Err(in_stream_error(err)));
            self.finished = true;
            return;
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            events.push(Ok(TurnEvent::TextDelta(text.to_string())));
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for (pos, call) in calls.iter().enumerate() {
                let index = call["index"].as_u64().unwrap_or(pos as u64);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str().filter(|s| !s.is_empty()) {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
        }

        if choice["finish_reason"].as_str().is_some_and(|r| r == "error") {
            events.push(Err(BackendError::Stream("model finished with an error".into())));
            self.finished = true;
            return;
        }
        if !choice["finish_reason"].is_null() {
            self.finish_turn(events);
        }
    }

    fn finish_turn(&mut self, events: &mut Vec<Result<TurnEvent, BackendError>>) {
        for (index, call) in std::mem::take(&mut self.tool_calls) {
            if call.name.is_empty() {
                tracing::warn!("openrouter: dropping tool call #{} without a name", index);
                continue;
            }
            let id = if call.id.is_empty() { format!("call_{index}") } else { call.id };
            events.push(Ok(TurnEvent::ToolCall(ToolCallRequest {
                id,
                name: call.name,
                arguments: call.arguments,
            })));
        }
        events.push(Ok(TurnEvent::Finish));
        self.finished = true;
    }
}

fn in_stream_error(err: &Value) -> BackendError {
    let message = err["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    match err["code"].as_u64() {
        Some(429) => BackendError::RateLimited,
        Some(code) => BackendError::Status {
            status: u16::try_from(code).unwrap_or(500),
            body: truncate_chars(&message, ERROR_BODY_LIMIT),
        },
        None => BackendError::Stream(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::query_database_spec;

    fn collect(parser: &mut CompletionStreamParser, chunks: &[&str]) -> Vec<Result<TurnEvent, BackendError>> {
        let mut out = Vec::new();
        for c in chunks {
            out.extend(parser.feed(c.as_bytes()));
        }
        out.extend(parser.finish());
        out
    }

    #[test]
    fn text_deltas_are_emitted_in_order() {
        let mut p = CompletionStreamParser::default();
        let events = collect(&mut p, &[
            ": OPENROUTER PROCESSING\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Pen\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"jualan\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
        ]);
        assert_eq!(
            events,
            vec![
                Ok(TurnEvent::TextDelta("Pen".into())),
                Ok(TurnEvent::TextDelta("jualan".into())),
                Ok(TurnEvent::Finish),
            ]
        );
    }

    #[test]
    fn lines_split_across_chunks_and_utf8_boundaries() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"Rp 1,2 jt — naik\"}}]}\n";
        let bytes = line.as_bytes();
        let dash = line.find('—').unwrap();
        let mut p = CompletionStreamParser::default();
        let mut events = p.feed(&bytes[..dash + 1]);
        assert!(events.is_empty());
        events.extend(p.feed(&bytes[dash + 1..]));
        assert_eq!(events, vec![Ok(TurnEvent::TextDelta("Rp 1,2 jt — naik".into()))]);
    }

    #[test]
    fn tool_call_fragments_are_assembled_by_index() {
        let mut p = CompletionStreamParser::default();
        let events = collect(&mut p, &[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"queryDatabase\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"sql\\\":\\\"SELECT 1\\\",\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"purpose\\\":\\\"probe\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        ]);
        assert_eq!(
            events,
            vec![
                Ok(TurnEvent::ToolCall(ToolCallRequest {
                    id: "call_a".into(),
                    name: "queryDatabase".into(),
                    arguments: "{\"sql\":\"SELECT 1\",\"purpose\":\"probe\"}".into(),
                })),
                Ok(TurnEvent::Finish),
            ]
        );
    }

    #[test]
    fn missing_finish_reason_still_releases_tool_calls() {
        let mut p = CompletionStreamParser::default();
        let events = collect(&mut p, &[
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":1,\"function\":{\"name\":\"queryDatabase\",\"arguments\":\"{}\"}}]}}]}",
        ]);
        assert_eq!(
            events,
            vec![
                Ok(TurnEvent::ToolCall(ToolCallRequest {
                    id: "call_1".into(),
                    name: "queryDatabase".into(),
                    arguments: "{}".into(),
                })),
                Ok(TurnEvent::Finish),
            ]
        );
    }

    #[test]
    fn in_stream_errors_become_failures() {
        let mut p = CompletionStreamParser::default();
        let events = collect(&mut p, &[
            "data: {\"error\":{\"code\":429,\"message\":\"Rate limit exceeded: free-models-per-min\"}}\n\n",
        ]);
        assert_eq!(events, vec![Err(BackendError::RateLimited)]);

        let mut p = CompletionStreamParser::default();
        let events = collect(&mut p, &["data: {\"error\":{\"message\":\"Provider returned error\"}}\n\n"]);
        assert_eq!(events, vec![Err(BackendError::Stream("Provider returned error".into()))]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut p = CompletionStreamParser::default();
        assert!(collect(&mut p, &[": keepalive\n\n"]).is_empty());
    }

    #[test]
    fn request_body_carries_tools_and_history() {
        let req = TurnRequest {
            messages: vec![
                ModelMessage::System { content: "sys".into() },
                ModelMessage::User { content: "top store?".into() },
                ModelMessage::Assistant {
                    content: String::new(),
                    tool_calls: vec![ToolCallRequest {
                        id: "c1".into(),
                        name: "queryDatabase".into(),
                        arguments: "{}".into(),
                    }],
                },
                ModelMessage::Tool { call_id: "c1".into(), content: "{\"success\":true}".into() },
            ],
            tools: vec![query_database_spec()],
        };
        let body = request_body("qwen/qwen3-30b-a3b:free", &req);
        assert_eq!(body["model"], "qwen/qwen3-30b-a3b:free");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["function"]["name"], "queryDatabase");
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[2]["content"], Value::Null);
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(msgs[3]["tool_call_id"], "c1");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("ééééé", 2), "éé…");
    }
}
