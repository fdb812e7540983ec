//! Streaming plumbing: upstream bytes → caller SSE, with usage tracking.
//!
//! Every streaming request carries exactly one [`UsageGuard`]; its commit
//! runs on normal completion, upstream error, and client disconnect alike
//! (the guard commits from Drop when the response stream is dropped).

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use crate::translate::gemini::{cli_event_to_openai_chunks, ChatToGeminiStream, CliStreamState};
use crate::translate::responses::{ChatToResponsesStream, ResponsesToChatStream};
use crate::translate::anthropic::OpenAiToAnthropicStream;
use crate::translate::{drain_sse_lines, is_sse_done, parse_sse_data, parse_tool_arguments, Usage};
use crate::upstream::kiro::KiroStreamAdapter;
use crate::usage::{self, SseUsageTracker, UsageRecord};

/// Re-expresses upstream bytes as OpenAI chat-chunk SSE (the hub dialect),
/// except for the passthrough variants where the bytes already are the
/// final dialect.
pub enum UpstreamAdapter {
    /// Upstream already speaks chat-chunk SSE.
    Passthrough,
    /// Codex upstream serving a Responses-dialect caller: forward raw.
    RawResponses,
    /// Codex upstream lowered to chat chunks.
    Responses(ResponsesToChatStream),
    /// GeminiCLI `data:` events lifted into chat chunks.
    GeminiCli {
        state: CliStreamState,
        line_buffer: Vec<u8>,
    },
    /// Kiro event-stream frames lifted into chat chunks.
    Kiro(KiroStreamAdapter),
}

impl UpstreamAdapter {
    /// True when the adapter's output is already the caller's dialect and
    /// no emitter should run on top.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpstreamAdapter::RawResponses)
    }

    pub fn adapt(&mut self, bytes: &[u8]) -> Vec<u8> {
        match self {
            UpstreamAdapter::Passthrough | UpstreamAdapter::RawResponses => bytes.to_vec(),
            UpstreamAdapter::Responses(translator) => {
                translator.feed(bytes).concat().into_bytes()
            }
            UpstreamAdapter::GeminiCli { state, line_buffer } => {
                let mut out = String::new();
                for line in drain_sse_lines(line_buffer, bytes) {
                    let Some(data) = parse_sse_data(&line) else {
                        continue;
                    };
                    if is_sse_done(data) {
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    for chunk in cli_event_to_openai_chunks(&event, state) {
                        out.push_str(&format!("data: {chunk}\n\n"));
                    }
                }
                out.into_bytes()
            }
            UpstreamAdapter::Kiro(adapter) => {
                let chunks = match adapter.feed(bytes) {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        crate::logger::error("stream", &format!("kiro decode error: {e}"));
                        vec![json!({"error": {"message": e.to_string(), "type": "upstream_error"}})]
                    }
                };
                chunks
                    .iter()
                    .map(|c| format!("data: {c}\n\n"))
                    .collect::<String>()
                    .into_bytes()
            }
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            UpstreamAdapter::Kiro(adapter) => adapter
                .finalize()
                .iter()
                .map(|c| format!("data: {c}\n\n"))
                .collect::<String>()
                .into_bytes(),
            _ => Vec::new(),
        }
    }
}

/// Serializes hub chat chunks into the caller's wire dialect.
pub enum CallerEmitter {
    /// Chat-dialect caller: forward and guarantee a trailing `[DONE]`.
    OpenAiChat { done_seen: bool },
    /// The adapter output is already final (Responses passthrough).
    Raw,
    Anthropic(OpenAiToAnthropicStream),
    Responses(ChatToResponsesStream),
    Gemini(ChatToGeminiStream),
}

impl CallerEmitter {
    pub fn feed(&mut self, sse: &[u8]) -> Vec<Bytes> {
        match self {
            CallerEmitter::OpenAiChat { done_seen } => {
                if twoway_contains(sse, b"data: [DONE]") {
                    *done_seen = true;
                }
                if sse.is_empty() {
                    Vec::new()
                } else {
                    vec![Bytes::copy_from_slice(sse)]
                }
            }
            CallerEmitter::Raw => {
                if sse.is_empty() {
                    Vec::new()
                } else {
                    vec![Bytes::copy_from_slice(sse)]
                }
            }
            CallerEmitter::Anthropic(emitter) => {
                emitter.feed(sse).into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
            CallerEmitter::Responses(emitter) => {
                emitter.feed(sse).into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
            CallerEmitter::Gemini(emitter) => {
                emitter.feed(sse).into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
        }
    }

    pub fn finalize(&mut self) -> Vec<Bytes> {
        match self {
            CallerEmitter::OpenAiChat { done_seen } => {
                if *done_seen {
                    Vec::new()
                } else {
                    vec![Bytes::from_static(b"data: [DONE]\n\n")]
                }
            }
            CallerEmitter::Raw => Vec::new(),
            CallerEmitter::Anthropic(emitter) => {
                emitter.finalize().into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
            CallerEmitter::Responses(emitter) => {
                emitter.finalize().into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
            CallerEmitter::Gemini(emitter) => {
                emitter.finalize().into_iter().map(|s| Bytes::from(s.into_bytes())).collect()
            }
        }
    }
}

fn twoway_contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Owns the request's usage record; committing is idempotent and also runs
/// from Drop so cancelled transfers still produce their log row.
pub struct UsageGuard {
    record: Option<UsageRecord>,
    pub tracker: SseUsageTracker,
    started: Instant,
}

impl UsageGuard {
    pub fn new(record: UsageRecord) -> Self {
        Self {
            record: Some(record),
            tracker: SseUsageTracker::new(),
            started: Instant::now(),
        }
    }

    pub fn feed(&mut self, sse: &[u8]) {
        self.tracker.feed(sse);
    }

    pub fn commit(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.usage = self.tracker.finalize();
        // An in-stream error supersedes the HTTP status for logging.
        if !self.tracker.success {
            record.success = false;
            record.status_code = self.tracker.status_code.or(record.status_code);
            record.error_message = self.tracker.error_message.clone().or(record.error_message);
        }
        record.duration_ms = self.started.elapsed().as_millis() as i64;
        usage::commit(&record);
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.commit();
    }
}

struct StreamState {
    adapter: UpstreamAdapter,
    emitter: CallerEmitter,
    guard: UsageGuard,
}

/// Build the chunked SSE response for an opened upstream stream.
pub fn sse_response(
    upstream: reqwest::Response,
    adapter: UpstreamAdapter,
    emitter: CallerEmitter,
    guard: UsageGuard,
) -> Response {
    let state = Arc::new(Mutex::new(StreamState {
        adapter,
        emitter,
        guard,
    }));
    let tail_state = Arc::clone(&state);

    let stream = upstream
        .bytes_stream()
        .map(move |result| {
            let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
            match result {
                Ok(bytes) => {
                    let adapted = st.adapter.adapt(&bytes);
                    st.guard.feed(&adapted);
                    st.emitter
                        .feed(&adapted)
                        .into_iter()
                        .map(Ok::<Bytes, std::io::Error>)
                        .collect::<Vec<_>>()
                }
                Err(e) => {
                    crate::logger::error("stream", &format!("upstream read error: {e}"));
                    vec![Err(std::io::Error::other(e.to_string()))]
                }
            }
        })
        .chain(futures_util::stream::once(async move {
            let mut st = tail_state.lock().unwrap_or_else(|p| p.into_inner());
            let mut out: Vec<Result<Bytes, std::io::Error>> = Vec::new();
            let tail = st.adapter.finish();
            if !tail.is_empty() {
                st.guard.feed(&tail);
                out.extend(st.emitter.feed(&tail).into_iter().map(Ok));
            }
            out.extend(st.emitter.finalize().into_iter().map(Ok));
            st.guard.commit();
            out
        }))
        .flat_map(futures_util::stream::iter);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            crate::logger::error("stream", &format!("failed to build stream response: {e}"));
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("empty body response")
        })
}

// ---------------------------------------------------------------------------
// Non-streaming aggregation
// ---------------------------------------------------------------------------

/// Fold a chat-chunk SSE byte run into one chat.completion object.
pub fn chunks_to_completion(sse: &[u8], model_fallback: &str) -> Value {
    let mut buffer = Vec::new();
    let lines = drain_sse_lines(&mut buffer, sse);

    let mut id = String::new();
    let mut model = String::new();
    let mut created = 0i64;
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage = Usage::default();
    let mut tool_calls: std::collections::BTreeMap<i64, (String, String, String)> =
        std::collections::BTreeMap::new();

    for line in lines {
        let Some(data) = parse_sse_data(&line) else {
            continue;
        };
        if is_sse_done(data) {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            continue;
        };

        if let Some(chunk_id) = payload.get("id").and_then(|i| i.as_str()) {
            if id.is_empty() && !chunk_id.is_empty() {
                id = chunk_id.to_string();
            }
        }
        if let Some(m) = payload.get("model").and_then(|m| m.as_str()) {
            if model.is_empty() && !m.is_empty() {
                model = m.to_string();
            }
        }
        if created == 0 {
            created = payload.get("created").and_then(|c| c.as_i64()).unwrap_or(0);
        }
        if let Some(parsed) = crate::translate::extract_openai_usage(&payload) {
            if !parsed.is_empty() {
                usage = parsed;
            }
        }

        let Some(choice) = payload
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            if !reason.is_empty() {
                finish_reason = Some(reason.to_string());
            }
        }
        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            content.push_str(text);
        }
        if let Some(text) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
            reasoning.push_str(text);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in calls {
                let idx = tc.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
                let entry = tool_calls.entry(idx).or_default();
                if let Some(call_id) = tc.get("id").and_then(|i| i.as_str()).filter(|s| !s.is_empty()) {
                    entry.0 = call_id.to_string();
                }
                if let Some(name) = tc
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .filter(|s| !s.is_empty())
                {
                    entry.1 = name.to_string();
                }
                if let Some(args) = tc.pointer("/function/arguments").and_then(|a| a.as_str()) {
                    entry.2.push_str(args);
                }
            }
        }
    }

    let mut message = Map::new();
    message.insert("role".to_string(), json!("assistant"));
    message.insert("content".to_string(), json!(content));
    if !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !tool_calls.is_empty() {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|(idx, (call_id, name, args))| {
                // validate accumulated args; "" becomes {}
                let parsed = parse_tool_arguments(args, name, call_id);
                json!({
                    "id": call_id,
                    "index": idx,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(&parsed).unwrap_or_else(|_| "{}".to_string())
                    }
                })
            })
            .collect();
        message.insert("tool_calls".to_string(), Value::Array(calls));
        if finish_reason.is_none() {
            finish_reason = Some("tool_calls".to_string());
        }
    }

    let usage = usage.finalized();
    json!({
        "id": if id.is_empty() { format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()) } else { id },
        "object": "chat.completion",
        "created": if created > 0 { created } else { chrono::Utc::now().timestamp() },
        "model": if model.is_empty() { model_fallback.to_string() } else { model },
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason.unwrap_or_else(|| "stop".to_string())
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
            "prompt_tokens_details": {"cached_tokens": usage.cached_tokens}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_fold_into_completion_with_tools() {
        let sse = concat!(
            "data: {\"id\":\"x\",\"model\":\"m\",\"created\":9,\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"}}]}\n\n",
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"type\":\"function\",\"function\":{\"name\":\"f\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"type\":\"function\",\"function\":{\"arguments\":\"{\\\"x\\\":1}\"}}]},\"finish_reason\":\"tool_calls\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        let completion = chunks_to_completion(sse.as_bytes(), "fallback");
        assert_eq!(completion["choices"][0]["message"]["content"], "hello");
        assert_eq!(completion["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            completion["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
            "{\"x\":1}"
        );
        assert_eq!(completion["usage"]["total_tokens"], 4);
        assert_eq!(completion["model"], "m");
    }

    #[test]
    fn empty_stream_still_yields_a_completion() {
        let completion = chunks_to_completion(b"", "m");
        assert_eq!(completion["choices"][0]["message"]["content"], "");
        assert_eq!(completion["choices"][0]["finish_reason"], "stop");
        assert_eq!(completion["model"], "m");
    }

    #[test]
    fn openai_emitter_appends_done_once() {
        let mut emitter = CallerEmitter::OpenAiChat { done_seen: false };
        let out = emitter.feed(b"data: {\"choices\":[]}\n\n");
        assert_eq!(out.len(), 1);
        let tail = emitter.finalize();
        assert_eq!(tail.len(), 1);
        assert_eq!(&tail[0][..], b"data: [DONE]\n\n");

        let mut emitter = CallerEmitter::OpenAiChat { done_seen: false };
        emitter.feed(b"data: [DONE]\n\n");
        assert!(emitter.finalize().is_empty());
    }
}
