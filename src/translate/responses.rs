//! OpenAI Responses ↔ Chat Completions translation.
//!
//! Request side lowers typed input items into chat messages; the streaming
//! side replays a ChatCompletions SSE stream as `event: response.*` events
//! with a monotonic `sequence_number` on every event.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{drain_sse_lines, is_sse_done, parse_sse_data, sse_event, Usage};

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn normalize_role(role: &str) -> &'static str {
    match role.trim().to_ascii_lowercase().as_str() {
        "developer" | "system" => "system",
        "assistant" => "assistant",
        "tool" => "tool",
        _ => "user",
    }
}

fn message_content_to_chat(content: &Value) -> Option<Value> {
    if let Some(s) = content.as_str() {
        return Some(Value::String(s.to_string()));
    }

    let parts = content.as_array()?;
    let mut images: Vec<Value> = Vec::new();
    let mut texts: Vec<&str> = Vec::new();

    for part in parts {
        match str_field(part, "type") {
            "input_text" | "output_text" | "text" => {
                let text = str_field(part, "text");
                if !text.is_empty() {
                    texts.push(text);
                }
            }
            "input_image" | "image" => {
                let url = part
                    .get("image_url")
                    .and_then(|u| u.as_str())
                    .or_else(|| part.get("url").and_then(|u| u.as_str()))
                    .unwrap_or("");
                if !url.is_empty() {
                    images.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            _ => {}
        }
    }

    if !images.is_empty() {
        let mut out = Vec::new();
        if !texts.is_empty() {
            out.push(json!({"type": "text", "text": texts.join("\n")}));
        }
        out.extend(images);
        return Some(Value::Array(out));
    }
    if !texts.is_empty() {
        return Some(Value::String(texts.join("\n")));
    }
    None
}

fn input_to_chat_messages(input: &Value) -> Vec<Value> {
    match input {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![json!({"role": "user", "content": trimmed})]
            }
        }
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match str_field(item, "type") {
                    // Bare {role, content} items are messages too.
                    "message" | "" => {
                        let role = normalize_role(str_field(item, "role"));
                        if let Some(content) = item.get("content").and_then(message_content_to_chat) {
                            out.push(json!({"role": role, "content": content}));
                        }
                    }
                    "function_call" => {
                        let call_id = str_field(item, "call_id");
                        out.push(json!({
                            "role": "assistant",
                            "content": null,
                            "tool_calls": [{
                                "id": call_id,
                                "type": "function",
                                "function": {
                                    "name": str_field(item, "name"),
                                    "arguments": str_field(item, "arguments")
                                }
                            }]
                        }));
                    }
                    "function_call_output" => {
                        let output = match item.get("output") {
                            Some(Value::String(s)) => s.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": str_field(item, "call_id"),
                            "content": output
                        }));
                    }
                    _ => {}
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// `/v1/responses` request → `/v1/chat/completions` request.
pub fn responses_request_to_chat(request: &Value) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), request.get("model").cloned().unwrap_or(Value::Null));

    let mut messages = Vec::new();
    if let Some(instructions) = request.get("instructions").and_then(|i| i.as_str()) {
        if !instructions.trim().is_empty() {
            messages.push(json!({"role": "system", "content": instructions}));
        }
    }
    if let Some(input) = request.get("input") {
        messages.extend(input_to_chat_messages(input));
    }
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "stream".to_string(),
        Value::Bool(request.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)),
    );

    for key in ["temperature", "top_p"] {
        if let Some(v) = request.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    if let Some(v) = request.get("max_output_tokens").filter(|v| !v.is_null()) {
        out.insert("max_tokens".to_string(), v.clone());
    }
    for key in ["tools", "tool_choice", "user", "metadata", "response_format", "seed"] {
        if let Some(v) = request.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }

    Value::Object(out)
}

fn extract_chat_text(chat_resp: &Value) -> String {
    let message = chat_resp
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or(Value::Null);
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| str_field(p, "type") == "text")
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect(),
        _ => String::new(),
    }
}

/// Non-streaming chat.completion → response object.
pub fn chat_response_to_responses(chat_resp: &Value, original_request: &Value) -> Value {
    let chat_id = str_field(chat_resp, "id").trim();
    let created_at = chat_resp
        .get("created")
        .and_then(|c| c.as_i64())
        .filter(|c| *c > 0)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let resp_id = if chat_id.starts_with("resp_") {
        chat_id.to_string()
    } else if chat_id.is_empty() {
        format!("resp_{}", Uuid::new_v4().simple())
    } else {
        format!("resp_{chat_id}")
    };
    let msg_id = format!("msg_{resp_id}_0");

    let mut out = json!({
        "id": resp_id,
        "object": "response",
        "created_at": created_at,
        "status": "completed",
        "background": false,
        "error": null,
        "output": [{
            "id": msg_id,
            "type": "message",
            "status": "completed",
            "role": "assistant",
            "content": [{
                "type": "output_text",
                "text": extract_chat_text(chat_resp),
                "annotations": [],
                "logprobs": []
            }]
        }]
    });

    let model = str_field(chat_resp, "model");
    if !model.is_empty() {
        out["model"] = json!(model);
    } else if let Some(model) = original_request.get("model") {
        out["model"] = model.clone();
    }

    if let Some(usage) = chat_resp.get("usage").filter(|u| u.is_object()) {
        out["usage"] = json!({
            "input_tokens": usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
            "output_tokens": usage.get("completion_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
            "total_tokens": usage.get("total_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        });
    }

    for key in ["instructions", "max_output_tokens", "tools", "tool_choice"] {
        if let Some(v) = original_request.get(key).filter(|v| !v.is_null()) {
            out[key] = v.clone();
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Streaming: ChatCompletions SSE → Responses SSE
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ToolCallState {
    call_id: String,
    name: String,
    arguments: String,
    item_added: bool,
}

/// State machine translating chat chunk SSE into `response.*` events.
pub struct ChatToResponsesStream {
    original_request: Value,

    buffer: Vec<u8>,
    started: bool,
    upstream_done: bool,
    finalized: bool,
    error_emitted: bool,

    seq: i64,
    resp_id: String,
    created_at: i64,
    msg_item_id: String,
    text_buf: String,
    msg_open: bool,
    msg_done: bool,

    tool_calls: BTreeMap<i64, ToolCallState>,
    pub usage: Usage,
}

impl ChatToResponsesStream {
    pub fn new(original_request: Value) -> Self {
        Self {
            original_request,
            buffer: Vec::new(),
            started: false,
            upstream_done: false,
            finalized: false,
            error_emitted: false,
            seq: 0,
            resp_id: String::new(),
            created_at: 0,
            msg_item_id: String::new(),
            text_buf: String::new(),
            msg_open: false,
            msg_done: false,
            tool_calls: BTreeMap::new(),
            usage: Usage::default(),
        }
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn emit(&self, event_name: &str, payload: &Value) -> String {
        sse_event(Some(event_name), payload)
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finalized || self.upstream_done {
            return out;
        }

        for line in drain_sse_lines(&mut self.buffer, chunk) {
            let Some(data) = parse_sse_data(&line) else {
                continue;
            };
            if is_sse_done(data) {
                self.upstream_done = true;
                break;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(err) = payload.get("error") {
                self.error_emitted = true;
                self.upstream_done = true;
                out.push(self.emit("error", &json!({"type": "error", "error": err})));
                break;
            }

            if let Some(usage) = super::extract_openai_usage(&payload) {
                if !usage.is_empty() {
                    self.usage = usage;
                }
            }

            out.extend(self.ensure_started(&payload));

            let Some(choice) = payload
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            else {
                continue;
            };
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                let calls: Vec<Value> = tool_calls.clone();
                out.extend(self.close_message_if_needed());
                out.extend(self.handle_tool_calls(&calls));
            }

            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty() {
                    out.extend(self.ensure_message_open());
                    self.text_buf.push_str(content);
                    let event = json!({
                        "type": "response.output_text.delta",
                        "sequence_number": self.next_seq(),
                        "item_id": self.msg_item_id,
                        "output_index": 0,
                        "content_index": 0,
                        "delta": content,
                        "logprobs": []
                    });
                    out.push(self.emit("response.output_text.delta", &event));
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                if !reason.is_empty() {
                    self.upstream_done = true;
                    break;
                }
            }
        }

        out
    }

    /// Emit the closing event run: done events for the open message and
    /// tool calls, then `response.completed`.
    pub fn finalize(&mut self) -> Vec<String> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;
        if self.error_emitted {
            return Vec::new();
        }
        self.build_done_events()
    }

    fn ensure_started(&mut self, chat_chunk: &Value) -> Vec<String> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        let chat_id = str_field(chat_chunk, "id").trim();
        self.created_at = chat_chunk
            .get("created")
            .and_then(|c| c.as_i64())
            .filter(|c| *c > 0)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        self.resp_id = if chat_id.starts_with("resp_") {
            chat_id.to_string()
        } else if chat_id.is_empty() {
            format!("resp_{}", Uuid::new_v4().simple())
        } else {
            format!("resp_{chat_id}")
        };
        self.msg_item_id = format!("msg_{}_0", self.resp_id);

        let created = json!({
            "type": "response.created",
            "sequence_number": self.next_seq(),
            "response": {
                "id": self.resp_id,
                "object": "response",
                "created_at": self.created_at,
                "status": "in_progress",
                "background": false,
                "error": null,
                "output": []
            }
        });
        let in_progress = json!({
            "type": "response.in_progress",
            "sequence_number": self.next_seq(),
            "response": {
                "id": self.resp_id,
                "object": "response",
                "created_at": self.created_at,
                "status": "in_progress"
            }
        });
        vec![
            self.emit("response.created", &created),
            self.emit("response.in_progress", &in_progress),
        ]
    }

    fn ensure_message_open(&mut self) -> Vec<String> {
        if self.msg_open {
            return Vec::new();
        }
        self.msg_open = true;

        let item_added = json!({
            "type": "response.output_item.added",
            "sequence_number": self.next_seq(),
            "output_index": 0,
            "item": {
                "id": self.msg_item_id,
                "type": "message",
                "status": "in_progress",
                "content": [],
                "role": "assistant"
            }
        });
        let part_added = json!({
            "type": "response.content_part.added",
            "sequence_number": self.next_seq(),
            "item_id": self.msg_item_id,
            "output_index": 0,
            "content_index": 0,
            "part": {"type": "output_text", "annotations": [], "logprobs": [], "text": ""}
        });
        vec![
            self.emit("response.output_item.added", &item_added),
            self.emit("response.content_part.added", &part_added),
        ]
    }

    fn close_message_if_needed(&mut self) -> Vec<String> {
        if !self.msg_open || self.msg_done {
            return Vec::new();
        }
        self.msg_done = true;

        let full_text = self.text_buf.clone();
        let text_done = json!({
            "type": "response.output_text.done",
            "sequence_number": self.next_seq(),
            "item_id": self.msg_item_id,
            "output_index": 0,
            "content_index": 0,
            "text": full_text,
            "logprobs": []
        });
        let part_done = json!({
            "type": "response.content_part.done",
            "sequence_number": self.next_seq(),
            "item_id": self.msg_item_id,
            "output_index": 0,
            "content_index": 0,
            "part": {"type": "output_text", "annotations": [], "logprobs": [], "text": full_text}
        });
        let item_done = json!({
            "type": "response.output_item.done",
            "sequence_number": self.next_seq(),
            "output_index": 0,
            "item": {
                "id": self.msg_item_id,
                "type": "message",
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "annotations": [], "logprobs": [], "text": full_text}]
            }
        });
        vec![
            self.emit("response.output_text.done", &text_done),
            self.emit("response.content_part.done", &part_done),
            self.emit("response.output_item.done", &item_done),
        ]
    }

    fn handle_tool_calls(&mut self, tool_calls: &[Value]) -> Vec<String> {
        let mut out = Vec::new();
        for tc in tool_calls {
            if str_field(tc, "type") != "function" && tc.get("function").is_none() {
                continue;
            }
            let idx = tc.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
            let function = tc.get("function").cloned().unwrap_or(Value::Null);

            {
                let resp_id = self.resp_id.clone();
                let state = self.tool_calls.entry(idx).or_insert_with(|| ToolCallState {
                    call_id: format!("call_{resp_id}_{idx}"),
                    ..Default::default()
                });
                if let Some(id) = tc.get("id").and_then(|i| i.as_str()).filter(|s| !s.is_empty()) {
                    state.call_id = id.to_string();
                }
                if let Some(name) = function.get("name").and_then(|n| n.as_str()).filter(|s| !s.is_empty()) {
                    state.name = name.to_string();
                }
            }

            let Some(args_delta) = function
                .get("arguments")
                .and_then(|a| a.as_str())
                .filter(|a| !a.is_empty())
            else {
                continue;
            };

            let (item_id, needs_item, name, call_id) = {
                let state = self.tool_calls.get_mut(&idx).expect("state just inserted");
                state.arguments.push_str(args_delta);
                let needs_item = !state.item_added;
                state.item_added = true;
                (
                    format!("fc_{}", state.call_id),
                    needs_item,
                    state.name.clone(),
                    state.call_id.clone(),
                )
            };

            if needs_item {
                let item_added = json!({
                    "type": "response.output_item.added",
                    "sequence_number": self.next_seq(),
                    "output_index": idx,
                    "item": {
                        "id": item_id,
                        "type": "function_call",
                        "status": "in_progress",
                        "arguments": "",
                        "call_id": call_id,
                        "name": name
                    }
                });
                out.push(self.emit("response.output_item.added", &item_added));
            }

            let delta_event = json!({
                "type": "response.function_call_arguments.delta",
                "sequence_number": self.next_seq(),
                "item_id": item_id,
                "output_index": idx,
                "delta": args_delta
            });
            out.push(self.emit("response.function_call_arguments.delta", &delta_event));
        }
        out
    }

    fn build_done_events(&mut self) -> Vec<String> {
        let mut out = self.close_message_if_needed();

        let tool_snapshot: Vec<(i64, String, String, String)> = self
            .tool_calls
            .iter()
            .filter(|(_, st)| st.item_added)
            .map(|(idx, st)| (*idx, st.call_id.clone(), st.name.clone(), st.arguments.clone()))
            .collect();

        for (idx, call_id, name, arguments) in &tool_snapshot {
            let item_id = format!("fc_{call_id}");
            let args_done = json!({
                "type": "response.function_call_arguments.done",
                "sequence_number": self.next_seq(),
                "item_id": item_id,
                "output_index": idx,
                "arguments": arguments
            });
            out.push(self.emit("response.function_call_arguments.done", &args_done));
            let item_done = json!({
                "type": "response.output_item.done",
                "sequence_number": self.next_seq(),
                "output_index": idx,
                "item": {
                    "id": item_id,
                    "type": "function_call",
                    "status": "completed",
                    "arguments": arguments,
                    "call_id": call_id,
                    "name": name
                }
            });
            out.push(self.emit("response.output_item.done", &item_done));
        }

        let mut outputs: Vec<Value> = Vec::new();
        if !self.msg_item_id.is_empty() {
            outputs.push(json!({
                "id": self.msg_item_id,
                "type": "message",
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "annotations": [], "logprobs": [], "text": self.text_buf}]
            }));
        }
        for (_, call_id, name, arguments) in &tool_snapshot {
            outputs.push(json!({
                "id": format!("fc_{call_id}"),
                "type": "function_call",
                "status": "completed",
                "arguments": arguments,
                "call_id": call_id,
                "name": name
            }));
        }

        let mut response = json!({
            "id": if self.resp_id.is_empty() {
                format!("resp_{}", Uuid::new_v4().simple())
            } else {
                self.resp_id.clone()
            },
            "object": "response",
            "created_at": if self.created_at > 0 { self.created_at } else { chrono::Utc::now().timestamp() },
            "status": "completed",
            "background": false,
            "error": null
        });
        if !outputs.is_empty() {
            response["output"] = Value::Array(outputs);
        }

        let usage = self.usage.finalized();
        if !usage.is_empty() {
            response["usage"] = json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "total_tokens": usage.total_tokens
            });
        }

        for key in ["model", "instructions", "max_output_tokens"] {
            if let Some(v) = self.original_request.get(key).filter(|v| !v.is_null()) {
                response[key] = v.clone();
            }
        }

        let completed = json!({
            "type": "response.completed",
            "sequence_number": self.next_seq(),
            "response": response
        });
        out.push(self.emit("response.completed", &completed));
        out
    }
}

// ---------------------------------------------------------------------------
// Chat → Responses request, and Responses → Chat (the Codex upstream only
// speaks the Responses dialect)
// ---------------------------------------------------------------------------

/// Chat request → Responses request: system messages become instructions,
/// the rest of the conversation becomes typed input items.
pub fn chat_request_to_responses(chat: &Value) -> Value {
    let mut out = Map::new();
    out.insert("model".to_string(), chat.get("model").cloned().unwrap_or(Value::Null));

    let mut instructions: Vec<&str> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    let empty = Vec::new();
    for message in chat.get("messages").and_then(|m| m.as_array()).unwrap_or(&empty) {
        let role = str_field(message, "role");
        match role {
            "system" | "developer" => {
                if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
                    if !text.is_empty() {
                        instructions.push(text);
                    }
                }
            }
            "tool" => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": str_field(message, "tool_call_id"),
                    "output": message.get("content").and_then(|c| c.as_str()).unwrap_or("")
                }));
            }
            "assistant" => {
                if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc in tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": str_field(tc, "id"),
                            "name": tc.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or(""),
                            "arguments": tc.pointer("/function/arguments").and_then(|a| a.as_str()).unwrap_or("")
                        }));
                    }
                }
                let text = match message.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect(),
                    _ => String::new(),
                };
                if !text.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}]
                    }));
                }
            }
            _ => {
                let content = match message.get("content") {
                    Some(Value::String(s)) => json!([{"type": "input_text", "text": s}]),
                    Some(Value::Array(parts)) => {
                        let mut items = Vec::new();
                        for part in parts {
                            match str_field(part, "type") {
                                "text" => items.push(json!({
                                    "type": "input_text",
                                    "text": part.get("text").cloned().unwrap_or(Value::Null)
                                })),
                                "image_url" => {
                                    let url = part
                                        .pointer("/image_url/url")
                                        .and_then(|u| u.as_str())
                                        .unwrap_or("");
                                    items.push(json!({"type": "input_image", "image_url": url}));
                                }
                                _ => {}
                            }
                        }
                        Value::Array(items)
                    }
                    _ => json!([]),
                };
                input.push(json!({"type": "message", "role": "user", "content": content}));
            }
        }
    }

    if !instructions.is_empty() {
        out.insert("instructions".to_string(), json!(instructions.join("\n")));
    }
    out.insert("input".to_string(), Value::Array(input));
    out.insert(
        "stream".to_string(),
        Value::Bool(chat.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)),
    );
    if let Some(v) = chat.get("max_tokens").filter(|v| !v.is_null()) {
        out.insert("max_output_tokens".to_string(), v.clone());
    }
    for key in ["temperature", "top_p", "tool_choice"] {
        if let Some(v) = chat.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }

    // Responses tools are flat, not nested under `function`.
    if let Some(tools) = chat.get("tools").and_then(|t| t.as_array()) {
        let flattened: Vec<Value> = tools
            .iter()
            .map(|tool| match tool.get("function") {
                Some(function) => {
                    let mut flat = Map::new();
                    flat.insert("type".to_string(), json!("function"));
                    for key in ["name", "description", "parameters"] {
                        if let Some(v) = function.get(key) {
                            flat.insert(key.to_string(), v.clone());
                        }
                    }
                    Value::Object(flat)
                }
                None => tool.clone(),
            })
            .collect();
        if !flattened.is_empty() {
            out.insert("tools".to_string(), Value::Array(flattened));
        }
    }

    Value::Object(out)
}

/// Responses response object → chat.completion.
pub fn responses_response_to_chat(response: &Value, model_fallback: &str) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    let empty = Vec::new();
    for item in response.get("output").and_then(|o| o.as_array()).unwrap_or(&empty) {
        match str_field(item, "type") {
            "message" => {
                if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                    for part in parts {
                        if str_field(part, "type") == "output_text" {
                            text.push_str(str_field(part, "text"));
                        }
                    }
                }
            }
            "reasoning" => {
                if let Some(summary) = item.get("summary").and_then(|s| s.as_array()) {
                    for part in summary {
                        reasoning.push_str(str_field(part, "text"));
                    }
                }
            }
            "function_call" => {
                tool_calls.push(json!({
                    "id": str_field(item, "call_id"),
                    "type": "function",
                    "function": {
                        "name": str_field(item, "name"),
                        "arguments": str_field(item, "arguments")
                    }
                }));
            }
            _ => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };

    let mut message = json!({"role": "assistant", "content": text});
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    let model = {
        let m = str_field(response, "model");
        if m.is_empty() { model_fallback } else { m }
    };

    let mut out = json!({
        "id": format!("chatcmpl-{}", str_field(response, "id").trim_start_matches("resp_")),
        "object": "chat.completion",
        "created": response.get("created_at").and_then(|c| c.as_i64()).unwrap_or_else(|| chrono::Utc::now().timestamp()),
        "model": model,
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}]
    });

    if let Some(usage) = response.get("usage").filter(|u| u.is_object()) {
        let input = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let total = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(input + output);
        let cached = usage
            .pointer("/input_tokens_details/cached_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        out["usage"] = json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": total,
            "prompt_tokens_details": {"cached_tokens": cached}
        });
    }

    out
}

#[derive(Default)]
struct ResponsesToolState {
    call_id: String,
    name: String,
    index: i64,
}

/// Responses SSE → ChatCompletions SSE (used when a chat-dialect caller is
/// served by the Codex upstream).
pub struct ResponsesToChatStream {
    buffer: Vec<u8>,
    finished: bool,
    emitted_done: bool,
    chat_id: String,
    created: i64,
    tool_items: std::collections::HashMap<String, ResponsesToolState>,
    next_tool_index: i64,
    current_item: Option<String>,
    pub usage: Usage,
}

impl Default for ResponsesToChatStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponsesToChatStream {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            finished: false,
            emitted_done: false,
            chat_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            tool_items: std::collections::HashMap::new(),
            next_tool_index: -1,
            current_item: None,
            usage: Usage::default(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        sse_event(
            None,
            &json!({
                "id": self.chat_id,
                "object": "chat.completion.chunk",
                "created": self.created,
                "model": "",
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
            }),
        )
    }

    pub fn feed(&mut self, raw: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        for line in drain_sse_lines(&mut self.buffer, raw) {
            let Some(data) = parse_sse_data(&line) else {
                continue;
            };
            if is_sse_done(data) {
                continue;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(usage) = super::extract_openai_usage(&payload) {
                if !usage.is_empty() {
                    self.usage = usage;
                }
            }

            match payload.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "response.output_text.delta" => {
                    let delta = str_field(&payload, "delta");
                    if !delta.is_empty() {
                        out.push(self.chunk(json!({"role": "assistant", "content": delta}), None));
                    }
                }
                "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                    let delta = str_field(&payload, "delta");
                    if !delta.is_empty() {
                        out.push(self.chunk(
                            json!({"role": "assistant", "reasoning_content": delta}),
                            None,
                        ));
                    }
                }
                "response.output_item.added" => {
                    let item = payload.get("item").cloned().unwrap_or(Value::Null);
                    if str_field(&item, "type") == "function_call" {
                        let item_id = str_field(&item, "id").to_string();
                        self.next_tool_index += 1;
                        let state = ResponsesToolState {
                            call_id: str_field(&item, "call_id").to_string(),
                            name: str_field(&item, "name").to_string(),
                            index: self.next_tool_index,
                        };
                        let chunk = self.chunk(
                            json!({"role": "assistant", "tool_calls": [{
                                "index": state.index,
                                "id": state.call_id,
                                "type": "function",
                                "function": {"name": state.name, "arguments": ""}
                            }]}),
                            None,
                        );
                        self.current_item = Some(item_id.clone());
                        self.tool_items.insert(item_id, state);
                        out.push(chunk);
                    }
                }
                "response.function_call_arguments.delta" => {
                    let delta = str_field(&payload, "delta");
                    if !delta.is_empty() {
                        let index = payload
                            .get("item_id")
                            .and_then(|i| i.as_str())
                            .and_then(|id| self.tool_items.get(id))
                            .map(|s| s.index)
                            .or_else(|| {
                                self.current_item
                                    .as_ref()
                                    .and_then(|id| self.tool_items.get(id))
                                    .map(|s| s.index)
                            })
                            .unwrap_or(0);
                        out.push(self.chunk(
                            json!({"tool_calls": [{
                                "index": index,
                                "type": "function",
                                "function": {"arguments": delta}
                            }]}),
                            None,
                        ));
                    }
                }
                "response.completed" => {
                    let finish = if self.tool_items.is_empty() { "stop" } else { "tool_calls" };
                    let mut final_chunk = json!({
                        "id": self.chat_id,
                        "object": "chat.completion.chunk",
                        "created": self.created,
                        "model": payload.pointer("/response/model").cloned().unwrap_or(json!("")),
                        "choices": [{"index": 0, "delta": {}, "finish_reason": finish}]
                    });
                    let usage = self.usage.finalized();
                    if !usage.is_empty() {
                        final_chunk["usage"] = json!({
                            "prompt_tokens": usage.input_tokens,
                            "completion_tokens": usage.output_tokens,
                            "total_tokens": usage.total_tokens,
                            "prompt_tokens_details": {"cached_tokens": usage.cached_tokens}
                        });
                    }
                    out.push(sse_event(None, &final_chunk));
                    out.push(super::sse_done().to_string());
                    self.emitted_done = true;
                    self.finished = true;
                    break;
                }
                "response.failed" | "error" => {
                    let error = payload
                        .get("error")
                        .or_else(|| payload.pointer("/response/error"))
                        .cloned()
                        .unwrap_or_else(|| json!({"message": "upstream error"}));
                    out.push(sse_event(None, &json!({"error": error})));
                    out.push(super::sse_done().to_string());
                    self.emitted_done = true;
                    self.finished = true;
                    break;
                }
                _ => {}
            }
        }

        out
    }

    pub fn finalize(&mut self) -> Vec<String> {
        if self.emitted_done {
            return Vec::new();
        }
        self.emitted_done = true;
        self.finished = true;
        vec![
            self.chunk(json!({}), Some("stop")),
            super::sse_done().to_string(),
        ]
    }
}

/// Extract the `response.completed` response object out of a raw SSE body
/// (the non-streaming path still runs over SSE upstream).
pub fn extract_completed_response(raw: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(raw);
    for line in text.lines() {
        let Some(data) = parse_sse_data(line.trim()) else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || is_sse_done(data) {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if payload.get("type").and_then(|t| t.as_str()) == Some("response.completed") {
            if let Some(resp) = payload.get("response").filter(|r| r.is_object()) {
                return Some(resp.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(stream: &mut ChatToResponsesStream, s: &str) -> Vec<String> {
        stream.feed(s.as_bytes())
    }

    fn event_names(events: &[String]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.lines().next())
            .filter_map(|l| l.strip_prefix("event: "))
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn request_lowering_maps_instructions_and_input() {
        let request = json!({
            "model": "gpt-5-codex",
            "instructions": "be brief",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "function_call_output", "call_id": "c1", "output": "42"}
            ],
            "max_output_tokens": 50,
            "stream": true
        });
        let chat = responses_request_to_chat(&request);
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be brief");
        assert_eq!(messages[1]["content"], "hi");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "c1");
        assert_eq!(chat["max_tokens"], 50);
        assert_eq!(chat["stream"], true);
    }

    #[test]
    fn string_input_becomes_user_message() {
        let chat = responses_request_to_chat(&json!({"model": "m", "input": "ping"}));
        assert_eq!(chat["messages"][0]["role"], "user");
        assert_eq!(chat["messages"][0]["content"], "ping");
    }

    #[test]
    fn text_stream_event_order_and_sequence_numbers() {
        let mut stream = ChatToResponsesStream::new(json!({"model": "m"}));
        let mut events = Vec::new();
        events.extend(feed_str(
            &mut stream,
            "data: {\"id\":\"x\",\"created\":1,\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"}}]}\n\n",
        ));
        events.extend(feed_str(
            &mut stream,
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
        ));
        events.extend(stream.finalize());

        assert_eq!(
            event_names(&events),
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );

        // sequence numbers strictly increase across every event
        let seqs: Vec<i64> = events
            .iter()
            .map(|e| {
                let data = e.lines().nth(1).unwrap().strip_prefix("data: ").unwrap();
                serde_json::from_str::<Value>(data).unwrap()["sequence_number"]
                    .as_i64()
                    .unwrap()
            })
            .collect();
        for pair in seqs.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        assert!(events.last().unwrap().contains("\"text\":\"hello\""));
    }

    #[test]
    fn tool_call_stream_emits_function_call_events() {
        let mut stream = ChatToResponsesStream::new(json!({"model": "m"}));
        let mut events = Vec::new();
        events.extend(feed_str(
            &mut stream,
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"type\":\"function\",\"function\":{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
        ));
        events.extend(feed_str(
            &mut stream,
            "data: {\"id\":\"x\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"type\":\"function\",\"function\":{\"arguments\":\"1}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
        ));
        events.extend(stream.finalize());

        let names = event_names(&events);
        assert!(names.contains(&"response.function_call_arguments.delta".to_string()));
        assert!(names.contains(&"response.function_call_arguments.done".to_string()));
        let joined = events.join("");
        assert!(joined.contains("\"arguments\":\"{\\\"a\\\":1}\""));
        assert!(joined.contains("\"call_id\":\"c1\""));
    }

    #[test]
    fn upstream_error_is_forwarded_and_stream_stops() {
        let mut stream = ChatToResponsesStream::new(json!({"model": "m"}));
        let events = feed_str(
            &mut stream,
            "data: {\"error\":{\"message\":\"boom\",\"type\":\"server_error\"}}\n\n",
        );
        assert_eq!(event_names(&events), vec!["error"]);
        assert!(stream.finalize().is_empty());
    }

    #[test]
    fn completed_response_extraction_from_sse_body() {
        let body = b"event: response.created\ndata: {\"type\":\"response.created\"}\n\nevent: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"usage\":{\"input_tokens\":3,\"output_tokens\":1,\"total_tokens\":4}}}\n\n";
        let resp = extract_completed_response(body).unwrap();
        assert_eq!(resp["id"], "resp_1");
        assert_eq!(resp["usage"]["total_tokens"], 4);
        assert!(extract_completed_response(b"data: [DONE]\n\n").is_none());
    }

    #[test]
    fn chat_request_raises_to_responses_items() {
        let chat = json!({
            "model": "gpt-5-codex",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "ping"},
                {"role": "assistant", "content": null,
                 "tool_calls": [{"id": "c1", "type": "function",
                                 "function": {"name": "f", "arguments": "{}"}}]},
                {"role": "tool", "tool_call_id": "c1", "content": "out"}
            ],
            "max_tokens": 64,
            "stream": false
        });
        let responses = chat_request_to_responses(&chat);
        assert_eq!(responses["instructions"], "sys");
        assert_eq!(responses["max_output_tokens"], 64);
        let input = responses["input"].as_array().unwrap();
        assert_eq!(input[0]["type"], "message");
        assert_eq!(input[0]["content"][0]["text"], "ping");
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "c1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["output"], "out");
    }

    #[test]
    fn responses_object_lowers_to_chat_completion() {
        let response = json!({
            "id": "resp_1",
            "model": "gpt-5-codex",
            "created_at": 5,
            "output": [
                {"type": "message", "status": "completed", "role": "assistant",
                 "content": [{"type": "output_text", "text": "pong"}]}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 1, "total_tokens": 4}
        });
        let chat = responses_response_to_chat(&response, "fallback");
        assert_eq!(chat["object"], "chat.completion");
        assert_eq!(chat["choices"][0]["message"]["content"], "pong");
        assert_eq!(chat["choices"][0]["finish_reason"], "stop");
        assert_eq!(chat["usage"]["total_tokens"], 4);
    }

    #[test]
    fn responses_sse_lowers_to_chat_chunks_with_done() {
        let mut stream = ResponsesToChatStream::new();
        let mut out = Vec::new();
        out.extend(stream.feed(
            b"event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\",\"sequence_number\":3}\n\n",
        ));
        out.extend(stream.feed(
            b"event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{\"model\":\"gpt-5-codex\",\"usage\":{\"input_tokens\":3,\"output_tokens\":1,\"total_tokens\":4}}}\n\n",
        ));
        out.extend(stream.finalize());

        assert!(out[0].contains("\"content\":\"hi\""));
        let final_chunk = &out[1];
        assert!(final_chunk.contains("\"finish_reason\":\"stop\""));
        assert!(final_chunk.contains("\"total_tokens\":4"));
        assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");
        // finalize after response.completed adds nothing
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn responses_sse_tool_calls_lower_to_chat_tool_deltas() {
        let mut stream = ResponsesToChatStream::new();
        let mut out = Vec::new();
        out.extend(stream.feed(
            b"event: response.output_item.added\ndata: {\"type\":\"response.output_item.added\",\"item\":{\"id\":\"fc_1\",\"type\":\"function_call\",\"call_id\":\"c9\",\"name\":\"f\"}}\n\n",
        ));
        out.extend(stream.feed(
            b"event: response.function_call_arguments.delta\ndata: {\"type\":\"response.function_call_arguments.delta\",\"item_id\":\"fc_1\",\"delta\":\"{\\\"x\\\":1}\"}\n\n",
        ));
        out.extend(stream.feed(
            b"event: response.completed\ndata: {\"type\":\"response.completed\",\"response\":{}}\n\n",
        ));

        assert!(out[0].contains("\"id\":\"c9\""));
        assert!(out[0].contains("\"name\":\"f\""));
        assert!(out[1].contains("{\\\"x\\\":1}"));
        assert!(out[2].contains("\"finish_reason\":\"tool_calls\""));
    }

    #[test]
    fn chat_response_to_responses_object() {
        let chat = json!({
            "id": "abc",
            "created": 123,
            "model": "m",
            "choices": [{"message": {"role": "assistant", "content": "out"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        });
        let resp = chat_response_to_responses(&chat, &json!({"instructions": "i"}));
        assert_eq!(resp["id"], "resp_abc");
        assert_eq!(resp["output"][0]["content"][0]["text"], "out");
        assert_eq!(resp["usage"]["total_tokens"], 3);
        assert_eq!(resp["instructions"], "i");
    }
}
