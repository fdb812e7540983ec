//! Anthropic Messages ↔ OpenAI Chat translation.
//!
//! Request side flattens Anthropic content blocks into OpenAI messages;
//! response side rebuilds content blocks, including thinking blocks sourced
//! from `reasoning_content` deltas or raw `<thinking>` tags. The streaming
//! emitter is a small state machine over block indices: one `message_start`,
//! ordered `content_block_*` tuples, thinking always before text, then
//! `message_delta` + `message_stop`.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::thinking::{SegmentKind, ThinkingTagParser};
use super::{
    anthropic_stop_to_openai, drain_sse_lines, extract_openai_usage, is_sse_done,
    openai_finish_to_anthropic, parse_sse_data, parse_tool_arguments, sse_event, Usage,
};
use crate::error::{GatewayError, GatewayResult};

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(|t| t.as_str()).unwrap_or("")
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// Flatten an Anthropic `system` (string or array of text blocks) into one
/// newline-joined string.
pub fn flatten_system(system: &Value) -> Option<String> {
    match system {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(blocks) => {
            let joined = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    }
}

/// Whether the caller asked for thinking. Absent means enabled.
pub fn thinking_enabled(request: &Value) -> bool {
    let Some(thinking) = request.get("thinking") else {
        return true;
    };
    match thinking {
        Value::Bool(flag) => *flag,
        Value::Object(obj) => match obj.get("type").and_then(|t| t.as_str()) {
            Some("disabled") | Some("off") | Some("none") => false,
            _ => true,
        },
        _ => true,
    }
}

/// Remove the built-in web_search tool when mixed with ordinary tools, and
/// demote a tool_choice that names it to auto. Returns (tools, tool_choice).
fn strip_web_search_when_mixed(tools: &[Value], tool_choice: Option<&Value>) -> (Vec<Value>, Option<Value>) {
    let names: Vec<String> = tools
        .iter()
        .map(|t| str_field(t, "name").trim().to_ascii_lowercase())
        .collect();
    let has_web_search = names.iter().any(|n| n == "web_search");
    let has_other = names.iter().any(|n| !n.is_empty() && n != "web_search");

    if !(has_web_search && has_other) {
        return (tools.to_vec(), tool_choice.cloned());
    }

    let kept: Vec<Value> = tools
        .iter()
        .zip(names.iter())
        .filter(|(_, n)| n.as_str() != "web_search")
        .map(|(t, _)| t.clone())
        .collect();

    crate::logger::info(
        "translate",
        &format!("mixed tools detected, dropped builtin web_search (kept {})", kept.len()),
    );

    let choice = match tool_choice {
        Some(choice)
            if str_field(choice, "type") == "tool"
                && str_field(choice, "name").eq_ignore_ascii_case("web_search") =>
        {
            Some(json!({"type": "auto"}))
        }
        other => other.cloned(),
    };

    (kept, choice)
}

fn anthropic_tools_to_openai(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut function = Map::new();
            function.insert("name".to_string(), tool.get("name").cloned().unwrap_or(Value::Null));
            if let Some(desc) = tool.get("description") {
                function.insert("description".to_string(), desc.clone());
            }
            function.insert(
                "parameters".to_string(),
                tool.get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            );
            json!({"type": "function", "function": function})
        })
        .collect()
}

fn anthropic_tool_choice_to_openai(choice: &Value) -> Value {
    match str_field(choice, "type") {
        "any" => json!("required"),
        "tool" => json!({"type": "function", "function": {"name": str_field(choice, "name")}}),
        "none" => json!("none"),
        _ => json!("auto"),
    }
}

/// A multimodal content block list for OpenAI. Fails on image shapes the
/// target cannot represent instead of silently dropping them.
fn blocks_to_openai_content(blocks: &[Value]) -> GatewayResult<Value> {
    let mut parts = Vec::new();
    for block in blocks {
        match block_type(block) {
            "text" => parts.push(json!({"type": "text", "text": str_field(block, "text")})),
            "image" => {
                let source = block.get("source").cloned().unwrap_or(Value::Null);
                match str_field(&source, "type") {
                    "base64" => {
                        let media_type = source
                            .get("media_type")
                            .and_then(|m| m.as_str())
                            .unwrap_or("image/png");
                        let data = str_field(&source, "data");
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{media_type};base64,{data}")}
                        }));
                    }
                    "url" => {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": {"url": str_field(&source, "url")}
                        }));
                    }
                    other => {
                        return Err(GatewayError::InvalidRequest(format!(
                            "unsupported image source type: {other}"
                        )))
                    }
                }
            }
            // thinking blocks in history are carried via reasoning_content
            // at the message level, not as content parts
            "thinking" | "redacted_thinking" => {}
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unsupported content block type: {other}"
                )))
            }
        }
    }

    if parts.len() == 1 && parts[0].get("type").and_then(|t| t.as_str()) == Some("text") {
        return Ok(parts[0]["text"].clone());
    }
    Ok(Value::Array(parts))
}

fn assistant_tool_use_to_openai(blocks: &[Value]) -> Value {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut thinking_content: Option<String> = None;
    let mut thinking_signature: Option<String> = None;

    for block in blocks {
        match block_type(block) {
            "thinking" => {
                thinking_content = Some(str_field(block, "thinking").to_string());
                if let Some(sig) = block.get("signature").and_then(|s| s.as_str()) {
                    if !sig.is_empty() {
                        thinking_signature = Some(sig.to_string());
                    }
                }
            }
            "text" => {
                let text = str_field(block, "text");
                if !text.trim().is_empty() && text.trim() != "(no content)" {
                    text_parts.push(text.to_string());
                }
            }
            "tool_use" => {
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(json!({
                    "id": str_field(block, "id"),
                    "type": "function",
                    "function": {
                        "name": str_field(block, "name"),
                        "arguments": serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string())
                    }
                }));
            }
            _ => {}
        }
    }

    // A thought signature on a text-less tool turn must ride along on the
    // tool call itself so it survives the round trip.
    if text_parts.is_empty() && !tool_calls.is_empty() {
        if let Some(sig) = thinking_signature {
            if let Some(first) = tool_calls.first_mut() {
                first["extra_content"] = json!({"google": {"thought_signature": sig}});
            }
        }
    }

    let mut out = Map::new();
    out.insert("role".to_string(), json!("assistant"));
    out.insert(
        "content".to_string(),
        if text_parts.is_empty() {
            Value::Null
        } else {
            Value::String(text_parts.join("\n"))
        },
    );
    if let Some(thinking) = thinking_content {
        if !thinking.is_empty() {
            out.insert("reasoning_content".to_string(), Value::String(thinking));
        }
    }
    if !tool_calls.is_empty() {
        out.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(out)
}

fn user_tool_results_to_openai(blocks: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for block in blocks {
        if block_type(block) != "tool_result" {
            continue;
        }
        let content = match block.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        out.push(json!({
            "role": "tool",
            "tool_call_id": str_field(block, "tool_use_id"),
            "content": content
        }));
    }
    out
}

/// Convert an Anthropic Messages request into an OpenAI Chat request.
pub fn anthropic_to_openai_request(request: &Value) -> GatewayResult<Value> {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = request.get("system").and_then(flatten_system) {
        messages.push(json!({"role": "system", "content": system}));
    }

    for message in request
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[])
    {
        let role = str_field(message, "role");
        match message.get("content") {
            Some(Value::String(s)) => messages.push(json!({"role": role, "content": s})),
            Some(Value::Array(blocks)) => {
                let has_tool_use = blocks.iter().any(|b| block_type(b) == "tool_use");
                let has_tool_result = blocks.iter().any(|b| block_type(b) == "tool_result");

                if has_tool_use && role == "assistant" {
                    messages.push(assistant_tool_use_to_openai(blocks));
                } else if has_tool_result && role == "user" {
                    messages.extend(user_tool_results_to_openai(blocks));
                } else {
                    let content = blocks_to_openai_content(blocks)?;
                    messages.push(json!({"role": role, "content": content}));
                }
            }
            _ => {}
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), request.get("model").cloned().unwrap_or(Value::Null));
    out.insert("messages".to_string(), Value::Array(messages));
    if let Some(max_tokens) = request.get("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens.clone());
    }
    out.insert(
        "stream".to_string(),
        Value::Bool(request.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)),
    );
    if let Some(t) = request.get("temperature") {
        out.insert("temperature".to_string(), t.clone());
    }
    if let Some(t) = request.get("top_p") {
        out.insert("top_p".to_string(), t.clone());
    }
    if let Some(stops) = request.get("stop_sequences").filter(|s| s.is_array()) {
        out.insert("stop".to_string(), stops.clone());
    }

    let tools = request
        .get("tools")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    if !tools.is_empty() {
        let (kept, choice) = strip_web_search_when_mixed(&tools, request.get("tool_choice"));
        if !kept.is_empty() {
            out.insert("tools".to_string(), Value::Array(anthropic_tools_to_openai(&kept)));
        }
        if let Some(choice) = choice {
            out.insert("tool_choice".to_string(), anthropic_tool_choice_to_openai(&choice));
        }
    } else if let Some(choice) = request.get("tool_choice") {
        out.insert("tool_choice".to_string(), anthropic_tool_choice_to_openai(choice));
    }

    Ok(Value::Object(out))
}

/// OpenAI chat request → Anthropic Messages request, for Anthropic-shaped
/// upstreams serving chat-dialect callers. System messages fold into the
/// `system` field; tool messages become tool_result blocks.
pub fn openai_request_to_anthropic(chat: &Value) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    let empty = Vec::new();
    for message in chat.get("messages").and_then(|m| m.as_array()).unwrap_or(&empty) {
        let role = str_field(message, "role");
        match role {
            "system" | "developer" => {
                if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
                    if !text.is_empty() {
                        system_parts.push(text.to_string());
                    }
                }
            }
            "tool" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": str_field(message, "tool_call_id"),
                        "content": message.get("content").and_then(|c| c.as_str()).unwrap_or("")
                    }]
                }));
            }
            "assistant" => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(reasoning) = message.get("reasoning_content").and_then(|r| r.as_str()) {
                    if !reasoning.is_empty() {
                        blocks.push(json!({"type": "thinking", "thinking": reasoning}));
                    }
                }
                match message.get("content") {
                    Some(Value::String(s)) if !s.is_empty() => {
                        blocks.push(json!({"type": "text", "text": s}))
                    }
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            if str_field(part, "type") == "text" {
                                blocks.push(json!({
                                    "type": "text",
                                    "text": part.get("text").cloned().unwrap_or(Value::Null)
                                }));
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc in tool_calls {
                        let name = tc.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or("");
                        let raw_args = tc
                            .pointer("/function/arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("");
                        let id = str_field(tc, "id");
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": parse_tool_arguments(raw_args, name, id)
                        }));
                    }
                }
                if !blocks.is_empty() {
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            _ => {
                let content = match message.get("content") {
                    Some(Value::String(s)) => json!([{"type": "text", "text": s}]),
                    Some(Value::Array(parts)) => {
                        let mut blocks = Vec::new();
                        for part in parts {
                            match str_field(part, "type") {
                                "text" => blocks.push(json!({
                                    "type": "text",
                                    "text": part.get("text").cloned().unwrap_or(Value::Null)
                                })),
                                "image_url" => {
                                    let url = part
                                        .pointer("/image_url/url")
                                        .and_then(|u| u.as_str())
                                        .unwrap_or("");
                                    if let Some(rest) = url.strip_prefix("data:") {
                                        if let Some((media_type, data)) = rest.split_once(";base64,") {
                                            blocks.push(json!({
                                                "type": "image",
                                                "source": {
                                                    "type": "base64",
                                                    "media_type": media_type,
                                                    "data": data
                                                }
                                            }));
                                            continue;
                                        }
                                    }
                                    blocks.push(json!({
                                        "type": "image",
                                        "source": {"type": "url", "url": url}
                                    }));
                                }
                                _ => {}
                            }
                        }
                        Value::Array(blocks)
                    }
                    _ => json!([]),
                };
                messages.push(json!({"role": "user", "content": content}));
            }
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), chat.get("model").cloned().unwrap_or(Value::Null));
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "max_tokens".to_string(),
        chat.get("max_tokens").cloned().unwrap_or(json!(4096)),
    );
    out.insert(
        "stream".to_string(),
        Value::Bool(chat.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)),
    );
    if !system_parts.is_empty() {
        out.insert("system".to_string(), json!(system_parts.join("\n")));
    }
    for (chat_key, key) in [("temperature", "temperature"), ("top_p", "top_p")] {
        if let Some(v) = chat.get(chat_key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    if let Some(stop) = chat.get("stop") {
        let sequences = match stop {
            Value::String(s) => json!([s]),
            Value::Array(_) => stop.clone(),
            _ => json!([]),
        };
        out.insert("stop_sequences".to_string(), sequences);
    }
    if let Some(tools) = chat.get("tools").and_then(|t| t.as_array()) {
        let anthropic_tools: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(json!("")),
                    "input_schema": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}}))
                }))
            })
            .collect();
        if !anthropic_tools.is_empty() {
            out.insert("tools".to_string(), Value::Array(anthropic_tools));
        }
    }

    Value::Object(out)
}

/// Non-streaming OpenAI chat response → Anthropic message.
pub fn openai_response_to_anthropic(chat_resp: &Value, model: &str, thinking: bool) -> Value {
    let choice = chat_resp
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut blocks: Vec<Value> = Vec::new();

    let reasoning = ["reasoning_content", "reasoning", "thinking_content"]
        .iter()
        .find_map(|k| message.get(*k).and_then(|v| v.as_str()))
        .unwrap_or("");
    let mut content_text = str_field(&message, "content").to_string();

    let mut thinking_text = if thinking { reasoning.to_string() } else { String::new() };

    // Some upstreams put reasoning into the content as a raw tag prefix.
    if thinking && thinking_text.is_empty() && content_text.trim_start().starts_with("<thinking>") {
        let mut parser = ThinkingTagParser::new();
        let mut segments = parser.push_and_parse(&content_text);
        segments.extend(parser.flush());
        let mut text_out = String::new();
        for segment in segments {
            match segment.kind {
                SegmentKind::Thinking => thinking_text.push_str(&segment.content),
                SegmentKind::Text => text_out.push_str(&segment.content),
            }
        }
        content_text = text_out;
    }

    if !thinking_text.is_empty() {
        blocks.push(json!({"type": "thinking", "thinking": thinking_text}));
    }
    if !content_text.is_empty() {
        blocks.push(json!({"type": "text", "text": content_text}));
    }

    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let function = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = str_field(&function, "name");
            let id = str_field(tc, "id");
            let id = if id.is_empty() {
                format!("toolu_{}", Uuid::new_v4().simple())
            } else {
                id.to_string()
            };
            let input = parse_tool_arguments(str_field(&function, "arguments"), name, &id);
            blocks.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
    }

    let finish_reason = str_field(&choice, "finish_reason");
    let stop_reason = if finish_reason.is_empty() {
        "end_turn"
    } else {
        openai_finish_to_anthropic(finish_reason)
    };

    let usage = extract_openai_usage(chat_resp).unwrap_or_default().finalized();

    let id_raw = str_field(chat_resp, "id");
    let id = if id_raw.starts_with("msg_") {
        id_raw.to_string()
    } else if id_raw.is_empty() {
        format!("msg_{}", Uuid::new_v4().simple())
    } else {
        format!("msg_{id_raw}")
    };

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": blocks,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_read_input_tokens": usage.cached_tokens
        }
    })
}

/// Anthropic message → OpenAI chat.completion (for OpenAI callers hitting
/// an Anthropic-native upstream).
pub fn anthropic_response_to_openai(message: &Value, model: &str) -> Value {
    let blocks = message
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &blocks {
        match block_type(block) {
            "text" => text.push_str(str_field(block, "text")),
            "thinking" => reasoning.push_str(str_field(block, "thinking")),
            "tool_use" => {
                let input = block.get("input").cloned().unwrap_or(json!({}));
                tool_calls.push(json!({
                    "id": str_field(block, "id"),
                    "type": "function",
                    "function": {
                        "name": str_field(block, "name"),
                        "arguments": serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string())
                    }
                }));
            }
            _ => {}
        }
    }

    let stop_reason = str_field(message, "stop_reason");
    let finish_reason = if stop_reason.is_empty() {
        "stop"
    } else {
        anthropic_stop_to_openai(stop_reason)
    };

    let usage = super::extract_anthropic_usage(message).unwrap_or_default().finalized();

    let mut msg = Map::new();
    msg.insert("role".to_string(), json!("assistant"));
    msg.insert("content".to_string(), json!(text));
    if !reasoning.is_empty() {
        msg.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !tool_calls.is_empty() {
        msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    json!({
        "id": format!("chatcmpl-{}", str_field(message, "id").trim_start_matches("msg_")),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(msg),
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
            "prompt_tokens_details": {"cached_tokens": usage.cached_tokens}
        }
    })
}

// ---------------------------------------------------------------------------
// Streaming: OpenAI chunks → Anthropic events
// ---------------------------------------------------------------------------

struct ToolBlock {
    block_index: i64,
    started: bool,
    closed: bool,
    id: String,
    name: String,
    arguments: String,
}

/// Converts an OpenAI Chat SSE stream into an Anthropic Messages SSE
/// stream. Feed raw upstream bytes, then call `finalize` once at the end
/// (including on error or cancellation paths).
pub struct OpenAiToAnthropicStream {
    model: String,
    request_id: String,
    thinking_enabled: bool,

    line_buffer: Vec<u8>,
    started: bool,
    finished: bool,
    error_emitted: bool,

    next_index: i64,
    thinking_index: Option<i64>,
    text_index: Option<i64>,
    thinking_signature: Option<String>,
    tool_blocks: HashMap<i64, ToolBlock>,
    open_tool: Option<i64>,

    tag_parser: Option<ThinkingTagParser>,
    finish_reason: Option<String>,
    pub usage: Usage,
}

impl OpenAiToAnthropicStream {
    pub fn new(model: &str, thinking_enabled: bool) -> Self {
        Self {
            model: model.to_string(),
            request_id: Uuid::new_v4().simple().to_string(),
            thinking_enabled,
            line_buffer: Vec::new(),
            started: false,
            finished: false,
            error_emitted: false,
            next_index: 0,
            thinking_index: None,
            text_index: None,
            thinking_signature: None,
            tool_blocks: HashMap::new(),
            open_tool: None,
            tag_parser: if thinking_enabled {
                Some(ThinkingTagParser::new())
            } else {
                None
            },
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        for line in drain_sse_lines(&mut self.line_buffer, chunk) {
            let Some(data) = parse_sse_data(&line) else {
                continue;
            };
            if is_sse_done(data) {
                continue;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
                self.error_emitted = true;
                out.push(sse_event(
                    Some("error"),
                    &json!({"type": "error", "error": {
                        "type": "upstream_error",
                        "message": err.get("message").and_then(|m| m.as_str()).unwrap_or("upstream error")
                    }}),
                ));
                continue;
            }

            if let Some(usage) = extract_openai_usage(&payload) {
                if !usage.is_empty() {
                    self.usage = usage;
                }
            }

            self.ensure_started(&payload, &mut out);

            let Some(choice) = payload.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first())
            else {
                continue;
            };
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

            if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                if !reason.is_empty() {
                    self.finish_reason = Some(reason.to_string());
                }
            }

            self.capture_signature(&delta);

            let reasoning = ["reasoning_content", "reasoning", "thinking_content"]
                .iter()
                .find_map(|k| delta.get(*k).and_then(|v| v.as_str()))
                .unwrap_or("");
            if self.thinking_enabled && !reasoning.is_empty() {
                self.emit_thinking(reasoning, &mut out);
            }

            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                if !content.is_empty() {
                    self.emit_content(content, &mut out);
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                let calls: Vec<Value> = tool_calls.clone();
                self.emit_tool_calls(&calls, &mut out);
            }
        }

        out
    }

    /// Close every open block and terminate the message. Safe to call once.
    pub fn finalize(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        if self.error_emitted {
            return out;
        }

        // An empty upstream stream still yields a valid message envelope.
        if !self.started {
            self.started = true;
            out.push(self.message_start_event(None));
        }

        let segments = match self.tag_parser.as_mut() {
            Some(parser) => parser.flush(),
            None => Vec::new(),
        };
        for segment in segments {
            match segment.kind {
                SegmentKind::Thinking => self.emit_thinking(&segment.content, &mut out),
                SegmentKind::Text => self.emit_text(&segment.content, &mut out),
            }
        }

        self.close_thinking(&mut out);
        self.close_text(&mut out);
        self.close_tools(&mut out);

        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(openai_finish_to_anthropic)
            .unwrap_or("end_turn");

        let usage = self.usage.finalized();
        out.push(sse_event(
            Some("message_delta"),
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": usage.output_tokens}
            }),
        ));
        out.push(sse_event(Some("message_stop"), &json!({"type": "message_stop"})));
        out
    }

    fn ensure_started(&mut self, payload: &Value, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(self.message_start_event(Some(payload)));
    }

    fn message_start_event(&self, payload: Option<&Value>) -> String {
        let id_raw = payload.map(|p| str_field(p, "id")).unwrap_or("");
        let id = if id_raw.starts_with("msg_") {
            id_raw.to_string()
        } else if id_raw.is_empty() {
            format!("msg_{}", self.request_id)
        } else {
            format!("msg_{id_raw}")
        };

        sse_event(
            Some("message_start"),
            &json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.usage.input_tokens, "output_tokens": 0}
                }
            }),
        )
    }

    fn capture_signature(&mut self, delta: &Value) {
        let direct = delta
            .get("signature")
            .or_else(|| {
                delta
                    .get("extra_content")
                    .and_then(|e| e.get("thought_signature"))
            })
            .and_then(|s| s.as_str());
        if let Some(sig) = direct {
            if !sig.is_empty() {
                self.thinking_signature = Some(sig.to_string());
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tool_calls {
                if let Some(sig) = tc
                    .get("extra_content")
                    .and_then(|e| e.get("google"))
                    .and_then(|g| g.get("thought_signature"))
                    .and_then(|s| s.as_str())
                {
                    if !sig.is_empty() {
                        self.thinking_signature = Some(sig.to_string());
                    }
                }
            }
        }
    }

    fn emit_thinking(&mut self, content: &str, out: &mut Vec<String>) {
        // Once text has begun, late reasoning is dropped; Anthropic
        // requires thinking to precede text within a message.
        if self.thinking_index.is_none() && self.text_index.is_some() {
            return;
        }
        let index = match self.thinking_index {
            Some(index) => index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.thinking_index = Some(index);
                out.push(sse_event(
                    Some("content_block_start"),
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "thinking", "thinking": ""}
                    }),
                ));
                index
            }
        };
        out.push(sse_event(
            Some("content_block_delta"),
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "thinking_delta", "thinking": content}
            }),
        ));
    }

    fn emit_content(&mut self, content: &str, out: &mut Vec<String>) {
        // The tag parser only matters while the stream could still open
        // with `<thinking>`; once real text flows it degrades to a
        // passthrough.
        let segments = match self.tag_parser.as_mut() {
            Some(parser) => Some(parser.push_and_parse(content)),
            None => None,
        };
        match segments {
            Some(segments) => {
                for segment in segments {
                    match segment.kind {
                        SegmentKind::Thinking => self.emit_thinking(&segment.content, out),
                        SegmentKind::Text => self.emit_text(&segment.content, out),
                    }
                }
            }
            None => self.emit_text(content, out),
        }
    }

    fn emit_text(&mut self, content: &str, out: &mut Vec<String>) {
        if content.is_empty() {
            return;
        }
        if self.text_index.is_none() {
            self.close_thinking(out);
            let index = self.next_index;
            self.next_index += 1;
            self.text_index = Some(index);
            out.push(sse_event(
                Some("content_block_start"),
                &json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ));
        }
        let index = self.text_index.expect("text block just ensured");
        out.push(sse_event(
            Some("content_block_delta"),
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": content}
            }),
        ));
    }

    fn emit_tool_calls(&mut self, tool_calls: &[Value], out: &mut Vec<String>) {
        for tc in tool_calls {
            let tc_index = tc.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
            let function = tc.get("function").cloned().unwrap_or(Value::Null);

            {
                let entry = self.tool_blocks.entry(tc_index).or_insert_with(|| ToolBlock {
                    block_index: -1,
                    started: false,
                    closed: false,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = tc.get("id").and_then(|i| i.as_str()) {
                    if !id.is_empty() {
                        entry.id = id.to_string();
                    }
                }
                if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                    if !name.is_empty() {
                        entry.name = name.to_string();
                    }
                }
            }

            let needs_start = self
                .tool_blocks
                .get(&tc_index)
                .map(|e| !e.started && !e.name.is_empty())
                .unwrap_or(false);

            if needs_start {
                self.close_thinking(out);
                self.close_text(out);
                if let Some(open) = self.open_tool.take() {
                    if let Some(prev) = self.tool_blocks.get_mut(&open) {
                        if prev.started && !prev.closed {
                            prev.closed = true;
                            out.push(content_block_stop(prev.block_index));
                        }
                    }
                }

                let block_index = self.next_index;
                self.next_index += 1;
                let (id, name) = {
                    let entry = self.tool_blocks.get_mut(&tc_index).expect("entry just inserted");
                    entry.started = true;
                    entry.block_index = block_index;
                    if entry.id.is_empty() {
                        entry.id = format!("toolu_{}", Uuid::new_v4().simple());
                    }
                    (entry.id.clone(), entry.name.clone())
                };
                self.open_tool = Some(tc_index);

                out.push(sse_event(
                    Some("content_block_start"),
                    &json!({
                        "type": "content_block_start",
                        "index": block_index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                    }),
                ));
            }

            if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                if !args.is_empty() {
                    if let Some(entry) = self.tool_blocks.get_mut(&tc_index) {
                        if entry.started && !entry.closed {
                            entry.arguments.push_str(args);
                            out.push(sse_event(
                                Some("content_block_delta"),
                                &json!({
                                    "type": "content_block_delta",
                                    "index": entry.block_index,
                                    "delta": {"type": "input_json_delta", "partial_json": args}
                                }),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.thinking_index.take() {
            if let Some(sig) = self.thinking_signature.clone() {
                out.push(sse_event(
                    Some("content_block_delta"),
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "signature_delta", "signature": sig}
                    }),
                ));
            }
            out.push(content_block_stop(index));
            // Keep the index slot consumed; thinking never reopens.
            self.thinking_index = None;
            self.tag_parser = None;
        }
    }

    fn close_text(&mut self, out: &mut Vec<String>) {
        if let Some(index) = self.text_index.take() {
            out.push(content_block_stop(index));
        }
    }

    fn close_tools(&mut self, out: &mut Vec<String>) {
        let mut indices: Vec<i64> = self
            .tool_blocks
            .values()
            .filter(|b| b.started && !b.closed)
            .map(|b| b.block_index)
            .collect();
        indices.sort_unstable();
        for index in indices {
            out.push(content_block_stop(index));
        }
        self.tool_blocks.clear();
        self.open_tool = None;
    }
}

fn content_block_stop(index: i64) -> String {
    sse_event(
        Some("content_block_stop"),
        &json!({"type": "content_block_stop", "index": index}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(payload: Value) -> Vec<u8> {
        format!("data: {payload}\n\n").into_bytes()
    }

    fn delta_chunk(delta: Value) -> Vec<u8> {
        chunk(json!({
            "id": "abc", "object": "chat.completion.chunk", "model": "m",
            "choices": [{"index": 0, "delta": delta, "finish_reason": null}]
        }))
    }

    fn finish_chunk(reason: &str) -> Vec<u8> {
        chunk(json!({
            "id": "abc", "object": "chat.completion.chunk", "model": "m",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
        }))
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
    fn reasoning_then_text_event_sequence() {
        let mut stream = OpenAiToAnthropicStream::new("claude-x", true);
        let mut events = Vec::new();
        events.extend(stream.feed(&delta_chunk(json!({"reasoning_content": "thought"}))));
        events.extend(stream.feed(&delta_chunk(json!({"content": "answer"}))));
        events.extend(stream.feed(&finish_chunk("stop")));
        events.extend(stream.finalize());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        assert!(events[1].contains("\"thinking\""));
        assert!(events[2].contains("thinking_delta"));
        assert!(events[2].contains("thought"));
        assert!(events[5].contains("text_delta"));
        assert!(events[5].contains("answer"));
        assert!(events.iter().any(|e| e.contains("\"stop_reason\":\"end_turn\"")));
    }

    #[test]
    fn raw_thinking_tag_is_peeled() {
        let mut stream = OpenAiToAnthropicStream::new("claude-x", true);
        let mut events = Vec::new();
        events.extend(stream.feed(&delta_chunk(json!({"content": "<thinking>X</thinking>\nY"}))));
        events.extend(stream.finalize());

        let joined = events.join("");
        assert!(joined.contains("thinking_delta"));
        assert!(joined.contains("\"thinking\":\"X\""));
        assert!(joined.contains("\"text\":\"Y\""));
    }

    #[test]
    fn tag_split_across_chunks_still_isolates_thinking() {
        // The same input in different chunkings yields one thinking block
        // with content X followed by text Y.
        let input = "<thinking>X</thinking>\nY";
        for split in 1..input.len() {
            let mut stream = OpenAiToAnthropicStream::new("m", true);
            let mut events = Vec::new();
            events.extend(stream.feed(&delta_chunk(json!({"content": &input[..split]}))));
            events.extend(stream.feed(&delta_chunk(json!({"content": &input[split..]}))));
            events.extend(stream.finalize());
            let joined = events.join("");

            let thinking: String = joined
                .match_indices("\"thinking\":\"")
                .map(|(i, pat)| {
                    let rest = &joined[i + pat.len()..];
                    rest[..rest.find('"').unwrap()].to_string()
                })
                .collect::<Vec<_>>()
                .concat();
            assert!(thinking.contains('X') || thinking == "X", "split={split}: {thinking}");
            assert!(joined.contains("text_delta"), "split={split}");
        }
    }

    #[test]
    fn signature_delta_precedes_thinking_stop() {
        let mut stream = OpenAiToAnthropicStream::new("m", true);
        let mut events = Vec::new();
        events.extend(stream.feed(&delta_chunk(json!({"reasoning_content": "t"}))));
        events.extend(stream.feed(&delta_chunk(json!({"signature": "sig123"}))));
        events.extend(stream.feed(&delta_chunk(json!({"content": "body"}))));
        events.extend(stream.finalize());

        let joined = events.join("");
        let sig_pos = joined.find("signature_delta").expect("signature_delta missing");
        let stop_pos = joined.find("content_block_stop").expect("stop missing");
        assert!(sig_pos < stop_pos);
        assert!(joined.contains("sig123"));
    }

    #[test]
    fn streaming_tool_call_accumulates_arguments() {
        let mut stream = OpenAiToAnthropicStream::new("m", false);
        let mut events = Vec::new();
        events.extend(stream.feed(&delta_chunk(json!({
            "tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                            "function": {"name": "get_x", "arguments": ""}}]
        }))));
        events.extend(stream.feed(&delta_chunk(json!({
            "tool_calls": [{"index": 0, "type": "function",
                            "function": {"arguments": "{\"x\":1}"}}]
        }))));
        events.extend(stream.feed(&finish_chunk("tool_calls")));
        events.extend(stream.finalize());

        let joined = events.join("");
        assert!(joined.contains("\"type\":\"tool_use\""));
        assert!(joined.contains("\"name\":\"get_x\""));
        assert!(joined.contains("input_json_delta"));
        assert!(joined.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn upstream_error_becomes_error_event() {
        let mut stream = OpenAiToAnthropicStream::new("m", false);
        let events = stream.feed(&chunk(json!({"error": {"message": "quota exceeded"}})));
        assert_eq!(event_names(&events), vec!["error"]);
        assert!(events[0].contains("quota exceeded"));
        assert!(stream.finalize().is_empty());
    }

    #[test]
    fn usage_is_tracked_from_chunks() {
        let mut stream = OpenAiToAnthropicStream::new("m", false);
        stream.feed(&chunk(json!({
            "id": "abc",
            "choices": [{"index": 0, "delta": {"content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        })));
        let _ = stream.finalize();
        assert_eq!(stream.usage.input_tokens, 3);
        assert_eq!(stream.usage.finalized().total_tokens, 4);
    }

    #[test]
    fn request_system_and_tools_convert() {
        let request = json!({
            "model": "claude-x",
            "max_tokens": 100,
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "search", "description": "d",
                       "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}}],
            "stop_sequences": ["END"]
        });
        let out = anthropic_to_openai_request(&request).unwrap();
        assert_eq!(out["messages"][0]["role"], "system");
        assert_eq!(out["messages"][0]["content"], "a\nb");
        assert_eq!(out["tools"][0]["type"], "function");
        assert_eq!(out["tools"][0]["function"]["name"], "search");
        assert_eq!(out["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(out["stop"][0], "END");
    }

    #[test]
    fn web_search_dropped_when_mixed() {
        let request = json!({
            "model": "claude-x",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"name": "web_search", "type": "web_search_20250305"},
                {"name": "calc", "input_schema": {"type": "object"}}
            ],
            "tool_choice": {"type": "tool", "name": "web_search"}
        });
        let out = anthropic_to_openai_request(&request).unwrap();
        let tools = out["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], "calc");
        assert_eq!(out["tool_choice"], json!("auto"));
    }

    #[test]
    fn image_block_becomes_data_url() {
        let request = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}}
            ]}]
        });
        let out = anthropic_to_openai_request(&request).unwrap();
        let content = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn unsupported_image_source_is_rejected() {
        let request = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "file_id", "file_id": "f1"}}
            ]}]
        });
        let err = anthropic_to_openai_request(&request).unwrap_err();
        assert!(err.to_string().contains("file_id"));
    }

    #[test]
    fn tool_round_trip_request_side() {
        let request = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "results"}
                ]}
            ]
        });
        let out = anthropic_to_openai_request(&request).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["tool_calls"][0]["id"], "t1");
        assert_eq!(
            messages[0]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "t1");
        assert_eq!(messages[1]["content"], "results");
    }

    #[test]
    fn chat_request_lowers_to_anthropic_shape() {
        let chat = json!({
            "model": "claude-sonnet-4.5",
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "ok",
                 "tool_calls": [{"id": "c1", "type": "function",
                                 "function": {"name": "f", "arguments": ""}}]},
                {"role": "tool", "tool_call_id": "c1", "content": "done"}
            ],
            "stop": ["HALT"],
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {"type": "object"}}}]
        });
        let anthropic = openai_request_to_anthropic(&chat);
        assert_eq!(anthropic["system"], "sys");
        assert_eq!(anthropic["messages"][0]["content"][0]["text"], "hello");
        let assistant_blocks = anthropic["messages"][1]["content"].as_array().unwrap();
        assert!(assistant_blocks.iter().any(|b| b["type"] == "tool_use"));
        // empty streamed arguments became {}
        let tool_use = assistant_blocks.iter().find(|b| b["type"] == "tool_use").unwrap();
        assert_eq!(tool_use["input"], json!({}));
        assert_eq!(anthropic["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(anthropic["stop_sequences"][0], "HALT");
        assert_eq!(anthropic["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn text_only_round_trip_preserves_meaning() {
        let request = json!({
            "model": "claude-x",
            "max_tokens": 10,
            "system": "sys",
            "messages": [
                {"role": "user", "content": "q1"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": [{"type": "text", "text": "q2"}]}
            ],
            "stop_sequences": ["STOP"]
        });
        let openai = anthropic_to_openai_request(&request).unwrap();
        // system became messages[0]; user/assistant preserved in order
        let roles: Vec<&str> = openai["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(openai["messages"][3]["content"], "q2");
        assert_eq!(openai["stop"], json!(["STOP"]));
    }

    #[test]
    fn text_only_request_round_trips_through_openai() {
        let original = json!({
            "model": "claude-x",
            "max_tokens": 32,
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "q1"},
                {"role": "assistant", "content": "a1"},
                {"role": "user", "content": "q2"}
            ],
            "stop_sequences": ["END"],
            "tools": [{"name": "calc", "description": "d",
                       "input_schema": {"type": "object", "properties": {}}}]
        });
        let openai = anthropic_to_openai_request(&original).unwrap();
        let back = openai_request_to_anthropic(&openai);

        assert_eq!(back["system"], "be terse");
        assert_eq!(back["stop_sequences"], json!(["END"]));
        assert_eq!(back["tools"][0]["name"], "calc");
        assert_eq!(back["tools"][0]["input_schema"]["type"], "object");

        let roles: Vec<&str> = back["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);

        let texts: Vec<String> = back["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| match &m["content"] {
                Value::String(s) => s.clone(),
                Value::Array(blocks) => blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["q1", "a1", "q2"]);
    }

    #[test]
    fn nonstream_response_with_tagged_thinking() {
        let resp = json!({
            "id": "x1",
            "choices": [{"message": {"role": "assistant", "content": "<thinking>T</thinking>\nA"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });
        let message = openai_response_to_anthropic(&resp, "m", true);
        let blocks = message["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["thinking"], "T");
        assert_eq!(blocks[1]["type"], "text");
        assert_eq!(blocks[1]["text"], "A");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["usage"]["input_tokens"], 3);
    }
}
