//! Gemini v1beta ↔ OpenAI Chat translation.
//!
//! Two directions are covered: Gemini-dialect callers lowered onto OpenAI
//! chat (and back, including streaming), and OpenAI chat requests raised
//! into the cloudcode-pa payload the GeminiCLI upstream accepts. The
//! upstream's historical quirks live here: snake_case `mime_type` on
//! inline data and a sentinel `thoughtSignature` on non-text parts.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{
    drain_sse_lines, extract_gemini_usage, gemini_finish_to_openai, is_sse_done,
    openai_finish_to_gemini, parse_sse_data, parse_tool_arguments, sse_event, Usage,
};
use crate::error::{GatewayError, GatewayResult};

pub const SKIP_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn get_aliased<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

pub fn default_safety_settings() -> Value {
    json!([
        {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF"},
        {"category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "BLOCK_NONE"},
    ])
}

fn ensure_default_safety_settings(request_obj: &mut Map<String, Value>) {
    if !request_obj.contains_key("safetySettings") {
        request_obj.insert("safetySettings".to_string(), default_safety_settings());
    }
}

/// A part is reasoning when it carries `thought: true`, or a non-empty
/// thought signature without an explicit flag.
pub fn is_thought_part(part: &Value) -> bool {
    if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
        return true;
    }
    get_aliased(part, "thoughtSignature", "thought_signature")
        .and_then(|s| s.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

fn next_tool_call_id(name: &str) -> String {
    let n = name.trim();
    let n = if n.is_empty() { "tool" } else { n };
    format!("{n}-{}", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Gemini caller → OpenAI chat
// ---------------------------------------------------------------------------

fn system_instruction_to_text(value: Option<&Value>) -> String {
    let Some(parts) = value.and_then(|v| v.get("parts")).and_then(|p| p.as_array()) else {
        return String::new();
    };
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn parts_to_openai_content(parts: &[Value]) -> GatewayResult<(Value, Vec<Value>)> {
    let mut texts: Vec<&str> = Vec::new();
    let mut blocks: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut has_inline = false;

    for (idx, part) in parts.iter().enumerate() {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if has_inline {
                blocks.push(json!({"type": "text", "text": text}));
            } else {
                texts.push(text);
            }
            continue;
        }

        if let Some(inline) = get_aliased(part, "inlineData", "inline_data") {
            let mime = get_aliased(inline, "mimeType", "mime_type")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .trim();
            let data = str_field(inline, "data").trim();
            if mime.is_empty() || data.is_empty() {
                return Err(GatewayError::InvalidRequest(format!(
                    "contents parts[{idx}].inlineData is missing mimeType/data"
                )));
            }
            has_inline = true;
            blocks.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime};base64,{data}")}
            }));
            continue;
        }

        if let Some(fc) = get_aliased(part, "functionCall", "function_call") {
            let name = str_field(fc, "name");
            let args = fc.get("args").cloned().unwrap_or(json!({}));
            tool_calls.push(json!({
                "id": next_tool_call_id(name),
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string())
                }
            }));
            continue;
        }

        // functionResponse parts become tool messages at the caller
        if get_aliased(part, "functionResponse", "function_response").is_some() {
            continue;
        }

        // fileData would require fetching a remote URI to represent in the
        // chat dialect; reject instead of dropping it.
        if get_aliased(part, "fileData", "file_data").is_some() {
            return Err(GatewayError::InvalidRequest(
                "fileData parts cannot be represented for this upstream".to_string(),
            ));
        }

        if is_thought_part(part) {
            continue;
        }

        return Err(GatewayError::InvalidRequest(format!(
            "unsupported Gemini content part at index {idx}"
        )));
    }

    let content = if has_inline {
        let mut out = Vec::new();
        if !texts.is_empty() {
            out.push(json!({"type": "text", "text": texts.concat()}));
        }
        out.extend(blocks);
        Value::Array(out)
    } else {
        Value::String(texts.concat())
    };

    Ok((content, tool_calls))
}

fn function_responses_to_tool_messages(parts: &[Value], call_ids: &mut Vec<String>) -> Vec<Value> {
    let mut out = Vec::new();
    for part in parts {
        let Some(fr) = get_aliased(part, "functionResponse", "function_response") else {
            continue;
        };
        let response = fr
            .get("response")
            .map(|r| match r.get("result") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => r.to_string(),
            })
            .unwrap_or_default();
        let call_id = if call_ids.is_empty() {
            next_tool_call_id(str_field(fr, "name"))
        } else {
            call_ids.remove(0)
        };
        out.push(json!({"role": "tool", "tool_call_id": call_id, "content": response}));
    }
    out
}

/// Gemini generateContent request → OpenAI chat request.
pub fn gemini_request_to_openai_chat(model: &str, request: &Value, stream: bool) -> GatewayResult<Value> {
    let mut messages: Vec<Value> = Vec::new();

    let sys_text = system_instruction_to_text(get_aliased(request, "systemInstruction", "system_instruction"));
    if !sys_text.is_empty() {
        messages.push(json!({"role": "system", "content": sys_text}));
    }

    let contents = request
        .get("contents")
        .and_then(|c| c.as_array())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("contents must be a non-empty array".to_string()))?;

    // functionCall ids are synthesized on the assistant side and consumed
    // in order by the following functionResponse turn.
    let mut pending_call_ids: Vec<String> = Vec::new();

    for (idx, item) in contents.iter().enumerate() {
        let role = str_field(item, "role").trim().to_ascii_lowercase();
        let parts = item
            .get("parts")
            .and_then(|p| p.as_array())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("contents[{idx}].parts must be a non-empty array"))
            })?;

        match role.as_str() {
            "user" => {
                let tool_messages = function_responses_to_tool_messages(parts, &mut pending_call_ids);
                if !tool_messages.is_empty() {
                    messages.extend(tool_messages);
                    continue;
                }
                let (content, _) = parts_to_openai_content(parts)?;
                messages.push(json!({"role": "user", "content": content}));
            }
            "model" => {
                let (content, tool_calls) = parts_to_openai_content(parts)?;
                let mut message = Map::new();
                message.insert("role".to_string(), json!("assistant"));
                message.insert("content".to_string(), content);
                if !tool_calls.is_empty() {
                    pending_call_ids = tool_calls
                        .iter()
                        .map(|tc| str_field(tc, "id").to_string())
                        .collect();
                    message.insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                messages.push(Value::Object(message));
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "contents[{idx}].role is not supported: {other:?}"
                )))
            }
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), json!(model.trim()));
    out.insert("messages".to_string(), Value::Array(messages));
    out.insert("stream".to_string(), Value::Bool(stream));

    if let Some(gen_cfg) = get_aliased(request, "generationConfig", "generation_config") {
        if let Some(t) = gen_cfg.get("temperature").filter(|v| !v.is_null()) {
            out.insert("temperature".to_string(), t.clone());
        }
        if let Some(t) = gen_cfg.get("topP").filter(|v| !v.is_null()) {
            out.insert("top_p".to_string(), t.clone());
        }
        if let Some(t) = gen_cfg.get("maxOutputTokens").filter(|v| !v.is_null()) {
            out.insert("max_tokens".to_string(), t.clone());
        }
    }

    if let Some(tools) = request.get("tools").and_then(|t| t.as_array()) {
        let mut openai_tools = Vec::new();
        for tool in tools {
            let Some(decls) = get_aliased(tool, "functionDeclarations", "function_declarations")
                .and_then(|d| d.as_array())
            else {
                continue;
            };
            for decl in decls {
                let parameters = decl
                    .get("parametersJsonSchema")
                    .or_else(|| decl.get("parameters"))
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                let mut function = Map::new();
                function.insert("name".to_string(), decl.get("name").cloned().unwrap_or(Value::Null));
                if let Some(desc) = decl.get("description") {
                    function.insert("description".to_string(), desc.clone());
                }
                function.insert("parameters".to_string(), parameters);
                openai_tools.push(json!({"type": "function", "function": function}));
            }
        }
        if !openai_tools.is_empty() {
            out.insert("tools".to_string(), Value::Array(openai_tools));
        }
    }

    Ok(Value::Object(out))
}

fn openai_usage_to_gemini_metadata(usage: Option<&Value>) -> Option<Value> {
    let usage = usage.filter(|u| u.is_object())?;
    let prompt = usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let completion = usage.get("completion_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .filter(|t| *t > 0)
        .unwrap_or(prompt + completion);
    let thoughts = usage
        .pointer("/completion_tokens_details/reasoning_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let mut out = json!({
        "promptTokenCount": prompt,
        "candidatesTokenCount": completion,
        "totalTokenCount": total,
    });
    if thoughts > 0 {
        out["thoughtsTokenCount"] = json!(thoughts);
    }
    Some(out)
}

/// Non-streaming OpenAI chat response → Gemini generateContent response.
pub fn openai_chat_response_to_gemini(chat_resp: &Value) -> Value {
    let message = chat_resp.pointer("/choices/0/message").cloned().unwrap_or(Value::Null);

    let mut parts: Vec<Value> = Vec::new();
    match message.get("content") {
        Some(Value::String(s)) if !s.is_empty() => parts.push(json!({"text": s})),
        Some(Value::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter(|b| str_field(b, "type") == "text")
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
        }
        _ => {}
    }

    let mut has_tool_call = false;
    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let function = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = str_field(&function, "name");
            if name.is_empty() {
                continue;
            }
            has_tool_call = true;
            let args = parse_tool_arguments(str_field(&function, "arguments"), name, str_field(tc, "id"));
            parts.push(json!({"functionCall": {"name": name, "args": args}}));
        }
    }

    let finish_raw = chat_resp
        .pointer("/choices/0/finish_reason")
        .and_then(|f| f.as_str())
        .unwrap_or("stop");
    // Tool use is indicated by the part type in Gemini, not the reason.
    let finish = if has_tool_call { "STOP" } else { openai_finish_to_gemini(finish_raw) };

    let mut out = json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish
        }]
    });
    if let Some(meta) = openai_usage_to_gemini_metadata(chat_resp.get("usage")) {
        out["usageMetadata"] = meta;
    }
    out
}

// ---------------------------------------------------------------------------
// Streaming: OpenAI chunks → Gemini SSE
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StreamToolCall {
    name: String,
    arguments: String,
    id: String,
}

/// ChatCompletions SSE → `data: {candidates, usageMetadata}` SSE. Gemini
/// streams terminate without a `[DONE]` sentinel.
pub struct ChatToGeminiStream {
    buffer: Vec<u8>,
    finished: bool,
    last_usage: Option<Value>,
    tool_calls: std::collections::BTreeMap<i64, StreamToolCall>,
    finish_seen: Option<String>,
    pub usage: Usage,
}

impl Default for ChatToGeminiStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatToGeminiStream {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            finished: false,
            last_usage: None,
            tool_calls: std::collections::BTreeMap::new(),
            finish_seen: None,
            usage: Usage::default(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        for line in drain_sse_lines(&mut self.buffer, chunk) {
            let Some(data) = parse_sse_data(&line) else {
                continue;
            };
            if is_sse_done(data) {
                self.finished = true;
                break;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream_error");
                let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(500);
                out.push(sse_event(None, &json!({"error": {"message": message, "code": code}})));
                self.finished = true;
                break;
            }

            if let Some(usage) = payload.get("usage").filter(|u| u.is_object()) {
                self.last_usage = Some(usage.clone());
                if let Some(parsed) = super::extract_openai_usage(&payload) {
                    self.usage = parsed;
                }
            }

            let Some(choice) = payload
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
            else {
                continue;
            };
            let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tool_calls {
                    let idx = tc.get("index").and_then(|i| i.as_i64()).unwrap_or(0);
                    let function = tc.get("function").cloned().unwrap_or(Value::Null);
                    let entry = self.tool_calls.entry(idx).or_default();
                    if let Some(id) = tc.get("id").and_then(|i| i.as_str()).filter(|s| !s.is_empty()) {
                        entry.id = id.to_string();
                    }
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()).filter(|s| !s.is_empty()) {
                        entry.name = name.to_string();
                    }
                    if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                        entry.arguments.push_str(args);
                    }
                }
            }

            let text_delta = delta.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let finish_reason = choice
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .unwrap_or("")
                .trim()
                .to_string();

            if !finish_reason.is_empty() {
                self.finish_seen = Some(finish_reason.clone());
            }

            if text_delta.is_empty() && finish_reason.is_empty() {
                continue;
            }

            // Tool calls are emitted complete at finalize; the terminal
            // chunk comes from there so the functionCall part is whole.
            if !finish_reason.is_empty() && !self.tool_calls.is_empty() {
                continue;
            }

            let mut candidate = json!({
                "content": {
                    "role": "model",
                    "parts": if text_delta.is_empty() { json!([]) } else { json!([{"text": text_delta}]) }
                }
            });
            let mut payload_out = json!({});
            if !finish_reason.is_empty() {
                candidate["finishReason"] = json!(openai_finish_to_gemini(&finish_reason));
                if let Some(meta) = openai_usage_to_gemini_metadata(self.last_usage.as_ref()) {
                    payload_out["usageMetadata"] = meta;
                }
            }
            payload_out["candidates"] = json!([candidate]);
            out.push(sse_event(None, &payload_out));
        }

        out
    }

    /// Emit the terminal chunk when tool calls were accumulated (or when
    /// upstream never sent a finish chunk). No `[DONE]` follows.
    pub fn finalize(&mut self) -> Vec<String> {
        if self.finished && self.tool_calls.is_empty() {
            return Vec::new();
        }
        self.finished = true;

        if self.tool_calls.is_empty() {
            return Vec::new();
        }

        let mut parts = Vec::new();
        for (_, tc) in std::mem::take(&mut self.tool_calls) {
            let args = parse_tool_arguments(&tc.arguments, &tc.name, &tc.id);
            parts.push(json!({"functionCall": {"name": tc.name, "args": args}}));
        }

        let mut payload = json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": "STOP"
            }]
        });
        if let Some(meta) = openai_usage_to_gemini_metadata(self.last_usage.as_ref()) {
            payload["usageMetadata"] = meta;
        }
        vec![sse_event(None, &payload)]
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat → cloudcode-pa payload (upstream direction)
// ---------------------------------------------------------------------------

fn data_url_to_inline_data(url: &str) -> Option<Value> {
    let rest = url.trim().strip_prefix("data:")?;
    let (mime, b64) = rest.split_once(";base64,")?;
    let mime = if mime.trim().is_empty() { "image/png" } else { mime.trim() };
    let b64 = b64.trim();
    if b64.is_empty() {
        return None;
    }
    // cloudcode-pa historically expects snake_case mime_type here
    Some(json!({"inlineData": {"mime_type": mime, "data": b64}}))
}

fn openai_tools_to_gemini(tools: Option<&Value>) -> Option<Value> {
    let tools = tools?.as_array()?;
    if tools.is_empty() {
        return None;
    }

    let mut decls = Vec::new();
    let mut search_nodes = Vec::new();

    for tool in tools {
        match str_field(tool, "type") {
            "function" => {
                if let Some(function) = tool.get("function").filter(|f| f.is_object()) {
                    let mut decl = function.as_object().cloned().unwrap_or_default();
                    if !decl.contains_key("parametersJsonSchema") {
                        let parameters = decl
                            .remove("parameters")
                            .filter(|p| p.is_object())
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                        decl.insert("parametersJsonSchema".to_string(), parameters);
                    }
                    decl.remove("strict");
                    decls.push(Value::Object(decl));
                }
            }
            "web_search" | "google_search" => {
                let cfg: Map<String, Value> = tool
                    .as_object()
                    .map(|o| {
                        o.iter()
                            .filter(|(k, _)| k.as_str() != "type")
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                search_nodes.push(json!({"googleSearch": cfg}));
            }
            _ => {
                if let Some(gs) = tool.get("google_search").or_else(|| tool.get("googleSearch")) {
                    search_nodes.push(json!({"googleSearch": gs}));
                }
            }
        }
    }

    let mut out = Vec::new();
    if !decls.is_empty() {
        out.push(json!({"functionDeclarations": decls}));
    }
    out.extend(search_nodes);
    if out.is_empty() {
        None
    } else {
        Some(Value::Array(out))
    }
}

fn openai_messages_to_gemini_contents(messages: &[Value]) -> GatewayResult<(Option<Value>, Vec<Value>)> {
    // tool_call_id -> function name, so functionResponse parts carry the
    // right name even when the tool message arrives later.
    let mut call_names = std::collections::HashMap::new();
    let mut tool_outputs = std::collections::HashMap::new();
    for message in messages {
        if str_field(message, "role") == "assistant" {
            if let Some(tcs) = message.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tcs {
                    let id = str_field(tc, "id");
                    let name = tc.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or("");
                    if !id.is_empty() && !name.is_empty() {
                        call_names.insert(id.to_string(), name.to_string());
                    }
                }
            }
        }
        if str_field(message, "role") == "tool" {
            let id = str_field(message, "tool_call_id");
            if !id.is_empty() {
                tool_outputs.insert(id.to_string(), message.get("content").cloned().unwrap_or(Value::Null));
            }
        }
    }

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    let multi_message = messages.len() > 1;

    for message in messages {
        let role = str_field(message, "role");
        let content = message.get("content").cloned().unwrap_or(Value::Null);

        if (role == "system" || role == "developer") && multi_message {
            match &content {
                Value::String(s) if !s.trim().is_empty() => {
                    system_parts.push(json!({"text": s.trim()}))
                }
                Value::Array(items) => {
                    for item in items {
                        if str_field(item, "type") == "text" {
                            let text = str_field(item, "text").trim();
                            if !text.is_empty() {
                                system_parts.push(json!({"text": text}));
                            }
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        if role == "user" || ((role == "system" || role == "developer") && !multi_message) {
            let mut parts: Vec<Value> = Vec::new();
            match &content {
                Value::String(s) if !s.trim().is_empty() => parts.push(json!({"text": s})),
                Value::Array(items) => {
                    for item in items {
                        match str_field(item, "type") {
                            "text" => parts.push(json!({"text": item.get("text").cloned().unwrap_or(Value::Null)})),
                            "image_url" => {
                                let url = item
                                    .pointer("/image_url/url")
                                    .and_then(|u| u.as_str())
                                    .or_else(|| item.get("image_url").and_then(|u| u.as_str()))
                                    .unwrap_or("");
                                match data_url_to_inline_data(url) {
                                    Some(mut inline) => {
                                        inline["thoughtSignature"] = json!(SKIP_THOUGHT_SIGNATURE);
                                        parts.push(inline);
                                    }
                                    // This upstream cannot fetch remote
                                    // image URLs; dropping one silently
                                    // would corrupt the conversation.
                                    None => {
                                        return Err(GatewayError::InvalidRequest(format!(
                                            "image_url {url:?} cannot be represented for this upstream (data: URLs only)"
                                        )))
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            if !parts.is_empty() {
                contents.push(json!({"role": "user", "parts": parts}));
            }
            continue;
        }

        if role == "assistant" {
            let mut parts: Vec<Value> = Vec::new();
            match &content {
                Value::String(s) if !s.trim().is_empty() => parts.push(json!({"text": s})),
                Value::Array(items) => {
                    for item in items {
                        if str_field(item, "type") == "text" {
                            parts.push(json!({"text": item.get("text").cloned().unwrap_or(Value::Null)}));
                        }
                    }
                }
                _ => {}
            }

            let mut call_ids: Vec<String> = Vec::new();
            if let Some(tcs) = message.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tcs {
                    let name = tc.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or("");
                    let raw_args = tc.pointer("/function/arguments").and_then(|a| a.as_str()).unwrap_or("");
                    let args = parse_tool_arguments(raw_args, name, str_field(tc, "id"));
                    parts.push(json!({
                        "functionCall": {"name": name, "args": args},
                        "thoughtSignature": SKIP_THOUGHT_SIGNATURE
                    }));
                    let id = str_field(tc, "id");
                    if !id.is_empty() {
                        call_ids.push(id.to_string());
                    }
                }
            }

            if !parts.is_empty() {
                contents.push(json!({"role": "model", "parts": parts}));
            }

            if !call_ids.is_empty() {
                let mut response_parts = Vec::new();
                for id in call_ids {
                    let Some(name) = call_names.get(&id) else {
                        continue;
                    };
                    let result = match tool_outputs.get(&id) {
                        Some(Value::String(s)) => {
                            serde_json::from_str::<Value>(s).unwrap_or_else(|_| json!(s))
                        }
                        Some(other) => other.clone(),
                        None => Value::Null,
                    };
                    response_parts.push(json!({
                        "functionResponse": {"name": name, "response": {"result": result}}
                    }));
                }
                if !response_parts.is_empty() {
                    contents.push(json!({"role": "user", "parts": response_parts}));
                }
            }
        }
    }

    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(json!({"role": "user", "parts": system_parts}))
    };
    Ok((system_instruction, contents))
}

/// OpenAI chat request → GeminiCLI payload `{project, request, model}`.
/// The project is filled in by the dispatcher per selected candidate.
pub fn openai_request_to_cli_payload(request: &Value) -> GatewayResult<Value> {
    let model = {
        let m = str_field(request, "model").trim();
        if m.is_empty() { "gemini-2.5-pro" } else { m }
    };

    let mut req_obj = Map::new();

    let mut gen_cfg = Map::new();
    if let Some(t) = request.get("temperature").filter(|v| v.is_number()) {
        gen_cfg.insert("temperature".to_string(), t.clone());
    }
    if let Some(t) = request.get("top_p").filter(|v| v.is_number()) {
        gen_cfg.insert("topP".to_string(), t.clone());
    }
    if let Some(t) = request.get("top_k").filter(|v| v.is_number()) {
        gen_cfg.insert("topK".to_string(), t.clone());
    }
    if let Some(t) = request.get("max_tokens").and_then(|v| v.as_i64()).filter(|v| *v > 0) {
        gen_cfg.insert("maxOutputTokens".to_string(), json!(t));
    }
    match request.get("stop") {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            gen_cfg.insert("stopSequences".to_string(), json!([s.trim()]));
        }
        Some(Value::Array(items)) => {
            let seqs: Vec<String> = items
                .iter()
                .filter_map(|s| s.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !seqs.is_empty() {
                gen_cfg.insert("stopSequences".to_string(), json!(seqs));
            }
        }
        _ => {}
    }
    if !gen_cfg.is_empty() {
        req_obj.insert("generationConfig".to_string(), Value::Object(gen_cfg));
    }

    let empty = Vec::new();
    let messages = request.get("messages").and_then(|m| m.as_array()).unwrap_or(&empty);
    let (system_instruction, contents) = openai_messages_to_gemini_contents(messages)?;
    if let Some(si) = system_instruction {
        req_obj.insert("systemInstruction".to_string(), si);
    }
    req_obj.insert("contents".to_string(), Value::Array(contents));

    if let Some(tools) = openai_tools_to_gemini(request.get("tools")) {
        req_obj.insert("tools".to_string(), tools);
    }

    ensure_default_safety_settings(&mut req_obj);

    Ok(json!({"project": "", "request": Value::Object(req_obj), "model": model}))
}

fn normalize_fn_decl(decl: &Value) -> Value {
    let mut out = decl.as_object().cloned().unwrap_or_default();
    if !out.contains_key("parametersJsonSchema") {
        let parameters = out
            .remove("parameters")
            .filter(|p| p.is_object())
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
        out.insert("parametersJsonSchema".to_string(), parameters);
    }
    out.remove("strict");
    Value::Object(out)
}

fn ensure_skip_thought_signature(part: &mut Map<String, Value>) {
    if let Some(existing) = part.get("thoughtSignature").and_then(|s| s.as_str()) {
        if !existing.trim().is_empty() {
            return;
        }
    }
    if let Some(snake) = part.get("thought_signature").and_then(|s| s.as_str()) {
        let trimmed = snake.trim().to_string();
        if !trimmed.is_empty() {
            part.insert("thoughtSignature".to_string(), json!(trimmed));
            part.remove("thought_signature");
            return;
        }
    }
    part.insert("thoughtSignature".to_string(), json!(SKIP_THOUGHT_SIGNATURE));
}

fn normalize_content_for_cli(content: &Value) -> Value {
    let Some(obj) = content.as_object() else {
        return content.clone();
    };
    let mut out = obj.clone();
    let Some(parts_in) = obj.get("parts").and_then(|p| p.as_array()) else {
        return Value::Object(out);
    };

    let mut parts_out = Vec::with_capacity(parts_in.len());
    for part in parts_in {
        let Some(part_obj) = part.as_object() else {
            parts_out.push(part.clone());
            continue;
        };
        let mut p = part_obj.clone();

        if let Some(inline) = get_aliased(part, "inlineData", "inline_data").and_then(|v| v.as_object()) {
            let mut inline_out = inline.clone();
            if let Some(mime) = get_aliased(&Value::Object(inline.clone()), "mimeType", "mime_type")
                .and_then(|m| m.as_str())
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
            {
                inline_out.insert("mime_type".to_string(), json!(mime));
            }
            inline_out.remove("mimeType");
            p.remove("inline_data");
            p.insert("inlineData".to_string(), Value::Object(inline_out));
            ensure_skip_thought_signature(&mut p);
        }

        if get_aliased(part, "functionCall", "function_call").is_some() {
            ensure_skip_thought_signature(&mut p);
        }

        parts_out.push(Value::Object(p));
    }
    out.insert("parts".to_string(), Value::Array(parts_out));
    Value::Object(out)
}

/// Gemini v1beta caller request → GeminiCLI payload, preserving the body
/// while normalizing tool declarations, aliases, and safety settings.
pub fn gemini_request_to_cli_payload(model: &str, request: &Value) -> Value {
    let mut req_obj = request.as_object().cloned().unwrap_or_default();
    req_obj.remove("model");

    if !req_obj.contains_key("systemInstruction") {
        if let Some(si) = req_obj.remove("system_instruction") {
            req_obj.insert("systemInstruction".to_string(), si);
        }
    }

    if let Some(tools_in) = req_obj.get("tools").and_then(|t| t.as_array()).cloned() {
        let mut tools_out = Vec::new();
        for tool in tools_in {
            if let Some(decls) = get_aliased(&tool, "functionDeclarations", "function_declarations")
                .and_then(|d| d.as_array())
            {
                tools_out.push(json!({
                    "functionDeclarations": decls.iter().map(normalize_fn_decl).collect::<Vec<_>>()
                }));
            } else if let Some(gs) = get_aliased(&tool, "googleSearch", "google_search") {
                tools_out.push(json!({"googleSearch": gs}));
            } else {
                tools_out.push(tool);
            }
        }
        req_obj.insert("tools".to_string(), Value::Array(tools_out));
    }

    if let Some(si) = req_obj.get("systemInstruction").cloned() {
        req_obj.insert("systemInstruction".to_string(), normalize_content_for_cli(&si));
    }
    if let Some(contents) = req_obj.get("contents").and_then(|c| c.as_array()).cloned() {
        req_obj.insert(
            "contents".to_string(),
            Value::Array(contents.iter().map(normalize_content_for_cli).collect()),
        );
    }

    ensure_default_safety_settings(&mut req_obj);
    json!({"project": "", "request": Value::Object(req_obj), "model": model})
}

// ---------------------------------------------------------------------------
// GeminiCLI upstream → OpenAI chunks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CliStreamState {
    created: i64,
    function_index: i64,
}

fn base_chunk(response: &Value, state: &CliStreamState, finish_reason: Option<&str>) -> Value {
    json!({
        "id": str_field(response, "responseId"),
        "object": "chat.completion.chunk",
        "created": if state.created > 0 { state.created } else { chrono::Utc::now().timestamp() },
        "model": str_field(response, "modelVersion"),
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": finish_reason
        }]
    })
}

fn attach_usage(payload: &mut Value, response: &Value) {
    let Some(usage) = extract_gemini_usage(response) else {
        return;
    };
    if usage.total_tokens == 0 {
        return;
    }
    payload["usage"] = json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
    });
}

/// One GeminiCLI SSE event (JSON) → 0..N OpenAI chat.completion.chunk
/// payloads.
pub fn cli_event_to_openai_chunks(raw_event: &Value, state: &mut CliStreamState) -> Vec<Value> {
    let Some(response) = raw_event.get("response").filter(|r| r.is_object()) else {
        return Vec::new();
    };

    if let Some(created) = str_field(response, "createTime")
        .parse::<chrono::DateTime<chrono::Utc>>()
        .ok()
        .map(|d| d.timestamp())
    {
        state.created = created;
    }

    let candidates = response.get("candidates").and_then(|c| c.as_array());
    let finish_reason = candidates
        .and_then(|c| c.first())
        .and_then(|c| c.get("finishReason"))
        .and_then(|f| f.as_str())
        .map(|f| gemini_finish_to_openai(f.trim()));

    let parts = candidates
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    if parts.is_empty() {
        let mut payload = base_chunk(response, state, finish_reason);
        attach_usage(&mut payload, response);
        return vec![payload];
    }

    let mut chunks = Vec::new();
    for part in &parts {
        let signature = get_aliased(part, "thoughtSignature", "thought_signature")
            .and_then(|s| s.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        let text = part.get("text").and_then(|t| t.as_str());
        let function_call = get_aliased(part, "functionCall", "function_call");
        let inline_data = get_aliased(part, "inlineData", "inline_data");

        if signature.is_some() && text.is_none() && function_call.is_none() && inline_data.is_none() {
            continue;
        }

        let mut payload = base_chunk(response, state, finish_reason);
        attach_usage(&mut payload, response);

        if let Some(text) = text.filter(|t| !t.is_empty()) {
            payload["choices"][0]["delta"]["role"] = json!("assistant");
            if is_thought_part(part) {
                payload["choices"][0]["delta"]["reasoning_content"] = json!(text);
                if let Some(sig) = signature {
                    payload["choices"][0]["delta"]["signature"] = json!(sig);
                }
            } else {
                payload["choices"][0]["delta"]["content"] = json!(text);
            }
            chunks.push(payload);
            continue;
        }

        if let Some(fc) = function_call {
            let name = str_field(fc, "name").trim();
            if name.is_empty() {
                continue;
            }
            let args = fc.get("args").cloned().unwrap_or(json!({}));
            let args_str = match &args {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
            };
            payload["choices"][0]["delta"]["role"] = json!("assistant");
            payload["choices"][0]["delta"]["tool_calls"] = json!([{
                "id": next_tool_call_id(name),
                "index": state.function_index,
                "type": "function",
                "function": {"name": name, "arguments": args_str}
            }]);
            state.function_index += 1;
            payload["choices"][0]["finish_reason"] = json!("tool_calls");
            chunks.push(payload);
            continue;
        }

        if let Some(inline) = inline_data {
            let data = str_field(inline, "data").trim();
            if data.is_empty() {
                continue;
            }
            let mime = get_aliased(inline, "mimeType", "mime_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png")
                .trim();
            payload["choices"][0]["delta"]["role"] = json!("assistant");
            payload["choices"][0]["delta"]["images"] = json!([{
                "type": "image_url",
                "image_url": {"url": format!("data:{mime};base64,{data}")}
            }]);
            chunks.push(payload);
        }
    }

    chunks
}

/// Non-streaming GeminiCLI response (with its `response` wrapper) → OpenAI
/// chat.completion.
pub fn cli_response_to_openai(raw: &Value) -> Value {
    let response = raw.get("response").filter(|r| r.is_object()).unwrap_or(raw);

    let response_id = {
        let id = str_field(response, "responseId").trim();
        if id.is_empty() {
            format!("gemini-cli-{}", Uuid::new_v4().simple())
        } else {
            id.to_string()
        }
    };
    let created = str_field(response, "createTime")
        .parse::<chrono::DateTime<chrono::Utc>>()
        .map(|d| d.timestamp())
        .unwrap_or_else(|_| chrono::Utc::now().timestamp());

    let first = response
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let parts = first
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut content_texts = String::new();
    let mut reasoning_texts = String::new();
    let mut tool_calls = Vec::new();
    let mut images = Vec::new();

    for part in &parts {
        let signature = get_aliased(part, "thoughtSignature", "thought_signature")
            .and_then(|s| s.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        let text = part.get("text").and_then(|t| t.as_str());
        let function_call = get_aliased(part, "functionCall", "function_call");
        let inline_data = get_aliased(part, "inlineData", "inline_data");

        if signature && text.is_none() && function_call.is_none() && inline_data.is_none() {
            continue;
        }

        if let Some(text) = text.filter(|t| !t.is_empty()) {
            if is_thought_part(part) {
                reasoning_texts.push_str(text);
            } else {
                content_texts.push_str(text);
            }
            continue;
        }

        if let Some(fc) = function_call {
            let name = str_field(fc, "name").trim();
            if name.is_empty() {
                continue;
            }
            let args = fc.get("args").cloned().unwrap_or(json!({}));
            let args_str = match &args {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
            };
            tool_calls.push(json!({
                "id": next_tool_call_id(name),
                "index": tool_calls.len(),
                "type": "function",
                "function": {"name": name, "arguments": args_str}
            }));
            continue;
        }

        if let Some(inline) = inline_data {
            let data = str_field(inline, "data").trim();
            if data.is_empty() {
                continue;
            }
            let mime = get_aliased(inline, "mimeType", "mime_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png")
                .trim();
            images.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime};base64,{data}")}
            }));
        }
    }

    let mut finish_reason = first
        .get("finishReason")
        .and_then(|f| f.as_str())
        .map(|f| gemini_finish_to_openai(f.trim()))
        .unwrap_or("stop")
        .to_string();

    let mut message = json!({"role": "assistant", "content": content_texts});
    if !reasoning_texts.is_empty() {
        message["reasoning_content"] = json!(reasoning_texts);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
        finish_reason = "tool_calls".to_string();
    }
    if !images.is_empty() {
        message["images"] = json!(images);
    }

    let usage = extract_gemini_usage(response).unwrap_or_default();
    json!({
        "id": response_id,
        "object": "chat.completion",
        "created": created,
        "model": str_field(response, "modelVersion"),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens,
        }
    })
}
