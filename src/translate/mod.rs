//! Wire-format translation.
//!
//! Four dialects interoperate pairwise: OpenAI Chat Completions, OpenAI
//! Responses, Anthropic Messages, and Gemini v1beta. Translators are pure
//! functions of the input prefix plus a small local state machine; they
//! never reorder chunks.

pub mod anthropic;
pub mod gemini;
pub mod history;
pub mod responses;
pub mod thinking;

use serde_json::Value;

/// Parse an SSE `data:` line, returning the payload portion.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete SSE lines from a byte buffer; line breaks may split
/// across reads.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };

        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    lines
}

/// Serialize one SSE event. `event:` is omitted for bare data streams.
pub fn sse_event(event: Option<&str>, payload: &Value) -> String {
    match event {
        Some(name) => format!("event: {name}\ndata: {payload}\n\n"),
        None => format!("data: {payload}\n\n"),
    }
}

pub fn sse_done() -> &'static str {
    "data: [DONE]\n\n"
}

// ---------------------------------------------------------------------------
// Stop-reason maps. The full cycle must round-trip.
// ---------------------------------------------------------------------------

pub fn anthropic_stop_to_openai(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "stop_sequence" => "stop",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

pub fn openai_finish_to_anthropic(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "end_turn",
        _ => "end_turn",
    }
}

pub fn openai_finish_to_gemini(finish_reason: &str) -> &'static str {
    match finish_reason {
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        // Tool use is indicated by the part type, not the finish reason.
        _ => "STOP",
    }
}

pub fn gemini_finish_to_openai(finish_reason: &str) -> &'static str {
    match finish_reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

// ---------------------------------------------------------------------------
// Usage extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cached_tokens == 0
            && self.total_tokens == 0
    }

    /// Total must never be less than the sum of the parts; cached never
    /// exceeds input (and is never fabricated).
    pub fn finalized(mut self) -> Usage {
        self.total_tokens = self.total_tokens.max(self.input_tokens + self.output_tokens);
        self.cached_tokens = self.cached_tokens.min(self.input_tokens);
        self
    }
}

fn as_i64(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn usage_object<'a>(payload: &'a Value) -> Option<&'a Value> {
    if let Some(usage) = payload.get("usage").filter(|u| u.is_object()) {
        return Some(usage);
    }
    // Responses streaming wraps the object: {type, response: {usage}}
    if let Some(usage) = payload
        .get("response")
        .and_then(|r| r.get("usage"))
        .filter(|u| u.is_object())
    {
        return Some(usage);
    }
    payload
        .get("x_groq")
        .and_then(|x| x.get("usage"))
        .filter(|u| u.is_object())
}

/// Extract usage from an OpenAI-compatible payload (chat or responses,
/// streaming chunk or final object).
pub fn extract_openai_usage(payload: &Value) -> Option<Usage> {
    let usage = usage_object(payload)?;

    let input = match usage.get("prompt_tokens") {
        Some(v) => as_i64(Some(v)),
        None => as_i64(usage.get("input_tokens")),
    };
    let output = match usage.get("completion_tokens") {
        Some(v) => as_i64(Some(v)),
        None => as_i64(usage.get("output_tokens")),
    };
    let total = match usage.get("total_tokens") {
        Some(v) => as_i64(Some(v)),
        None => input + output,
    };

    let mut cached = as_i64(usage.get("cached_tokens")).max(as_i64(usage.get("cache_tokens")));
    for details_key in ["prompt_tokens_details", "input_tokens_details"] {
        if let Some(details) = usage.get(details_key) {
            cached = cached
                .max(as_i64(details.get("cached_tokens")))
                .max(as_i64(details.get("cache_tokens")));
        }
    }

    Some(Usage {
        input_tokens: input,
        output_tokens: output,
        cached_tokens: cached.max(0),
        total_tokens: total,
    })
}

/// Gemini `usageMetadata`: thoughts are folded into input tokens, matching
/// how the other dialects count reasoning.
pub fn extract_gemini_usage(response_obj: &Value) -> Option<Usage> {
    let usage = response_obj.get("usageMetadata").filter(|u| u.is_object())?;
    let prompt = as_i64(usage.get("promptTokenCount"));
    let thoughts = as_i64(usage.get("thoughtsTokenCount"));
    let completion = as_i64(usage.get("candidatesTokenCount"));
    let total = match usage.get("totalTokenCount") {
        Some(v) => as_i64(Some(v)),
        None => prompt + thoughts + completion,
    };
    let cached = as_i64(usage.get("cachedContentTokenCount"));

    Some(Usage {
        input_tokens: prompt + thoughts,
        output_tokens: completion,
        cached_tokens: cached,
        total_tokens: total,
    })
}

pub fn extract_anthropic_usage(payload: &Value) -> Option<Usage> {
    let usage = payload
        .get("usage")
        .or_else(|| payload.get("message").and_then(|m| m.get("usage")))
        .filter(|u| u.is_object())?;

    let input = as_i64(usage.get("input_tokens"));
    let output = as_i64(usage.get("output_tokens"));
    let cached = as_i64(usage.get("cache_read_input_tokens"));
    let creation = as_i64(usage.get("cache_creation_input_tokens"));

    Some(Usage {
        input_tokens: input + creation,
        output_tokens: output,
        cached_tokens: cached,
        total_tokens: input + creation + output,
    })
}

/// Streaming tool-call arguments may finalize as an empty string; treat
/// that as `{}` and log which tool produced it.
pub fn parse_tool_arguments(raw: &str, tool_name: &str, tool_id: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        crate::logger::warn(
            "translate",
            &format!("tool call {tool_name} ({tool_id}) finalized with empty arguments, using {{}}"),
        );
        return Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(trimmed) {
        Ok(v @ Value::Object(_)) => v,
        Ok(other) => other,
        Err(_) => {
            crate::logger::warn(
                "translate",
                &format!("tool call {tool_name} ({tool_id}) arguments are not valid JSON, using {{}}"),
            );
            Value::Object(serde_json::Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_line_parsing() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert!(is_sse_done(" [DONE] "));
    }

    #[test]
    fn drain_handles_partial_lines() {
        let mut buffer = Vec::new();
        assert!(drain_sse_lines(&mut buffer, b"data: {\"a\":").is_empty());
        assert_eq!(drain_sse_lines(&mut buffer, b"1}\r\n"), vec!["data: {\"a\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stop_reasons_round_trip() {
        for anthropic in ["end_turn", "max_tokens", "tool_use"] {
            let openai = anthropic_stop_to_openai(anthropic);
            assert_eq!(openai_finish_to_anthropic(openai), anthropic);
        }
        // stop_sequence collapses into stop -> end_turn by design
        assert_eq!(
            openai_finish_to_anthropic(anthropic_stop_to_openai("stop_sequence")),
            "end_turn"
        );
    }

    #[test]
    fn openai_usage_with_cached_details() {
        let usage = extract_openai_usage(&json!({
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 4,
                "total_tokens": 14,
                "prompt_tokens_details": {"cached_tokens": 6}
            }
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 4);
        assert_eq!(usage.cached_tokens, 6);
        assert_eq!(usage.total_tokens, 14);
    }

    #[test]
    fn openai_usage_from_responses_wrapper() {
        let usage = extract_openai_usage(&json!({
            "type": "response.completed",
            "response": {"usage": {"input_tokens": 3, "output_tokens": 1}}
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn gemini_usage_folds_thoughts_into_input() {
        let usage = extract_gemini_usage(&json!({
            "usageMetadata": {
                "promptTokenCount": 10,
                "thoughtsTokenCount": 5,
                "candidatesTokenCount": 7,
                "totalTokenCount": 22
            }
        }))
        .unwrap();
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.total_tokens, 22);
    }

    #[test]
    fn finalize_clamps_cached_and_raises_total() {
        let usage = Usage {
            input_tokens: 5,
            output_tokens: 5,
            cached_tokens: 9,
            total_tokens: 0,
        }
        .finalized();
        assert_eq!(usage.total_tokens, 10);
        assert_eq!(usage.cached_tokens, 5);
    }

    #[test]
    fn empty_tool_arguments_become_object() {
        assert_eq!(parse_tool_arguments("", "t", "id"), json!({}));
        assert_eq!(parse_tool_arguments("{\"x\":1}", "t", "id"), json!({"x":1}));
        assert_eq!(parse_tool_arguments("not json", "t", "id"), json!({}));
    }
}
