//! Usage tracking.
//!
//! Every request produces exactly one UsageLog row and one UsageCounter
//! delta, success or not. The streaming tracker rides along the SSE bytes
//! on their way to the client; the commit opens its own short-lived
//! connection and never propagates failures into the response path.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::translate::{extract_openai_usage, Usage};

pub const MAX_ERROR_MESSAGE_LENGTH: usize = 2000;
pub const MAX_LOGS_PER_CHANNEL: usize = 200;
pub const MAX_REQUEST_BODY_LENGTH: usize = 65536;
pub const MAX_CLIENT_APP_LENGTH: usize = 128;

/// Byte-bounded truncation that never splits a UTF-8 sequence; truncated
/// values carry a trailing ellipsis marker.
fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

pub fn truncate_error_message(message: &str) -> String {
    truncate_utf8(message, MAX_ERROR_MESSAGE_LENGTH)
}

pub fn truncate_request_body(body: &Value) -> Option<String> {
    if body.is_null() {
        return None;
    }
    Some(truncate_utf8(&body.to_string(), MAX_REQUEST_BODY_LENGTH))
}

pub fn truncate_client_app(value: Option<&str>) -> Option<String> {
    let text = value?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_CLIENT_APP_LENGTH).collect())
}

// ---------------------------------------------------------------------------
// Streaming tracker
// ---------------------------------------------------------------------------

/// Inspects each `data:` line of an OpenAI-style SSE stream for usage and
/// inline error events. An embedded error flips the success flag even
/// though the HTTP status was already written as 200.
#[derive(Default)]
pub struct SseUsageTracker {
    buffer: String,
    pub usage: Usage,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    seen_usage: bool,
}

impl SseUsageTracker {
    pub fn new() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(payload) = serde_json::from_str::<Value>(data) else {
                continue;
            };

            if let Some(usage) = extract_openai_usage(&payload) {
                if !usage.is_empty() {
                    self.usage = usage;
                    self.seen_usage = true;
                }
            }

            // {error: {...}} in chat streams, response.error in Responses
            let error = payload
                .get("error")
                .filter(|e| !e.is_null())
                .or_else(|| payload.pointer("/response/error").filter(|e| !e.is_null()));
            if let Some(error) = error {
                self.success = false;
                match error {
                    Value::Object(obj) => {
                        let message = obj
                            .get("message")
                            .or_else(|| obj.get("detail"))
                            .and_then(|m| m.as_str())
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| error.to_string());
                        self.error_message = Some(truncate_error_message(&message));
                        let code = ["code", "status", "status_code"]
                            .iter()
                            .find_map(|k| obj.get(*k))
                            .and_then(|c| match c {
                                Value::Number(n) => n.as_u64(),
                                Value::String(s) => s.parse().ok(),
                                _ => None,
                            });
                        self.status_code = code
                            .and_then(|c| u16::try_from(c).ok())
                            .or(self.status_code)
                            .or(Some(500));
                    }
                    other => {
                        self.error_message = Some(truncate_error_message(&other.to_string()));
                        self.status_code = self.status_code.or(Some(500));
                    }
                }
            }
        }
    }

    pub fn finalize(&mut self) -> Usage {
        if !self.seen_usage {
            self.usage.total_tokens = self.usage.input_tokens + self.usage.output_tokens;
        }
        self.usage.finalized()
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: i64,
    pub endpoint: String,
    pub method: String,
    pub model_name: Option<String>,
    pub config_type: String,
    pub stream: bool,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub usage: Usage,
    pub quota_consumed: f64,
    pub duration_ms: i64,
    pub client_app: Option<String>,
    pub request_body: Option<String>,
}

impl UsageRecord {
    pub fn new(user_id: i64, endpoint: &str, config_type: &str) -> Self {
        Self {
            user_id,
            endpoint: endpoint.to_string(),
            method: "POST".to_string(),
            model_name: None,
            config_type: config_type.to_string(),
            stream: false,
            success: true,
            status_code: None,
            error_message: None,
            usage: Usage::default(),
            quota_consumed: 0.0,
            duration_ms: 0,
            client_app: None,
            request_body: None,
        }
    }
}

fn commit_inner(conn: &Connection, record: &UsageRecord) -> rusqlite::Result<()> {
    let now = Utc::now().timestamp();
    let usage = record.usage;

    conn.execute_batch("BEGIN")?;
    let result = (|| -> rusqlite::Result<()> {
        conn.execute(
            "insert into usage_logs (user_id, endpoint, method, model_name, config_type, stream,
                                     success, status_code, error_message, input_tokens, output_tokens,
                                     cached_tokens, total_tokens, quota_consumed, duration_ms,
                                     client_app, request_body, created_at)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.user_id,
                record.endpoint,
                record.method,
                record.model_name,
                record.config_type,
                record.stream as i64,
                record.success as i64,
                record.status_code.map(|c| c as i64),
                record.error_message.as_deref().map(truncate_error_message),
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
                usage.total_tokens,
                record.quota_consumed,
                record.duration_ms,
                record.client_app,
                record.request_body,
                now,
            ],
        )?;

        // Only the newest N rows per (user, config_type) are kept; the
        // counters below are the truth for historical totals.
        conn.execute(
            "delete from usage_logs where id in (
                select id from usage_logs
                where user_id = ?1 and config_type = ?2
                order by created_at desc, id desc
                limit -1 offset ?3
            )",
            params![record.user_id, record.config_type, MAX_LOGS_PER_CHANNEL as i64],
        )?;

        let (success_inc, failed_inc) = if record.success { (1i64, 0i64) } else { (0, 1) };
        conn.execute(
            "insert into usage_counters (user_id, config_type, total_requests, success_requests,
                                         failed_requests, input_tokens, output_tokens, cached_tokens,
                                         total_tokens, total_quota_consumed, total_duration_ms, updated_at)
             values (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             on conflict(user_id, config_type) do update set
                 total_requests = total_requests + 1,
                 success_requests = success_requests + excluded.success_requests,
                 failed_requests = failed_requests + excluded.failed_requests,
                 input_tokens = input_tokens + excluded.input_tokens,
                 output_tokens = output_tokens + excluded.output_tokens,
                 cached_tokens = cached_tokens + excluded.cached_tokens,
                 total_tokens = total_tokens + excluded.total_tokens,
                 total_quota_consumed = total_quota_consumed + excluded.total_quota_consumed,
                 total_duration_ms = total_duration_ms + excluded.total_duration_ms,
                 updated_at = excluded.updated_at",
            params![
                record.user_id,
                record.config_type,
                success_inc,
                failed_inc,
                usage.input_tokens,
                usage.output_tokens,
                usage.cached_tokens,
                usage.total_tokens,
                record.quota_consumed,
                record.duration_ms,
                now,
            ],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT"),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Commit one request's usage. Write failure is logged, never propagated.
pub fn commit(record: &UsageRecord) {
    let result = crate::db::open_conn().and_then(|conn| commit_inner(&conn, record));
    if let Err(e) = result {
        crate::logger::warn("usage", &format!("usage commit failed: {e}"));
    }
}

#[cfg(test)]
pub(crate) fn commit_with(conn: &Connection, record: &UsageRecord) {
    if let Err(e) = commit_inner(conn, record) {
        panic!("usage commit failed: {e}");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterRow {
    pub total_requests: i64,
    pub success_requests: i64,
    pub failed_requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub total_tokens: i64,
}

pub fn get_counters(conn: &Connection, user_id: i64, config_type: &str) -> rusqlite::Result<Option<CounterRow>> {
    let mut stmt = conn.prepare_cached(
        "select total_requests, success_requests, failed_requests, input_tokens, output_tokens,
                cached_tokens, total_tokens
         from usage_counters where user_id = ?1 and config_type = ?2",
    )?;
    stmt.query_row(params![user_id, config_type], |r| {
        Ok(CounterRow {
            total_requests: r.get(0)?,
            success_requests: r.get(1)?,
            failed_requests: r.get(2)?,
            input_tokens: r.get(3)?,
            output_tokens: r.get(4)?,
            cached_tokens: r.get(5)?,
            total_tokens: r.get(6)?,
        })
    })
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_memory_db;

    #[test]
    fn tracker_captures_usage_and_total() {
        let mut tracker = SseUsageTracker::new();
        tracker.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n");
        tracker.feed(
            b"data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n",
        );
        tracker.feed(b"data: [DONE]\n");
        let usage = tracker.finalize();
        assert!(tracker.success);
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn tracker_flips_success_on_inline_error() {
        let mut tracker = SseUsageTracker::new();
        tracker.feed(b"data: {\"error\":{\"message\":\"quota exceeded\",\"code\":429}}\n");
        assert!(!tracker.success);
        assert_eq!(tracker.status_code, Some(429));
        assert_eq!(tracker.error_message.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn tracker_handles_responses_style_error() {
        let mut tracker = SseUsageTracker::new();
        tracker.feed(b"data: {\"type\":\"response.failed\",\"response\":{\"error\":{\"message\":\"bad\"}}}\n");
        assert!(!tracker.success);
        assert_eq!(tracker.status_code, Some(500));
    }

    #[test]
    fn tracker_total_is_max_of_observed_and_sum() {
        let mut tracker = SseUsageTracker::new();
        tracker.feed(b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":5,\"total_tokens\":3}}\n");
        let usage = tracker.finalize();
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let text = "é".repeat(2000);
        let out = truncate_utf8(&text, MAX_ERROR_MESSAGE_LENGTH);
        assert!(out.ends_with('…'));
        assert!(out.len() <= MAX_ERROR_MESSAGE_LENGTH + '…'.len_utf8());
        // never panics on the boundary
        assert!(out.chars().all(|c| c == 'é' || c == '…'));
    }

    fn basic_record(user_id: i64, success: bool, tokens: i64) -> UsageRecord {
        let mut record = UsageRecord::new(user_id, "/v1/chat/completions", "codex");
        record.success = success;
        record.usage = Usage {
            input_tokens: tokens,
            output_tokens: 0,
            cached_tokens: 0,
            total_tokens: tokens,
        };
        record
    }

    #[test]
    fn counters_accumulate_monotonically() {
        let conn = open_memory_db();
        commit_with(&conn, &basic_record(1, true, 4));
        commit_with(&conn, &basic_record(1, true, 6));
        commit_with(&conn, &basic_record(1, false, 0));

        let row = get_counters(&conn, 1, "codex").unwrap().unwrap();
        assert_eq!(row.total_requests, 3);
        assert_eq!(row.success_requests, 2);
        assert_eq!(row.failed_requests, 1);
        assert_eq!(row.total_tokens, 10);
    }

    #[test]
    fn failures_still_write_a_log_row() {
        let conn = open_memory_db();
        let mut record = basic_record(2, false, 0);
        record.status_code = Some(502);
        record.error_message = Some("upstream died".to_string());
        commit_with(&conn, &record);

        let (count, success): (i64, i64) = conn
            .query_row(
                "select count(*), sum(success) from usage_logs where user_id = 2",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(success, 0);
    }

    #[test]
    fn log_window_is_trimmed_to_cap() {
        let conn = open_memory_db();
        for _ in 0..(MAX_LOGS_PER_CHANNEL + 25) {
            commit_with(&conn, &basic_record(3, true, 1));
        }
        let count: i64 = conn
            .query_row(
                "select count(*) from usage_logs where user_id = 3 and config_type = 'codex'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, MAX_LOGS_PER_CHANNEL as i64);

        // counters keep the full history even though logs rolled over
        let row = get_counters(&conn, 3, "codex").unwrap().unwrap();
        assert_eq!(row.total_requests, (MAX_LOGS_PER_CHANNEL + 25) as i64);
    }
}
