//! Upstream dispatchers.
//!
//! One dispatcher per provider behind a closed enum; all share the same
//! contract: send a translated request for a selected account and surface
//! the raw status/headers/body for classification. Retry policy lives in
//! the failover engine here, not in the dispatchers.

pub mod antigravity;
pub mod client;
pub mod codex;
pub mod eventstream;
pub mod gemini_cli;
pub mod kiro;
pub mod qwen;
pub mod zai;

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::accounts::repository::AccountRepository;
use crate::accounts::{Account, Provider};
use crate::auth::oauth;
use crate::cache;
use crate::error::{GatewayError, GatewayResult};
use crate::routing::selector::{self, Candidate};

const TOKEN_REFRESH_SKEW_SECS: i64 = 60;
const LAST_USED_THROTTLE: Duration = Duration::from_secs(60);
/// Freeze horizon when the upstream gives no expiry. Effectively permanent
/// but keeps `frozen_until` populated.
const INDEFINITE_FREEZE_DAYS: i64 = 3650;

/// How an upstream failure should be handled. Derived purely from the
/// response; never performs I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// 408/5xx/network: try the next candidate, write nothing.
    Transient,
    /// 429: cool the candidate down, optionally freeze on disclosed resets.
    RateLimit { until: Option<DateTime<Utc>> },
    /// 402/403: persist a freeze and move on.
    Freeze { reason: String, until: Option<DateTime<Utc>> },
    /// 401: refresh once, then freeze if it repeats.
    Unauthorized,
    /// Anything else is surfaced to the caller unchanged.
    Fatal,
}

pub fn classify_failure(status: u16, headers: &HeaderMap, body: &str) -> FailureKind {
    let now = Utc::now();
    match status {
        429 => FailureKind::RateLimit {
            until: parse_retry_after(headers, now),
        },
        401 => FailureKind::Unauthorized,
        402 | 403 => {
            let code = extract_error_detail_code(body);
            let reason = if code.is_empty() {
                format!("upstream_{status}")
            } else {
                format!("upstream_{status}:{code}")
            };
            FailureKind::Freeze { reason, until: None }
        }
        408 => FailureKind::Transient,
        s if s >= 500 => FailureKind::Transient,
        _ => FailureKind::Fatal,
    }
}

/// Retry-After: either delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(now + chrono::Duration::seconds(secs.max(0)));
    }
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// A reset header value: seconds-from-now, unix timestamp, HTTP date, or
/// ISO-8601.
pub fn parse_reset_at(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(num) = raw.parse::<f64>() {
        if num > 1_000_000_000.0 {
            return Utc.timestamp_opt(num as i64, 0).single();
        }
        return Some(now + chrono::Duration::seconds(num.max(0.0) as i64));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Error bodies of shape `{"detail":{"code":...}}` (or code at the top
/// level / under `error`) feed the freeze reason.
pub fn extract_error_detail_code(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body.trim()) else {
        return String::new();
    };
    let from = |v: Option<&Value>| -> String {
        v.and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let detail = from(parsed.pointer("/detail/code"));
    if !detail.is_empty() {
        return detail;
    }
    let top = from(parsed.get("code"));
    if !top.is_empty() {
        return top;
    }
    from(parsed.pointer("/error/code"))
}

/// Which quota window a ratelimit header key belongs to.
fn detect_ratelimit_bucket(key: &str) -> Option<&'static str> {
    let k = key.to_ascii_lowercase();
    if ["5h", "5-hour", "5hours", "5hour", "five_hour", "five-hour"]
        .iter()
        .any(|t| k.contains(t))
    {
        return Some("5h");
    }
    if ["week", "weekly", "7d", "7-day", "7day", "7days", "168h"]
        .iter()
        .any(|t| k.contains(t))
    {
        return Some("week");
    }
    None
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RatelimitWindow {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RatelimitWindow {
    pub fn used_percent(&self) -> Option<i64> {
        let limit = self.limit?;
        let remaining = self.remaining?;
        if limit <= 0 {
            return None;
        }
        let remaining = remaining.clamp(0, limit);
        let pct = (((limit - remaining) as f64 / limit as f64) * 100.0).round() as i64;
        Some(pct.clamp(0, 100))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RatelimitSnapshot {
    pub five_hour: RatelimitWindow,
    pub week: RatelimitWindow,
}

/// Scan `*ratelimit*` headers into 5h/weekly windows. Token/tpm limits are
/// not quota windows and are skipped; a bucket-less group counts as 5h.
pub fn extract_ratelimit_snapshot(headers: &HeaderMap, now: DateTime<Utc>) -> RatelimitSnapshot {
    let mut five_hour = RatelimitWindow::default();
    let mut week = RatelimitWindow::default();
    let mut unbucketed = RatelimitWindow::default();

    for (name, value) in headers.iter() {
        let key = name.as_str().to_ascii_lowercase();
        if !key.contains("ratelimit") {
            continue;
        }
        let Ok(raw) = value.to_str() else {
            continue;
        };

        let target = match detect_ratelimit_bucket(&key) {
            Some("5h") => &mut five_hour,
            Some("week") => &mut week,
            _ => &mut unbucketed,
        };

        if key.contains("reset") {
            if let Some(at) = parse_reset_at(raw, now) {
                target.reset_at = Some(at);
            }
            continue;
        }
        if key.contains("token") || key.contains("tpm") {
            continue;
        }
        if key.contains("remaining") {
            if let Ok(v) = raw.trim().parse::<i64>() {
                target.remaining = Some(v);
            }
        } else if key.contains("limit") {
            if let Ok(v) = raw.trim().parse::<i64>() {
                target.limit = Some(v);
            }
        }
    }

    if five_hour.limit.is_none() {
        five_hour.limit = unbucketed.limit;
    }
    if five_hour.remaining.is_none() {
        five_hour.remaining = unbucketed.remaining;
    }
    if five_hour.reset_at.is_none() {
        five_hour.reset_at = unbucketed.reset_at;
    }

    RatelimitSnapshot { five_hour, week }
}

/// Guess which window an opaque rate-limit error text refers to.
pub fn infer_limit_bucket(error_text: &str) -> &'static str {
    let text = error_text.to_ascii_lowercase();
    if ["week", "weekly", "per week", "7 day", "7-day", "7day"]
        .iter()
        .any(|t| text.contains(t))
    {
        return "week";
    }
    "5h"
}

// ---------------------------------------------------------------------------
// Account state writes
// ---------------------------------------------------------------------------

/// Persist a freeze using the week-limit columns. An unknown expiry becomes
/// a ten-year horizon; an existing later reset is never shortened.
pub fn freeze_account(account: &Account, reason: &str, until: Option<DateTime<Utc>>) {
    let now = Utc::now();
    let mut freeze_until = until.unwrap_or_else(|| now + chrono::Duration::days(INDEFINITE_FREEZE_DAYS));
    if let Some(existing) = account.limit_week_reset_at {
        if existing > freeze_until {
            freeze_until = existing;
        }
    }

    crate::logger::warn(
        "upstream",
        &format!(
            "freezing account {}/{} until {} (reason: {reason})",
            account.provider, account.id, freeze_until.to_rfc3339()
        ),
    );

    let result = crate::db::open_conn().and_then(|conn| {
        AccountRepository::new(&conn, account.provider).update_limits(
            account.id,
            account.user_id,
            account.limit_5h_used_percent,
            account.limit_5h_reset_at,
            Some(100),
            Some(freeze_until),
        )
    });
    if let Err(e) = result {
        crate::logger::error("upstream", &format!("failed to persist freeze: {e}"));
    }
}

/// Persist a rate-limit hit into the bucketed limit columns.
pub fn mark_rate_limited(account: &Account, bucket: &str, retry_at: Option<DateTime<Utc>>) {
    let now = Utc::now();
    let retry_at = retry_at.unwrap_or_else(|| {
        now + if bucket == "week" {
            chrono::Duration::days(7)
        } else {
            chrono::Duration::hours(5)
        }
    });

    let (p5, r5, pw, rw) = if bucket == "week" {
        (
            account.limit_5h_used_percent,
            account.limit_5h_reset_at,
            Some(100),
            Some(retry_at),
        )
    } else {
        (
            Some(100),
            Some(retry_at),
            account.limit_week_used_percent,
            account.limit_week_reset_at,
        )
    };

    let result = crate::db::open_conn().and_then(|conn| {
        AccountRepository::new(&conn, account.provider).update_limits(account.id, account.user_id, p5, r5, pw, rw)
    });
    if let Err(e) = result {
        crate::logger::error("upstream", &format!("failed to persist rate limit: {e}"));
    }
}

/// After a 2xx: throttled `last_used_at` write plus any limit fields the
/// response headers disclosed. Sync failures never fail the request.
pub fn sync_account_after_success(account: &Account, headers: &HeaderMap) {
    let now = Utc::now();

    let throttle_key = cache::last_used_throttle_key(account.provider.as_tag(), account.id);
    if cache::shared().set_if_absent(&throttle_key, "1", LAST_USED_THROTTLE) {
        if let Ok(conn) = crate::db::open_conn() {
            let _ = AccountRepository::new(&conn, account.provider).update_last_used(account.id, now);
        }
    }

    let snapshot = extract_ratelimit_snapshot(headers, now);
    let p5 = snapshot.five_hour.used_percent();
    let r5 = snapshot.five_hour.reset_at;
    let pw = snapshot.week.used_percent();
    let rw = snapshot.week.reset_at;
    if p5.is_none() && r5.is_none() && pw.is_none() && rw.is_none() {
        return;
    }

    // A 100% reading without a reset would freeze the account forever on a
    // header glitch; skip those.
    let p5 = p5.filter(|pct| !(*pct >= 100 && r5.is_none() && account.limit_5h_reset_at.is_none()));
    let pw = pw.filter(|pct| !(*pct >= 100 && rw.is_none() && account.limit_week_reset_at.is_none()));

    let result = crate::db::open_conn().and_then(|conn| {
        AccountRepository::new(&conn, account.provider).update_limits(
            account.id,
            account.user_id,
            p5.or(account.limit_5h_used_percent),
            r5.or(account.limit_5h_reset_at),
            pw.or(account.limit_week_used_percent),
            rw.or(account.limit_week_reset_at),
        )
    });
    if let Err(e) = result {
        crate::logger::debug("upstream", &format!("post-success limit sync skipped: {e}"));
    }
}

// ---------------------------------------------------------------------------
// Dispatcher enum
// ---------------------------------------------------------------------------

/// Per-request metadata the dispatchers may forward upstream.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: Option<String>,
}

pub enum Dispatcher {
    Codex(codex::CodexDispatcher),
    GeminiCli(gemini_cli::GeminiCliDispatcher),
    Kiro(kiro::KiroDispatcher),
    Antigravity(antigravity::AntigravityDispatcher),
    Qwen(qwen::QwenDispatcher),
}

impl Dispatcher {
    pub fn for_provider(provider: Provider) -> Option<Dispatcher> {
        match provider {
            Provider::Codex => Some(Dispatcher::Codex(codex::CodexDispatcher)),
            Provider::GeminiCli => Some(Dispatcher::GeminiCli(gemini_cli::GeminiCliDispatcher)),
            Provider::Kiro => Some(Dispatcher::Kiro(kiro::KiroDispatcher)),
            Provider::Antigravity => Some(Dispatcher::Antigravity(antigravity::AntigravityDispatcher)),
            Provider::Qwen => Some(Dispatcher::Qwen(qwen::QwenDispatcher)),
            Provider::ZaiTts | Provider::ZaiImage => None,
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Dispatcher::Codex(_) => Provider::Codex,
            Dispatcher::GeminiCli(_) => Provider::GeminiCli,
            Dispatcher::Kiro(_) => Provider::Kiro,
            Dispatcher::Antigravity(_) => Provider::Antigravity,
            Dispatcher::Qwen(_) => Provider::Qwen,
        }
    }

    /// Send the translated request for one candidate; the response status
    /// is returned unchecked for the engine to classify.
    pub async fn send(
        &self,
        account: &Account,
        project: Option<&str>,
        body: &Value,
        meta: &RequestMeta,
    ) -> GatewayResult<reqwest::Response> {
        match self {
            Dispatcher::Codex(d) => d.send(account, body, meta).await,
            Dispatcher::GeminiCli(d) => d.send(account, project, body, meta).await,
            Dispatcher::Kiro(d) => d.send(account, body, meta).await,
            Dispatcher::Antigravity(d) => d.send(account, body, meta).await,
            Dispatcher::Qwen(d) => d.send(account, body, meta).await,
        }
    }

    /// Refresh the account's tokens and return the updated row.
    pub async fn refresh(&self, account: &Account) -> GatewayResult<Account> {
        match self {
            Dispatcher::Codex(d) => d.refresh(account).await,
            Dispatcher::GeminiCli(d) => d.refresh(account).await,
            Dispatcher::Kiro(d) => d.refresh(account).await,
            Dispatcher::Antigravity(d) => d.refresh(account).await,
            Dispatcher::Qwen(d) => d.refresh(account).await,
        }
    }

    pub async fn list_models(&self, user_id: i64) -> GatewayResult<Vec<String>> {
        match self {
            Dispatcher::Codex(d) => d.list_models(user_id).await,
            Dispatcher::GeminiCli(d) => d.list_models(user_id).await,
            Dispatcher::Kiro(d) => d.list_models(user_id).await,
            Dispatcher::Antigravity(d) => d.list_models(user_id).await,
            Dispatcher::Qwen(d) => d.list_models(user_id).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Failover engine
// ---------------------------------------------------------------------------

pub struct StreamOpen {
    pub response: reqwest::Response,
    pub account: Account,
    pub project: Option<String>,
}

/// Enabled accounts → candidates. When every account sits in a freeze,
/// the error names the earliest recovery time instead of a bare failure.
pub fn candidates_from_enabled(enabled: Vec<Account>) -> GatewayResult<Vec<Candidate>> {
    let (usable, frozen): (Vec<Account>, Vec<Account>) =
        enabled.into_iter().partition(|a| a.effective_status());

    if usable.is_empty() && !frozen.is_empty() {
        let earliest = frozen.iter().filter_map(|a| a.frozen_until()).min();
        return Err(GatewayError::NoAccountAvailable { earliest });
    }
    selector::build_candidates(usable)
}

fn load_candidates(provider: Provider, user_id: i64) -> GatewayResult<Vec<Candidate>> {
    let conn = crate::db::open_conn()?;
    let enabled = AccountRepository::new(&conn, provider).list_enabled_by_user(user_id)?;
    candidates_from_enabled(enabled)
}

/// Refresh when the token expires within the skew window. Concurrent
/// refreshes collapse onto one provider call via the cache lock; losers
/// wait and reload the row the winner wrote.
pub async fn ensure_fresh_token(dispatcher: &Dispatcher, account: &Account) -> GatewayResult<Account> {
    let needs_refresh = match account.token_expires_at {
        Some(expires_at) => expires_at <= Utc::now() + chrono::Duration::seconds(TOKEN_REFRESH_SKEW_SECS),
        None => false,
    };
    if !needs_refresh {
        return Ok(account.clone());
    }
    refresh_deduplicated(dispatcher, account).await
}

pub async fn refresh_deduplicated(dispatcher: &Dispatcher, account: &Account) -> GatewayResult<Account> {
    let tag = account.provider.as_tag();
    if oauth::try_acquire_refresh_lock(tag, account.id) {
        let result = dispatcher.refresh(account).await;
        oauth::release_refresh_lock(tag, account.id);
        return result;
    }

    // Another task holds the lock; give it a moment, then pick up its
    // write-back.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let conn = crate::db::open_conn()?;
    AccountRepository::new(&conn, account.provider)
        .get_by_id_and_user(account.id, account.user_id)?
        .ok_or_else(|| GatewayError::Internal("account disappeared during refresh".to_string()))
}

/// The selection/dispatch loop: pick a credential, send, classify, and
/// either return the open response or move to the next candidate. Errors
/// out with the earliest recovery time once every candidate is burned.
pub async fn open_stream_with_failover(
    dispatcher: &Dispatcher,
    user_id: i64,
    model: &str,
    body: &Value,
    meta: &RequestMeta,
) -> GatewayResult<StreamOpen> {
    let candidates = load_candidates(dispatcher.provider(), user_id)?;
    let mut exclude: HashSet<String> = HashSet::new();
    let mut refresh_attempted: HashSet<i64> = HashSet::new();

    loop {
        let candidate = selector::select_candidate(user_id, model, &candidates, &exclude)?;
        let key = candidate.cooldown_key(model);

        let account = match ensure_fresh_token(dispatcher, &candidate.account).await {
            Ok(account) => account,
            Err(e) => {
                crate::logger::warn(
                    "upstream",
                    &format!("token refresh failed for account {}: {e}", candidate.account.id),
                );
                candidate.account.clone()
            }
        };

        let response = match dispatcher.send(&account, candidate.project.as_deref(), body, meta).await {
            Ok(response) => response,
            Err(e) => {
                crate::logger::warn(
                    "upstream",
                    &format!("request to account {} failed: {e}", account.id),
                );
                exclude.insert(key);
                continue;
            }
        };

        let status = response.status();
        if status.is_success() {
            selector::clear_cooldown(&key);
            sync_account_after_success(&account, response.headers());
            return Ok(StreamOpen {
                response,
                account,
                project: candidate.project.clone(),
            });
        }

        let headers = response.headers().clone();
        let body_text = response.text().await.unwrap_or_default();

        match classify_failure(status.as_u16(), &headers, &body_text) {
            FailureKind::RateLimit { until } => {
                let cooled_until = selector::mark_cooldown(&key, until);
                crate::logger::info(
                    "upstream",
                    &format!(
                        "account {} rate limited on {model}, cooling until {}",
                        account.id,
                        cooled_until.to_rfc3339()
                    ),
                );
                // Persist a freeze only when the response discloses a real
                // quota window reset.
                let snapshot = extract_ratelimit_snapshot(&headers, Utc::now());
                if snapshot.five_hour.reset_at.is_some() || snapshot.week.reset_at.is_some() {
                    let bucket = if snapshot.week.reset_at.is_some() {
                        "week"
                    } else {
                        "5h"
                    };
                    let reset = snapshot.week.reset_at.or(snapshot.five_hour.reset_at);
                    mark_rate_limited(&account, bucket, reset);
                }
                exclude.insert(key);
            }
            FailureKind::Unauthorized => {
                if refresh_attempted.insert(account.id) {
                    match refresh_deduplicated(dispatcher, &account).await {
                        Ok(_) => {
                            crate::logger::info(
                                "upstream",
                                &format!("account {} token refreshed after 401, retrying", account.id),
                            );
                            continue;
                        }
                        Err(e) => {
                            crate::logger::warn(
                                "upstream",
                                &format!("refresh after 401 failed for account {}: {e}", account.id),
                            );
                        }
                    }
                }
                freeze_account(&account, "unauthorized", None);
                exclude.insert(key);
            }
            FailureKind::Freeze { reason, until } => {
                freeze_account(&account, &reason, until);
                exclude.insert(key);
            }
            FailureKind::Transient => {
                crate::logger::warn(
                    "upstream",
                    &format!("transient upstream error {status} on account {}", account.id),
                );
                exclude.insert(key);
            }
            FailureKind::Fatal => {
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    body: body_text,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn classification_follows_the_action_table() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify_failure(429, &empty, ""),
            FailureKind::RateLimit { .. }
        ));
        assert_eq!(classify_failure(401, &empty, ""), FailureKind::Unauthorized);
        assert!(matches!(classify_failure(402, &empty, ""), FailureKind::Freeze { .. }));
        assert!(matches!(classify_failure(403, &empty, ""), FailureKind::Freeze { .. }));
        assert_eq!(classify_failure(408, &empty, ""), FailureKind::Transient);
        assert_eq!(classify_failure(500, &empty, ""), FailureKind::Transient);
        assert_eq!(classify_failure(503, &empty, ""), FailureKind::Transient);
        assert_eq!(classify_failure(400, &empty, ""), FailureKind::Fatal);
        assert_eq!(classify_failure(404, &empty, ""), FailureKind::Fatal);
    }

    #[test]
    fn freeze_reason_carries_detail_code() {
        let empty = HeaderMap::new();
        let kind = classify_failure(403, &empty, r#"{"detail":{"code":"deactivated_workspace"}}"#);
        match kind {
            FailureKind::Freeze { reason, .. } => {
                assert_eq!(reason, "upstream_403:deactivated_workspace")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn retry_after_seconds_and_http_date() {
        let now = Utc::now();
        let h = headers(&[("retry-after", "2")]);
        let at = parse_retry_after(&h, now).unwrap();
        assert_eq!((at - now).num_seconds(), 2);

        let h = headers(&[("retry-after", "Wed, 21 Oct 2026 07:28:00 GMT")]);
        let at = parse_retry_after(&h, now).unwrap();
        assert_eq!(at.timestamp(), 1792567680);
    }

    #[test]
    fn reset_at_accepts_many_shapes() {
        let now = Utc::now();
        assert_eq!(
            (parse_reset_at("30", now).unwrap() - now).num_seconds(),
            30
        );
        let unix = parse_reset_at("1792567680", now).unwrap();
        assert_eq!(unix.timestamp(), 1792567680);
        assert!(parse_reset_at("2026-10-21T07:28:00Z", now).is_some());
        assert!(parse_reset_at("garbage", now).is_none());
    }

    #[test]
    fn snapshot_detects_buckets_and_skips_token_limits() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-5h-limit", "100"),
            ("x-ratelimit-5h-remaining", "25"),
            ("x-ratelimit-weekly-limit", "1000"),
            ("x-ratelimit-weekly-remaining", "999"),
            ("x-ratelimit-limit-tokens", "500000"),
        ]);
        let snap = extract_ratelimit_snapshot(&h, now);
        assert_eq!(snap.five_hour.used_percent(), Some(75));
        assert_eq!(snap.week.used_percent(), Some(0));
    }

    #[test]
    fn unbucketed_headers_default_to_5h() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-limit", "10"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "120"),
        ]);
        let snap = extract_ratelimit_snapshot(&h, now);
        assert_eq!(snap.five_hour.used_percent(), Some(100));
        assert!(snap.five_hour.reset_at.is_some());
    }

    #[test]
    fn limit_bucket_inference() {
        assert_eq!(infer_limit_bucket("you hit your weekly limit"), "week");
        assert_eq!(infer_limit_bucket("7-day quota exceeded"), "week");
        assert_eq!(infer_limit_bucket("5 hour limit reached"), "5h");
        assert_eq!(infer_limit_bucket("rate limited"), "5h");
    }

    #[test]
    fn all_frozen_accounts_surface_earliest_recovery() {
        let reset = Utc::now() + chrono::Duration::seconds(3600);
        let mut account = Account {
            id: 1,
            user_id: 1,
            provider: Provider::GeminiCli,
            provider_external_id: Some("g-1".to_string()),
            account_name: "g".to_string(),
            email: None,
            credentials: "sealed".to_string(),
            status: 1,
            token_expires_at: None,
            last_refresh_at: None,
            last_used_at: None,
            limit_5h_used_percent: Some(100),
            limit_5h_reset_at: Some(reset),
            limit_week_used_percent: None,
            limit_week_reset_at: None,
            project_id: Some("p1".to_string()),
            region: None,
            plan_type: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match candidates_from_enabled(vec![account.clone()]) {
            Err(GatewayError::NoAccountAvailable { earliest: Some(at) }) => assert_eq!(at, reset),
            other => panic!("expected frozen error, got {other:?}"),
        }

        // once the freeze lapses the account is a candidate again
        account.limit_5h_reset_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let candidates = candidates_from_enabled(vec![account]).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn detail_code_fallbacks() {
        assert_eq!(
            extract_error_detail_code(r#"{"detail":{"code":"x"}}"#),
            "x"
        );
        assert_eq!(extract_error_detail_code(r#"{"code":"top"}"#), "top");
        assert_eq!(extract_error_detail_code(r#"{"error":{"code":"e"}}"#), "e");
        assert_eq!(extract_error_detail_code("not json"), "");
    }
}
