//! OAuth credential lifecycle: PKCE, callback parsing, token refresh, and
//! the device-code flow.
//!
//! Sessions live in the cache under short TTLs; the device-code endpoints
//! never return provider tokens to the caller.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::cache;
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

pub const PKCE_SESSION_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEVICE_SESSION_TTL: Duration = Duration::from_secs(15 * 60);
const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// 96 random bytes give a ~128-char base64url verifier; the challenge is the
/// S256 digest of the verifier.
pub fn generate_pkce_codes() -> PkceCodes {
    let mut raw = [0u8; 96];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let code_verifier = URL_SAFE_NO_PAD.encode(raw);
    let digest = Sha256::digest(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(digest);
    PkceCodes {
        code_verifier,
        code_challenge,
    }
}

/// 32 hex chars of state.
pub fn generate_state() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceSession {
    pub user_id: i64,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

pub fn store_pkce_session(state: &str, session: &PkceSession) {
    cache::shared().set_json(&cache::pkce_state_key(state), session, PKCE_SESSION_TTL);
}

/// One-shot load: the session is deleted on read so a replayed callback
/// cannot reuse it.
pub fn take_pkce_session(state: &str) -> Option<PkceSession> {
    cache::shared().take_json(&cache::pkce_state_key(state))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
    pub error: Option<String>,
}

fn query_pairs(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parse an OAuth callback in any of the shapes users paste:
/// a full URL, a leading `?query`, bare `k=v&k=v`, or a `#fragment`.
pub fn parse_oauth_callback(input: &str) -> GatewayResult<CallbackParams> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::InvalidRequest("callback_url must not be empty".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix('?') {
        format!("http://localhost/?{rest}")
    } else if let Some(rest) = trimmed.strip_prefix('#') {
        format!("http://localhost/#{rest}")
    } else if trimmed.contains('/') || trimmed.contains('?') || trimmed.contains('#') || trimmed.contains(':') {
        format!("http://{trimmed}")
    } else if trimmed.contains('=') {
        format!("http://localhost/?{trimmed}")
    } else {
        return Err(GatewayError::InvalidRequest(
            "callback_url is neither a URL nor a query string".to_string(),
        ));
    };

    let parsed = Url::parse(&candidate)
        .map_err(|e| GatewayError::InvalidRequest(format!("callback_url is not parseable: {e}")))?;

    let mut params = query_pairs(parsed.query().unwrap_or(""));
    if let Some(fragment) = parsed.fragment() {
        for (k, v) in query_pairs(fragment) {
            params.entry(k).or_insert(v);
        }
    }

    let mut code = params.get("code").map(|s| s.trim().to_string()).unwrap_or_default();
    let mut state = params.get("state").map(|s| s.trim().to_string()).unwrap_or_default();
    let error = params
        .get("error")
        .or_else(|| params.get("error_description"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    // Some clients paste `code#state` fused into the code parameter.
    if state.is_empty() {
        if let Some((left, right)) = code.clone().split_once('#') {
            code = left.trim().to_string();
            state = right.trim().to_string();
        }
    }

    if code.is_empty() && error.is_none() {
        return Err(GatewayError::InvalidRequest("callback_url is missing code".to_string()));
    }
    if state.is_empty() {
        return Err(GatewayError::InvalidRequest("callback_url is missing state".to_string()));
    }

    Ok(CallbackParams { code, state, error })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| now + chrono::Duration::seconds(secs.max(0)))
    }
}

/// Exchange an authorization code for tokens at a provider token endpoint.
pub async fn exchange_code(
    token_url: &str,
    client_id: &str,
    redirect_uri: &str,
    code: &str,
    code_verifier: &str,
) -> GatewayResult<TokenResponse> {
    let form = [
        ("grant_type", "authorization_code"),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("code", code),
        ("code_verifier", code_verifier),
    ];
    post_token_form(token_url, &form).await
}

/// refresh_token grant. Returns the provider's raw token response; callers
/// keep the old refresh_token when no rotation happened.
pub async fn refresh_token_grant(
    token_url: &str,
    client_id: &str,
    refresh_token: &str,
    scope: Option<&str>,
) -> GatewayResult<TokenResponse> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", refresh_token),
    ];
    if let Some(scope) = scope {
        form.push(("scope", scope));
    }
    post_token_form(token_url, &form).await
}

async fn post_token_form(token_url: &str, form: &[(&str, &str)]) -> GatewayResult<TokenResponse> {
    let http = client::token_client()?;
    let resp = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(client::map_reqwest_error)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    resp.json::<TokenResponse>()
        .await
        .map_err(|e| GatewayError::Network(format!("token endpoint returned malformed JSON: {e}")))
}

/// Concurrent refreshes for the same account must collapse into one
/// provider call. First caller wins the cache lock; everyone else reloads
/// the row the winner writes back.
pub fn try_acquire_refresh_lock(provider: &str, account_id: i64) -> bool {
    cache::shared().set_if_absent(&cache::refresh_lock_key(provider, account_id), "1", REFRESH_LOCK_TTL)
}

pub fn release_refresh_lock(provider: &str, account_id: i64) {
    cache::shared().delete(&cache::refresh_lock_key(provider, account_id));
}

// ---------------------------------------------------------------------------
// Device-code flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeSession {
    pub user_id: i64,
    pub client_id: String,
    /// Scrubbed once the flow completes.
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub device_code: Option<String>,
    pub token_url: String,
    /// AWS SSO OIDC takes a camelCase JSON body instead of the RFC 8628
    /// form encoding.
    #[serde(default)]
    pub aws_json: bool,
    #[serde(default)]
    pub region: Option<String>,
    pub interval_secs: i64,
    pub next_poll_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub fn store_device_session(state: &str, session: &DeviceCodeSession) {
    cache::shared().set_json(&cache::device_code_key(state), session, DEVICE_SESSION_TTL);
}

pub fn load_device_session(state: &str) -> Option<DeviceCodeSession> {
    cache::shared().get_json(&cache::device_code_key(state))
}

pub fn delete_device_session(state: &str) {
    cache::shared().delete(&cache::device_code_key(state));
}

#[derive(Debug)]
pub enum DevicePollOutcome {
    Pending { retry_after_ms: i64 },
    SlowDown { retry_after_ms: i64 },
    Success(TokenResponse),
    Expired,
}

/// One poll step of the device-code flow. The session is re-persisted with
/// an advanced `next_poll_at`; on `slow_down` the interval grows by 5s.
pub async fn poll_device_session(state: &str) -> GatewayResult<DevicePollOutcome> {
    let Some(mut session) = load_device_session(state) else {
        return Ok(DevicePollOutcome::Expired);
    };

    let now = Utc::now();
    if now < session.next_poll_at {
        let retry_after_ms = (session.next_poll_at - now).num_milliseconds().max(0);
        return Ok(DevicePollOutcome::Pending { retry_after_ms });
    }

    let Some(device_code) = session.device_code.clone() else {
        return Ok(DevicePollOutcome::Expired);
    };

    let http = client::token_client()?;
    let request = if session.aws_json {
        http.post(&session.token_url)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "clientId": session.client_id,
                "clientSecret": session.client_secret,
                "deviceCode": device_code,
                "grantType": "urn:ietf:params:oauth:grant-type:device_code",
            }))
    } else {
        let mut form = vec![
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("client_id", session.client_id.as_str()),
            ("device_code", device_code.as_str()),
        ];
        if let Some(secret) = session.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        http.post(&session.token_url)
            .header("Accept", "application/json")
            .form(&form)
    };
    let resp = request.send().await.map_err(client::map_reqwest_error)?;

    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);

    if status.is_success() {
        // AWS answers in camelCase; normalize before decoding.
        let normalized = if session.aws_json {
            serde_json::json!({
                "access_token": body.get("accessToken").cloned().unwrap_or(Value::Null),
                "refresh_token": body.get("refreshToken").cloned().unwrap_or(Value::Null),
                "id_token": body.get("idToken").cloned().unwrap_or(Value::Null),
                "expires_in": body.get("expiresIn").cloned().unwrap_or(Value::Null),
            })
        } else {
            body
        };
        let tokens: TokenResponse = serde_json::from_value(normalized)
            .map_err(|e| GatewayError::Network(format!("device token response malformed: {e}")))?;
        // Scrub secrets before the session entry outlives the flow.
        session.client_secret = None;
        session.device_code = None;
        store_device_session(state, &session);
        return Ok(DevicePollOutcome::Success(tokens));
    }

    // RFC 8628 puts the code in `error`; AWS also surfaces it as an
    // exception `__type` like AuthorizationPendingException.
    let error_code = body
        .get("error")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            body.get("__type").and_then(|v| v.as_str()).map(|t| {
                if t.contains("AuthorizationPending") {
                    "authorization_pending".to_string()
                } else if t.contains("SlowDown") {
                    "slow_down".to_string()
                } else if t.contains("ExpiredToken") {
                    "expired_token".to_string()
                } else {
                    t.to_string()
                }
            })
        })
        .unwrap_or_default();

    match error_code.as_str() {
        "authorization_pending" => {
            session.next_poll_at = now + chrono::Duration::seconds(session.interval_secs.max(1));
            store_device_session(state, &session);
            Ok(DevicePollOutcome::Pending {
                retry_after_ms: session.interval_secs.max(1) * 1000,
            })
        }
        "slow_down" => {
            session.interval_secs += 5;
            session.next_poll_at = now + chrono::Duration::seconds(session.interval_secs);
            store_device_session(state, &session);
            Ok(DevicePollOutcome::SlowDown {
                retry_after_ms: session.interval_secs * 1000,
            })
        }
        "expired_token" | "access_denied" => {
            delete_device_session(state);
            Ok(DevicePollOutcome::Expired)
        }
        _ => Err(GatewayError::Upstream {
            status: status.as_u16(),
            body: body.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_verifier_and_challenge_shapes() {
        let codes = generate_pkce_codes();
        assert_eq!(codes.code_verifier.len(), 128);
        // S256 digest is 32 bytes -> 43 chars base64url without padding
        assert_eq!(codes.code_challenge.len(), 43);
        assert!(!codes.code_challenge.contains('='));

        let other = generate_pkce_codes();
        assert_ne!(codes.code_verifier, other.code_verifier);
    }

    #[test]
    fn state_is_32_hex_chars() {
        let state = generate_state();
        assert_eq!(state.len(), 32);
        assert!(state.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn callback_full_url() {
        let parsed =
            parse_oauth_callback("http://localhost:1455/auth/callback?code=abc&state=xyz").unwrap();
        assert_eq!(parsed.code, "abc");
        assert_eq!(parsed.state, "xyz");
    }

    #[test]
    fn callback_query_only() {
        let parsed = parse_oauth_callback("?code=abc&state=xyz").unwrap();
        assert_eq!(parsed.code, "abc");
        assert_eq!(parsed.state, "xyz");
    }

    #[test]
    fn callback_bare_pairs() {
        let parsed = parse_oauth_callback("code=abc&state=xyz").unwrap();
        assert_eq!(parsed.code, "abc");
        assert_eq!(parsed.state, "xyz");
    }

    #[test]
    fn callback_fragment() {
        let parsed = parse_oauth_callback("#code=abc&state=xyz").unwrap();
        assert_eq!(parsed.code, "abc");
        assert_eq!(parsed.state, "xyz");
    }

    #[test]
    fn callback_fused_code_hash_state() {
        let parsed = parse_oauth_callback("?code=abc%23xyz").unwrap();
        assert_eq!(parsed.code, "abc");
        assert_eq!(parsed.state, "xyz");
    }

    #[test]
    fn callback_missing_state_is_an_error() {
        assert!(parse_oauth_callback("?code=abc").is_err());
        assert!(parse_oauth_callback("").is_err());
        assert!(parse_oauth_callback("justtext").is_err());
    }

    #[test]
    fn refresh_lock_single_winner() {
        assert!(try_acquire_refresh_lock("codex", 991));
        assert!(!try_acquire_refresh_lock("codex", 991));
        release_refresh_lock("codex", 991);
        assert!(try_acquire_refresh_lock("codex", 991));
        release_refresh_lock("codex", 991);
    }

    #[test]
    fn pkce_session_is_one_shot() {
        let state = generate_state();
        store_pkce_session(
            &state,
            &PkceSession {
                user_id: 5,
                code_verifier: "v".to_string(),
                created_at: Utc::now(),
            },
        );
        assert!(take_pkce_session(&state).is_some());
        assert!(take_pkce_session(&state).is_none());
    }
}
