//! ChatGPT/Codex dispatcher.
//!
//! Codex speaks the Responses dialect over SSE only: even non-streaming
//! calls go out with `stream=true` and the final object is pulled from the
//! `response.completed` event. The upstream rejects sampling fields and
//! requires encrypted reasoning content to be requested explicitly.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::accounts::repository::AccountRepository;
use crate::accounts::{default_account_name, Account, Provider};
use crate::auth::credentials::{decode_jwt_claims, extract_openai_profile, Credentials};
use crate::auth::oauth::{self, PkceSession, TokenResponse};
use crate::crypto::{decrypt_secret, encrypt_secret};
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

use super::RequestMeta;

pub const OPENAI_AUTH_URL: &str = "https://auth.openai.com/oauth/authorize";
pub const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const OPENAI_REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
pub const OAUTH_SCOPE: &str = "openid email profile offline_access";

pub const CODEX_DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub const CODEX_DEFAULT_VERSION: &str = "0.21.0";
pub const CODEX_OPENAI_BETA: &str = "responses=experimental";
pub const CODEX_DEFAULT_USER_AGENT: &str =
    "codex_cli_rs/0.50.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";

fn base_url() -> String {
    std::env::var("CODEX_API_BASE_URL")
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| CODEX_DEFAULT_BASE_URL.to_string())
}

fn responses_url() -> String {
    format!("{}/responses", base_url())
}

/// Resolve client aliases onto real Codex model names.
pub fn resolve_model_name(model: &str) -> String {
    let raw = model.trim();
    match raw.to_ascii_lowercase().as_str() {
        "codex-latest" => "gpt-5-codex".to_string(),
        "codex-mini" => "gpt-5-codex-mini".to_string(),
        _ => raw.to_string(),
    }
}

/// Minimal cleanup so the Codex upstream accepts the Responses body. The
/// upstream returns 400 on the sampling/limit fields, insists on SSE, and
/// wants a string `input` lifted into a message item.
pub fn normalize_responses_request(request: &Value) -> Value {
    let mut body = request.as_object().cloned().unwrap_or_default();

    body.insert("stream".to_string(), json!(true));
    body.insert("store".to_string(), json!(false));
    body.insert("parallel_tool_calls".to_string(), json!(true));
    body.insert("include".to_string(), json!(["reasoning.encrypted_content"]));

    for rejected in [
        "max_output_tokens",
        "max_completion_tokens",
        "temperature",
        "top_p",
        "service_tier",
        "previous_response_id",
        "prompt_cache_retention",
        "safety_identifier",
    ] {
        body.remove(rejected);
    }

    if let Some(Value::String(input)) = body.get("input").cloned() {
        body.insert(
            "input".to_string(),
            json!([{
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": input}]
            }]),
        );
    }

    if let Some(model) = body.get("model").and_then(|m| m.as_str()) {
        let resolved = resolve_model_name(model);
        body.insert("model".to_string(), json!(resolved));
    }

    if !body.contains_key("instructions") {
        body.insert("instructions".to_string(), json!(""));
    }

    Value::Object(body)
}

fn build_headers(access_token: &str, chatgpt_account_id: &str, user_agent: Option<&str>) -> Vec<(String, String)> {
    let ua = user_agent
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(CODEX_DEFAULT_USER_AGENT);
    let session_id = Uuid::new_v4().to_string();

    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Authorization".to_string(), format!("Bearer {access_token}")),
        ("Accept".to_string(), "text/event-stream".to_string()),
        ("Connection".to_string(), "Keep-Alive".to_string()),
        ("Version".to_string(), CODEX_DEFAULT_VERSION.to_string()),
        ("Openai-Beta".to_string(), CODEX_OPENAI_BETA.to_string()),
        ("Session_id".to_string(), session_id.clone()),
        ("Conversation_id".to_string(), session_id),
        ("User-Agent".to_string(), ua.to_string()),
        ("Originator".to_string(), "codex_cli_rs".to_string()),
    ];
    if !chatgpt_account_id.is_empty() {
        headers.push(("Chatgpt-Account-Id".to_string(), chatgpt_account_id.to_string()));
    }
    headers
}

fn load_credentials(account: &Account) -> GatewayResult<Credentials> {
    let plain = decrypt_secret(&account.credentials)?;
    Ok(Credentials::from_json_str(&plain))
}

/// The account id the upstream wants in `Chatgpt-Account-Id`: the stored
/// column first, then the credential blob, then the token claims.
fn resolve_chatgpt_account_id(account: &Account, creds: &Credentials) -> String {
    if let Some(id) = account.provider_external_id.as_deref().filter(|s| !s.trim().is_empty()) {
        return id.trim().to_string();
    }
    if let Some(id) = creds.account_id.as_deref().filter(|s| !s.trim().is_empty()) {
        return id.trim().to_string();
    }
    for token in [creds.id_token.as_deref(), creds.access_token.as_deref()] {
        let Some(token) = token else { continue };
        let profile = extract_openai_profile(&decode_jwt_claims(token));
        if let Some(id) = profile.account_id {
            return id;
        }
    }
    String::new()
}

pub struct CodexDispatcher;

impl CodexDispatcher {
    pub async fn send(
        &self,
        account: &Account,
        body: &Value,
        meta: &RequestMeta,
    ) -> GatewayResult<reqwest::Response> {
        let creds = load_credentials(account)?;
        let access_token = creds
            .access_token
            .as_deref()
            .ok_or_else(|| GatewayError::MissingCredentialField("access_token".to_string()))?;
        let chatgpt_account_id = resolve_chatgpt_account_id(account, &creds);
        if chatgpt_account_id.is_empty() {
            return Err(GatewayError::MissingCredentialField("account_id".to_string()));
        }

        let http = client::streaming_client()?;
        let mut request = http.post(responses_url()).json(body);
        for (name, value) in build_headers(access_token, &chatgpt_account_id, meta.user_agent.as_deref()) {
            request = request.header(name, value);
        }
        request.send().await.map_err(client::map_reqwest_error)
    }

    pub async fn refresh(&self, account: &Account) -> GatewayResult<Account> {
        let creds = load_credentials(account)?;
        let refresh_token = creds
            .refresh_token
            .as_deref()
            .ok_or_else(|| GatewayError::MissingCredentialField("refresh_token".to_string()))?;

        let tokens = oauth::refresh_token_grant(
            OPENAI_TOKEN_URL,
            OPENAI_CLIENT_ID,
            refresh_token,
            Some("openid profile email"),
        )
        .await?;

        apply_token_response(account, &creds, &tokens)
    }

    pub async fn list_models(&self, _user_id: i64) -> GatewayResult<Vec<String>> {
        Ok(crate::config::load().codex_supported_models.clone())
    }
}

/// Write a refresh/exchange result back into the account row: new blob,
/// profile fields, and both refresh timestamps in one statement.
pub fn apply_token_response(
    account: &Account,
    old_creds: &Credentials,
    tokens: &TokenResponse,
) -> GatewayResult<Account> {
    let now = Utc::now();
    let expires_at = tokens.expires_at(now);

    let id_token = tokens.id_token.clone().or_else(|| old_creds.id_token.clone());
    let profile = id_token
        .as_deref()
        .map(|t| extract_openai_profile(&decode_jwt_claims(t)))
        .unwrap_or_default();

    let stored = Credentials {
        credential_type: Some("codex".to_string()),
        refresh_token: tokens
            .refresh_token
            .clone()
            .or_else(|| old_creds.refresh_token.clone()),
        access_token: tokens.access_token.clone(),
        id_token,
        account_id: profile
            .account_id
            .clone()
            .or_else(|| old_creds.account_id.clone()),
        email: profile.email.clone().or_else(|| old_creds.email.clone()),
        expires_at: expires_at.map(|d| d.to_rfc3339()),
        ..Default::default()
    };
    let encrypted = encrypt_secret(&stored.to_storage_json())?;

    let conn = crate::db::open_conn()?;
    let repo = AccountRepository::new(&conn, Provider::Codex);
    repo.update_credentials_and_profile(
        account.id,
        account.user_id,
        &encrypted,
        profile.email.as_deref(),
        profile.account_id.as_deref(),
        profile.plan_type.as_deref(),
        expires_at,
        now,
    )?;
    repo.get_by_id_and_user(account.id, account.user_id)?
        .ok_or_else(|| GatewayError::Internal("account vanished during refresh".to_string()))
}

// ---------------------------------------------------------------------------
// OAuth entry points
// ---------------------------------------------------------------------------

pub struct AuthorizeUrl {
    pub auth_url: String,
    pub state: String,
    pub expires_in: u64,
}

/// Build the PKCE authorize URL and persist the session keyed by state.
pub fn create_authorize_url(user_id: i64) -> AuthorizeUrl {
    let state = oauth::generate_state();
    let codes = oauth::generate_pkce_codes();

    let mut url = url::Url::parse(OPENAI_AUTH_URL).expect("static URL parses");
    url.query_pairs_mut()
        .append_pair("client_id", OPENAI_CLIENT_ID)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", OPENAI_REDIRECT_URI)
        .append_pair("scope", OAUTH_SCOPE)
        .append_pair("state", &state)
        .append_pair("code_challenge", &codes.code_challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("prompt", "login")
        .append_pair("id_token_add_organizations", "true")
        .append_pair("codex_cli_simplified_flow", "true");

    oauth::store_pkce_session(
        &state,
        &PkceSession {
            user_id,
            code_verifier: codes.code_verifier,
            created_at: Utc::now(),
        },
    );

    AuthorizeUrl {
        auth_url: url.to_string(),
        state,
        expires_in: oauth::PKCE_SESSION_TTL.as_secs(),
    }
}

/// Complete the PKCE flow: parse the pasted callback, verify the state
/// belongs to the user, exchange the code, and upsert the account keyed by
/// (user, provider account id) or (user, email).
pub async fn submit_oauth_callback(user_id: i64, callback_url: &str) -> GatewayResult<Account> {
    let parsed = oauth::parse_oauth_callback(callback_url)?;
    if let Some(err) = parsed.error {
        return Err(GatewayError::InvalidRequest(format!("OAuth login failed: {err}")));
    }

    let session = oauth::take_pkce_session(&parsed.state)
        .ok_or_else(|| GatewayError::InvalidRequest("state unknown or expired, restart the login flow".to_string()))?;
    if session.user_id != user_id {
        return Err(GatewayError::Forbidden("state belongs to a different user".to_string()));
    }

    let tokens = oauth::exchange_code(
        OPENAI_TOKEN_URL,
        OPENAI_CLIENT_ID,
        OPENAI_REDIRECT_URI,
        &parsed.code,
        &session.code_verifier,
    )
    .await?;

    let conn = crate::db::open_conn()?;
    upsert_account_from_tokens(&conn, user_id, &tokens)
}

/// Shared by the OAuth callback and credential import: exactly one account
/// per (user, provider account id) survives.
pub fn upsert_account_from_tokens(
    conn: &Connection,
    user_id: i64,
    tokens: &TokenResponse,
) -> GatewayResult<Account> {
    let now = Utc::now();
    let expires_at = tokens.expires_at(now);

    let id_token = tokens.id_token.clone().unwrap_or_default();
    let profile = extract_openai_profile(&decode_jwt_claims(&id_token));

    let stored = Credentials {
        credential_type: Some("codex".to_string()),
        refresh_token: tokens.refresh_token.clone(),
        access_token: tokens.access_token.clone(),
        id_token: Some(id_token).filter(|t| !t.is_empty()),
        account_id: profile.account_id.clone(),
        email: profile.email.clone(),
        expires_at: expires_at.map(|d| d.to_rfc3339()),
        ..Default::default()
    };
    let encrypted = encrypt_secret(&stored.to_storage_json())?;

    let account_name = default_account_name(profile.email.as_deref(), profile.account_id.as_deref());

    let repo = AccountRepository::new(conn, Provider::Codex);

    let existing = match (&profile.account_id, &profile.email) {
        (Some(account_id), _) => repo.get_by_user_and_external_id(user_id, account_id)?,
        (None, Some(email)) => repo.get_by_user_and_email(user_id, email)?,
        (None, None) => None,
    };

    match existing {
        Some(account) => {
            repo.update_credentials_and_profile(
                account.id,
                user_id,
                &encrypted,
                profile.email.as_deref(),
                profile.account_id.as_deref(),
                profile.plan_type.as_deref(),
                expires_at,
                now,
            )?;
            repo.get_by_id_and_user(account.id, user_id)?
                .ok_or_else(|| GatewayError::Internal("account vanished during upsert".to_string()))
        }
        None => repo
            .create(
                user_id,
                profile.account_id.as_deref(),
                &account_name,
                profile.email.as_deref(),
                &encrypted,
                expires_at,
                None,
                None,
                profile.plan_type.as_deref(),
            )
            .map_err(Into::into),
    }
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub base_url: String,
    pub api_key: String,
}

/// Normalize a user-pasted fallback base URL: no trailing slash, and a
/// trailing `/responses` is stripped so it is not appended twice.
pub fn normalize_fallback_base_url(raw: &str) -> GatewayResult<String> {
    let mut base = raw.trim().trim_end_matches('/').to_string();
    if base.to_ascii_lowercase().ends_with("/responses") {
        base.truncate(base.len() - "/responses".len());
        base = base.trim_end_matches('/').to_string();
    }
    let parsed = url::Url::parse(&base)
        .map_err(|_| GatewayError::InvalidRequest("base_url must be a full http(s) URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host().is_none() {
        return Err(GatewayError::InvalidRequest("base_url must be a full http(s) URL".to_string()));
    }
    Ok(base)
}

pub fn load_fallback_config(user_id: i64) -> GatewayResult<Option<FallbackConfig>> {
    let conn = crate::db::open_conn()?;
    let mut stmt = conn.prepare_cached(
        "select base_url, api_key from codex_fallback_configs where user_id = ?1 and is_active = 1",
    )?;
    let row = stmt
        .query_row(rusqlite::params![user_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .optional()?;

    let Some((base_url, sealed_key)) = row else {
        return Ok(None);
    };
    let api_key = decrypt_secret(&sealed_key)?;
    if api_key.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(FallbackConfig { base_url, api_key }))
}

pub fn save_fallback_config(user_id: i64, base_url: &str, api_key: &str) -> GatewayResult<()> {
    let base_url = normalize_fallback_base_url(base_url)?;
    let sealed = encrypt_secret(api_key.trim())?;
    let conn = crate::db::open_conn()?;
    conn.execute(
        "insert into codex_fallback_configs (user_id, base_url, api_key, is_active, updated_at)
         values (?1, ?2, ?3, 1, ?4)
         on conflict(user_id) do update set base_url = excluded.base_url,
             api_key = excluded.api_key, is_active = 1, updated_at = excluded.updated_at",
        rusqlite::params![user_id, base_url, sealed, Utc::now().timestamp()],
    )?;
    Ok(())
}

/// When every Codex account is exhausted, transparently re-issue to the
/// user's configured fallback. Fallback failures surface as ordinary
/// upstream errors with no further retry.
pub async fn open_fallback_stream(
    user_id: i64,
    body: &Value,
    meta: &RequestMeta,
) -> GatewayResult<Option<reqwest::Response>> {
    let Some(config) = load_fallback_config(user_id)? else {
        return Ok(None);
    };

    let url = format!("{}/responses", config.base_url);
    let normalized = normalize_responses_request(body);
    let ua = meta
        .user_agent
        .as_deref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(CODEX_DEFAULT_USER_AGENT);

    crate::logger::warn(
        "codex",
        &format!("all codex accounts unavailable for user {user_id}, using fallback {}", config.base_url),
    );

    let http = client::streaming_client()?;
    let response = http
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("Accept", "text/event-stream")
        .header("Connection", "Keep-Alive")
        .header("Openai-Beta", CODEX_OPENAI_BETA)
        .header("User-Agent", ua)
        .json(&normalized)
        .send()
        .await
        .map_err(client::map_reqwest_error)?;

    let status = response.status();
    if status.is_success() {
        return Ok(Some(response));
    }
    let body_text = response.text().await.unwrap_or_default();
    Err(GatewayError::Upstream {
        status: status.as_u16(),
        body: body_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_pins_stream_fields_and_strips_rejected() {
        let body = json!({
            "model": "codex-latest",
            "input": "ping",
            "max_output_tokens": 100,
            "temperature": 0.5,
            "top_p": 0.9,
            "previous_response_id": "resp_x"
        });
        let out = normalize_responses_request(&body);
        assert_eq!(out["stream"], true);
        assert_eq!(out["store"], false);
        assert_eq!(out["parallel_tool_calls"], true);
        assert_eq!(out["include"][0], "reasoning.encrypted_content");
        assert_eq!(out["model"], "gpt-5-codex");
        assert_eq!(out["instructions"], "");
        assert!(out.get("max_output_tokens").is_none());
        assert!(out.get("temperature").is_none());
        assert!(out.get("top_p").is_none());
        assert!(out.get("previous_response_id").is_none());

        // string input lifted into a message item
        assert_eq!(out["input"][0]["type"], "message");
        assert_eq!(out["input"][0]["content"][0]["text"], "ping");
    }

    #[test]
    fn existing_instructions_survive() {
        let out = normalize_responses_request(&json!({"model": "gpt-5-codex", "instructions": "keep"}));
        assert_eq!(out["instructions"], "keep");
    }

    #[test]
    fn model_alias_resolution() {
        assert_eq!(resolve_model_name("codex-latest"), "gpt-5-codex");
        assert_eq!(resolve_model_name("codex-mini"), "gpt-5-codex-mini");
        assert_eq!(resolve_model_name("gpt-5.1-codex"), "gpt-5.1-codex");
    }

    #[test]
    fn headers_include_session_and_account() {
        let headers = build_headers("tok", "acct-1", None);
        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };
        assert_eq!(find("Authorization"), "Bearer tok");
        assert_eq!(find("Openai-Beta"), CODEX_OPENAI_BETA);
        assert_eq!(find("Chatgpt-Account-Id"), "acct-1");
        assert_eq!(find("Session_id"), find("Conversation_id"));
        assert_eq!(find("User-Agent"), CODEX_DEFAULT_USER_AGENT);
    }

    #[test]
    fn authorize_url_carries_pkce_params() {
        let out = create_authorize_url(42);
        assert!(out.auth_url.starts_with(OPENAI_AUTH_URL));
        assert!(out.auth_url.contains("code_challenge_method=S256"));
        assert!(out.auth_url.contains(&format!("state={}", out.state)));
        assert_eq!(out.state.len(), 32);

        // session round-trips through the cache exactly once
        let session = oauth::take_pkce_session(&out.state).unwrap();
        assert_eq!(session.user_id, 42);
        assert!(oauth::take_pkce_session(&out.state).is_none());
    }

    #[test]
    fn oauth_upsert_dedupes_on_provider_account_id() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let conn = crate::db::test_support::open_memory_db();
        let claims = json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct-X"}
        });
        let id_token = format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes())
        );

        let first = TokenResponse {
            access_token: Some("at-1".to_string()),
            refresh_token: Some("rt-1".to_string()),
            id_token: Some(id_token.clone()),
            expires_in: Some(3600),
        };
        let created = upsert_account_from_tokens(&conn, 1, &first).unwrap();

        // A second callback with a fresh code but the same account id must
        // update in place, not create a duplicate.
        let second = TokenResponse {
            access_token: Some("at-2".to_string()),
            refresh_token: Some("rt-2".to_string()),
            id_token: Some(id_token),
            expires_in: Some(3600),
        };
        let updated = upsert_account_from_tokens(&conn, 1, &second).unwrap();
        assert_eq!(updated.id, created.id);

        let repo = AccountRepository::new(&conn, Provider::Codex);
        let all = repo.list_by_user(1).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].last_refresh_at.is_some());
        let plain = decrypt_secret(&all[0].credentials).unwrap();
        assert!(plain.contains("at-2"));
    }

    #[test]
    fn fallback_base_url_normalization() {
        assert_eq!(
            normalize_fallback_base_url("https://api.example.com/v1/responses/").unwrap(),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_fallback_base_url("https://api.example.com/v1").unwrap(),
            "https://api.example.com/v1"
        );
        assert!(normalize_fallback_base_url("not-a-url").is_err());
        assert!(normalize_fallback_base_url("ftp://x.y").is_err());
    }
}
