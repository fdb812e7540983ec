//! Antigravity dispatcher (default provider pool).
//!
//! The Antigravity upstream is OpenAI-compatible; the account credential is
//! a long-lived upstream key, which is cached decrypted for sixty seconds
//! to keep the crypto work off the per-request path.

use std::time::Duration;

use serde_json::Value;

use crate::accounts::Account;
use crate::auth::credentials::Credentials;
use crate::cache;
use crate::crypto::decrypt_secret;
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

use super::RequestMeta;

pub const DEFAULT_MODELS: &[&str] = &[
    "claude-sonnet-4.5",
    "claude-opus-4.5",
    "gemini-3-pro",
    "gpt-oss-120b-medium",
];

const PLUGIN_KEY_TTL: Duration = Duration::from_secs(60);

fn base_url() -> String {
    std::env::var("ANTIGRAVITY_BASE_URL")
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "http://localhost:8045".to_string())
}

/// The decrypted upstream key, via the short-lived cache.
fn upstream_key(account: &Account) -> GatewayResult<String> {
    let cache_key = cache::plugin_key_key(account.user_id);
    if let Some(key) = cache::shared().get(&cache_key) {
        return Ok(key);
    }

    let plain = decrypt_secret(&account.credentials)?;
    let creds = Credentials::from_json_str(&plain);
    let key = creds
        .access_token
        .or(creds.refresh_token)
        .ok_or_else(|| GatewayError::MissingCredentialField("access_token".to_string()))?;
    cache::shared().set(&cache_key, &key, PLUGIN_KEY_TTL);
    Ok(key)
}

pub struct AntigravityDispatcher;

impl AntigravityDispatcher {
    pub async fn send(
        &self,
        account: &Account,
        body: &Value,
        meta: &RequestMeta,
    ) -> GatewayResult<reqwest::Response> {
        let key = upstream_key(account)?;

        let http = client::streaming_client()?;
        let mut request = http
            .post(format!("{}/v1/chat/completions", base_url()))
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(ua) = meta.user_agent.as_deref().filter(|s| !s.trim().is_empty()) {
            request = request.header("User-Agent", ua);
        }
        request.json(body).send().await.map_err(client::map_reqwest_error)
    }

    /// The upstream key is static; a 401 means the key is dead, so the
    /// engine's freeze path is the correct outcome.
    pub async fn refresh(&self, account: &Account) -> GatewayResult<Account> {
        cache::shared().delete(&cache::plugin_key_key(account.user_id));
        Err(GatewayError::MissingCredentialField("refresh_token".to_string()))
    }

    pub async fn list_models(&self, _user_id: i64) -> GatewayResult<Vec<String>> {
        Ok(DEFAULT_MODELS.iter().map(|s| s.to_string()).collect())
    }
}
