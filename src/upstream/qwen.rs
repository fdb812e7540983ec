//! Qwen dispatcher.
//!
//! Qwen accounts come in through the device-code flow; the chat surface is
//! OpenAI-compatible at the portal endpoint the token response names (the
//! `resource_url` field), falling back to the public portal.

use chrono::Utc;
use serde_json::{json, Value};

use crate::accounts::repository::AccountRepository;
use crate::accounts::{Account, Provider};
use crate::auth::credentials::Credentials;
use crate::auth::oauth::{self, DeviceCodeSession};
use crate::crypto::{decrypt_secret, encrypt_secret};
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

use super::RequestMeta;

pub const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
pub const QWEN_DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
pub const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
pub const QWEN_DEFAULT_API_BASE: &str = "https://portal.qwen.ai/v1";
pub const QWEN_SCOPE: &str = "openid profile email model.completion";

pub const QWEN_MODELS: &[&str] = &["qwen3-coder-plus", "qwen3-coder-flash", "qwen3-max"];

fn load_credentials(account: &Account) -> GatewayResult<Credentials> {
    let plain = decrypt_secret(&account.credentials)?;
    Ok(Credentials::from_json_str(&plain))
}

/// The API base for this account. The device flow stores the granted
/// `resource_url` in the region slot.
fn api_base(creds: &Credentials) -> String {
    let raw = creds
        .region
        .as_deref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(QWEN_DEFAULT_API_BASE);
    let base = raw.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("https://{base}")
    }
}

pub struct QwenDispatcher;

impl QwenDispatcher {
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

        let http = client::streaming_client()?;
        let mut request = http
            .post(format!("{}/chat/completions", api_base(&creds)))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(ua) = meta.user_agent.as_deref().filter(|s| !s.trim().is_empty()) {
            request = request.header("User-Agent", ua);
        }
        request.json(body).send().await.map_err(client::map_reqwest_error)
    }

    pub async fn refresh(&self, account: &Account) -> GatewayResult<Account> {
        let creds = load_credentials(account)?;
        let refresh_token = creds
            .refresh_token
            .clone()
            .ok_or_else(|| GatewayError::MissingCredentialField("refresh_token".to_string()))?;

        let tokens = oauth::refresh_token_grant(QWEN_TOKEN_URL, QWEN_CLIENT_ID, &refresh_token, None).await?;

        let now = Utc::now();
        let expires_at = tokens.expires_at(now);
        let stored = Credentials {
            credential_type: Some("qwen".to_string()),
            refresh_token: tokens.refresh_token.clone().or(Some(refresh_token)),
            access_token: tokens.access_token.clone(),
            region: creds.region.clone(),
            account_id: creds.account_id.clone(),
            email: creds.email.clone(),
            expires_at: expires_at.map(|d| d.to_rfc3339()),
            ..Default::default()
        };
        let encrypted = encrypt_secret(&stored.to_storage_json())?;

        let conn = crate::db::open_conn()?;
        let repo = AccountRepository::new(&conn, Provider::Qwen);
        repo.update_credentials_and_profile(
            account.id,
            account.user_id,
            &encrypted,
            creds.email.as_deref(),
            None,
            None,
            expires_at,
            now,
        )?;
        repo.get_by_id_and_user(account.id, account.user_id)?
            .ok_or_else(|| GatewayError::Internal("account vanished during refresh".to_string()))
    }

    pub async fn list_models(&self, _user_id: i64) -> GatewayResult<Vec<String>> {
        Ok(QWEN_MODELS.iter().map(|s| s.to_string()).collect())
    }
}

// ---------------------------------------------------------------------------
// Device-code flow entry points
// ---------------------------------------------------------------------------

pub struct DeviceFlowStart {
    pub state: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub interval_secs: i64,
    pub expires_in: i64,
}

/// Begin the device-code flow: request a device authorization and park the
/// session in the cache. The caller polls `poll_device_flow` with the
/// returned state; tokens never leave the server.
pub async fn start_device_flow(user_id: i64) -> GatewayResult<DeviceFlowStart> {
    let codes = oauth::generate_pkce_codes();
    let http = client::token_client()?;
    let resp = http
        .post(QWEN_DEVICE_CODE_URL)
        .header("Accept", "application/json")
        .form(&[
            ("client_id", QWEN_CLIENT_ID),
            ("scope", QWEN_SCOPE),
            ("code_challenge", codes.code_challenge.as_str()),
            ("code_challenge_method", "S256"),
        ])
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
    let body: Value = resp
        .json()
        .await
        .map_err(|e| GatewayError::Network(format!("device authorization malformed: {e}")))?;

    let device_code = body
        .get("device_code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Network("device authorization missing device_code".to_string()))?
        .to_string();
    let interval = body.get("interval").and_then(|v| v.as_i64()).unwrap_or(5);
    let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(900);

    let state = oauth::generate_state();
    let now = Utc::now();
    oauth::store_device_session(
        &state,
        &DeviceCodeSession {
            user_id,
            client_id: QWEN_CLIENT_ID.to_string(),
            client_secret: None,
            device_code: Some(device_code),
            token_url: QWEN_TOKEN_URL.to_string(),
            aws_json: false,
            region: None,
            interval_secs: interval,
            next_poll_at: now + chrono::Duration::seconds(interval),
            created_at: now,
        },
    );

    Ok(DeviceFlowStart {
        state,
        user_code: body
            .get("user_code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        verification_uri: body
            .get("verification_uri")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        verification_uri_complete: body
            .get("verification_uri_complete")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        interval_secs: interval,
        expires_in,
    })
}

/// One client poll. On success the tokens become an account and are
/// scrubbed from the cache; the caller only learns the account id.
pub async fn poll_device_flow(user_id: i64, state: &str) -> GatewayResult<Value> {
    if let Some(session) = oauth::load_device_session(state) {
        if session.user_id != user_id {
            return Err(GatewayError::Forbidden("state belongs to a different user".to_string()));
        }
    }

    match oauth::poll_device_session(state).await? {
        oauth::DevicePollOutcome::Pending { retry_after_ms } => {
            Ok(json!({"status": "pending", "retry_after_ms": retry_after_ms}))
        }
        oauth::DevicePollOutcome::SlowDown { retry_after_ms } => {
            Ok(json!({"status": "slow_down", "retry_after_ms": retry_after_ms}))
        }
        oauth::DevicePollOutcome::Expired => Ok(json!({"status": "expired"})),
        oauth::DevicePollOutcome::Success(tokens) => {
            let now = Utc::now();
            let expires_at = tokens.expires_at(now);
            let stored = Credentials {
                credential_type: Some("qwen".to_string()),
                refresh_token: tokens.refresh_token.clone(),
                access_token: tokens.access_token.clone(),
                expires_at: expires_at.map(|d| d.to_rfc3339()),
                ..Default::default()
            };
            let encrypted = encrypt_secret(&stored.to_storage_json())?;

            let conn = crate::db::open_conn()?;
            let repo = AccountRepository::new(&conn, Provider::Qwen);
            let account = repo.create(
                user_id,
                None,
                "Qwen Account",
                None,
                &encrypted,
                expires_at,
                None,
                None,
                None,
            )?;
            oauth::delete_device_session(state);
            Ok(json!({"status": "success", "account_id": account.id}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_base_falls_back_to_portal() {
        let creds = Credentials::default();
        assert_eq!(api_base(&creds), "https://portal.qwen.ai/v1");

        let with_resource = Credentials {
            region: Some("portal-intl.qwen.ai/v1".to_string()),
            ..Default::default()
        };
        assert_eq!(api_base(&with_resource), "https://portal-intl.qwen.ai/v1");

        let with_scheme = Credentials {
            region: Some("https://custom.example.com/v1/".to_string()),
            ..Default::default()
        };
        assert_eq!(api_base(&with_scheme), "https://custom.example.com/v1");
    }
}
