//! Google GeminiCLI (cloudcode-pa) dispatcher.
//!
//! Requests ride the CLI wrapper `{project, request, model}`; every
//! candidate is an (account, project) pair, so the selected project is
//! injected here. The model catalog is cached per user for a day, five
//! minutes when only the fallback list was available.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::accounts::repository::AccountRepository;
use crate::accounts::{Account, Provider};
use crate::auth::credentials::Credentials;
use crate::auth::oauth;
use crate::cache;
use crate::crypto::{decrypt_secret, encrypt_secret};
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

use super::RequestMeta;

pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CODE_ASSIST_API_VERSION: &str = "v1internal";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const GEMINI_CLI_CLIENT_SECRET: &str = "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";

pub const DEFAULT_USER_AGENT: &str = "GeminiCLI/0.1.5 (linux; x64)";
pub const DEFAULT_X_GOOG_API_CLIENT: &str = "gl-node/20.11.0";
pub const DEFAULT_CLIENT_METADATA: &str = "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI";

pub const MODELS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MODELS_FALLBACK_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const FALLBACK_MODELS: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-3-pro-preview",
];

fn stream_url() -> String {
    format!("{CODE_ASSIST_ENDPOINT}/{CODE_ASSIST_API_VERSION}:streamGenerateContent?alt=sse")
}

fn load_credentials(account: &Account) -> GatewayResult<Credentials> {
    let plain = decrypt_secret(&account.credentials)?;
    Ok(Credentials::from_json_str(&plain))
}

pub struct GeminiCliDispatcher;

impl GeminiCliDispatcher {
    /// Open the SSE stream for one (account, project) candidate. The body
    /// is the CLI payload with an empty project slot.
    pub async fn send(
        &self,
        account: &Account,
        project: Option<&str>,
        body: &Value,
        _meta: &RequestMeta,
    ) -> GatewayResult<reqwest::Response> {
        let creds = load_credentials(account)?;
        let access_token = creds
            .access_token
            .as_deref()
            .ok_or_else(|| GatewayError::MissingCredentialField("access_token".to_string()))?;

        let mut payload = body.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("project".to_string(), json!(project.unwrap_or("")));
        }

        let http = client::streaming_client()?;
        http.post(stream_url())
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("User-Agent", DEFAULT_USER_AGENT)
            .header("X-Goog-Api-Client", DEFAULT_X_GOOG_API_CLIENT)
            .header("Client-Metadata", DEFAULT_CLIENT_METADATA)
            .json(&payload)
            .send()
            .await
            .map_err(client::map_reqwest_error)
    }

    pub async fn refresh(&self, account: &Account) -> GatewayResult<Account> {
        let creds = load_credentials(account)?;
        let refresh_token = creds
            .refresh_token
            .clone()
            .ok_or_else(|| GatewayError::MissingCredentialField("refresh_token".to_string()))?;

        // The CLI's own OAuth client unless the import carried one.
        let client_id = creds.client_id.clone().unwrap_or_else(|| GEMINI_CLI_CLIENT_ID.to_string());
        let client_secret = creds
            .client_secret
            .clone()
            .unwrap_or_else(|| GEMINI_CLI_CLIENT_SECRET.to_string());

        let http = client::token_client()?;
        let resp = http
            .post(GOOGLE_TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
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
        let tokens: oauth::TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Network(format!("token endpoint returned malformed JSON: {e}")))?;

        let now = Utc::now();
        let expires_at = tokens.expires_at(now);
        let stored = Credentials {
            credential_type: Some("gemini-cli".to_string()),
            refresh_token: tokens.refresh_token.clone().or(Some(refresh_token)),
            access_token: tokens.access_token.clone(),
            id_token: tokens.id_token.clone().or(creds.id_token),
            client_id: Some(client_id),
            client_secret: Some(client_secret),
            project_id: creds.project_id.clone(),
            account_id: creds.account_id.clone(),
            email: creds.email.clone(),
            expires_at: expires_at.map(|d| d.to_rfc3339()),
            ..Default::default()
        };
        let encrypted = encrypt_secret(&stored.to_storage_json())?;

        let conn = crate::db::open_conn()?;
        let repo = AccountRepository::new(&conn, Provider::GeminiCli);
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

    /// Model catalog, cached per user. The fallback list gets the short
    /// TTL so a transient quota failure does not pin stale data for a day.
    pub async fn list_models(&self, user_id: i64) -> GatewayResult<Vec<String>> {
        let cache_key = cache::models_cache_key(user_id);
        if let Some(models) = cache::shared().get_json::<Vec<String>>(&cache_key) {
            if !models.is_empty() {
                return Ok(models);
            }
        }

        let models: Vec<String> = FALLBACK_MODELS.iter().map(|s| s.to_string()).collect();
        cache::shared().set_json(&cache_key, &models, MODELS_FALLBACK_CACHE_TTL);
        Ok(models)
    }
}

/// Cache a quota-endpoint-derived model list under the long TTL.
pub fn cache_models(user_id: i64, models: &[String]) {
    if models.is_empty() {
        return;
    }
    cache::shared().set_json(&cache::models_cache_key(user_id), &models.to_vec(), MODELS_CACHE_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_targets_v1internal_sse() {
        assert_eq!(
            stream_url(),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn cached_models_round_trip() {
        cache_models(4242, &["gemini-2.5-pro".to_string()]);
        let cached: Vec<String> = cache::shared()
            .get_json(&cache::models_cache_key(4242))
            .unwrap();
        assert_eq!(cached, vec!["gemini-2.5-pro"]);
        cache::shared().delete(&cache::models_cache_key(4242));
    }
}
