//! AWS CodeWhisperer (Kiro) dispatcher.
//!
//! Kiro accepts a conversation payload with strictly alternating history
//! ending on an assistant turn, and answers with AWS event-stream frames.
//! The adapter below re-expresses decoded frames as OpenAI chat chunks so
//! the regular translators finish the job (including `<thinking>` tags in
//! assistant text, which the Anthropic emitter peels downstream).

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::accounts::repository::AccountRepository;
use crate::accounts::{Account, Provider};
use crate::auth::credentials::Credentials;
use crate::crypto::{decrypt_secret, encrypt_secret};
use crate::error::{GatewayError, GatewayResult};
use crate::translate::history;
use crate::upstream::client;
use crate::upstream::eventstream::{EventStreamDecoder, Frame};

use super::RequestMeta;

pub const DEFAULT_REGION: &str = "us-east-1";

pub const KIRO_MODELS: &[&str] = &[
    "claude-sonnet-4.5",
    "claude-sonnet-4",
    "claude-haiku-4.5",
    "claude-3-7-sonnet-20250219",
];

fn map_model(model: &str) -> String {
    match model.trim() {
        "claude-sonnet-4-5-20250929" => "claude-sonnet-4.5".to_string(),
        "claude-sonnet-4-20250514" => "claude-sonnet-4".to_string(),
        "claude-haiku-4-5-20251001" => "claude-haiku-4.5".to_string(),
        other => other.to_string(),
    }
}

fn codewhisperer_url(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse")
}

fn oidc_token_url(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com/token")
}

fn desktop_refresh_url(region: &str) -> String {
    format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
}

fn load_credentials(account: &Account) -> GatewayResult<Credentials> {
    let plain = decrypt_secret(&account.credentials)?;
    Ok(Credentials::from_json_str(&plain))
}

fn region_of(account: &Account, creds: &Credentials) -> String {
    creds
        .api_region
        .clone()
        .or_else(|| creds.region.clone())
        .or_else(|| account.region.clone())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

fn auth_region_of(account: &Account, creds: &Credentials) -> String {
    creds
        .auth_region
        .clone()
        .or_else(|| creds.region.clone())
        .or_else(|| account.region.clone())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

// ---------------------------------------------------------------------------
// Request building (Anthropic → Kiro conversation payload)
// ---------------------------------------------------------------------------

fn blocks_to_plain_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b.get("type").and_then(|t| t.as_str()) {
                Some("text") => b.get("text").and_then(|t| t.as_str()).map(|s| s.to_string()),
                Some("tool_result") => {
                    let inner = b.get("content").cloned().unwrap_or(Value::Null);
                    Some(blocks_to_plain_text(&inner))
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn tool_results_of(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .map(|b| {
            json!({
                "toolUseId": b.get("tool_use_id").cloned().unwrap_or(Value::Null),
                "status": "success",
                "content": [{"text": blocks_to_plain_text(&b.get("content").cloned().unwrap_or(Value::Null))}]
            })
        })
        .collect()
}

fn tool_uses_of(content: &Value) -> Vec<Value> {
    let Value::Array(blocks) = content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .map(|b| {
            json!({
                "toolUseId": b.get("id").cloned().unwrap_or(Value::Null),
                "name": b.get("name").cloned().unwrap_or(Value::Null),
                "input": b.get("input").cloned().unwrap_or(json!({}))
            })
        })
        .collect()
}

fn kiro_tool_specs(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "toolSpecification": {
                    "name": tool.get("name").cloned().unwrap_or(Value::Null),
                    "description": tool.get("description").cloned().unwrap_or(json!("")),
                    "inputSchema": {"json": tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}}))}
                }
            })
        })
        .collect()
}

/// Build the Kiro conversation payload from an Anthropic Messages request.
/// History repair runs first: pairing sanitation, placeholder tools, role
/// merging with the trailing "OK" turn, and the chunked-write policy
/// suffix on the system prompt.
pub fn anthropic_to_kiro_request(request: &Value) -> GatewayResult<Value> {
    let model_id = map_model(request.get("model").and_then(|m| m.as_str()).unwrap_or(""));

    let mut messages: Vec<Value> = request
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    if messages.is_empty() {
        return Err(GatewayError::InvalidRequest("messages must not be empty".to_string()));
    }

    history::sanitize_tool_pairing(&mut messages);
    history::ensure_nonempty_assistant_content(&mut messages);

    let mut tools: Vec<Value> = request
        .get("tools")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    history::ensure_tool_definitions(&mut tools, &messages);

    let mut system = crate::translate::anthropic::flatten_system(
        request.get("system").unwrap_or(&Value::Null),
    )
    .unwrap_or_default();
    history::inject_chunked_write_policy(&mut system);

    let merged = history::merge_for_strict_alternation(&messages);

    // The last user turn is the current message; everything before it is
    // history, which merge() guarantees ends on an assistant turn.
    let (current, history_messages) = match merged.split_last() {
        Some((last, rest)) if last.get("role").and_then(|r| r.as_str()) == Some("assistant") => {
            // merge appended a synthetic OK because the caller's last turn
            // was user; use the turn before it as current.
            match rest.split_last() {
                Some((user_turn, head)) => (user_turn.clone(), head.to_vec()),
                None => (last.clone(), Vec::new()),
            }
        }
        Some((last, rest)) => (last.clone(), rest.to_vec()),
        None => return Err(GatewayError::InvalidRequest("messages must not be empty".to_string())),
    };

    let mut history_out: Vec<Value> = Vec::new();
    for message in &history_messages {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("");
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        if role == "user" {
            let mut node = Map::new();
            node.insert("content".to_string(), json!(blocks_to_plain_text(&content)));
            node.insert("modelId".to_string(), json!(model_id));
            node.insert("origin".to_string(), json!("AI_EDITOR"));
            let tool_results = tool_results_of(&content);
            if !tool_results.is_empty() {
                node.insert(
                    "userInputMessageContext".to_string(),
                    json!({"toolResults": tool_results}),
                );
            }
            history_out.push(json!({"userInputMessage": Value::Object(node)}));
        } else {
            let mut node = Map::new();
            node.insert("content".to_string(), json!(blocks_to_plain_text(&content)));
            let tool_uses = tool_uses_of(&content);
            if !tool_uses.is_empty() {
                node.insert("toolUses".to_string(), Value::Array(tool_uses));
            }
            history_out.push(json!({"assistantResponseMessage": Value::Object(node)}));
        }
    }

    let current_content = current.get("content").cloned().unwrap_or(Value::Null);
    let mut current_text = blocks_to_plain_text(&current_content);
    if !system.is_empty() {
        current_text = format!("{system}\n\n{current_text}");
    }
    if current_text.is_empty() {
        current_text = " ".to_string();
    }

    let mut context = Map::new();
    if !tools.is_empty() {
        context.insert("tools".to_string(), Value::Array(kiro_tool_specs(&tools)));
    }
    let tool_results = tool_results_of(&current_content);
    if !tool_results.is_empty() {
        context.insert("toolResults".to_string(), Value::Array(tool_results));
    }

    let mut current_message = Map::new();
    current_message.insert("content".to_string(), json!(current_text));
    current_message.insert("modelId".to_string(), json!(model_id));
    current_message.insert("origin".to_string(), json!("AI_EDITOR"));
    if !context.is_empty() {
        current_message.insert("userInputMessageContext".to_string(), Value::Object(context));
    }

    Ok(json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": Uuid::new_v4().to_string(),
            "currentMessage": {"userInputMessage": Value::Object(current_message)},
            "history": history_out
        }
    }))
}

// ---------------------------------------------------------------------------
// Stream adaptation (event-stream frames → OpenAI chunks)
// ---------------------------------------------------------------------------

/// Decodes raw Kiro bytes and re-emits them as OpenAI chat chunk payloads.
pub struct KiroStreamAdapter {
    decoder: EventStreamDecoder,
    response_id: String,
    tool_index: i64,
    open_tool_id: Option<String>,
}

impl Default for KiroStreamAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl KiroStreamAdapter {
    pub fn new() -> Self {
        Self {
            decoder: EventStreamDecoder::new(),
            response_id: format!("kiro-{}", Uuid::new_v4().simple()),
            tool_index: -1,
            open_tool_id: None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": "kiro",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        })
    }

    fn frame_to_chunks(&mut self, frame: &Frame) -> Vec<Value> {
        let payload: Value = serde_json::from_slice(&frame.payload).unwrap_or(Value::Null);

        if frame.message_type() == Some("exception") || frame.exception_type().is_some() {
            let message = payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream exception");
            return vec![json!({"error": {
                "message": message,
                "type": frame.exception_type().unwrap_or("exception")
            }})];
        }

        match frame.event_type() {
            Some("assistantResponseEvent") => {
                let content = payload.get("content").and_then(|c| c.as_str()).unwrap_or("");
                if content.is_empty() {
                    return Vec::new();
                }
                vec![self.chunk(json!({"role": "assistant", "content": content}), None)]
            }
            Some("toolUseEvent") => {
                let tool_use_id = payload
                    .get("toolUseId")
                    .and_then(|i| i.as_str())
                    .unwrap_or("")
                    .to_string();
                let name = payload.get("name").and_then(|n| n.as_str()).unwrap_or("");
                let input = match payload.get("input") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => String::new(),
                };
                let stop = payload.get("stop").and_then(|s| s.as_bool()).unwrap_or(false);

                if self.open_tool_id.as_deref() != Some(tool_use_id.as_str()) {
                    self.tool_index += 1;
                    self.open_tool_id = Some(tool_use_id.clone());
                }

                let mut chunks = Vec::new();
                if !name.is_empty() || !input.is_empty() {
                    chunks.push(self.chunk(
                        json!({"role": "assistant", "tool_calls": [{
                            "index": self.tool_index,
                            "id": tool_use_id,
                            "type": "function",
                            "function": {"name": name, "arguments": input}
                        }]}),
                        None,
                    ));
                }
                if stop {
                    self.open_tool_id = None;
                    chunks.push(self.chunk(json!({}), Some("tool_calls")));
                }
                chunks
            }
            Some("messageMetadataEvent") | Some("followupPromptEvent") => Vec::new(),
            _ => Vec::new(),
        }
    }

    /// Feed raw bytes; returns OpenAI chunk payloads for every frame that
    /// became complete.
    pub fn feed(&mut self, data: &[u8]) -> GatewayResult<Vec<Value>> {
        self.decoder
            .feed(data)
            .map_err(|e| GatewayError::Network(format!("event-stream decode failed: {e}")))?;
        let frames = self
            .decoder
            .decode_available()
            .map_err(|e| GatewayError::Network(format!("event-stream decode failed: {e}")))?;

        let mut chunks = Vec::new();
        for frame in &frames {
            chunks.extend(self.frame_to_chunks(frame));
        }
        Ok(chunks)
    }

    /// Final chunk carrying the stop marker when upstream never sent one.
    pub fn finalize(&mut self) -> Vec<Value> {
        vec![self.chunk(json!({}), Some("stop"))]
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct KiroDispatcher;

impl KiroDispatcher {
    pub async fn send(
        &self,
        account: &Account,
        body: &Value,
        _meta: &RequestMeta,
    ) -> GatewayResult<reqwest::Response> {
        let creds = load_credentials(account)?;
        let access_token = creds
            .access_token
            .as_deref()
            .ok_or_else(|| GatewayError::MissingCredentialField("access_token".to_string()))?;
        let region = region_of(account, &creds);

        let http = client::streaming_client()?;
        http.post(codewhisperer_url(&region))
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Content-Type", "application/x-amz-json-1.1")
            .header(
                "X-Amz-Target",
                "AmazonCodeWhispererStreamingService.GenerateAssistantResponse",
            )
            .header("Accept", "application/vnd.amazon.eventstream")
            .json(body)
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
        let auth_region = auth_region_of(account, &creds);

        let http = client::token_client()?;
        let (access_token, new_refresh, expires_in) =
            match (creds.client_id.as_deref(), creds.client_secret.as_deref()) {
                // IAM Identity Center accounts refresh against SSO OIDC.
                (Some(client_id), Some(client_secret)) => {
                    let resp = http
                        .post(oidc_token_url(&auth_region))
                        .json(&json!({
                            "clientId": client_id,
                            "clientSecret": client_secret,
                            "grantType": "refresh_token",
                            "refreshToken": refresh_token,
                        }))
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
                        .map_err(|e| GatewayError::Network(format!("OIDC response malformed: {e}")))?;
                    (
                        body.get("accessToken").and_then(|v| v.as_str()).map(|s| s.to_string()),
                        body.get("refreshToken").and_then(|v| v.as_str()).map(|s| s.to_string()),
                        body.get("expiresIn").and_then(|v| v.as_i64()),
                    )
                }
                // Social-login accounts use the desktop refresh endpoint.
                _ => {
                    let resp = http
                        .post(desktop_refresh_url(&auth_region))
                        .json(&json!({"refreshToken": refresh_token}))
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
                        .map_err(|e| GatewayError::Network(format!("refresh response malformed: {e}")))?;
                    (
                        body.get("accessToken").and_then(|v| v.as_str()).map(|s| s.to_string()),
                        body.get("refreshToken").and_then(|v| v.as_str()).map(|s| s.to_string()),
                        body.get("expiresIn").and_then(|v| v.as_i64()),
                    )
                }
            };

        let access_token = access_token
            .ok_or_else(|| GatewayError::Network("refresh response missing accessToken".to_string()))?;
        let now = Utc::now();
        let expires_at = expires_in.map(|secs| now + chrono::Duration::seconds(secs.max(0)));

        let stored = Credentials {
            credential_type: Some("kiro".to_string()),
            refresh_token: new_refresh.or(Some(refresh_token)),
            access_token: Some(access_token),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            region: creds.region.clone(),
            auth_region: creds.auth_region.clone(),
            api_region: creds.api_region.clone(),
            account_id: creds.account_id.clone(),
            email: creds.email.clone(),
            expires_at: expires_at.map(|d| d.to_rfc3339()),
            ..Default::default()
        };
        let encrypted = encrypt_secret(&stored.to_storage_json())?;

        let conn = crate::db::open_conn()?;
        let repo = AccountRepository::new(&conn, Provider::Kiro);
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
        Ok(KIRO_MODELS.iter().map(|s| s.to_string()).collect())
    }
}

// ---------------------------------------------------------------------------
// IAM Identity Center device flow
// ---------------------------------------------------------------------------

fn oidc_register_url(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com/client/register")
}

fn oidc_device_authorization_url(region: &str) -> String {
    format!("https://oidc.{region}.amazonaws.com/device_authorization")
}

pub struct KiroDeviceFlowStart {
    pub state: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub interval_secs: i64,
    pub expires_in: i64,
}

/// Three-call IdC sequence: register a client, start a device
/// authorization, and park both in the cached session for polling. The
/// caller only ever sees the user code and verification URI.
pub async fn start_device_flow(user_id: i64, start_url: &str, region: &str) -> GatewayResult<KiroDeviceFlowStart> {
    let region = {
        let r = region.trim();
        if r.is_empty() { DEFAULT_REGION } else { r }
    };
    let http = crate::upstream::client::token_client()?;

    let register: Value = {
        let resp = http
            .post(oidc_register_url(region))
            .json(&json!({
                "clientName": format!("hubgate-{}", Uuid::new_v4().simple()),
                "clientType": "public",
                "scopes": ["codewhisperer:completions", "codewhisperer:analysis", "codewhisperer:conversations"],
            }))
            .send()
            .await
            .map_err(crate::upstream::client::map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::Network(format!("client registration malformed: {e}")))?
    };

    let client_id = register
        .get("clientId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Network("registration missing clientId".to_string()))?
        .to_string();
    let client_secret = register
        .get("clientSecret")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Network("registration missing clientSecret".to_string()))?
        .to_string();

    let authorization: Value = {
        let resp = http
            .post(oidc_device_authorization_url(region))
            .json(&json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "startUrl": start_url,
            }))
            .send()
            .await
            .map_err(crate::upstream::client::map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::Network(format!("device authorization malformed: {e}")))?
    };

    let device_code = authorization
        .get("deviceCode")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Network("device authorization missing deviceCode".to_string()))?
        .to_string();
    let interval = authorization.get("interval").and_then(|v| v.as_i64()).unwrap_or(5);
    let expires_in = authorization.get("expiresIn").and_then(|v| v.as_i64()).unwrap_or(600);

    let state = crate::auth::oauth::generate_state();
    let now = Utc::now();
    crate::auth::oauth::store_device_session(
        &state,
        &crate::auth::oauth::DeviceCodeSession {
            user_id,
            client_id,
            client_secret: Some(client_secret),
            device_code: Some(device_code),
            token_url: oidc_token_url(region),
            aws_json: true,
            region: Some(region.to_string()),
            interval_secs: interval,
            next_poll_at: now + chrono::Duration::seconds(interval),
            created_at: now,
        },
    );

    Ok(KiroDeviceFlowStart {
        state,
        user_code: authorization
            .get("userCode")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        verification_uri: authorization
            .get("verificationUri")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        verification_uri_complete: authorization
            .get("verificationUriComplete")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        interval_secs: interval,
        expires_in,
    })
}

/// One poll of the IdC flow. The registered client id/secret ride into the
/// account credentials so later refreshes can use SSO OIDC; the caller
/// never sees any token material.
pub async fn poll_device_flow(user_id: i64, state: &str) -> GatewayResult<Value> {
    use crate::auth::oauth::{self, DevicePollOutcome};

    // Snapshot the registration before polling scrubs it from the session.
    let registration = oauth::load_device_session(state);
    if let Some(session) = &registration {
        if session.user_id != user_id {
            return Err(GatewayError::Forbidden("state belongs to a different user".to_string()));
        }
    }

    match oauth::poll_device_session(state).await? {
        DevicePollOutcome::Pending { retry_after_ms } => {
            Ok(json!({"status": "pending", "retry_after_ms": retry_after_ms}))
        }
        DevicePollOutcome::SlowDown { retry_after_ms } => {
            Ok(json!({"status": "slow_down", "retry_after_ms": retry_after_ms}))
        }
        DevicePollOutcome::Expired => Ok(json!({"status": "expired"})),
        DevicePollOutcome::Success(tokens) => {
            let registration = registration
                .ok_or_else(|| GatewayError::Internal("device session vanished during poll".to_string()))?;
            let now = Utc::now();
            let expires_at = tokens.expires_at(now);
            let region = registration.region.clone();

            let stored = Credentials {
                credential_type: Some("kiro".to_string()),
                refresh_token: tokens.refresh_token.clone(),
                access_token: tokens.access_token.clone(),
                client_id: Some(registration.client_id.clone()),
                client_secret: registration.client_secret.clone(),
                region: region.clone(),
                auth_region: region.clone(),
                api_region: region.clone(),
                expires_at: expires_at.map(|d| d.to_rfc3339()),
                ..Default::default()
            };
            let encrypted = encrypt_secret(&stored.to_storage_json())?;

            let conn = crate::db::open_conn()?;
            let repo = AccountRepository::new(&conn, Provider::Kiro);
            let account = repo.create(
                user_id,
                None,
                "Kiro Account",
                None,
                &encrypted,
                expires_at,
                None,
                region.as_deref(),
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
    fn request_builder_injects_policy_and_history() {
        let request = json!({
            "model": "claude-sonnet-4-5-20250929",
            "system": "base system",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        });
        let out = anthropic_to_kiro_request(&request).unwrap();
        let state = &out["conversationState"];

        let current = &state["currentMessage"]["userInputMessage"];
        assert_eq!(current["modelId"], "claude-sonnet-4.5");
        let content = current["content"].as_str().unwrap();
        assert!(content.contains("base system"));
        assert!(content.contains("150 lines"));
        assert!(content.contains("second"));

        let history = state["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].get("userInputMessage").is_some());
        assert!(history[1].get("assistantResponseMessage").is_some());
    }

    #[test]
    fn trailing_user_history_gets_ok_assistant() {
        let request = json!({
            "model": "claude-sonnet-4.5",
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
                {"role": "user", "content": "c"},
                {"role": "user", "content": "d"}
            ]
        });
        let out = anthropic_to_kiro_request(&request).unwrap();
        let history = out["conversationState"]["history"].as_array().unwrap();
        // user(a), assistant(b), user(c+d merged) is current, so history
        // ends on the assistant turn
        assert!(history.last().unwrap().get("assistantResponseMessage").is_some());
    }

    #[test]
    fn history_tools_become_placeholder_specs() {
        let request = json!({
            "model": "claude-sonnet-4.5",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "old_tool", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "out"}
                ]}
            ]
        });
        let out = anthropic_to_kiro_request(&request).unwrap();
        let tools = out["conversationState"]["currentMessage"]["userInputMessage"]
            ["userInputMessageContext"]["tools"]
            .as_array()
            .unwrap();
        assert_eq!(tools[0]["toolSpecification"]["name"], "old_tool");
        assert_eq!(
            tools[0]["toolSpecification"]["description"],
            "Tool used in conversation history"
        );
    }

    fn encode_event(event_type: &str, payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in [(":message-type", "event"), (":event-type", event_type)] {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7u8);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }
        let total_len = 12 + header_bytes.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&out[0..8]).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    #[test]
    fn adapter_maps_assistant_and_tool_events() {
        let mut adapter = KiroStreamAdapter::new();

        let chunks = adapter
            .feed(&encode_event("assistantResponseEvent", br#"{"content":"hello"}"#))
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "hello");

        let chunks = adapter
            .feed(&encode_event(
                "toolUseEvent",
                br#"{"toolUseId":"t1","name":"search","input":"{\"q\":"}"#,
            ))
            .unwrap();
        assert_eq!(
            chunks[0]["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "search"
        );
        assert_eq!(chunks[0]["choices"][0]["delta"]["tool_calls"][0]["index"], 0);

        let chunks = adapter
            .feed(&encode_event(
                "toolUseEvent",
                br#"{"toolUseId":"t1","name":"search","input":"\"x\"}","stop":true}"#,
            ))
            .unwrap();
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn adapter_surfaces_exceptions_as_error_chunks() {
        let mut adapter = KiroStreamAdapter::new();
        let mut header_bytes = Vec::new();
        for (name, value) in [(":message-type", "exception"), (":exception-type", "ThrottlingException")] {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7u8);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }
        let payload = br#"{"message":"slow down"}"#;
        let total_len = 12 + header_bytes.len() + payload.len() + 4;
        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc32fast::hash(&frame[0..8]).to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        let chunks = adapter.feed(&frame).unwrap();
        assert_eq!(chunks[0]["error"]["message"], "slow down");
        assert_eq!(chunks[0]["error"]["type"], "ThrottlingException");
    }

    #[test]
    fn model_mapping() {
        assert_eq!(map_model("claude-sonnet-4-5-20250929"), "claude-sonnet-4.5");
        assert_eq!(map_model("claude-sonnet-4.5"), "claude-sonnet-4.5");
    }
}
