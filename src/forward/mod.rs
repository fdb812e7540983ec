//! Routing facade.
//!
//! The four wire-format endpoints land here. Each request is lowered onto
//! the OpenAI chat dialect as the hub, raised into the selected provider's
//! dialect, driven through the failover engine, and the response stream is
//! translated back while the usage tracker rides along.

pub mod context;
pub mod stream;

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::accounts::Provider;
use crate::error::{GatewayError, GatewayResult, WireFormat};
use crate::translate::anthropic::{
    anthropic_to_openai_request, openai_request_to_anthropic, openai_response_to_anthropic,
    thinking_enabled, OpenAiToAnthropicStream,
};
use crate::translate::gemini::{
    gemini_request_to_cli_payload, gemini_request_to_openai_chat, openai_chat_response_to_gemini,
    openai_request_to_cli_payload, ChatToGeminiStream,
};
use crate::translate::responses::{
    chat_request_to_responses, chat_response_to_responses, extract_completed_response,
    responses_request_to_chat, responses_response_to_chat, ChatToResponsesStream,
    ResponsesToChatStream,
};
use crate::upstream::kiro::{anthropic_to_kiro_request, KiroStreamAdapter};
use crate::upstream::{codex, Dispatcher, RequestMeta, StreamOpen};
use crate::usage::{self, UsageRecord};

use context::AuthPrincipal;
use stream::{CallerEmitter, UpstreamAdapter, UsageGuard};

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
    }
}

fn client_app(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("x-client-app")
        .or_else(|| headers.get("user-agent"))
        .and_then(|v| v.to_str().ok());
    usage::truncate_client_app(raw)
}

fn stream_requested(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        _ => false,
    }
}

struct RequestPlan {
    principal: AuthPrincipal,
    provider: Provider,
    model: String,
    stream: bool,
    /// Hub-dialect (chat) request used for non-native providers.
    chat_request: Value,
    /// Body in the provider's own dialect, ready to send.
    upstream_body: Value,
    thinking: bool,
}

/// Build the translation plan for one request.
fn plan_request(
    format: WireFormat,
    headers: &HeaderMap,
    payload: &Value,
    path_model: Option<&str>,
    force_stream: Option<bool>,
) -> GatewayResult<RequestPlan> {
    let principal = context::authenticate(headers)?;
    let provider = context::resolve_config_type(&principal, headers);
    context::enforce_provider_gate(&principal, provider)?;

    if matches!(provider, Provider::ZaiTts | Provider::ZaiImage) {
        return Err(GatewayError::InvalidRequest(format!(
            "config type {provider} does not serve chat endpoints"
        )));
    }

    crate::logger::debug_body("forward", payload);

    let stream = force_stream.unwrap_or_else(|| stream_requested(payload));
    let thinking = match format {
        WireFormat::Anthropic => thinking_enabled(payload),
        _ => true,
    };

    // Lower onto the hub dialect.
    let chat_request = match format {
        WireFormat::OpenAiChat => payload.clone(),
        WireFormat::Anthropic => anthropic_to_openai_request(payload)?,
        WireFormat::OpenAiResponses => responses_request_to_chat(payload),
        WireFormat::Gemini => {
            let model = path_model.unwrap_or_default();
            gemini_request_to_openai_chat(model, payload, stream)?
        }
    };

    let model = chat_request
        .get("model")
        .and_then(|m| m.as_str())
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("model is required".to_string()))?;

    // Raise into the provider dialect. Native pairs skip the hub to keep
    // fields the hub cannot carry.
    let upstream_body = match provider {
        Provider::Codex => {
            if format == WireFormat::OpenAiResponses {
                codex::normalize_responses_request(payload)
            } else {
                codex::normalize_responses_request(&chat_request_to_responses(&chat_request))
            }
        }
        Provider::GeminiCli => {
            if format == WireFormat::Gemini {
                gemini_request_to_cli_payload(path_model.unwrap_or(&model), payload)
            } else {
                openai_request_to_cli_payload(&chat_request)?
            }
        }
        Provider::Kiro => {
            let anthropic_request = if format == WireFormat::Anthropic {
                payload.clone()
            } else {
                openai_request_to_anthropic(&chat_request)
            };
            anthropic_to_kiro_request(&anthropic_request)?
        }
        Provider::Antigravity | Provider::Qwen => {
            let mut body = chat_request.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stream".to_string(), Value::Bool(stream));
            }
            body
        }
        Provider::ZaiTts | Provider::ZaiImage => unreachable!("rejected above"),
    };

    Ok(RequestPlan {
        principal,
        provider,
        model,
        stream,
        chat_request,
        upstream_body,
        thinking,
    })
}

fn upstream_adapter(provider: Provider, format: WireFormat) -> UpstreamAdapter {
    match provider {
        Provider::Codex => {
            if format == WireFormat::OpenAiResponses {
                UpstreamAdapter::RawResponses
            } else {
                UpstreamAdapter::Responses(ResponsesToChatStream::new())
            }
        }
        Provider::GeminiCli => UpstreamAdapter::GeminiCli {
            state: Default::default(),
            line_buffer: Vec::new(),
        },
        Provider::Kiro => UpstreamAdapter::Kiro(KiroStreamAdapter::new()),
        _ => UpstreamAdapter::Passthrough,
    }
}

fn caller_emitter(format: WireFormat, plan: &RequestPlan, terminal: bool) -> CallerEmitter {
    if terminal {
        return CallerEmitter::Raw;
    }
    match format {
        WireFormat::OpenAiChat => CallerEmitter::OpenAiChat { done_seen: false },
        WireFormat::Anthropic => {
            CallerEmitter::Anthropic(OpenAiToAnthropicStream::new(&plan.model, plan.thinking))
        }
        WireFormat::OpenAiResponses => {
            CallerEmitter::Responses(ChatToResponsesStream::new(plan.chat_request.clone()))
        }
        WireFormat::Gemini => CallerEmitter::Gemini(ChatToGeminiStream::new()),
    }
}

fn base_record(plan: &RequestPlan, headers: &HeaderMap, endpoint: &str, payload: &Value) -> UsageRecord {
    let mut record = UsageRecord::new(plan.principal.user_id, endpoint, plan.provider.as_tag());
    record.model_name = Some(plan.model.clone());
    record.stream = plan.stream;
    record.client_app = client_app(headers);
    if crate::config::load().debug_log {
        record.request_body = usage::truncate_request_body(payload);
    }
    record
}

/// Open the upstream stream, falling back to the user's Codex fallback
/// when the pool is exhausted.
async fn open_upstream(plan: &RequestPlan, meta: &RequestMeta) -> GatewayResult<StreamOpenOrFallback> {
    let dispatcher = Dispatcher::for_provider(plan.provider)
        .ok_or_else(|| GatewayError::InvalidRequest("provider has no chat dispatcher".to_string()))?;

    match crate::upstream::open_stream_with_failover(
        &dispatcher,
        plan.principal.user_id,
        &plan.model,
        &plan.upstream_body,
        meta,
    )
    .await
    {
        Ok(open) => Ok(StreamOpenOrFallback::Primary(open)),
        Err(err @ GatewayError::NoAccountAvailable { .. })
        | Err(err @ GatewayError::MissingCredentialField(_))
            if plan.provider == Provider::Codex =>
        {
            match codex::open_fallback_stream(plan.principal.user_id, &plan.upstream_body, meta).await? {
                Some(response) => Ok(StreamOpenOrFallback::Fallback(response)),
                None => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

enum StreamOpenOrFallback {
    Primary(StreamOpen),
    Fallback(reqwest::Response),
}

impl StreamOpenOrFallback {
    fn into_response(self) -> reqwest::Response {
        match self {
            StreamOpenOrFallback::Primary(open) => open.response,
            StreamOpenOrFallback::Fallback(response) => response,
        }
    }
}

async fn handle_request(
    format: WireFormat,
    headers: HeaderMap,
    payload: Value,
    endpoint: &str,
    path_model: Option<&str>,
    force_stream: Option<bool>,
) -> GatewayResult<Response> {
    let plan = plan_request(format, &headers, &payload, path_model, force_stream)?;
    let meta = request_meta(&headers);
    let mut record = base_record(&plan, &headers, endpoint, &payload);

    let opened = match open_upstream(&plan, &meta).await {
        Ok(opened) => opened,
        Err(err) => {
            record.success = false;
            record.status_code = Some(err.status_code().as_u16());
            record.error_message = Some(err.to_string());
            usage::commit(&record);
            return Err(err);
        }
    };
    let upstream = opened.into_response();

    let adapter = upstream_adapter(plan.provider, format);
    let terminal = adapter.is_terminal();

    if plan.stream {
        let emitter = caller_emitter(format, &plan, terminal);
        let guard = UsageGuard::new(record);
        return Ok(stream::sse_response(upstream, adapter, emitter, guard));
    }

    // Non-streaming: every provider still answers over a stream; collect
    // it, fold to the hub dialect, and serialize for the caller.
    collect_and_respond(format, plan, upstream, adapter, record).await
}

async fn collect_and_respond(
    format: WireFormat,
    plan: RequestPlan,
    upstream: reqwest::Response,
    mut adapter: UpstreamAdapter,
    mut record: UsageRecord,
) -> GatewayResult<Response> {
    let raw = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::Network(format!("failed to read upstream body: {e}")))?;

    // Codex native non-stream: pull response.completed straight out.
    if plan.provider == Provider::Codex {
        let Some(response_obj) = extract_completed_response(&raw) else {
            record.success = false;
            record.status_code = Some(502);
            record.error_message = Some("upstream did not return response.completed".to_string());
            usage::commit(&record);
            return Err(GatewayError::Upstream {
                status: 502,
                body: "upstream did not return response.completed".to_string(),
            });
        };
        let chat = responses_response_to_chat(&response_obj, &plan.model);

        if let Some(parsed) = crate::translate::extract_openai_usage(&chat) {
            record.usage = parsed.finalized();
        }
        usage::commit(&record);

        let body = match format {
            WireFormat::OpenAiResponses => response_obj,
            WireFormat::OpenAiChat => chat,
            WireFormat::Anthropic => openai_response_to_anthropic(&chat, &plan.model, plan.thinking),
            WireFormat::Gemini => openai_chat_response_to_gemini(&chat),
        };
        return Ok(Json(body).into_response());
    }

    // OpenAI-compatible upstreams answer non-streaming calls with a plain
    // chat.completion object; the SSE fold only applies when the body is
    // actually an event stream.
    let plain_completion = match &adapter {
        UpstreamAdapter::Passthrough => serde_json::from_slice::<Value>(&raw)
            .ok()
            .filter(|v| v.get("choices").is_some() || v.get("error").is_some()),
        _ => None,
    };

    let chat = match plain_completion {
        Some(body) => {
            if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("upstream error")
                    .to_string();
                record.success = false;
                record.status_code = Some(502);
                record.error_message = Some(message.clone());
                usage::commit(&record);
                return Err(GatewayError::Upstream {
                    status: 502,
                    body: message,
                });
            }
            if let Some(parsed) = crate::translate::extract_openai_usage(&body) {
                record.usage = parsed.finalized();
            }
            usage::commit(&record);
            body
        }
        None => {
            let mut adapted = adapter.adapt(&raw);
            adapted.extend_from_slice(&adapter.finish());

            let mut tracker = crate::usage::SseUsageTracker::new();
            tracker.feed(&adapted);
            record.usage = tracker.finalize();
            if !tracker.success {
                record.success = false;
                record.status_code = tracker.status_code;
                record.error_message = tracker.error_message.clone();
                usage::commit(&record);
                return Err(GatewayError::Upstream {
                    status: tracker.status_code.unwrap_or(502),
                    body: tracker.error_message.unwrap_or_else(|| "upstream error".to_string()),
                });
            }

            let chat = stream::chunks_to_completion(&adapted, &plan.model);
            usage::commit(&record);
            chat
        }
    };

    let body = match format {
        WireFormat::OpenAiChat => chat,
        WireFormat::Anthropic => openai_response_to_anthropic(&chat, &plan.model, plan.thinking),
        WireFormat::OpenAiResponses => chat_response_to_responses(&chat, &plan.chat_request),
        WireFormat::Gemini => openai_chat_response_to_gemini(&chat),
    };
    Ok(Json(body).into_response())
}

// ---------------------------------------------------------------------------
// Endpoint handlers
// ---------------------------------------------------------------------------

/// POST /v1/chat/completions
pub async fn chat_completions(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    match handle_request(
        WireFormat::OpenAiChat,
        headers,
        payload,
        "/v1/chat/completions",
        None,
        None,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::OpenAiChat),
    }
}

/// POST /v1/responses
pub async fn responses(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    match handle_request(
        WireFormat::OpenAiResponses,
        headers,
        payload,
        "/v1/responses",
        None,
        None,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::OpenAiResponses),
    }
}

/// POST /v1/messages
pub async fn messages(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    match handle_request(
        WireFormat::Anthropic,
        headers,
        payload,
        "/v1/messages",
        None,
        None,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::Anthropic),
    }
}

/// POST /v1beta/models/{model}:generateContent and :streamGenerateContent
pub async fn gemini_generate(
    Path(model_and_action): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let (model, action) = match model_and_action.split_once(':') {
        Some((model, action)) if !model.is_empty() => (model.to_string(), action.to_string()),
        _ => {
            return GatewayError::InvalidRequest(
                "path must be models/{model}:generateContent".to_string(),
            )
            .into_response_for(WireFormat::Gemini)
        }
    };

    let stream = match action.as_str() {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return GatewayError::InvalidRequest(format!("unsupported action: {other}"))
                .into_response_for(WireFormat::Gemini)
        }
    };

    let endpoint = format!("/v1beta/models/{model}:{action}");
    match handle_request(
        WireFormat::Gemini,
        headers,
        payload,
        &endpoint,
        Some(&model),
        Some(stream),
    )
    .await
    {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::Gemini),
    }
}

/// GET /v1/models, config-type aware.
pub async fn list_models(headers: HeaderMap) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let provider = context::resolve_config_type(&principal, &headers);
        context::enforce_provider_gate(&principal, provider)?;

        let dispatcher = Dispatcher::for_provider(provider)
            .ok_or_else(|| GatewayError::InvalidRequest("config type has no model catalog".to_string()))?;
        let models = dispatcher.list_models(principal.user_id).await?;

        let data: Vec<Value> = models
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": 1700000000,
                    "owned_by": provider.as_tag(),
                })
            })
            .collect();
        Ok(json!({"object": "list", "data": data}))
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response_for(WireFormat::OpenAiChat),
    }
}

fn first_usable_account(provider: Provider, user_id: i64) -> GatewayResult<crate::accounts::Account> {
    let conn = crate::db::open_conn()?;
    let enabled = crate::accounts::repository::AccountRepository::new(&conn, provider)
        .list_enabled_by_user(user_id)?;
    enabled
        .into_iter()
        .find(|a| a.effective_status())
        .ok_or(GatewayError::NoAccountAvailable { earliest: None })
}

/// POST /v1/audio/speech (Z.AI TTS pool)
pub async fn audio_speech(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    let result: GatewayResult<Response> = async {
        let principal = context::authenticate(&headers)?;
        let voice = payload
            .get("voice")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        let text = payload
            .get("input")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("input is required".to_string()))?;

        let account = first_usable_account(Provider::ZaiTts, principal.user_id)?;
        let mut record = UsageRecord::new(principal.user_id, "/v1/audio/speech", Provider::ZaiTts.as_tag());
        record.client_app = client_app(&headers);

        match crate::upstream::zai::generate_tts(&account, voice, text).await {
            Ok(path) => {
                usage::commit(&record);
                let audio = tokio::fs::read(&path)
                    .await
                    .map_err(|e| GatewayError::Internal(format!("cannot read artifact: {e}")))?;
                Ok((
                    [(axum::http::header::CONTENT_TYPE, "audio/mpeg")],
                    audio,
                )
                    .into_response())
            }
            Err(err) => {
                record.success = false;
                record.status_code = Some(err.status_code().as_u16());
                record.error_message = Some(err.to_string());
                usage::commit(&record);
                Err(err)
            }
        }
    }
    .await;
    match result {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::OpenAiChat),
    }
}

/// POST /v1/images/generations (Z.AI Image pool)
pub async fn image_generations(headers: HeaderMap, Json(payload): Json<Value>) -> Response {
    let result: GatewayResult<Response> = async {
        let principal = context::authenticate(&headers)?;
        let prompt = payload
            .get("prompt")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("prompt is required".to_string()))?;
        let size = payload.get("size").and_then(|v| v.as_str());

        let account = first_usable_account(Provider::ZaiImage, principal.user_id)?;
        let mut record = UsageRecord::new(principal.user_id, "/v1/images/generations", Provider::ZaiImage.as_tag());
        record.client_app = client_app(&headers);

        match crate::upstream::zai::generate_image(&account, prompt, size).await {
            Ok(body) => {
                usage::commit(&record);
                Ok(Json(body).into_response())
            }
            Err(err) => {
                record.success = false;
                record.status_code = Some(err.status_code().as_u16());
                record.error_message = Some(err.to_string());
                usage::commit(&record);
                Err(err)
            }
        }
    }
    .await;
    match result {
        Ok(response) => response,
        Err(err) => err.into_response_for(WireFormat::OpenAiChat),
    }
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_flag_parsing_accepts_loose_shapes() {
        assert!(stream_requested(&json!({"stream": true})));
        assert!(stream_requested(&json!({"stream": 1})));
        assert!(stream_requested(&json!({"stream": "yes"})));
        assert!(!stream_requested(&json!({"stream": false})));
        assert!(!stream_requested(&json!({})));
    }

    #[test]
    fn adapter_selection_matches_provider_dialects() {
        assert!(matches!(
            upstream_adapter(Provider::Codex, WireFormat::OpenAiResponses),
            UpstreamAdapter::RawResponses
        ));
        assert!(matches!(
            upstream_adapter(Provider::Codex, WireFormat::OpenAiChat),
            UpstreamAdapter::Responses(_)
        ));
        assert!(matches!(
            upstream_adapter(Provider::Kiro, WireFormat::Anthropic),
            UpstreamAdapter::Kiro(_)
        ));
        assert!(matches!(
            upstream_adapter(Provider::Antigravity, WireFormat::OpenAiChat),
            UpstreamAdapter::Passthrough
        ));
    }
}
