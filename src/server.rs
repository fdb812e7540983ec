//! HTTP server assembly.

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::error::GatewayResult;
use crate::forward::{self, context};
use crate::upstream::{codex, kiro, qwen};

#[derive(Deserialize)]
struct CallbackRequest {
    callback_url: String,
}

#[derive(Deserialize)]
struct DevicePollRequest {
    state: String,
}

#[derive(Deserialize)]
struct StatusRequest {
    status: i64,
}

async fn update_account_status(
    axum::extract::Path((provider_tag, account_id)): axum::extract::Path<(String, i64)>,
    headers: HeaderMap,
    Json(req): Json<StatusRequest>,
) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let provider = crate::accounts::Provider::from_tag(&provider_tag).ok_or_else(|| {
            crate::error::GatewayError::InvalidRequest(format!("unknown provider: {provider_tag}"))
        })?;
        let conn = crate::db::open_conn()?;
        let account = crate::accounts::update_status_guarded(
            &conn,
            provider,
            principal.user_id,
            account_id,
            req.status,
        )?;
        Ok(serde_json::to_value(&account).unwrap_or_else(|_| json!({})))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_user_settings(headers: HeaderMap) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let conn = crate::db::open_conn()?;
        let settings = crate::accounts::settings::get(&conn, principal.user_id)?;
        Ok(serde_json::to_value(settings).unwrap_or_else(|_| json!({})))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn put_user_settings(
    headers: HeaderMap,
    Json(body): Json<crate::accounts::settings::UserSettings>,
) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let conn = crate::db::open_conn()?;
        let saved = crate::accounts::settings::set(&conn, principal.user_id, &body)?;
        Ok(serde_json::to_value(saved).unwrap_or_else(|_| json!({})))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn codex_authorize_url(headers: HeaderMap) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let out = codex::create_authorize_url(principal.user_id);
        Ok(json!({
            "auth_url": out.auth_url,
            "state": out.state,
            "expires_in": out.expires_in,
        }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn codex_oauth_callback(headers: HeaderMap, Json(req): Json<CallbackRequest>) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let account = codex::submit_oauth_callback(principal.user_id, &req.callback_url).await?;
        Ok(json!({
            "account_id": account.id,
            "account_name": account.account_name,
            "email": account.email,
        }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Deserialize)]
struct KiroDeviceStartRequest {
    start_url: String,
    #[serde(default)]
    region: String,
}

async fn kiro_device_start(headers: HeaderMap, Json(req): Json<KiroDeviceStartRequest>) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let start = kiro::start_device_flow(principal.user_id, &req.start_url, &req.region).await?;
        Ok(json!({
            "state": start.state,
            "user_code": start.user_code,
            "verification_uri": start.verification_uri,
            "verification_uri_complete": start.verification_uri_complete,
            "interval": start.interval_secs,
            "expires_in": start.expires_in,
        }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn kiro_device_poll(headers: HeaderMap, Json(req): Json<DevicePollRequest>) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        kiro::poll_device_flow(principal.user_id, &req.state).await
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn qwen_device_start(headers: HeaderMap) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        let start = qwen::start_device_flow(principal.user_id).await?;
        Ok(json!({
            "state": start.state,
            "user_code": start.user_code,
            "verification_uri": start.verification_uri,
            "verification_uri_complete": start.verification_uri_complete,
            "interval": start.interval_secs,
            "expires_in": start.expires_in,
        }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn qwen_device_poll(headers: HeaderMap, Json(req): Json<DevicePollRequest>) -> Response {
    let result: GatewayResult<Value> = async {
        let principal = context::authenticate(&headers)?;
        qwen::poll_device_flow(principal.user_id, &req.state).await
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();
    Router::new()
        .route("/health", get(forward::health))
        // Client-facing wire formats
        .route("/v1/chat/completions", post(forward::chat_completions))
        .route("/v1/responses", post(forward::responses))
        .route("/v1/messages", post(forward::messages))
        .route("/v1beta/models/:model_and_action", post(forward::gemini_generate))
        .route("/v1/models", get(forward::list_models))
        .route("/v1/audio/speech", post(forward::audio_speech))
        .route("/v1/images/generations", post(forward::image_generations))
        // User preferences and account state
        .route("/api/settings", get(get_user_settings).put(put_user_settings))
        .route(
            "/api/accounts/:provider/:account_id/status",
            axum::routing::put(update_account_status),
        )
        // Credential lifecycle
        .route("/api/codex/oauth/authorize-url", post(codex_authorize_url))
        .route("/api/codex/oauth/callback", post(codex_oauth_callback))
        .route("/api/qwen/device/start", post(qwen_device_start))
        .route("/api/qwen/device/poll", post(qwen_device_poll))
        .route("/api/kiro/device/start", post(kiro_device_start))
        .route("/api/kiro/device/poll", post(kiro_device_poll))
        .layer(cors)
}

pub async fn serve() {
    if let Err(e) = crate::db::init() {
        crate::logger::error("server", &format!("database init failed: {e}"));
        return;
    }
    crate::logger::init();
    crate::upstream::zai::cleanup_artifacts_on_startup();

    let addr: SocketAddr = crate::config::load()
        .listen_addr
        .parse()
        .unwrap_or_else(|_| "127.0.0.1:8787".parse().expect("static addr parses"));

    crate::logger::info("server", &format!("listening on {addr}"));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            crate::logger::error("server", &format!("bind failed: {e}"));
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app()).await {
        crate::logger::error("server", &format!("server error: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });

        let r = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        let s = r.json::<serde_json::Value>().await.unwrap();
        assert_eq!(s["status"], "ok");
        drop(h);
    }

    #[tokio::test]
    async fn chat_requires_credentials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        let h = tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });

        let client = reqwest::Client::new();
        let r = client
            .post(format!("http://{addr}/v1/chat/completions"))
            .json(&json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status().as_u16(), 401);
        let body: Value = r.json().await.unwrap();
        assert_eq!(body["error"]["type"], "authentication_error");
        drop(h);
    }
}
