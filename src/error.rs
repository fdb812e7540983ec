//! Gateway error types.
//!
//! One error enum crosses the facade boundary; serialization depends on the
//! caller's wire format (OpenAI/Gemini object errors vs Anthropic's typed
//! envelope).

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;

/// Which client dialect the response is serialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiChat,
    OpenAiResponses,
    Anthropic,
    Gemini,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("credentials corrupted, please re-import the account")]
    CredentialsCorrupted,

    #[error("account is missing required field: {0}")]
    MissingCredentialField(String),

    #[error("{}", no_account_message(.earliest))]
    NoAccountAvailable { earliest: Option<DateTime<Utc>> },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream request failed: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

fn no_account_message(earliest: &Option<DateTime<Utc>>) -> String {
    match earliest {
        Some(at) => format!(
            "no account available, earliest recovery at {}",
            at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ),
        None => "no account available".to_string(),
    }
}

impl From<crate::crypto::CryptoError> for GatewayError {
    fn from(_: crate::crypto::CryptoError) -> Self {
        GatewayError::CredentialsCorrupted
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(format!("database error: {e}"))
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest(_) | GatewayError::MissingCredentialField(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::CredentialsCorrupted => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NoAccountAvailable { earliest } => {
                if earliest.is_some() {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::BAD_REQUEST
                }
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Network(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "authentication_error",
            GatewayError::Forbidden(_) => "permission_error",
            GatewayError::InvalidRequest(_) | GatewayError::MissingCredentialField(_) => {
                "invalid_request_error"
            }
            GatewayError::ModelNotFound(_) => "not_found_error",
            GatewayError::CredentialsCorrupted => "credentials_error",
            GatewayError::NoAccountAvailable { .. } | GatewayError::RateLimited { .. } => {
                "rate_limit_error"
            }
            GatewayError::Upstream { .. } | GatewayError::Network(_) | GatewayError::Timeout(_) => {
                "upstream_error"
            }
            GatewayError::Internal(_) => "api_error",
        }
    }

    fn retry_after_secs(&self) -> Option<i64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some((*retry_after_secs).max(0)),
            GatewayError::NoAccountAvailable { earliest: Some(at) } => {
                Some((*at - Utc::now()).num_seconds().max(0) + 1)
            }
            _ => None,
        }
    }

    /// Serialize in the caller's wire format.
    pub fn into_response_for(self, format: WireFormat) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        crate::logger::error(
            "gateway",
            &format!("returning error response: status={} message={}", status.as_u16(), message),
        );

        let body = match format {
            WireFormat::Anthropic => json!({
                "type": "error",
                "error": {"type": self.error_type(), "message": message}
            }),
            WireFormat::Gemini => json!({
                "error": {"message": message, "code": status.as_u16()}
            }),
            WireFormat::OpenAiChat | WireFormat::OpenAiResponses => json!({
                "error": {
                    "message": message,
                    "type": self.error_type(),
                    "code": status.as_u16(),
                }
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for(WireFormat::OpenAiChat)
    }
}
