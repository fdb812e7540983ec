//! Request context: authentication boundary and config-type resolution.
//!
//! The gateway recognizes two principals: provider-scoped API keys (which
//! pin the config type) and HS256 session tokens (which may override it
//! via `X-Api-Type`). Key lookup compares in constant time; session
//! tokens are verified against the configured secret and the blacklist.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rusqlite::params;
use serde_json::Value;
use sha2::Sha256;

use crate::accounts::Provider;
use crate::cache;
use crate::crypto::secrets_equal;
use crate::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller plus everything the router needs to gate and
/// route the request.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub user_id: i64,
    /// Set when the key was created for a specific provider pool.
    pub config_type: Option<Provider>,
    pub beta: bool,
    pub trust_level: i64,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Gemini clients send `x-goog-api-key` instead of an Authorization header.
fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn looks_like_jwt(token: &str) -> bool {
    token.matches('.').count() == 2
}

fn verify_session_token(token: &str) -> GatewayResult<AuthPrincipal> {
    let mut parts = token.splitn(3, '.');
    let (Some(header), Some(payload), Some(signature)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(GatewayError::Unauthorized("malformed session token".to_string()));
    };

    let secret = &crate::config::load().jwt_secret_key;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Internal("invalid JWT secret".to_string()))?;
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    if !secrets_equal(&expected, signature) {
        return Err(GatewayError::Unauthorized("invalid session token".to_string()));
    }

    let claims: Value = URL_SAFE_NO_PAD
        .decode(payload)
        .ok()
        .and_then(|raw| serde_json::from_slice(&raw).ok())
        .ok_or_else(|| GatewayError::Unauthorized("malformed session token".to_string()))?;

    if let Some(exp) = claims.get("exp").and_then(|e| e.as_i64()) {
        if exp < chrono::Utc::now().timestamp() {
            return Err(GatewayError::Unauthorized("session token expired".to_string()));
        }
    }
    if let Some(jti) = claims.get("jti").and_then(|j| j.as_str()) {
        if cache::shared().is_token_blacklisted(jti) {
            return Err(GatewayError::Unauthorized("session token revoked".to_string()));
        }
    }

    let user_id = claims
        .get("sub")
        .and_then(|s| match s {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| GatewayError::Unauthorized("session token missing subject".to_string()))?;

    Ok(AuthPrincipal {
        user_id,
        config_type: None,
        beta: claims.get("beta").and_then(|b| b.as_i64()).unwrap_or(0) == 1,
        trust_level: claims.get("trust_level").and_then(|t| t.as_i64()).unwrap_or(0),
    })
}

fn lookup_api_key(candidate: &str) -> GatewayResult<Option<AuthPrincipal>> {
    let conn = crate::db::open_conn()?;
    let mut stmt = conn.prepare_cached(
        "select user_id, api_key, config_type, beta, trust_level from gateway_api_keys",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, i64>(4)?,
        ))
    })?;

    for row in rows {
        let (user_id, stored_key, config_type, beta, trust_level) = row?;
        if secrets_equal(&stored_key, candidate) {
            return Ok(Some(AuthPrincipal {
                user_id,
                config_type: config_type.as_deref().and_then(Provider::from_tag),
                beta: beta == 1,
                trust_level,
            }));
        }
    }
    Ok(None)
}

/// Authenticate the request from its headers.
pub fn authenticate(headers: &HeaderMap) -> GatewayResult<AuthPrincipal> {
    let token = bearer_token(headers)
        .or_else(|| api_key_from_headers(headers))
        .ok_or_else(|| GatewayError::Unauthorized("missing credentials".to_string()))?;

    if looks_like_jwt(&token) {
        return verify_session_token(&token);
    }
    lookup_api_key(&token)?
        .ok_or_else(|| GatewayError::Unauthorized("unknown API key".to_string()))
}

/// Resolve the effective config type: API-key marker first, then the
/// `X-Api-Type` header on session auth, then the antigravity default.
pub fn resolve_config_type(principal: &AuthPrincipal, headers: &HeaderMap) -> Provider {
    if let Some(provider) = principal.config_type {
        return provider;
    }
    headers
        .get("x-api-type")
        .and_then(|v| v.to_str().ok())
        .and_then(Provider::from_tag)
        .unwrap_or(Provider::Antigravity)
}

/// Kiro is gated behind the beta program (trust level 3 passes too).
pub fn enforce_provider_gate(principal: &AuthPrincipal, provider: Provider) -> GatewayResult<()> {
    if provider == Provider::Kiro && !principal.beta && principal.trust_level < 3 {
        return Err(GatewayError::Forbidden(
            "the Kiro pool is limited to beta program users".to_string(),
        ));
    }
    Ok(())
}

/// Mint a session token for tests and local tooling.
pub fn issue_session_token(user_id: i64, beta: bool, trust_level: i64, ttl_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": user_id,
        "beta": if beta { 1 } else { 0 },
        "trust_level": trust_level,
        "exp": chrono::Utc::now().timestamp() + ttl_secs,
        "jti": uuid::Uuid::new_v4().simple().to_string(),
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());

    let secret = &crate::config::load().jwt_secret_key;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{header}.{payload}.{signature}")
}

/// Register an API key row (used by tests and provisioning tooling).
pub fn register_api_key(
    user_id: i64,
    api_key: &str,
    config_type: Option<Provider>,
    beta: bool,
    trust_level: i64,
) -> GatewayResult<()> {
    let conn = crate::db::open_conn()?;
    conn.execute(
        "insert into gateway_api_keys (user_id, api_key, config_type, beta, trust_level, created_at)
         values (?1, ?2, ?3, ?4, ?5, ?6)
         on conflict(api_key) do update set user_id = excluded.user_id,
             config_type = excluded.config_type, beta = excluded.beta,
             trust_level = excluded.trust_level",
        params![
            user_id,
            api_key,
            config_type.map(|p| p.as_tag()),
            beta as i64,
            trust_level,
            chrono::Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn session_token_round_trip() {
        let token = issue_session_token(7, true, 0, 3600);
        let headers = headers_with(&[("authorization", &format!("Bearer {token}"))]);
        let principal = authenticate(&headers).unwrap();
        assert_eq!(principal.user_id, 7);
        assert!(principal.beta);
        assert!(principal.config_type.is_none());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = issue_session_token(7, false, 0, 3600);
        let tampered = format!("{}x", token);
        let headers = headers_with(&[("authorization", &format!("Bearer {tampered}"))]);
        assert!(authenticate(&headers).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue_session_token(7, false, 0, -10);
        let headers = headers_with(&[("authorization", &format!("Bearer {token}"))]);
        assert!(matches!(
            authenticate(&headers),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_credentials_is_unauthorized() {
        assert!(matches!(
            authenticate(&HeaderMap::new()),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn config_type_resolution_order() {
        let key_principal = AuthPrincipal {
            user_id: 1,
            config_type: Some(Provider::Codex),
            beta: false,
            trust_level: 0,
        };
        // key marker wins over the header
        let headers = headers_with(&[("x-api-type", "kiro")]);
        assert_eq!(resolve_config_type(&key_principal, &headers), Provider::Codex);

        let session_principal = AuthPrincipal {
            user_id: 1,
            config_type: None,
            beta: false,
            trust_level: 0,
        };
        assert_eq!(
            resolve_config_type(&session_principal, &headers),
            Provider::Kiro
        );
        assert_eq!(
            resolve_config_type(&session_principal, &HeaderMap::new()),
            Provider::Antigravity
        );
    }

    #[test]
    fn kiro_gate_requires_beta_or_trust() {
        let plain = AuthPrincipal {
            user_id: 1,
            config_type: None,
            beta: false,
            trust_level: 0,
        };
        assert!(enforce_provider_gate(&plain, Provider::Kiro).is_err());
        assert!(enforce_provider_gate(&plain, Provider::Codex).is_ok());

        let beta = AuthPrincipal { beta: true, ..plain.clone() };
        assert!(enforce_provider_gate(&beta, Provider::Kiro).is_ok());

        let trusted = AuthPrincipal { trust_level: 3, ..plain };
        assert!(enforce_provider_gate(&trusted, Provider::Kiro).is_ok());
    }
}
