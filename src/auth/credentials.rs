//! Credential JSON normalization and token claim extraction.
//!
//! Every provider stores the same logical credential shape. Field-name
//! aliasing (camelCase vs snake_case) is resolved here, at the ingress
//! boundary; the stored form is always snake_case and empty strings become
//! null before storage.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

fn string_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = obj.get(*name) {
            if let Some(s) = v.as_str() {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

impl Credentials {
    /// Build from any imported/exported credential JSON. Unknown keys are
    /// dropped; camelCase aliases resolve to the canonical snake_case form.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        Self {
            credential_type: string_field(obj, &["type"]),
            refresh_token: string_field(obj, &["refresh_token", "refreshToken"]),
            access_token: string_field(obj, &["access_token", "accessToken"]),
            id_token: string_field(obj, &["id_token", "idToken"]),
            client_id: string_field(obj, &["client_id", "clientId"]),
            client_secret: string_field(obj, &["client_secret", "clientSecret"]),
            region: string_field(obj, &["region"]),
            auth_region: string_field(obj, &["auth_region", "authRegion"]),
            api_region: string_field(obj, &["api_region", "apiRegion"]),
            project_id: string_field(obj, &["project_id", "projectId", "project"]),
            account_id: string_field(obj, &["account_id", "accountId"]),
            email: string_field(obj, &["email"]),
            expires_at: string_field(obj, &["expires_at", "expiresAt", "expired", "expiry"]),
        }
    }

    pub fn from_json_str(raw: &str) -> Self {
        serde_json::from_str::<Value>(raw)
            .map(|v| Self::from_value(&v))
            .unwrap_or_default()
    }

    pub fn to_storage_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.expires_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }
}

/// Decode JWT payload claims without verifying the signature. Extraction
/// only; the gateway never trusts these claims for authorization.
pub fn decode_jwt_claims(token: &str) -> Value {
    let mut parts = token.split('.');
    let (_header, payload) = match (parts.next(), parts.next()) {
        (Some(h), Some(p)) if !p.is_empty() => (h, p),
        _ => return Value::Object(Map::new()),
    };

    URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .ok()
        .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenAiProfile {
    pub email: Option<String>,
    pub account_id: Option<String>,
    pub plan_type: Option<String>,
}

/// Pull email / ChatGPT account id / plan type out of OpenAI id_token claims.
pub fn extract_openai_profile(claims: &Value) -> OpenAiProfile {
    let email = claims
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let auth_info = claims
        .get("https://api.openai.com/auth")
        .and_then(|v| v.as_object());

    let account_id = auth_info
        .and_then(|a| a.get("chatgpt_account_id").and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        // user_id is more stable in some tokens
        .or_else(|| auth_info.and_then(|a| a.get("user_id").and_then(|v| v.as_str())))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let plan_type = auth_info
        .and_then(|a| a.get("chatgpt_plan_type").and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    OpenAiProfile {
        email,
        account_id,
        plan_type,
    }
}

/// Any of the subscription fields containing POWER or ENTERPRISE marks an
/// enterprise plan; no precedence between the fields.
pub fn is_enterprise_plan(subscription: Option<&str>, subscription_type: Option<&str>) -> bool {
    [subscription, subscription_type]
        .iter()
        .flatten()
        .map(|s| s.to_ascii_uppercase())
        .any(|s| s.contains("POWER") || s.contains("ENTERPRISE"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn camel_case_aliases_resolve() {
        let creds = Credentials::from_value(&json!({
            "refreshToken": "rt",
            "accessToken": "at",
            "projectId": "p-1",
            "authRegion": "us-east-1"
        }));
        assert_eq!(creds.refresh_token.as_deref(), Some("rt"));
        assert_eq!(creds.access_token.as_deref(), Some("at"));
        assert_eq!(creds.project_id.as_deref(), Some("p-1"));
        assert_eq!(creds.auth_region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn snake_case_wins_when_both_present() {
        let creds = Credentials::from_value(&json!({
            "refresh_token": "snake",
            "refreshToken": "camel"
        }));
        assert_eq!(creds.refresh_token.as_deref(), Some("snake"));
    }

    #[test]
    fn empty_strings_normalize_to_none() {
        let creds = Credentials::from_value(&json!({
            "refresh_token": "rt",
            "access_token": "",
            "email": "   "
        }));
        assert_eq!(creds.access_token, None);
        assert_eq!(creds.email, None);
    }

    #[test]
    fn storage_json_is_snake_case_without_nulls() {
        let creds = Credentials::from_value(&json!({"refreshToken": "rt", "type": "codex"}));
        let raw = creds.to_storage_json();
        assert!(raw.contains("\"refresh_token\":\"rt\""));
        assert!(raw.contains("\"type\":\"codex\""));
        assert!(!raw.contains("null"));
    }

    fn make_jwt(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.fakesig")
    }

    #[test]
    fn claims_decode_without_signature_check() {
        let token = make_jwt(&json!({
            "email": "user@example.com",
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acct-42",
                "chatgpt_plan_type": "plus"
            }
        }));
        let claims = decode_jwt_claims(&token);
        let profile = extract_openai_profile(&claims);
        assert_eq!(profile.email.as_deref(), Some("user@example.com"));
        assert_eq!(profile.account_id.as_deref(), Some("acct-42"));
        assert_eq!(profile.plan_type.as_deref(), Some("plus"));
    }

    #[test]
    fn user_id_fallback_when_account_id_missing() {
        let token = make_jwt(&json!({
            "https://api.openai.com/auth": {"user_id": "user-7"}
        }));
        let profile = extract_openai_profile(&decode_jwt_claims(&token));
        assert_eq!(profile.account_id.as_deref(), Some("user-7"));
    }

    #[test]
    fn malformed_tokens_decode_to_empty_claims() {
        assert_eq!(decode_jwt_claims("garbage"), json!({}));
        assert_eq!(decode_jwt_claims("a.b.c"), json!({}));
        assert_eq!(decode_jwt_claims(""), json!({}));
    }

    #[test]
    fn enterprise_detection_any_field_matches() {
        assert!(is_enterprise_plan(Some("POWER_USER"), None));
        assert!(is_enterprise_plan(None, Some("enterprise-annual")));
        assert!(is_enterprise_plan(Some("free"), Some("Enterprise")));
        assert!(!is_enterprise_plan(Some("plus"), Some("pro")));
        assert!(!is_enterprise_plan(None, None));
    }
}
