//! Account data model.
//!
//! Every upstream provider stores accounts in its own table, all sharing the
//! same column skeleton. Freeze state is derived from the limit columns, not
//! stored separately.

pub mod repository;
pub mod settings;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream provider pools. Doubles as the config-type tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Antigravity,
    Codex,
    Kiro,
    GeminiCli,
    Qwen,
    ZaiTts,
    ZaiImage,
}

impl Provider {
    pub const ALL: &'static [Provider] = &[
        Provider::Antigravity,
        Provider::Codex,
        Provider::Kiro,
        Provider::GeminiCli,
        Provider::Qwen,
        Provider::ZaiTts,
        Provider::ZaiImage,
    ];

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "antigravity" => Some(Provider::Antigravity),
            "codex" => Some(Provider::Codex),
            "kiro" => Some(Provider::Kiro),
            "gemini-cli" | "gemini_cli" | "geminicli" => Some(Provider::GeminiCli),
            "qwen" => Some(Provider::Qwen),
            "zai-tts" | "zai_tts" => Some(Provider::ZaiTts),
            "zai-image" | "zai_image" => Some(Provider::ZaiImage),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Provider::Antigravity => "antigravity",
            Provider::Codex => "codex",
            Provider::Kiro => "kiro",
            Provider::GeminiCli => "gemini-cli",
            Provider::Qwen => "qwen",
            Provider::ZaiTts => "zai-tts",
            Provider::ZaiImage => "zai-image",
        }
    }

    pub fn accounts_table(&self) -> &'static str {
        match self {
            Provider::Antigravity => "accounts_antigravity",
            Provider::Codex => "accounts_codex",
            Provider::Kiro => "accounts_kiro",
            Provider::GeminiCli => "accounts_gemini_cli",
            Provider::Qwen => "accounts_qwen",
            Provider::ZaiTts => "accounts_zai_tts",
            Provider::ZaiImage => "accounts_zai_image",
        }
    }

    /// Providers whose candidates are scoped to a project id.
    pub fn requires_project(&self) -> bool {
        matches!(self, Provider::GeminiCli)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Why an account is currently frozen. Week-limit wins over the 5h limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezeReason {
    Week,
    #[serde(rename = "5h")]
    FiveHour,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub provider: Provider,
    pub provider_external_id: Option<String>,
    pub account_name: String,
    pub email: Option<String>,
    /// Encrypted credential blob. Always non-empty ciphertext.
    #[serde(skip_serializing)]
    pub credentials: String,
    pub status: i64,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub limit_5h_used_percent: Option<i64>,
    pub limit_5h_reset_at: Option<DateTime<Utc>>,
    pub limit_week_used_percent: Option<i64>,
    pub limit_week_reset_at: Option<DateTime<Utc>>,
    /// Comma-separated GCP project ids (GeminiCLI only).
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub plan_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn freeze_reason(&self) -> Option<FreezeReason> {
        let now = Utc::now();

        if let Some(pct) = self.limit_week_used_percent {
            if pct >= 100 {
                match self.limit_week_reset_at {
                    None => return Some(FreezeReason::Week),
                    Some(reset_at) if reset_at > now => return Some(FreezeReason::Week),
                    Some(_) => {}
                }
            }
        }

        if let Some(pct) = self.limit_5h_used_percent {
            if pct >= 100 {
                match self.limit_5h_reset_at {
                    None => return Some(FreezeReason::FiveHour),
                    Some(reset_at) if reset_at > now => return Some(FreezeReason::FiveHour),
                    Some(_) => {}
                }
            }
        }

        None
    }

    pub fn frozen_until(&self) -> Option<DateTime<Utc>> {
        match self.freeze_reason()? {
            FreezeReason::Week => self.limit_week_reset_at,
            FreezeReason::FiveHour => self.limit_5h_reset_at,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self.freeze_reason() {
            None => false,
            Some(_) => match self.frozen_until() {
                // A frozen account without a known reset stays frozen.
                None => true,
                Some(until) => until > Utc::now(),
            },
        }
    }

    /// Usable iff enabled and not frozen.
    pub fn effective_status(&self) -> bool {
        self.status == 1 && !self.is_frozen()
    }

    /// Non-empty project ids, comma-separated; "ALL" is not a usable id.
    pub fn project_ids(&self) -> Vec<String> {
        self.project_id
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|p| p.trim())
            .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case("all"))
            .map(|p| p.to_string())
            .collect()
    }
}

/// Guarded status flip: enabling an account that is still frozen is
/// rejected, naming the freeze expiry so the caller knows when to retry.
pub fn update_status_guarded(
    conn: &rusqlite::Connection,
    provider: Provider,
    user_id: i64,
    account_id: i64,
    status: i64,
) -> crate::error::GatewayResult<Account> {
    use crate::error::GatewayError;

    let repo = repository::AccountRepository::new(conn, provider);
    let account = repo
        .get_by_id_and_user(account_id, user_id)?
        .ok_or_else(|| GatewayError::InvalidRequest("account not found".to_string()))?;

    if status == 1 && account.is_frozen() {
        let until = account
            .frozen_until()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(GatewayError::InvalidRequest(format!(
            "account is frozen until {until}; it cannot be enabled before the limit resets"
        )));
    }

    repo.update_status(account_id, user_id, status)?;
    repo.get_by_id_and_user(account_id, user_id)?
        .ok_or_else(|| GatewayError::Internal("account vanished during update".to_string()))
}

/// Default display name: first 3 chars of the email local part joined with
/// the first `-`-segment of the provider account id.
pub fn default_account_name(email: Option<&str>, external_id: Option<&str>) -> String {
    let email = email.unwrap_or("").trim();
    let local = email.split('@').next().unwrap_or("");
    let email_prefix: String = local.chars().take(3).collect();

    let external = external_id.unwrap_or("").trim();
    let account_prefix = external.split('-').next().unwrap_or("");

    match (email_prefix.is_empty(), account_prefix.is_empty()) {
        (false, false) => format!("{email_prefix}-{account_prefix}"),
        (false, true) => email_prefix,
        (true, false) => account_prefix.to_string(),
        (true, true) => {
            if email.is_empty() {
                "Account".to_string()
            } else {
                email.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn blank_account() -> Account {
        Account {
            id: 1,
            user_id: 1,
            provider: Provider::Codex,
            provider_external_id: Some("acc-1".to_string()),
            account_name: "test".to_string(),
            email: None,
            credentials: "sealed".to_string(),
            status: 1,
            token_expires_at: None,
            last_refresh_at: None,
            last_used_at: None,
            limit_5h_used_percent: None,
            limit_5h_reset_at: None,
            limit_week_used_percent: None,
            limit_week_reset_at: None,
            project_id: None,
            region: None,
            plan_type: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn enabled_account_is_effective() {
        let account = blank_account();
        assert!(!account.is_frozen());
        assert!(account.effective_status());
    }

    #[test]
    fn frozen_when_used_percent_full_and_reset_in_future() {
        let mut account = blank_account();
        account.limit_5h_used_percent = Some(100);
        account.limit_5h_reset_at = Some(Utc::now() + Duration::hours(1));
        assert_eq!(account.freeze_reason(), Some(FreezeReason::FiveHour));
        assert!(account.is_frozen());
        assert!(!account.effective_status());
    }

    #[test]
    fn not_frozen_when_reset_has_passed() {
        let mut account = blank_account();
        account.limit_5h_used_percent = Some(100);
        account.limit_5h_reset_at = Some(Utc::now() - Duration::hours(1));
        assert!(!account.is_frozen());
        assert!(account.effective_status());
    }

    #[test]
    fn week_limit_outranks_5h() {
        let mut account = blank_account();
        account.limit_5h_used_percent = Some(100);
        account.limit_5h_reset_at = Some(Utc::now() + Duration::hours(1));
        account.limit_week_used_percent = Some(100);
        account.limit_week_reset_at = Some(Utc::now() + Duration::days(3));
        assert_eq!(account.freeze_reason(), Some(FreezeReason::Week));
        assert_eq!(account.frozen_until(), account.limit_week_reset_at);
    }

    #[test]
    fn disabled_account_never_effective() {
        let mut account = blank_account();
        account.status = 0;
        assert!(!account.effective_status());
    }

    #[test]
    fn project_ids_skip_all_and_blanks() {
        let mut account = blank_account();
        account.project_id = Some("proj-a, ALL, ,proj-b".to_string());
        assert_eq!(account.project_ids(), vec!["proj-a", "proj-b"]);
    }

    #[test]
    fn enabling_a_frozen_account_is_rejected() {
        let conn = crate::db::test_support::open_memory_db();
        let repo = repository::AccountRepository::new(&conn, Provider::Codex);
        let account = repo
            .create(1, Some("x-1"), "t", None, "sealed", None, None, None, None)
            .unwrap();
        repo.update_status(account.id, 1, 0).unwrap();
        repo.update_limits(
            account.id,
            1,
            Some(100),
            Some(Utc::now() + Duration::hours(2)),
            None,
            None,
        )
        .unwrap();

        let err = update_status_guarded(&conn, Provider::Codex, 1, account.id, 1).unwrap_err();
        assert!(err.to_string().contains("frozen until"));

        // disabling is always allowed, and enabling works once thawed
        update_status_guarded(&conn, Provider::Codex, 1, account.id, 0).unwrap();
        repo.update_limits(account.id, 1, Some(100), Some(Utc::now() - Duration::hours(1)), None, None)
            .unwrap();
        let enabled = update_status_guarded(&conn, Provider::Codex, 1, account.id, 1).unwrap();
        assert_eq!(enabled.status, 1);
    }

    #[test]
    fn default_name_combines_email_and_id() {
        assert_eq!(
            default_account_name(Some("alice@example.com"), Some("acct-123-xyz")),
            "ali-acct"
        );
        assert_eq!(default_account_name(Some("bo@example.com"), None), "bo");
        assert_eq!(default_account_name(None, Some("team-9")), "team");
        assert_eq!(default_account_name(None, None), "Account");
    }
}
