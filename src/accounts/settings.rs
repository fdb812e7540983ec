//! Per-user UI preferences: the default channel for the account-management
//! surface and for the usage dashboard. Either is a provider tag or null.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Provider;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    pub account_channel: Option<String>,
    pub dashboard_channel: Option<String>,
}

fn normalize_channel(value: Option<&str>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .and_then(Provider::from_tag)
        .map(|p| p.as_tag().to_string())
}

pub fn get(conn: &Connection, user_id: i64) -> rusqlite::Result<UserSettings> {
    let mut stmt = conn.prepare_cached(
        "select account_channel, dashboard_channel from user_settings where user_id = ?1",
    )?;
    let row = stmt
        .query_row(params![user_id], |r| {
            Ok(UserSettings {
                account_channel: r.get(0)?,
                dashboard_channel: r.get(1)?,
            })
        })
        .optional()?;
    Ok(row.unwrap_or_default())
}

/// Upsert; unknown provider tags are stored as null rather than rejected.
pub fn set(conn: &Connection, user_id: i64, settings: &UserSettings) -> rusqlite::Result<UserSettings> {
    let account_channel = normalize_channel(settings.account_channel.as_deref());
    let dashboard_channel = normalize_channel(settings.dashboard_channel.as_deref());

    conn.execute(
        "insert into user_settings (user_id, account_channel, dashboard_channel, updated_at)
         values (?1, ?2, ?3, ?4)
         on conflict(user_id) do update set account_channel = excluded.account_channel,
             dashboard_channel = excluded.dashboard_channel,
             updated_at = excluded.updated_at",
        params![user_id, account_channel, dashboard_channel, Utc::now().timestamp()],
    )?;
    get(conn, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_memory_db;

    #[test]
    fn defaults_to_null_channels() {
        let conn = open_memory_db();
        let settings = get(&conn, 1).unwrap();
        assert_eq!(settings, UserSettings::default());
    }

    #[test]
    fn upsert_round_trip() {
        let conn = open_memory_db();
        let saved = set(
            &conn,
            1,
            &UserSettings {
                account_channel: Some("codex".to_string()),
                dashboard_channel: Some("gemini-cli".to_string()),
            },
        )
        .unwrap();
        assert_eq!(saved.account_channel.as_deref(), Some("codex"));

        let updated = set(
            &conn,
            1,
            &UserSettings {
                account_channel: None,
                dashboard_channel: Some("kiro".to_string()),
            },
        )
        .unwrap();
        assert_eq!(updated.account_channel, None);
        assert_eq!(updated.dashboard_channel.as_deref(), Some("kiro"));
    }

    #[test]
    fn unknown_tags_become_null() {
        let conn = open_memory_db();
        let saved = set(
            &conn,
            2,
            &UserSettings {
                account_channel: Some("not-a-provider".to_string()),
                dashboard_channel: None,
            },
        )
        .unwrap();
        assert_eq!(saved.account_channel, None);
    }
}
