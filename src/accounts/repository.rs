//! Per-provider account CRUD.
//!
//! Pure row plumbing: no business validation, no commits beyond the single
//! statement. The facade owns transaction boundaries.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Account, Provider};

pub struct AccountRepository<'c> {
    conn: &'c Connection,
    provider: Provider,
}

fn ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp())
}

fn from_ts(v: Option<i64>) -> Option<DateTime<Utc>> {
    v.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

impl<'c> AccountRepository<'c> {
    pub fn new(conn: &'c Connection, provider: Provider) -> Self {
        Self { conn, provider }
    }

    fn table(&self) -> &'static str {
        self.provider.accounts_table()
    }

    fn map_row(&self, row: &Row<'_>) -> rusqlite::Result<Account> {
        Ok(Account {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            provider: self.provider,
            provider_external_id: row.get("provider_external_id")?,
            account_name: row.get("account_name")?,
            email: row.get("email")?,
            credentials: row.get("credentials")?,
            status: row.get("status")?,
            token_expires_at: from_ts(row.get("token_expires_at")?),
            last_refresh_at: from_ts(row.get("last_refresh_at")?),
            last_used_at: from_ts(row.get("last_used_at")?),
            limit_5h_used_percent: row.get("limit_5h_used_percent")?,
            limit_5h_reset_at: from_ts(row.get("limit_5h_reset_at")?),
            limit_week_used_percent: row.get("limit_week_used_percent")?,
            limit_week_reset_at: from_ts(row.get("limit_week_reset_at")?),
            project_id: row.get("project_id")?,
            region: row.get("region")?,
            plan_type: row.get("plan_type")?,
            created_at: from_ts(row.get("created_at")?).unwrap_or_else(Utc::now),
            updated_at: from_ts(row.get("updated_at")?).unwrap_or_else(Utc::now),
        })
    }

    /// All accounts for a user, id ascending. Insertion order is the stable
    /// tie-break for selection.
    pub fn list_by_user(&self, user_id: i64) -> rusqlite::Result<Vec<Account>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select * from {} where user_id = ?1 order by id asc",
            self.table()
        ))?;
        let rows = stmt.query_map(params![user_id], |r| self.map_row(r))?;
        rows.collect()
    }

    pub fn list_enabled_by_user(&self, user_id: i64) -> rusqlite::Result<Vec<Account>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select * from {} where user_id = ?1 and status = 1 order by id asc",
            self.table()
        ))?;
        let rows = stmt.query_map(params![user_id], |r| self.map_row(r))?;
        rows.collect()
    }

    /// Authorization boundary: a user can only address their own accounts.
    pub fn get_by_id_and_user(&self, account_id: i64, user_id: i64) -> rusqlite::Result<Option<Account>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select * from {} where id = ?1 and user_id = ?2",
            self.table()
        ))?;
        stmt.query_row(params![account_id, user_id], |r| self.map_row(r))
            .optional()
    }

    pub fn get_by_user_and_external_id(
        &self,
        user_id: i64,
        external_id: &str,
    ) -> rusqlite::Result<Option<Account>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select * from {} where user_id = ?1 and provider_external_id = ?2",
            self.table()
        ))?;
        stmt.query_row(params![user_id, external_id], |r| self.map_row(r))
            .optional()
    }

    pub fn get_by_user_and_email(&self, user_id: i64, email: &str) -> rusqlite::Result<Option<Account>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "select * from {} where user_id = ?1 and email = ?2 order by id asc limit 1",
            self.table()
        ))?;
        stmt.query_row(params![user_id, email], |r| self.map_row(r))
            .optional()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        user_id: i64,
        provider_external_id: Option<&str>,
        account_name: &str,
        email: Option<&str>,
        credentials: &str,
        token_expires_at: Option<DateTime<Utc>>,
        project_id: Option<&str>,
        region: Option<&str>,
        plan_type: Option<&str>,
    ) -> rusqlite::Result<Account> {
        let now = Utc::now();
        self.conn.execute(
            &format!(
                "insert into {} (user_id, provider_external_id, account_name, email, credentials,
                                 status, token_expires_at, last_refresh_at, project_id, region,
                                 plan_type, created_at, updated_at)
                 values (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                self.table()
            ),
            params![
                user_id,
                provider_external_id,
                account_name,
                email,
                credentials,
                ts(token_expires_at),
                now.timestamp(),
                project_id,
                region,
                plan_type,
                now.timestamp(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(self
            .get_by_id_and_user(id, user_id)?
            .expect("row just inserted"))
    }

    /// Atomic write-back after a successful refresh or re-import: blob,
    /// profile fields, and refresh timestamps move together.
    #[allow(clippy::too_many_arguments)]
    pub fn update_credentials_and_profile(
        &self,
        account_id: i64,
        user_id: i64,
        credentials: &str,
        email: Option<&str>,
        provider_external_id: Option<&str>,
        plan_type: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        last_refresh_at: DateTime<Utc>,
    ) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!(
                "update {} set credentials = ?1,
                        email = coalesce(?2, email),
                        provider_external_id = coalesce(?3, provider_external_id),
                        plan_type = coalesce(?4, plan_type),
                        token_expires_at = ?5,
                        last_refresh_at = ?6,
                        updated_at = ?7
                 where id = ?8 and user_id = ?9",
                self.table()
            ),
            params![
                credentials,
                email,
                provider_external_id,
                plan_type,
                ts(token_expires_at),
                last_refresh_at.timestamp(),
                Utc::now().timestamp(),
                account_id,
                user_id,
            ],
        )
    }

    pub fn update_limits(
        &self,
        account_id: i64,
        user_id: i64,
        limit_5h_used_percent: Option<i64>,
        limit_5h_reset_at: Option<DateTime<Utc>>,
        limit_week_used_percent: Option<i64>,
        limit_week_reset_at: Option<DateTime<Utc>>,
    ) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!(
                "update {} set limit_5h_used_percent = ?1,
                        limit_5h_reset_at = ?2,
                        limit_week_used_percent = ?3,
                        limit_week_reset_at = ?4,
                        updated_at = ?5
                 where id = ?6 and user_id = ?7",
                self.table()
            ),
            params![
                limit_5h_used_percent,
                ts(limit_5h_reset_at),
                limit_week_used_percent,
                ts(limit_week_reset_at),
                Utc::now().timestamp(),
                account_id,
                user_id,
            ],
        )
    }

    pub fn update_status(&self, account_id: i64, user_id: i64, status: i64) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!(
                "update {} set status = ?1, updated_at = ?2 where id = ?3 and user_id = ?4",
                self.table()
            ),
            params![status, Utc::now().timestamp(), account_id, user_id],
        )
    }

    pub fn update_name(&self, account_id: i64, user_id: i64, account_name: &str) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!(
                "update {} set account_name = ?1, updated_at = ?2 where id = ?3 and user_id = ?4",
                self.table()
            ),
            params![account_name, Utc::now().timestamp(), account_id, user_id],
        )
    }

    pub fn update_last_used(&self, account_id: i64, at: DateTime<Utc>) -> rusqlite::Result<usize> {
        self.conn.execute(
            &format!("update {} set last_used_at = ?1 where id = ?2", self.table()),
            params![at.timestamp(), account_id],
        )
    }

    pub fn delete(&self, account_id: i64, user_id: i64) -> rusqlite::Result<bool> {
        let n = self.conn.execute(
            &format!("delete from {} where id = ?1 and user_id = ?2", self.table()),
            params![account_id, user_id],
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::open_memory_db;

    fn create_basic(repo: &AccountRepository<'_>, user_id: i64, external: &str) -> Account {
        repo.create(
            user_id,
            Some(external),
            "test",
            Some("a@example.com"),
            "sealed-blob",
            None,
            None,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn list_orders_by_insertion() {
        let conn = open_memory_db();
        let repo = AccountRepository::new(&conn, Provider::Codex);
        create_basic(&repo, 7, "acc-b");
        create_basic(&repo, 7, "acc-a");
        let listed = repo.list_by_user(7).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].id < listed[1].id);
        assert_eq!(listed[0].provider_external_id.as_deref(), Some("acc-b"));
    }

    #[test]
    fn user_cannot_address_foreign_account() {
        let conn = open_memory_db();
        let repo = AccountRepository::new(&conn, Provider::Codex);
        let account = create_basic(&repo, 1, "acc-1");
        assert!(repo.get_by_id_and_user(account.id, 2).unwrap().is_none());
        assert!(!repo.delete(account.id, 2).unwrap());
        assert!(repo.get_by_id_and_user(account.id, 1).unwrap().is_some());
    }

    #[test]
    fn dedup_lookup_by_external_id() {
        let conn = open_memory_db();
        let repo = AccountRepository::new(&conn, Provider::Codex);
        create_basic(&repo, 1, "acc-x");
        assert!(repo.get_by_user_and_external_id(1, "acc-x").unwrap().is_some());
        assert!(repo.get_by_user_and_external_id(1, "acc-y").unwrap().is_none());
        assert!(repo.get_by_user_and_external_id(2, "acc-x").unwrap().is_none());
    }

    #[test]
    fn credential_update_moves_refresh_fields_together() {
        let conn = open_memory_db();
        let repo = AccountRepository::new(&conn, Provider::Codex);
        let account = create_basic(&repo, 1, "acc-1");

        let expires = Utc::now() + chrono::Duration::hours(1);
        let refreshed_at = Utc::now();
        repo.update_credentials_and_profile(
            account.id,
            1,
            "new-blob",
            None,
            None,
            Some("plus"),
            Some(expires),
            refreshed_at,
        )
        .unwrap();

        let reloaded = repo.get_by_id_and_user(account.id, 1).unwrap().unwrap();
        assert_eq!(reloaded.credentials, "new-blob");
        // coalesce keeps the existing email when the refresh brought none
        assert_eq!(reloaded.email.as_deref(), Some("a@example.com"));
        assert_eq!(reloaded.plan_type.as_deref(), Some("plus"));
        assert_eq!(
            reloaded.token_expires_at.map(|d| d.timestamp()),
            Some(expires.timestamp())
        );
        assert_eq!(
            reloaded.last_refresh_at.map(|d| d.timestamp()),
            Some(refreshed_at.timestamp())
        );
    }

    #[test]
    fn limits_round_trip() {
        let conn = open_memory_db();
        let repo = AccountRepository::new(&conn, Provider::GeminiCli);
        let account = create_basic(&repo, 1, "g-1");
        let reset = Utc::now() + chrono::Duration::hours(5);
        repo.update_limits(account.id, 1, Some(100), Some(reset), None, None)
            .unwrap();
        let reloaded = repo.get_by_id_and_user(account.id, 1).unwrap().unwrap();
        assert_eq!(reloaded.limit_5h_used_percent, Some(100));
        assert!(reloaded.is_frozen());
    }

    #[test]
    fn provider_tables_are_disjoint() {
        let conn = open_memory_db();
        let codex = AccountRepository::new(&conn, Provider::Codex);
        let kiro = AccountRepository::new(&conn, Provider::Kiro);
        create_basic(&codex, 1, "acc-1");
        assert!(kiro.list_by_user(1).unwrap().is_empty());
    }
}
