//! SQLite storage bootstrap.
//!
//! One table per provider for accounts, all sharing the same column
//! skeleton, plus usage logs/counters and per-user settings. Connections
//! are opened per operation; transaction boundaries are owned by callers.

use rusqlite::Connection;

use crate::accounts::Provider;

pub fn open_conn() -> rusqlite::Result<Connection> {
    let path = crate::config::load().database_path.clone();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn = Connection::open(path)?;
    optimize_connection(&conn);
    Ok(conn)
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "cache_size", "-64000").ok();
    conn.pragma_update(None, "temp_store", "MEMORY").ok();
    conn.pragma_update(None, "busy_timeout", "5000").ok();
}

fn account_table_ddl(table: &str) -> String {
    format!(
        "create table if not exists {table} (
            id integer primary key autoincrement,
            user_id integer not null,
            provider_external_id text,
            account_name text not null default '',
            email text,
            credentials text not null,
            status integer not null default 1,
            token_expires_at integer,
            last_refresh_at integer,
            last_used_at integer,
            limit_5h_used_percent integer,
            limit_5h_reset_at integer,
            limit_week_used_percent integer,
            limit_week_reset_at integer,
            project_id text,
            region text,
            plan_type text,
            created_at integer not null,
            updated_at integer not null
        )"
    )
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    for provider in Provider::ALL {
        let table = provider.accounts_table();
        conn.execute(&account_table_ddl(table), [])?;
        conn.execute(
            &format!(
                "create unique index if not exists idx_{table}_user_external
                 on {table}(user_id, provider_external_id)
                 where provider_external_id is not null"
            ),
            [],
        )?;
        conn.execute(
            &format!("create index if not exists idx_{table}_user on {table}(user_id, id)"),
            [],
        )?;
    }

    conn.execute(
        "create table if not exists usage_logs (
            id integer primary key autoincrement,
            user_id integer not null,
            endpoint text not null,
            method text not null,
            model_name text,
            config_type text,
            stream integer not null default 0,
            success integer not null default 1,
            status_code integer,
            error_message text,
            input_tokens integer not null default 0,
            output_tokens integer not null default 0,
            cached_tokens integer not null default 0,
            total_tokens integer not null default 0,
            quota_consumed real not null default 0,
            duration_ms integer not null default 0,
            client_app text,
            request_body text,
            created_at integer not null
        )",
        [],
    )?;
    conn.execute(
        "create index if not exists idx_usage_logs_user_config_created
         on usage_logs(user_id, config_type, created_at desc)",
        [],
    )?;

    conn.execute(
        "create table if not exists usage_counters (
            user_id integer not null,
            config_type text not null,
            total_requests integer not null default 0,
            success_requests integer not null default 0,
            failed_requests integer not null default 0,
            input_tokens integer not null default 0,
            output_tokens integer not null default 0,
            cached_tokens integer not null default 0,
            total_tokens integer not null default 0,
            total_quota_consumed real not null default 0,
            total_duration_ms integer not null default 0,
            updated_at integer not null,
            primary key (user_id, config_type)
        )",
        [],
    )?;

    conn.execute(
        "create table if not exists user_settings (
            user_id integer primary key,
            account_channel text,
            dashboard_channel text,
            updated_at integer not null
        )",
        [],
    )?;

    conn.execute(
        "create table if not exists gateway_api_keys (
            id integer primary key autoincrement,
            user_id integer not null,
            api_key text not null unique,
            config_type text,
            beta integer not null default 0,
            trust_level integer not null default 0,
            created_at integer not null
        )",
        [],
    )?;

    conn.execute(
        "create table if not exists codex_fallback_configs (
            user_id integer primary key,
            base_url text not null,
            api_key text not null,
            is_active integer not null default 1,
            updated_at integer not null
        )",
        [],
    )?;

    Ok(())
}

pub fn init() -> rusqlite::Result<()> {
    let conn = open_conn()?;
    init_schema(&conn)
}
