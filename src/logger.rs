//! Global logger.
//!
//! Leveled logging with batched persistence into a SQLite `logs` table and a
//! stderr mirror. Writes go through an mpsc channel so request paths never
//! block on the database.

use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

static INIT: Once = Once::new();

const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: String,
    pub source: String,
    pub message: String,
}

fn db_path() -> PathBuf {
    crate::config::load().database_path.clone()
}

fn open_conn() -> Option<Connection> {
    let path = db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Connection::open(path).ok()
}

fn ensure_schema(conn: &Connection) {
    conn.execute(
        "create table if not exists logs (id integer primary key autoincrement, timestamp integer, level text, source text, message text)",
        [],
    )
    .ok();
    conn.execute(
        "create index if not exists idx_logs_timestamp on logs(timestamp desc)",
        [],
    )
    .ok();
}

fn flush_batch(conn: &Connection, batch: &[LogMessage]) {
    if batch.is_empty() {
        return;
    }
    let _ = conn.execute_batch("BEGIN");
    for msg in batch {
        let _ = conn.execute(
            "insert into logs(timestamp, level, source, message) values(?, ?, ?, ?)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }
    let _ = conn.execute_batch("COMMIT");
}

fn writer_loop(rx: mpsc::Receiver<LogMessage>) {
    let Some(conn) = open_conn() else {
        return;
    };
    ensure_schema(&conn);

    let mut batch: Vec<LogMessage> = Vec::with_capacity(BATCH_SIZE);
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(msg) => {
                batch.push(msg);
                if batch.len() >= BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
                    flush_batch(&conn, &batch);
                    batch.clear();
                    last_flush = Instant::now();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_batch(&conn, &batch);
                batch.clear();
                last_flush = Instant::now();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                flush_batch(&conn, &batch);
                return;
            }
        }
    }
}

pub fn init() {
    INIT.call_once(|| {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut sender) = LOG_SENDER.write() {
            *sender = Some(tx);
        }
        std::thread::Builder::new()
            .name("hubgate-logger".to_string())
            .spawn(move || writer_loop(rx))
            .ok();
    });
}

fn log(level: LogLevel, source: &str, message: &str) {
    eprintln!("[{}] {}: {}", level.as_str(), source, message);

    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };
    if let Ok(sender) = LOG_SENDER.read() {
        if let Some(tx) = sender.as_ref() {
            let _ = tx.send(msg);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log(LogLevel::Error, source, message);
}

/// Log a request body when `DEBUG_LOG` is enabled. No-op otherwise.
pub fn debug_body(source: &str, body: &serde_json::Value) {
    if crate::config::load().debug_log {
        log(LogLevel::Debug, source, &format!("request body: {}", body));
    }
}

pub fn recent_logs(limit: i64) -> Vec<LogEntry> {
    let Some(conn) = open_conn() else {
        return Vec::new();
    };
    ensure_schema(&conn);
    let Ok(mut stmt) = conn.prepare_cached(
        "select id, timestamp, level, source, message from logs order by timestamp desc, id desc limit ?1",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map(params![limit], |r| {
        Ok(LogEntry {
            id: r.get(0)?,
            timestamp: r.get(1)?,
            level: r.get(2)?,
            source: r.get(3)?,
            message: r.get(4)?,
        })
    });
    match rows {
        Ok(rows) => rows.filter_map(|x| x.ok()).collect(),
        Err(_) => Vec::new(),
    }
}
