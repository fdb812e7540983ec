//! Environment-driven configuration.
//!
//! All deployment inputs come from the process environment; `load()` reads
//! them once and hands out a shared snapshot.

use std::path::PathBuf;

use dirs::data_dir;
use once_cell::sync::Lazy;

pub const DEFAULT_CODEX_MODELS: &[&str] = &[
    "gpt-5-codex",
    "gpt-5.1-codex",
    "gpt-5.2-codex",
    "gpt-5.1-codex-mini",
    "gpt-5.1-codex-max",
];

#[derive(Clone, Debug)]
pub struct Settings {
    /// SQLite path. `DATABASE_URL` may be a bare path or `sqlite://` URL.
    pub database_path: PathBuf,
    /// Secret used to validate gateway session tokens.
    pub jwt_secret_key: String,
    /// Optional separate secret for refresh tokens (falls back to JWT secret).
    pub refresh_token_secret_key: Option<String>,
    /// Key material for the credential blob cipher.
    pub encryption_key: String,
    /// Outbound proxy URL. `CODEX_PROXY_URL` wins over `PROXY_URL`.
    pub proxy_url: Option<String>,
    /// Supported Codex model ids (JSON array or comma list in env).
    pub codex_supported_models: Vec<String>,
    pub zai_tts_base_url: String,
    pub zai_tts_user_agent: String,
    pub zai_image_base_url: String,
    pub zai_image_user_agent: String,
    /// How many non-streaming TTS audio files to keep on disk.
    pub zai_tts_file_keep_count: usize,
    /// Directory for locally stored TTS artifacts.
    pub zai_tts_artifact_dir: PathBuf,
    /// When true, request bodies are logged in full. Keep off in production.
    pub debug_log: bool,
    pub listen_addr: String,
}

impl Settings {
    pub fn refresh_secret(&self) -> &str {
        self.refresh_token_secret_key
            .as_deref()
            .unwrap_or(&self.jwt_secret_key)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn data_root() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("hubgate");
    std::fs::create_dir_all(&p).ok();
    p
}

fn database_path_from_env() -> PathBuf {
    match env_string("DATABASE_URL") {
        Some(raw) => {
            let stripped = raw
                .strip_prefix("sqlite://")
                .or_else(|| raw.strip_prefix("sqlite:"))
                .unwrap_or(&raw);
            PathBuf::from(stripped)
        }
        None => {
            let mut p = data_root();
            p.push("hubgate.db");
            p
        }
    }
}

/// Parse `CODEX_SUPPORTED_MODELS`: either a JSON array of strings or a
/// comma/newline-separated list. Duplicates are removed case-insensitively.
pub fn parse_model_list(raw: &str) -> Vec<String> {
    let value = raw.trim();
    if value.is_empty() {
        return Vec::new();
    }

    let items: Vec<String> = if value.starts_with('[') {
        match serde_json::from_str::<Vec<serde_json::Value>>(value) {
            Ok(parsed) => parsed
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => Vec::new(),
        }
    } else {
        value
            .replace('\n', ",")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.to_ascii_lowercase()) {
            out.push(item);
        }
    }
    out
}

fn load_settings() -> Settings {
    let codex_supported_models = env_string("CODEX_SUPPORTED_MODELS")
        .map(|raw| parse_model_list(&raw))
        .filter(|models| !models.is_empty())
        .unwrap_or_else(|| DEFAULT_CODEX_MODELS.iter().map(|s| s.to_string()).collect());

    let artifact_dir = env_string("ZAI_TTS_ARTIFACT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let mut p = data_root();
            p.push("tts");
            p
        });

    Settings {
        database_path: database_path_from_env(),
        jwt_secret_key: env_string("JWT_SECRET_KEY").unwrap_or_else(|| "dev-secret".to_string()),
        refresh_token_secret_key: env_string("REFRESH_TOKEN_SECRET_KEY"),
        encryption_key: env_string("CREDENTIALS_ENCRYPTION_KEY")
            .or_else(|| env_string("PLUGIN_API_ENCRYPTION_KEY"))
            .unwrap_or_else(|| "dev-encryption-key".to_string()),
        proxy_url: env_string("CODEX_PROXY_URL").or_else(|| env_string("PROXY_URL")),
        codex_supported_models,
        zai_tts_base_url: env_string("ZAI_TTS_BASE_URL")
            .unwrap_or_else(|| "https://audio.z.ai".to_string()),
        zai_tts_user_agent: env_string("ZAI_TTS_USER_AGENT")
            .unwrap_or_else(|| "Mozilla/5.0 AppleWebKit/537.36 Chrome/143 Safari/537".to_string()),
        zai_image_base_url: env_string("ZAI_IMAGE_BASE_URL")
            .unwrap_or_else(|| "https://image.z.ai".to_string()),
        zai_image_user_agent: env_string("ZAI_IMAGE_USER_AGENT")
            .unwrap_or_else(|| "Mozilla/5.0 AppleWebKit/537.36 Chrome/143 Safari/537".to_string()),
        zai_tts_file_keep_count: env_string("ZAI_TTS_FILE_KEEP_COUNT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
        zai_tts_artifact_dir: artifact_dir,
        debug_log: env_flag("DEBUG_LOG"),
        listen_addr: env_string("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:8787".to_string()),
    }
}

static SETTINGS: Lazy<Settings> = Lazy::new(load_settings);

pub fn load() -> &'static Settings {
    &SETTINGS
}
