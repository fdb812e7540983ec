//! Z.AI TTS and Image dispatchers.
//!
//! Both are simple bearer-token upstreams. Non-streaming TTS output is
//! saved under the artifact directory, which is pruned to the retention
//! count on startup and again after every generation.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::accounts::Account;
use crate::auth::credentials::Credentials;
use crate::crypto::decrypt_secret;
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::client;

fn token_of(account: &Account) -> GatewayResult<String> {
    let plain = decrypt_secret(&account.credentials)?;
    let creds = Credentials::from_json_str(&plain);
    creds
        .access_token
        .or(creds.refresh_token)
        .ok_or_else(|| GatewayError::MissingCredentialField("access_token".to_string()))
}

fn artifact_dir() -> PathBuf {
    crate::config::load().zai_tts_artifact_dir.clone()
}

/// Keep only the newest `keep` files in the artifact directory.
pub fn prune_artifacts(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter_map(|p| {
            let modified = std::fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();

    files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in files.into_iter().skip(keep) {
        if std::fs::remove_file(&stale).is_ok() {
            crate::logger::debug("zai", &format!("pruned stale artifact {}", stale.display()));
        }
    }
}

/// Startup hook: make the artifact directory and apply retention.
pub fn cleanup_artifacts_on_startup() {
    let dir = artifact_dir();
    std::fs::create_dir_all(&dir).ok();
    prune_artifacts(&dir, crate::config::load().zai_tts_file_keep_count);
}

/// Generate speech; returns the saved artifact path for non-streaming use.
pub async fn generate_tts(account: &Account, voice_id: &str, text: &str) -> GatewayResult<PathBuf> {
    let settings = crate::config::load();
    let token = token_of(account)?;
    let url = format!("{}/api/tts/generate", settings.zai_tts_base_url.trim_end_matches('/'));

    let http = client::default_client()?;
    let response = http
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("User-Agent", settings.zai_tts_user_agent.as_str())
        .json(&json!({"voice_id": voice_id, "text": text}))
        .send()
        .await
        .map_err(client::map_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let audio = response.bytes().await.map_err(client::map_reqwest_error)?;
    let dir = artifact_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| GatewayError::Internal(format!("cannot create artifact dir: {e}")))?;
    let path = dir.join(format!("tts-{}.mp3", uuid::Uuid::new_v4().simple()));
    std::fs::write(&path, &audio)
        .map_err(|e| GatewayError::Internal(format!("cannot write artifact: {e}")))?;

    prune_artifacts(&dir, settings.zai_tts_file_keep_count);
    Ok(path)
}

/// Generate an image; the upstream returns JSON with a hosted URL.
pub async fn generate_image(account: &Account, prompt: &str, size: Option<&str>) -> GatewayResult<Value> {
    let settings = crate::config::load();
    let token = token_of(account)?;
    let url = format!(
        "{}/api/images/generate",
        settings.zai_image_base_url.trim_end_matches('/')
    );

    let mut body = json!({"prompt": prompt});
    if let Some(size) = size {
        body["size"] = json!(size);
    }

    let http = client::default_client()?;
    let response = http
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("User-Agent", settings.zai_image_user_agent.as_str())
        .json(&body)
        .send()
        .await
        .map_err(client::map_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|e| GatewayError::Network(format!("image response malformed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("zai-prune-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();

        for i in 0..5 {
            let path = dir.join(format!("f{i}.mp3"));
            std::fs::write(&path, b"x").unwrap();
            // Distinct mtimes so the sort is deterministic.
            let time = std::time::SystemTime::now() - std::time::Duration::from_secs(100 - i * 10);
            let file = std::fs::File::open(&path).unwrap();
            file.set_modified(time).ok();
        }

        prune_artifacts(&dir, 2);
        let remaining: Vec<_> = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn prune_handles_missing_dir() {
        prune_artifacts(Path::new("/nonexistent/zai-prune-test"), 3);
    }
}
