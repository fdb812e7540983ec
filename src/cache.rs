//! In-process KV cache with per-entry TTL.
//!
//! Backed by a moka sync cache with an expiry policy that honors the TTL
//! stored on each entry. Every write carries an explicit TTL; nothing in
//! here is durable and callers must tolerate eviction at any time.

use std::time::{Duration, Instant};

use moka::sync::Cache as MokaCache;
use moka::Expiry;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

const MAX_ENTRIES: u64 = 100_000;

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct Cache {
    inner: MokaCache<String, Entry>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: MokaCache::builder()
                .max_capacity(MAX_ENTRIES)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).map(|e| e.value)
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.inner.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                ttl,
            },
        );
    }

    /// SET NX: store only when the key is absent. Returns true when this
    /// call created the entry, which is what lock acquisition checks.
    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let entry = self.inner.entry(key.to_string()).or_insert(Entry {
            value: value.to_string(),
            ttl,
        });
        entry.is_fresh()
    }

    pub fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        serde_json::from_str(&raw).ok()
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => {
                self.set(key, &raw, ttl);
                true
            }
            Err(_) => false,
        }
    }

    /// Fetch-and-delete, used for one-shot state like PKCE sessions so a
    /// replayed callback cannot reuse them.
    pub fn take_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_json(key);
        if value.is_some() {
            self.delete(key);
        }
        value
    }

    pub fn blacklist_token(&self, token_jti: &str, ttl: Duration) {
        self.set(&format!("blacklist:{token_jti}"), "1", ttl);
    }

    pub fn is_token_blacklisted(&self, token_jti: &str) -> bool {
        self.exists(&format!("blacklist:{token_jti}"))
    }

    pub fn store_refresh_token<T: Serialize>(&self, token_jti: &str, data: &T, ttl: Duration) -> bool {
        self.set_json(&format!("refresh_token:{token_jti}"), data, ttl)
    }

    pub fn get_refresh_token_data<T: DeserializeOwned>(&self, token_jti: &str) -> Option<T> {
        self.get_json(&format!("refresh_token:{token_jti}"))
    }

    pub fn revoke_refresh_token(&self, token_jti: &str) {
        self.delete(&format!("refresh_token:{token_jti}"));
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: Lazy<Cache> = Lazy::new(Cache::new);

/// The process-wide cache instance.
pub fn shared() -> &'static Cache {
    &SHARED
}

// Key layout. Everything routing-related lives under a stable prefix so the
// cache contents stay inspectable while debugging.

pub fn pkce_state_key(state: &str) -> String {
    format!("pkce_state:{state}")
}

pub fn device_code_key(state: &str) -> String {
    format!("device_code:{state}")
}

pub fn models_cache_key(user_id: i64) -> String {
    format!("models_cache:{user_id}")
}

pub fn plugin_key_key(user_id: i64) -> String {
    format!("plugin_key:{user_id}")
}

pub fn last_used_throttle_key(provider: &str, account_id: i64) -> String {
    format!("last_used_throttle:{provider}:{account_id}")
}

pub fn refresh_lock_key(provider: &str, account_id: i64) -> String {
    format!("refresh_lock:{provider}:{account_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.delete("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn entries_expire() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_millis(20));
        assert!(cache.exists("k"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn set_if_absent_is_first_writer_wins() {
        let cache = Cache::new();
        assert!(cache.set_if_absent("lock", "a", Duration::from_secs(60)));
        assert!(!cache.set_if_absent("lock", "b", Duration::from_secs(60)));
        assert_eq!(cache.get("lock").as_deref(), Some("a"));
    }

    #[test]
    fn json_round_trip() {
        let cache = Cache::new();
        cache.set_json("j", &serde_json::json!({"a": 1}), Duration::from_secs(60));
        let v: serde_json::Value = cache.get_json("j").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn take_json_is_one_shot() {
        let cache = Cache::new();
        cache.set_json("once", &serde_json::json!({"s": "x"}), Duration::from_secs(60));
        let first: Option<serde_json::Value> = cache.take_json("once");
        assert!(first.is_some());
        let second: Option<serde_json::Value> = cache.take_json("once");
        assert!(second.is_none());
    }
}
