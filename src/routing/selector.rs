//! Round-robin account selection with per-key cooldowns.
//!
//! Shared mutable state is two maps (cursors and cooldowns) behind a single
//! mutex. Selection holds the lock only for {read cursor, pick candidate,
//! advance cursor}; the outbound HTTP call always happens outside it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::accounts::Account;
use crate::error::{GatewayError, GatewayResult};

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

const CURSOR_WRAP: u64 = u64::MAX - 1024;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub account: Account,
    pub project: Option<String>,
}

impl Candidate {
    pub fn cooldown_key(&self, model: &str) -> String {
        cooldown_key(self.account.id, self.project.as_deref(), model)
    }
}

pub fn normalize_model_key(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}

pub fn cursor_key(user_id: i64, model: &str) -> String {
    format!("{user_id}:{}", normalize_model_key(model))
}

pub fn cooldown_key(account_id: i64, project: Option<&str>, model: &str) -> String {
    format!(
        "{account_id}:{}:{}",
        project.unwrap_or(""),
        normalize_model_key(model)
    )
}

/// Expand enabled accounts into selectable candidates. Providers with a
/// project scope get one candidate per configured project id.
pub fn build_candidates(enabled: Vec<Account>) -> GatewayResult<Vec<Candidate>> {
    if enabled.is_empty() {
        return Err(GatewayError::NoAccountAvailable { earliest: None });
    }

    let requires_project = enabled
        .first()
        .map(|a| a.provider.requires_project())
        .unwrap_or(false);

    if !requires_project {
        return Ok(enabled
            .into_iter()
            .map(|account| Candidate {
                account,
                project: None,
            })
            .collect());
    }

    let mut candidates = Vec::new();
    let mut has_missing_project = false;
    for account in enabled {
        let projects = account.project_ids();
        if projects.is_empty() {
            has_missing_project = true;
            continue;
        }
        for project in projects {
            candidates.push(Candidate {
                account: account.clone(),
                project: Some(project),
            });
        }
    }

    if candidates.is_empty() {
        if has_missing_project {
            return Err(GatewayError::MissingCredentialField("project_id".to_string()));
        }
        return Err(GatewayError::NoAccountAvailable { earliest: None });
    }
    Ok(candidates)
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    until: DateTime<Utc>,
    backoff_level: u32,
}

#[derive(Default)]
pub struct RoutingState {
    cursors: HashMap<String, u64>,
    cooldowns: HashMap<String, CooldownEntry>,
}

impl RoutingState {
    fn cleanup_expired(&mut self, now: DateTime<Utc>) {
        // Expired entries keep their backoff level until the next success
        // clears it, so repeated failures continue to escalate.
        self.cooldowns.retain(|_, e| e.until > now || e.backoff_level > 0);
    }

    /// Pick one candidate by round-robin over the not-cooling subset.
    pub fn select<'a>(
        &mut self,
        user_id: i64,
        model: &str,
        candidates: &'a [Candidate],
        exclude: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> GatewayResult<&'a Candidate> {
        self.cleanup_expired(now);

        let mut available: Vec<&Candidate> = Vec::with_capacity(candidates.len());
        let mut earliest: Option<DateTime<Utc>> = None;

        for candidate in candidates {
            let key = candidate.cooldown_key(model);
            if exclude.contains(&key) {
                continue;
            }
            if let Some(entry) = self.cooldowns.get(&key) {
                if entry.until > now {
                    earliest = match earliest {
                        Some(e) if e <= entry.until => Some(e),
                        _ => Some(entry.until),
                    };
                    continue;
                }
            }
            available.push(candidate);
        }

        if available.is_empty() {
            return Err(GatewayError::NoAccountAvailable { earliest });
        }

        let key = cursor_key(user_id, model);
        let cursor = self.cursors.get(&key).copied().unwrap_or(0);
        let cursor = if cursor >= CURSOR_WRAP { 0 } else { cursor };
        self.cursors.insert(key, cursor + 1);
        Ok(available[(cursor as usize) % available.len()])
    }

    /// Record a rate-limit hit. `retry_at` (Retry-After or a quota reset
    /// time) wins when it is in the future; otherwise exponential backoff
    /// runs BASE << level capped at MAX.
    pub fn mark_cooldown(
        &mut self,
        key: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        self.cleanup_expired(now);

        if let Some(at) = retry_at.filter(|at| *at > now) {
            self.cooldowns.insert(
                key.to_string(),
                CooldownEntry {
                    until: at,
                    backoff_level: 0,
                },
            );
            return at;
        }

        let level = self
            .cooldowns
            .get(key)
            .map(|e| e.backoff_level)
            .unwrap_or(0);
        // MAX is 1800s, so shifting past 11 always saturates.
        let seconds = BACKOFF_BASE.as_secs() << level.min(11);
        let seconds = seconds.clamp(BACKOFF_BASE.as_secs(), BACKOFF_MAX.as_secs());
        let next_level = if seconds >= BACKOFF_MAX.as_secs() {
            level
        } else {
            level + 1
        };

        let until = now + chrono::Duration::seconds(seconds as i64);
        self.cooldowns.insert(
            key.to_string(),
            CooldownEntry {
                until,
                backoff_level: next_level,
            },
        );
        until
    }

    /// A 2xx clears the cooldown and resets the backoff level.
    pub fn clear_cooldown(&mut self, key: &str) {
        self.cooldowns.remove(key);
    }

    pub fn cooldown_until(&self, key: &str) -> Option<DateTime<Utc>> {
        self.cooldowns.get(key).map(|e| e.until)
    }

    pub fn backoff_level(&self, key: &str) -> u32 {
        self.cooldowns.get(key).map(|e| e.backoff_level).unwrap_or(0)
    }
}

static ROUTING: Lazy<Mutex<RoutingState>> = Lazy::new(|| Mutex::new(RoutingState::default()));

pub fn with_routing_state<T>(f: impl FnOnce(&mut RoutingState) -> T) -> T {
    let mut state = ROUTING.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut state)
}

pub fn select_candidate(
    user_id: i64,
    model: &str,
    candidates: &[Candidate],
    exclude: &HashSet<String>,
) -> GatewayResult<Candidate> {
    with_routing_state(|state| {
        state
            .select(user_id, model, candidates, exclude, Utc::now())
            .map(|c| c.clone())
    })
}

pub fn mark_cooldown(key: &str, retry_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    with_routing_state(|state| state.mark_cooldown(key, retry_at, Utc::now()))
}

pub fn clear_cooldown(key: &str) {
    with_routing_state(|state| state.clear_cooldown(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Provider;

    fn account(id: i64, provider: Provider) -> Account {
        Account {
            id,
            user_id: 1,
            provider,
            provider_external_id: Some(format!("ext-{id}")),
            account_name: format!("acct-{id}"),
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

    fn candidates(n: i64) -> Vec<Candidate> {
        (1..=n)
            .map(|id| Candidate {
                account: account(id, Provider::Codex),
                project: None,
            })
            .collect()
    }

    #[test]
    fn round_robin_is_fair() {
        let mut state = RoutingState::default();
        let pool = candidates(3);
        let exclude = HashSet::new();
        let now = Utc::now();

        let mut counts = HashMap::new();
        for _ in 0..9 {
            let picked = state.select(1, "gpt-5-codex", &pool, &exclude, now).unwrap();
            *counts.entry(picked.account.id).or_insert(0) += 1;
        }
        for id in 1..=3 {
            assert_eq!(counts[&id], 3, "candidate {id} not picked fairly");
        }
    }

    #[test]
    fn cursor_is_per_user_model() {
        let mut state = RoutingState::default();
        let pool = candidates(2);
        let exclude = HashSet::new();
        let now = Utc::now();

        let a = state.select(1, "m1", &pool, &exclude, now).unwrap().account.id;
        let b = state.select(1, "m2", &pool, &exclude, now).unwrap().account.id;
        // Independent cursors both start at the first candidate.
        assert_eq!(a, b);
    }

    #[test]
    fn cooling_candidates_are_skipped() {
        let mut state = RoutingState::default();
        let pool = candidates(2);
        let exclude = HashSet::new();
        let now = Utc::now();

        let key = pool[0].cooldown_key("m");
        state.mark_cooldown(&key, Some(now + chrono::Duration::seconds(30)), now);

        for _ in 0..4 {
            let picked = state.select(1, "m", &pool, &exclude, now).unwrap();
            assert_eq!(picked.account.id, 2);
        }
    }

    #[test]
    fn exhaustion_reports_earliest_recovery() {
        let mut state = RoutingState::default();
        let pool = candidates(2);
        let exclude = HashSet::new();
        let now = Utc::now();

        let later = now + chrono::Duration::seconds(120);
        let sooner = now + chrono::Duration::seconds(30);
        state.mark_cooldown(&pool[0].cooldown_key("m"), Some(later), now);
        state.mark_cooldown(&pool[1].cooldown_key("m"), Some(sooner), now);

        match state.select(1, "m", &pool, &exclude, now) {
            Err(GatewayError::NoAccountAvailable { earliest: Some(at) }) => {
                assert_eq!(at, sooner)
            }
            other => panic!("expected NoAccountAvailable, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_wins_and_resets_backoff() {
        let mut state = RoutingState::default();
        let now = Utc::now();
        let retry_at = now + chrono::Duration::seconds(2);

        let until = state.mark_cooldown("k", Some(retry_at), now);
        assert_eq!(until, retry_at);
        assert_eq!(state.backoff_level("k"), 0);
    }

    #[test]
    fn backoff_doubles_until_max() {
        let mut state = RoutingState::default();
        let now = Utc::now();

        let mut prev = 0i64;
        for i in 0..6 {
            let until = state.mark_cooldown("k", None, now);
            let delay = (until - now).num_seconds();
            assert_eq!(delay, 1 << i);
            assert!(prev == 0 || delay >= 2 * prev);
            prev = delay;
        }
    }

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        let mut state = RoutingState::default();
        let now = Utc::now();
        for _ in 0..40 {
            state.mark_cooldown("k", None, now);
        }
        let until = state.mark_cooldown("k", None, now);
        assert_eq!((until - now).num_seconds(), BACKOFF_MAX.as_secs() as i64);
    }

    #[test]
    fn clear_resets_level() {
        let mut state = RoutingState::default();
        let now = Utc::now();
        for _ in 0..3 {
            state.mark_cooldown("k", None, now);
        }
        state.clear_cooldown("k");
        let until = state.mark_cooldown("k", None, now);
        assert_eq!((until - now).num_seconds(), 1);
    }

    #[test]
    fn project_expansion_for_scoped_providers() {
        let mut a = account(1, Provider::GeminiCli);
        a.project_id = Some("p1,p2,ALL".to_string());
        let out = build_candidates(vec![a]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].project.as_deref(), Some("p1"));
        assert_eq!(out[1].project.as_deref(), Some("p2"));
    }

    #[test]
    fn missing_project_is_a_named_error() {
        let a = account(1, Provider::GeminiCli);
        match build_candidates(vec![a]) {
            Err(GatewayError::MissingCredentialField(field)) => assert_eq!(field, "project_id"),
            other => panic!("expected MissingCredentialField, got {other:?}"),
        }
    }

    #[test]
    fn no_accounts_is_no_account_available() {
        match build_candidates(Vec::new()) {
            Err(GatewayError::NoAccountAvailable { earliest: None }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
