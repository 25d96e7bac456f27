//! Policy cache and rate limiter backing the governance gateway.
//!
//! Both stores are in-memory stand-ins for what would be a networked cache
//! (Redis, in the system this was modeled on) — the reference
//! implementation reachable without a running backend, with the same
//! degrade-on-error contract a networked client would need: reads fall back
//! to conservative defaults, writes report failure, nothing ever panics the
//! caller.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use aegis_core::PolicyRule;

struct Entry {
    rule: PolicyRule,
    expires_at: Instant,
}

/// Keyed, priority-ordered store of policy rules with a bounded TTL.
///
/// `store`/`get`/`delete`/`refresh` never fail outright: a storage fault is
/// logged and the conservative return value (`false`, empty, or partial
/// count) is produced instead, matching the engine's requirement to keep
/// functioning, degraded, when the cache is unreachable.
pub struct PolicyCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl PolicyCache {
    /// Construct an empty cache with the given TTL for every stored rule.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    /// Upsert a rule, resetting its TTL. Returns `true` on success.
    pub fn store(&self, rule: PolicyRule) -> bool {
        let mut guard = match self.entries.write() {
            Ok(g) => g,
            Err(_) => {
                tracing::warn!("policy cache store: lock poisoned");
                return false;
            }
        };
        let expires_at = Instant::now() + self.ttl;
        guard.insert(rule.rule_id.clone(), Entry { rule, expires_at });
        true
    }

    /// Look up a rule by id. Returns `None` if absent or expired.
    #[must_use]
    pub fn get(&self, rule_id: &str) -> Option<PolicyRule> {
        let guard = self.entries.read().ok()?;
        let entry = guard.get(rule_id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.rule.clone())
    }

    /// Enabled, non-expired rules ordered by ascending priority (lower
    /// priority value wins). Ties preserve no particular order; callers must
    /// not depend on tie order since aggregate scoring is order-independent.
    #[must_use]
    pub fn list_active(&self) -> Vec<PolicyRule> {
        let Ok(guard) = self.entries.read() else {
            tracing::warn!("policy cache list_active: lock poisoned");
            return Vec::new();
        };
        let now = Instant::now();
        let mut rules: Vec<PolicyRule> = guard
            .values()
            .filter(|e| e.expires_at > now && e.rule.enabled)
            .map(|e| e.rule.clone())
            .collect();
        rules.sort_by_key(|r| r.priority);
        rules
    }

    /// Remove an entry. Idempotent — deleting an absent id is not an error.
    pub fn delete(&self, rule_id: &str) -> bool {
        let Ok(mut guard) = self.entries.write() else {
            tracing::warn!("policy cache delete: lock poisoned");
            return false;
        };
        guard.remove(rule_id);
        true
    }

    /// Atomic-enough replace: clear the index, then insert every rule in
    /// `rules`. Returns the number of rules successfully stored; a store
    /// fault for an individual rule does not abort the rest.
    pub fn refresh(&self, rules: Vec<PolicyRule>) -> usize {
        let Ok(mut guard) = self.entries.write() else {
            tracing::warn!("policy cache refresh: lock poisoned");
            return 0;
        };
        guard.clear();
        let expires_at = Instant::now() + self.ttl;
        let mut stored = 0;
        for rule in rules {
            guard.insert(rule.rule_id.clone(), Entry { rule, expires_at });
            stored += 1;
        }
        stored
    }
}

struct Window {
    count: u64,
    window_start: Instant,
}

/// Current rate-limit status for an agent, exposed for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub count: u64,
    pub remaining: u64,
    pub window_resets_in: Duration,
}

/// Per-agent fixed-window request counter.
pub struct RateLimiter {
    quota: u64,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Construct a limiter allowing `quota` requests per `window`.
    #[must_use]
    pub fn new(quota: u64, window: Duration) -> Self {
        Self { quota, window, windows: Mutex::new(HashMap::new()) }
    }

    /// Atomically increment `agent_id`'s counter, initializing the window on
    /// first use, and report whether the request is allowed.
    ///
    /// On lock poisoning (store error) this fails open: `allowed = true`,
    /// `remaining = quota`, and the fault is logged for observability
    /// rather than propagated.
    pub fn check(&self, agent_id: &str) -> (bool, u64) {
        let mut guard = match self.windows.lock() {
            Ok(g) => g,
            Err(_) => {
                tracing::warn!(agent_id, "rate limiter: lock poisoned, failing open");
                return (true, self.quota);
            }
        };
        let now = Instant::now();
        let entry = guard.entry(agent_id.to_string()).or_insert_with(|| Window {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        let allowed = entry.count <= self.quota;
        let remaining = self.quota.saturating_sub(entry.count);
        (allowed, remaining)
    }

    /// Read-only snapshot of an agent's current window, without incrementing
    /// it. Used by health/observability surfaces, not by the hot path.
    #[must_use]
    pub fn status(&self, agent_id: &str) -> RateLimitStatus {
        let Ok(guard) = self.windows.lock() else {
            tracing::warn!(agent_id, "rate limiter status: lock poisoned");
            return RateLimitStatus { count: 0, remaining: self.quota, window_resets_in: self.window };
        };
        match guard.get(agent_id) {
            Some(entry) => {
                let elapsed = Instant::now().duration_since(entry.window_start);
                let remaining_window = self.window.saturating_sub(elapsed);
                RateLimitStatus {
                    count: entry.count,
                    remaining: self.quota.saturating_sub(entry.count),
                    window_resets_in: remaining_window,
                }
            }
            None => RateLimitStatus { count: 0, remaining: self.quota, window_resets_in: self.window },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::ActionType;
    use serde_json::Map;

    fn rule(id: &str, priority: u32, enabled: bool) -> PolicyRule {
        PolicyRule {
            rule_id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            action_types: vec![ActionType::Payment],
            conditions: Map::new(),
            risk_score_modifier: 0.1,
            enabled,
            priority,
        }
    }

    #[test]
    fn list_active_orders_by_priority() {
        let cache = PolicyCache::new(Duration::from_secs(300));
        cache.store(rule("b", 20, true));
        cache.store(rule("a", 10, true));
        let ids: Vec<String> = cache.list_active().into_iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn list_active_skips_disabled_rules() {
        let cache = PolicyCache::new(Duration::from_secs(300));
        cache.store(rule("disabled", 5, false));
        assert!(cache.list_active().is_empty());
    }

    #[test]
    fn list_active_on_empty_cache_is_empty() {
        let cache = PolicyCache::new(Duration::from_secs(300));
        assert!(cache.list_active().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = PolicyCache::new(Duration::from_secs(300));
        cache.store(rule("a", 1, true));
        assert!(cache.delete("a"));
        assert!(cache.delete("a"));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn refresh_replaces_the_whole_set() {
        let cache = PolicyCache::new(Duration::from_secs(300));
        cache.store(rule("stale", 1, true));
        let stored = cache.refresh(vec![rule("fresh", 1, true)]);
        assert_eq!(stored, 1);
        assert!(cache.get("stale").is_none());
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn rate_limiter_allows_up_to_quota() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let (allowed1, remaining1) = limiter.check("agent-a");
        let (allowed2, remaining2) = limiter.check("agent-a");
        let (allowed3, remaining3) = limiter.check("agent-a");
        assert!(allowed1 && allowed2);
        assert!(!allowed3);
        assert_eq!(remaining1, 1);
        assert_eq!(remaining2, 0);
        assert_eq!(remaining3, 0);
    }

    #[test]
    fn rate_limiter_tracks_agents_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").0);
        assert!(limiter.check("b").0);
        assert!(!limiter.check("a").0);
    }

    #[test]
    fn rate_limiter_status_does_not_consume_quota() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        limiter.check("agent-a");
        let status = limiter.status("agent-a");
        assert_eq!(status.count, 1);
        assert_eq!(status.remaining, 4);
        let (_, remaining_after) = limiter.check("agent-a");
        assert_eq!(remaining_after, 3);
    }
}
