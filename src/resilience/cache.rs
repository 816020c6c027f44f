//! TTL result cache for idempotent tool calls.
//!
//! Caching is opt-in: only (server, tool) pairs with a rule are ever stored.
//! Keys are SHA-256 digests of the server id, tool name and canonical JSON
//! arguments, so argument key order does not matter.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::mcp::ServerId;

/// Canonical hash of (server, tool, arguments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(server_id: &ServerId, tool: &str, arguments: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(arguments, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(server_id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        hasher.update(canonical.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialise with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    server_id: ServerId,
    tool: String,
}

/// Opt-in TTL cache shared by concurrent invocations.
pub struct ResultCache<V> {
    rules: DashMap<(ServerId, String), Duration>,
    entries: DashMap<CacheKey, CacheEntry<V>>,
    max_entries: usize,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            rules: DashMap::new(),
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Allow results of `server/tool` to be cached for `ttl`.
    pub fn enable(&self, server_id: &ServerId, tool: &str, ttl: Duration) {
        self.rules.insert((server_id.clone(), tool.to_string()), ttl);
    }

    pub fn disable(&self, server_id: &ServerId, tool: &str) {
        self.rules.remove(&(server_id.clone(), tool.to_string()));
        self.invalidate_tool(server_id, tool);
    }

    /// TTL if `server/tool` is cacheable.
    pub fn ttl_for(&self, server_id: &ServerId, tool: &str) -> Option<Duration> {
        self.rules
            .get(&(server_id.clone(), tool.to_string()))
            .map(|ttl| *ttl)
    }

    /// Live value for `key`; an expired entry is removed.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    /// Store a value for `ttl`, evicting to stay within the size bound.
    pub fn put(&self, key: CacheKey, value: V, ttl: Duration, server_id: &ServerId, tool: &str) {
        if ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                server_id: server_id.clone(),
                tool: tool.to_string(),
            },
        );
    }

    fn make_room(&self) {
        let purged = self.purge_expired();
        if purged > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            debug!(cache.key = %key, "evicting earliest-expiring entry");
            self.entries.remove(&key);
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Drop every cached result of `server/tool`.
    pub fn invalidate_tool(&self, server_id: &ServerId, tool: &str) {
        self.entries
            .retain(|_, entry| !(entry.server_id == *server_id && entry.tool == tool));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id() -> ServerId {
        ServerId::from("srv")
    }

    #[test]
    fn test_key_ignores_object_order() {
        let a = CacheKey::new(&id(), "t", &json!({"a": 1, "b": {"y": [1, 2], "x": null}}));
        let b = CacheKey::new(&id(), "t", &json!({"b": {"x": null, "y": [1, 2]}, "a": 1}));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_key_distinguishes_inputs() {
        let args = json!({"q": "rust"});
        let base = CacheKey::new(&id(), "search", &args);
        assert_ne!(base, CacheKey::new(&ServerId::from("other"), "search", &args));
        assert_ne!(base, CacheKey::new(&id(), "lookup", &args));
        assert_ne!(base, CacheKey::new(&id(), "search", &json!({"q": "go"})));
        // Array order is significant.
        assert_ne!(
            CacheKey::new(&id(), "t", &json!([1, 2])),
            CacheKey::new(&id(), "t", &json!([2, 1]))
        );
    }

    #[test]
    fn test_rules_are_opt_in() {
        let cache: ResultCache<u32> = ResultCache::new(8);
        assert!(cache.ttl_for(&id(), "t").is_none());
        cache.enable(&id(), "t", Duration::from_secs(5));
        assert_eq!(cache.ttl_for(&id(), "t"), Some(Duration::from_secs(5)));
        cache.disable(&id(), "t");
        assert!(cache.ttl_for(&id(), "t").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_respects_ttl() {
        let cache = ResultCache::new(8);
        let key = CacheKey::new(&id(), "t", &json!({}));
        cache.put(key.clone(), "v".to_string(), Duration::from_secs(10), &id(), "t");
        assert_eq!(cache.get(&key).as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get(&key).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_evicts_expired_then_soonest() {
        let cache = ResultCache::new(2);
        let k = |n: u32| CacheKey::new(&id(), "t", &json!({ "n": n }));

        cache.put(k(1), 1, Duration::from_secs(1), &id(), "t");
        cache.put(k(2), 2, Duration::from_secs(100), &id(), "t");
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.put(k(3), 3, Duration::from_secs(50), &id(), "t");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k(1)).is_none());

        // Nothing expired: the earliest-expiring entry goes.
        cache.put(k(4), 4, Duration::from_secs(200), &id(), "t");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k(3)).is_none());
        assert_eq!(cache.get(&k(2)), Some(2));
        assert_eq!(cache.get(&k(4)), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_invalidate() {
        let cache = ResultCache::new(16);
        let other = ServerId::from("other");
        cache.put(CacheKey::new(&id(), "a", &json!(1)), 1, Duration::from_secs(1), &id(), "a");
        cache.put(CacheKey::new(&id(), "b", &json!(1)), 2, Duration::from_secs(60), &id(), "b");
        cache.put(CacheKey::new(&other, "b", &json!(1)), 3, Duration::from_secs(60), &other, "b");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);

        cache.invalidate_tool(&id(), "b");
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
