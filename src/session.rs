//! Session registry (component C7): maps a transport flow to a stable
//! session identifier across the lifetime of that flow, with exactly
//! one bounded-eviction policy active (TTL or LRU) per
//! [`crate::config::SessionConfig`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use metrics::gauge;
use uuid::Uuid;

use crate::config::SessionConfig;

/// The canonical, endpoint-order-independent key for a transport flow
/// (spec §4.7): two peers observed from either direction resolve to the
/// same session.
pub fn flow_key(ip_a: &str, port_a: u16, ip_b: &str, port_b: u16) -> String {
    let (lo, hi) = if (ip_a, port_a) <= (ip_b, port_b) {
        ((ip_a, port_a), (ip_b, port_b))
    } else {
        ((ip_b, port_b), (ip_a, port_a))
    };
    format!("{}:{}-{}:{}", lo.0, lo.1, hi.0, hi.1)
}

enum Eviction {
    Ttl {
        ttl: Duration,
        last_seen: DashMap<String, Instant>,
    },
    Lru {
        cache: std::sync::Mutex<LruCache<String, ()>>,
    },
}

/// A striped, concurrent map from flow key to session UUID, bounded by
/// exactly one of a TTL or an LRU capacity per spec §4.7/§7.2.
pub struct SessionRegistry {
    sessions: DashMap<String, String>,
    eviction: Eviction,
    active_count: Arc<AtomicI64>,
}

impl SessionRegistry {
    /// Build a registry from a validated config. Panics are not
    /// possible here: [`crate::config::MelodyConfig::validate`] already
    /// guarantees exactly one of `max_sessions`/`session_ttl_seconds` is
    /// set before this is called.
    pub fn new(config: &SessionConfig) -> Self {
        let eviction = if let Some(ttl_seconds) = config.session_ttl_seconds {
            Eviction::Ttl {
                ttl: Duration::from_secs(ttl_seconds),
                last_seen: DashMap::new(),
            }
        } else {
            let capacity = config.max_sessions.unwrap_or(100_000).max(1);
            Eviction::Lru {
                cache: std::sync::Mutex::new(LruCache::new(
                    std::num::NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
                )),
            }
        };

        SessionRegistry {
            sessions: DashMap::new(),
            eviction,
            active_count: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Look up or allocate a session ID for `key`. Allocating bumps the
    /// active-session gauge; looking up an existing entry refreshes its
    /// TTL/LRU recency without changing the ID (spec §4.7 stability
    /// invariant).
    pub fn get_or_insert(&self, key: &str) -> String {
        match &self.eviction {
            Eviction::Ttl { ttl, last_seen } => {
                self.evict_expired(*ttl, last_seen);
                last_seen.insert(key.to_string(), Instant::now());
            }
            Eviction::Lru { cache } => {
                let mut cache = cache.lock().expect("lru cache lock poisoned");
                // `push` (unlike `put`) reports the entry it evicted to make
                // room, if any, so `sessions` can be kept in sync with the
                // cache's actual membership.
                if let Some((evicted_key, ())) = cache.push(key.to_string(), ()) {
                    if evicted_key != key {
                        self.sessions.remove(&evicted_key);
                        self.active_count.fetch_sub(1, Ordering::Relaxed);
                        gauge!("melody_sessions_active")
                            .set(self.active_count.load(Ordering::Relaxed) as f64);
                        metrics::counter!("melody_sessions_evicted").increment(1);
                    }
                }
            }
        }

        if let Some(existing) = self.sessions.get(key) {
            return existing.clone();
        }

        let id = Uuid::new_v4().to_string();
        self.sessions.insert(key.to_string(), id.clone());
        self.active_count.fetch_add(1, Ordering::Relaxed);
        gauge!("melody_sessions_active").set(self.active_count.load(Ordering::Relaxed) as f64);
        id
    }

    /// Always returns a freshly allocated, unregistered UUID: used for
    /// decoy-server events, which have no transport tuple to key on
    /// (spec §4.7).
    pub fn fresh_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn evict_expired(&self, ttl: Duration, last_seen: &DashMap<String, Instant>) {
        let now = Instant::now();
        let expired: Vec<String> = last_seen
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let count = expired.len() as i64;
        for key in expired {
            last_seen.remove(&key);
            self.sessions.remove(&key);
        }
        self.active_count.fetch_sub(count, Ordering::Relaxed);
        gauge!("melody_sessions_active").set(self.active_count.load(Ordering::Relaxed) as f64);
        metrics::counter!("melody_sessions_evicted").increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_key_is_endpoint_order_independent() {
        let a = flow_key("10.0.0.1", 51234, "10.0.0.2", 80);
        let b = flow_key("10.0.0.2", 80, "10.0.0.1", 51234);
        assert_eq!(a, b);
    }

    #[test]
    fn same_flow_returns_stable_session_id() {
        let registry = SessionRegistry::new(&SessionConfig {
            max_sessions: Some(10),
            session_ttl_seconds: None,
        });
        let key = flow_key("10.0.0.1", 51234, "10.0.0.2", 80);
        let first = registry.get_or_insert(&key);
        let second = registry.get_or_insert(&key);
        assert_eq!(first, second);
        assert_eq!(registry.active_sessions(), 1);
    }

    #[test]
    fn distinct_flows_get_distinct_ids() {
        let registry = SessionRegistry::new(&SessionConfig {
            max_sessions: Some(10),
            session_ttl_seconds: None,
        });
        let a = registry.get_or_insert(&flow_key("10.0.0.1", 1, "10.0.0.2", 2));
        let b = registry.get_or_insert(&flow_key("10.0.0.3", 3, "10.0.0.4", 4));
        assert_ne!(a, b);
    }

    #[test]
    fn ttl_eviction_drops_stale_sessions() {
        let registry = SessionRegistry::new(&SessionConfig {
            max_sessions: None,
            session_ttl_seconds: Some(0),
        });
        let key = flow_key("10.0.0.1", 1, "10.0.0.2", 2);
        registry.get_or_insert(&key);
        std::thread::sleep(Duration::from_millis(5));
        // Triggers eviction of the now-expired entry before inserting a new one.
        registry.get_or_insert(&flow_key("10.0.0.5", 5, "10.0.0.6", 6));
        assert_eq!(registry.active_sessions(), 1);
    }

    #[test]
    fn lru_eviction_drops_sessions_map_entry_too() {
        let registry = SessionRegistry::new(&SessionConfig {
            max_sessions: Some(1),
            session_ttl_seconds: None,
        });
        let first_key = flow_key("10.0.0.1", 1, "10.0.0.2", 2);
        let second_key = flow_key("10.0.0.3", 3, "10.0.0.4", 4);
        registry.get_or_insert(&first_key);
        registry.get_or_insert(&second_key);
        // Capacity is 1: inserting the second flow must evict the first from
        // both the LRU cache and the session map, not just the cache.
        assert_eq!(registry.active_sessions(), 1);
        assert!(registry.sessions.get(&second_key).is_some());
        assert!(registry.sessions.get(&first_key).is_none());
    }

    #[test]
    fn decoy_events_always_get_a_fresh_id() {
        let a = SessionRegistry::fresh_session_id();
        let b = SessionRegistry::fresh_session_id();
        assert_ne!(a, b);
    }
}
