//! Short-lived response cache. Entries expire by TTL only; new mail does not
//! invalidate them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String, ttl: Duration);
}

/// In-process cache living as long as the pipeline that owns it.
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for TtlCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            let now = Instant::now();
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            entries.insert(key.to_string(), (value, now + ttl));
        }
    }
}

/// SHA-256 hex over the request parts, unambiguous across part boundaries.
pub fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::from_millis(20));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn cache_key_separates_parts() {
        assert_ne!(cache_key(&["ab", "c"]), cache_key(&["a", "bc"]));
        assert_eq!(cache_key(&["x"]), cache_key(&["x"]));
        assert_eq!(cache_key(&["x"]).len(), 64);
    }
}
