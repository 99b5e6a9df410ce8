use std::time::Duration;

use bytes::Bytes;
use lru_time_cache::LruCache;
use parking_lot::Mutex;

use super::ResponseCache;

const MAX_ENTRY_BYTES: usize = 2 * 1024 * 1024;
const STATIC_CONTENT_TYPES: &[&str] = &[
    "image/",
    "text/css",
    "application/javascript",
    "font/",
    "application/font",
];

/// In-process TTL cache, the default backing store for D1. Reuses the same
/// `lru_time_cache::LruCache` the teacher applies to its connection map in
/// `socks5/forward.rs`.
pub(crate) struct MemoryCache {
    entries: Mutex<LruCache<(String, String), Bytes>>,
    enhanced: bool,
}

impl MemoryCache {
    pub(crate) fn new(ttl: Duration, enhanced: bool) -> Self {
        Self {
            entries: Mutex::new(LruCache::with_expiry_duration_and_capacity(ttl, 512)),
            enhanced,
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, host: &str, path: &str) -> Option<Bytes> {
        self.entries
            .lock()
            .get(&(host.to_string(), path.to_string()))
            .cloned()
    }

    fn set(&self, host: &str, path: &str, content_type: Option<&str>, body: Bytes) {
        if body.len() > MAX_ENTRY_BYTES {
            return;
        }
        if self.enhanced {
            let admitted = content_type
                .map(|ct| STATIC_CONTENT_TYPES.iter().any(|prefix| ct.starts_with(prefix)))
                .unwrap_or(false);
            if !admitted {
                return;
            }
        }
        self.entries
            .lock()
            .insert((host.to_string(), path.to_string()), body);
    }
}
