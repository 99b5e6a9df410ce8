use std::{net::IpAddr, time::Duration};

use lru_time_cache::LruCache;
use parking_lot::Mutex;

/// TTL-bounded hostname-to-address cache. Grounded on the teacher's use of
/// `lru_time_cache::LruCache` in `socks5/forward.rs`, which applies the same
/// crate to bound a connection map by recency rather than by a hard count.
pub(crate) struct DnsCache {
    inner: Mutex<LruCache<String, IpAddr>>,
}

impl DnsCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::with_expiry_duration_and_capacity(ttl, 4096)),
        }
    }

    pub(crate) fn get(&self, host: &str) -> Option<IpAddr> {
        self.inner.lock().get(host).copied()
    }

    pub(crate) fn insert(&self, host: String, ip: IpAddr) {
        self.inner.lock().insert(host, ip);
    }
}
