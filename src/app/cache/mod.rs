//! Optional HTTP response cache (spec §4.6's "Optional HTTP response
//! caching" collaborator, D1). The forwarder must survive cache misses,
//! partial responses, and cache-subsystem failures unchanged, so every
//! method here returns `Option`/`()` rather than `Result` — a cache failure
//! degrades silently to a miss instead of propagating.

mod disk;
mod memory;

use std::sync::Arc;

use bytes::Bytes;

use crate::cli::{CacheMode, CliArgs};

/// Byte-addressable response cache keyed by `(host, path)`. A trait object
/// rather than an enum since admission policy varies by backend
/// (`enhanced_cache` gates static-content-type filtering) and callers never
/// need to match on which backend is active.
pub(crate) trait ResponseCache: Send + Sync {
    fn get(&self, host: &str, path: &str) -> Option<Bytes>;
    fn set(&self, host: &str, path: &str, content_type: Option<&str>, body: Bytes);
}

/// No-op cache used when the dashboard/cache subsystem is disabled
/// entirely; keeps the forwarder's cache-lookup call sites unconditional.
#[derive(Default)]
pub(crate) struct NullCache;

impl ResponseCache for NullCache {
    fn get(&self, _host: &str, _path: &str) -> Option<Bytes> {
        None
    }

    fn set(&self, _host: &str, _path: &str, _content_type: Option<&str>, _body: Bytes) {}
}

pub(crate) fn build(args: &CliArgs) -> Arc<dyn ResponseCache> {
    match args.cache_mode {
        CacheMode::Memory => Arc::new(memory::MemoryCache::new(
            std::time::Duration::from_secs(args.cache_ttl),
            args.enhanced_cache,
        )),
        CacheMode::DiskCache => match disk::DiskCache::new(
            std::time::Duration::from_secs(args.cache_ttl),
            args.enhanced_cache,
        ) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                tracing::warn!(%err, "failed to initialize disk cache, falling back to memory cache");
                Arc::new(memory::MemoryCache::new(
                    std::time::Duration::from_secs(args.cache_ttl),
                    args.enhanced_cache,
                ))
            }
        },
    }
}
