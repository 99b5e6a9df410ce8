use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use super::ResponseCache;

const MAX_ENTRY_BYTES: u64 = 8 * 1024 * 1024;
const STATIC_CONTENT_TYPES: &[&str] = &[
    "image/",
    "text/css",
    "application/javascript",
    "font/",
    "application/font",
];

/// Best-effort disk-backed cache (`--cache-mode disk-cache`). Entries are
/// written via `tempfile::NamedTempFile::persist`, an atomic rename that
/// avoids readers ever observing a partially-written file — the disk
/// equivalent of the teacher's in-memory `LruCache`, for deployments that
/// want cached responses to survive a restart.
pub(crate) struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
    enhanced: bool,
    index: Mutex<()>,
}

impl DiskCache {
    pub(crate) fn new(ttl: Duration, enhanced: bool) -> io::Result<Self> {
        let dir = std::env::temp_dir().join("t2s-response-cache");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl,
            enhanced,
            index: Mutex::new(()),
        })
    }

    fn path_for(&self, host: &str, path: &str) -> PathBuf {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (host, path).hash(&mut hasher);
        self.dir.join(format!("{:016x}.cache", hasher.finish()))
    }
}

impl ResponseCache for DiskCache {
    fn get(&self, host: &str, path: &str) -> Option<Bytes> {
        let _guard = self.index.lock();
        let file_path = self.path_for(host, path);
        let meta = std::fs::metadata(&file_path).ok()?;
        let age = meta.modified().ok()?.elapsed().unwrap_or(Duration::MAX);
        if age > self.ttl {
            let _ = std::fs::remove_file(&file_path);
            return None;
        }
        std::fs::read(&file_path).ok().map(Bytes::from)
    }

    fn set(&self, host: &str, path: &str, content_type: Option<&str>, body: Bytes) {
        if body.len() as u64 > MAX_ENTRY_BYTES {
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
        let _guard = self.index.lock();
        let result: io::Result<()> = (|| {
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(&body)?;
            tmp.persist(self.path_for(host, path))
                .map_err(|err| err.error)?;
            Ok(())
        })();
        if let Err(err) = result {
            tracing::debug!(%err, "disk cache write failed, treating as miss");
        }
    }
}
