use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use tracing::info;

use super::backend::{Backend, Tier};

/// The backend pool: a lock-protected list plus a round-robin index and the
/// hysteretic global availability signal (spec §3, §4.4). Grounded on the
/// teacher's `AppContext::update_socks5_servers`, which also guards the
/// server list and its ordering behind a single lock reused by both the
/// checking service and the request path.
pub(crate) struct Pool {
    backends: RwLock<Vec<Arc<Backend>>>,
    index: AtomicU64,
    available: AtomicBool,
    pub(crate) bypass_count: AtomicU64,
    pub(crate) recovered_count: AtomicU64,
}

impl Pool {
    pub(crate) fn new(seed: impl IntoIterator<Item = (String, u16)>) -> Self {
        let backends = seed
            .into_iter()
            .map(|(host, port)| Arc::new(Backend::new(host, port)))
            .collect();
        Self {
            backends: RwLock::new(backends),
            index: AtomicU64::new(0),
            available: AtomicBool::new(false),
            bypass_count: AtomicU64::new(0),
            recovered_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    pub(crate) fn add(&self, host: String, port: u16) {
        self.backends.write().push(Arc::new(Backend::new(host, port)));
    }

    pub(crate) fn remove(&self, host: &str, port: u16) -> bool {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|b| !(b.host == host && b.port == port));
        backends.len() != before
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Selects the next backend by round-robin, filtered in §4.4's priority
    /// order: green first, then any healthy ("yellow"), then any backend at
    /// all as a last resort. The index advances only on a successful pick
    /// so load stays evenly distributed across whichever tier is in use.
    pub(crate) fn select(&self) -> Option<Arc<Backend>> {
        let backends = self.backends.read();
        if backends.is_empty() {
            return None;
        }
        pick_from_tier(&backends, &self.index, |b| b.tier() == Tier::Green)
            .or_else(|| pick_from_tier(&backends, &self.index, |b| b.tier() != Tier::Black))
            .or_else(|| pick_from_tier(&backends, &self.index, |_| true))
    }

    /// Recomputes the global availability signal from the current backend
    /// snapshot and applies transition side effects. Returns `Some(true)`
    /// on an unavailable→available transition (caller must run the forced
    /// re-proxy action), `Some(false)` on the reverse, `None` when nothing
    /// changed.
    pub(crate) fn recompute_availability(&self) -> Option<bool> {
        let backends = self.backends.read();
        let now_available = backends.iter().any(|b| b.tier() == Tier::Green);
        drop(backends);
        let was_available = self.available.swap(now_available, Ordering::AcqRel);
        match (was_available, now_available) {
            (true, false) => {
                self.bypass_count.fetch_add(1, Ordering::Relaxed);
                info!("SOCKS pool unavailable, bypassing to direct/drop per policy");
                Some(false)
            }
            (false, true) => {
                self.recovered_count.fetch_add(1, Ordering::Relaxed);
                info!("SOCKS pool recovered, forcing bypassed flows back through SOCKS");
                Some(true)
            }
            _ => None,
        }
    }
}

fn pick_from_tier(
    backends: &[Arc<Backend>],
    index: &AtomicU64,
    filter: impl Fn(&Arc<Backend>) -> bool,
) -> Option<Arc<Backend>> {
    let eligible: Vec<_> = backends.iter().filter(|b| filter(b)).collect();
    if eligible.is_empty() {
        return None;
    }
    let i = index.fetch_add(1, Ordering::Relaxed) as usize % eligible.len();
    Some(eligible[i].clone())
}
