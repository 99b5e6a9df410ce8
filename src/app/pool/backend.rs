use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

const TTL_RING_CAPACITY: usize = 150;

/// Immutable identity plus mutable health record for one upstream SOCKSv5
/// backend (spec §3). The mutable half mirrors the teacher's
/// `checking/health.rs` + `checking/ping.rs` split — a cheap atomic flag for
/// the hot is-healthy check, a lock-guarded record for the richer stats
/// only the health monitor and dashboard read.
#[derive(Debug)]
pub(crate) struct Backend {
    pub(crate) host: String,
    pub(crate) port: u16,
    status: Mutex<BackendStatus>,
    total_bytes: AtomicU64,
}

/// green/yellow/black classification used by the dashboard and §4.4
/// selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    Green,
    Yellow,
    Black,
}

#[derive(Debug, Clone)]
pub(crate) struct BackendStatus {
    pub(crate) healthy: bool,
    pub(crate) server_latency_ms: Option<u32>,
    pub(crate) internet_latency_ms: Option<u32>,
    pub(crate) last_probe_ts: Option<Instant>,
    pub(crate) consecutive_failures: u32,
    pub(crate) probe_backoff_seconds: u64,
    pub(crate) ema_bytes_per_second: f64,
    ttl_ring: VecDeque<u8>,
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            server_latency_ms: None,
            internet_latency_ms: None,
            last_probe_ts: None,
            consecutive_failures: 0,
            probe_backoff_seconds: 0,
            ema_bytes_per_second: 0.0,
            ttl_ring: VecDeque::with_capacity(TTL_RING_CAPACITY),
        }
    }
}

impl BackendStatus {
    pub(crate) fn tier(&self) -> Tier {
        match (self.healthy, self.internet_latency_ms) {
            (true, Some(_)) => Tier::Green,
            (true, None) => Tier::Yellow,
            (false, _) => Tier::Black,
        }
    }

    /// Share of TTL samples equal to the ring's modal value, or `None` when
    /// the platform can't surface received packet TTL (spec §8's "Ancillary
    /// TTL" edge case).
    pub(crate) fn ttl_integrity_percent(&self) -> Option<u8> {
        if self.ttl_ring.is_empty() {
            return None;
        }
        let mut counts = std::collections::HashMap::new();
        for &ttl in &self.ttl_ring {
            *counts.entry(ttl).or_insert(0usize) += 1;
        }
        let mode_count = counts.values().copied().max().unwrap_or(0);
        Some(((mode_count as f32 / self.ttl_ring.len() as f32) * 100.0).round() as u8)
    }
}

impl Backend {
    pub(crate) fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            status: Mutex::new(BackendStatus::default()),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn status(&self) -> BackendStatus {
        self.status.lock().clone()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.status.lock().healthy
    }

    pub(crate) fn tier(&self) -> Tier {
        self.status.lock().tier()
    }

    /// Applies the outcome of one probe cycle: records latencies on
    /// success, bumps `consecutive_failures` and doubles the backoff
    /// (capped, per §4.4) on failure.
    pub(crate) fn record_probe(
        &self,
        server_latency_ms: Option<u32>,
        internet_latency_ms: Option<u32>,
    ) {
        let mut status = self.status.lock();
        status.last_probe_ts = Some(Instant::now());
        let healthy = server_latency_ms.is_some();
        if healthy {
            status.consecutive_failures = 0;
            status.probe_backoff_seconds = 0;
        } else {
            status.consecutive_failures += 1;
            status.probe_backoff_seconds = (status.probe_backoff_seconds.max(1) * 2).min(60);
        }
        status.healthy = healthy;
        status.server_latency_ms = server_latency_ms;
        status.internet_latency_ms = internet_latency_ms;
    }

    pub(crate) fn record_ttl_sample(&self, ttl: u8) {
        let mut status = self.status.lock();
        if status.ttl_ring.len() >= TTL_RING_CAPACITY {
            status.ttl_ring.pop_front();
        }
        status.ttl_ring.push_back(ttl);
    }

    pub(crate) fn add_bytes(&self, n: u64, elapsed: Duration) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        if elapsed.as_secs_f64() > 0.0 {
            let rate = n as f64 / elapsed.as_secs_f64();
            let mut status = self.status.lock();
            const ALPHA: f64 = 0.2;
            status.ema_bytes_per_second = ALPHA * rate + (1.0 - ALPHA) * status.ema_bytes_per_second;
        }
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn backoff_elapsed(&self) -> bool {
        let status = self.status.lock();
        match status.last_probe_ts {
            None => true,
            Some(ts) => ts.elapsed() >= Duration::from_secs(status.probe_backoff_seconds),
        }
    }
}
