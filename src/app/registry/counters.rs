use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter block (spec §4.9): every field is an independently
/// incremented atomic rather than one lock-guarded struct, since the
/// counters have no cross-field invariant to protect — this is a deviation
/// from the teacher's per-scope-lock style (its `Usage` struct) but matches
/// what this set of genuinely-independent counters calls for.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) connections_http: AtomicU64,
    pub(crate) connections_https: AtomicU64,
    pub(crate) connections_dns: AtomicU64,
    pub(crate) connections_other: AtomicU64,
    pub(crate) direct_connections: AtomicU64,
    pub(crate) policy_dropped: AtomicU64,
    pub(crate) bytes_client_to_remote: AtomicU64,
    pub(crate) bytes_remote_to_client: AtomicU64,
    pub(crate) udp_sessions_created: AtomicU64,
    pub(crate) udp_sessions_active: AtomicU64,
    pub(crate) err_connection_timeout: AtomicU64,
    pub(crate) err_socket: AtomicU64,
    pub(crate) err_socks_handshake: AtomicU64,
    pub(crate) err_dns_failure: AtomicU64,
    pub(crate) err_auth_failure: AtomicU64,
    pub(crate) err_original_dst_unavailable: AtomicU64,
    pub(crate) err_policy_dropped: AtomicU64,
    pub(crate) err_rate_limited: AtomicU64,
}

impl Counters {
    pub(crate) fn inc_protocol_class(&self, class: &str) {
        let counter = match class {
            "http" => &self.connections_http,
            "https" => &self.connections_https,
            "dns" => &self.connections_dns,
            _ => &self.connections_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_error_bucket(&self, bucket: &str) {
        let counter = match bucket {
            "connection_timeout" => &self.err_connection_timeout,
            "socket_error" => &self.err_socket,
            "socks_handshake" => &self.err_socks_handshake,
            "dns_failure" => &self.err_dns_failure,
            "auth_failure" => &self.err_auth_failure,
            "original_dst_unavailable" => &self.err_original_dst_unavailable,
            "policy_dropped" => &self.err_policy_dropped,
            "rate_limited" => &self.err_rate_limited,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_client_to_remote(&self, n: u64) {
        self.bytes_client_to_remote.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_remote_to_client(&self, n: u64) {
        self.bytes_remote_to_client.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.bytes_client_to_remote.load(Ordering::Relaxed)
            + self.bytes_remote_to_client.load(Ordering::Relaxed)
    }

    /// Sum of every named error bucket, the dashboard/metrics `errors_total`.
    pub(crate) fn errors_total(&self) -> u64 {
        self.err_connection_timeout.load(Ordering::Relaxed)
            + self.err_socket.load(Ordering::Relaxed)
            + self.err_socks_handshake.load(Ordering::Relaxed)
            + self.err_dns_failure.load(Ordering::Relaxed)
            + self.err_auth_failure.load(Ordering::Relaxed)
            + self.err_original_dst_unavailable.load(Ordering::Relaxed)
            + self.err_policy_dropped.load(Ordering::Relaxed)
            + self.err_rate_limited.load(Ordering::Relaxed)
    }
}
