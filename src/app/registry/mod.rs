//! Connection registry and global counters (spec §4.9, C9): concurrent
//! `conn_id → TCP record` and `client_addr → UDP session` maps plus the
//! Prometheus-style counter block the dashboard and SSE stream read.

mod counters;
mod record;

pub(crate) use counters::Counters;
pub(crate) use record::{TcpRecord, UdpSessionRecord};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;

use crate::app::types::{ClientAddr, KillReason};

/// conn_id is a simple monotonic counter rather than the original's
/// `"{ip}:{port}_{thread_id}"` string — a thread id has no equivalent in an
/// async runtime, and a counter is already unique and cheaper to key on.
pub(crate) type ConnId = u64;

pub(crate) struct Registry {
    next_conn_id: AtomicU64,
    tcp: DashMap<ConnId, Arc<TcpRecord>>,
    udp: DashMap<ClientAddr, Arc<UdpSessionRecord>>,
    pub(crate) counters: Counters,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            tcp: DashMap::new(),
            udp: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_tcp(&self, id: ConnId, record: Arc<TcpRecord>) {
        self.tcp.insert(id, record);
    }

    pub(crate) fn remove_tcp(&self, id: ConnId) {
        self.tcp.remove(&id);
    }

    pub(crate) fn tcp_records(&self) -> Vec<Arc<TcpRecord>> {
        self.tcp.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn get_tcp(&self, id: ConnId) -> Option<Arc<TcpRecord>> {
        self.tcp.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn insert_udp(&self, client: ClientAddr, record: Arc<UdpSessionRecord>) {
        self.udp.insert(client, record);
    }

    pub(crate) fn remove_udp(&self, client: &ClientAddr) {
        self.udp.remove(client);
    }

    pub(crate) fn get_udp(&self, client: &ClientAddr) -> Option<Arc<UdpSessionRecord>> {
        self.udp.get(client).map(|e| e.value().clone())
    }

    pub(crate) fn udp_records(&self) -> Vec<Arc<UdpSessionRecord>> {
        self.udp.iter().map(|e| e.value().clone()).collect()
    }

    /// Admin kill by conn_id (spec §6's `POST /api/conn/kill`).
    pub(crate) fn kill_tcp(&self, id: ConnId, reason: KillReason) -> bool {
        match self.tcp.get(&id) {
            Some(record) => {
                record.kill(reason);
                true
            }
            None => false,
        }
    }

    /// Admin kill of a UDP session by client endpoint.
    pub(crate) fn kill_udp(&self, client: &ClientAddr, reason: KillReason) -> bool {
        match self.udp.get(client) {
            Some(record) => {
                record.kill(reason);
                true
            }
            None => false,
        }
    }

    /// The forced re-proxy action (spec §4.4): closes every live
    /// direct-fallback TCP connection and direct UDP session so clients
    /// reconnect through SOCKS. Grounded on the original's
    /// `_force_reproxy_on_socks_recovery`, which walks `_conns`/`_sessions`
    /// the same way, flagging entries rather than touching sockets it
    /// doesn't own a strong reference to.
    pub(crate) fn force_reproxy_direct_flows(&self) {
        for entry in self.tcp.iter() {
            if entry.value().is_direct() {
                entry.value().kill(KillReason::SocksRecovered);
            }
        }
        for entry in self.udp.iter() {
            if entry.value().is_direct() {
                entry.value().kill(KillReason::SocksRecovered);
            }
        }
    }
}
