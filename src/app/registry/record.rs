use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::app::types::{ClientAddr, KillReason, TargetAddr};

/// Live TCP connection record (spec §3, §4.9). The forwarder task awaits
/// `notify.notified()` in its splice loop alongside the socket reads, the
/// same `Arc<Notify>` pattern the teacher uses for session teardown in
/// `socks5/session.rs`'s `Session`/`SessionIncoming` pair, generalized here
/// to a registry-driven kill rather than a `Drop` hook.
pub(crate) struct TcpRecord {
    pub(crate) conn_id: u64,
    pub(crate) client: ClientAddr,
    pub(crate) target: TargetAddr,
    pub(crate) host_display: Mutex<Option<String>>,
    pub(crate) backend: Mutex<Option<(String, u16)>>,
    pub(crate) started_at: Instant,
    pub(crate) bytes_c2r: AtomicU64,
    pub(crate) bytes_r2c: AtomicU64,
    direct: AtomicBool,
    killed: AtomicBool,
    kill_reason: Mutex<Option<KillReason>>,
    notify: Notify,
}

impl TcpRecord {
    pub(crate) fn new(conn_id: u64, client: ClientAddr, target: TargetAddr, direct: bool) -> Self {
        Self {
            conn_id,
            client,
            target,
            host_display: Mutex::new(None),
            backend: Mutex::new(None),
            started_at: Instant::now(),
            bytes_c2r: AtomicU64::new(0),
            bytes_r2c: AtomicU64::new(0),
            direct: AtomicBool::new(direct),
            killed: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn is_direct(&self) -> bool {
        self.direct.load(Ordering::Relaxed)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub(crate) fn kill_reason(&self) -> Option<KillReason> {
        *self.kill_reason.lock()
    }

    pub(crate) fn kill(&self, reason: KillReason) {
        self.killed.store(true, Ordering::Relaxed);
        *self.kill_reason.lock() = Some(reason);
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait_for_kill(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn set_host_display(&self, host: String) {
        *self.host_display.lock() = Some(host);
    }

    pub(crate) fn set_backend(&self, host: String, port: u16) {
        *self.backend.lock() = Some((host, port));
    }
}

/// Live UDP session record (spec §3, §4.7).
pub(crate) struct UdpSessionRecord {
    pub(crate) client: ClientAddr,
    pub(crate) target: TargetAddr,
    pub(crate) started_at: Instant,
    pub(crate) last_activity: Mutex<Instant>,
    pub(crate) bytes_c2r: AtomicU64,
    pub(crate) bytes_r2c: AtomicU64,
    direct: AtomicBool,
    killed: AtomicBool,
    kill_reason: Mutex<Option<KillReason>>,
    notify: Notify,
}

impl UdpSessionRecord {
    pub(crate) fn new(client: ClientAddr, target: TargetAddr, direct: bool) -> Self {
        Self {
            client,
            target,
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            bytes_c2r: AtomicU64::new(0),
            bytes_r2c: AtomicU64::new(0),
            direct: AtomicBool::new(direct),
            killed: AtomicBool::new(false),
            kill_reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub(crate) fn is_direct(&self) -> bool {
        self.direct.load(Ordering::Relaxed)
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub(crate) fn kill_reason(&self) -> Option<KillReason> {
        *self.kill_reason.lock()
    }

    pub(crate) fn kill(&self, reason: KillReason) {
        self.killed.store(true, Ordering::Relaxed);
        *self.kill_reason.lock() = Some(reason);
        self.notify.notify_waiters();
    }

    pub(crate) async fn wait_for_kill(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }
}
