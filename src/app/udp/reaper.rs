use std::sync::Arc;

use tracing::debug;

use crate::app::{context::AppContext, types::KillReason};

use super::SessionTable;

/// Closes UDP sessions idle longer than `udp_session_timeout`, polling at
/// half that interval (spec §4.7 step 6). Grounded on the original's reaper
/// thread, which uses the same half-interval cadence to bound worst-case
/// staleness to 1.5x the configured timeout.
pub(crate) async fn run_reaper(ctx: AppContext, sessions: Arc<SessionTable>) {
    let poll_interval = ctx.udp_session_timeout / 2;
    let mut ticker = tokio::time::interval(poll_interval.max(std::time::Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        // Only signals the kill here; the session's own receive loop (in
        // `UdpSession::run_receive_loop`) performs the actual table/registry
        // removal once it wakes, which keeps that cleanup single-owner.
        for entry in sessions.iter() {
            if entry.value().record.idle_for() >= ctx.udp_session_timeout {
                debug!(client = %entry.key(), "reaping idle UDP session");
                entry.value().record.kill(KillReason::IdleTimeout);
            }
        }
    }
}
