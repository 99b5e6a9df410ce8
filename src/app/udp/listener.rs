use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::warn;

use crate::app::{
    context::AppContext,
    resolve::TProxyUdpSocket,
    types::{Action, AllSocksDownPolicy, ClientAddr, KillReason, ProtocolClass, TargetAddr},
};

use super::{session::UdpSession, SessionTable};

const UDP_RECV_BUFFER: usize = 64 * 1024;

/// Runs the UDP listener's single receive loop (spec §4.7): one TPROXY
/// socket services every client, sessions are demultiplexed by source
/// endpoint and handed their datagrams one at a time.
pub(crate) async fn run(ctx: AppContext, listener: Arc<TProxyUdpSocket>, sessions: Arc<SessionTable>) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    loop {
        let (n, client, orig_dst) = match listener.recv(&mut buf).await {
            Ok(triple) => triple,
            Err(err) => {
                warn!(%err, "UDP listener recv failed");
                continue;
            }
        };
        let target = match &ctx.fixed_target {
            Some((host, port)) => match ctx.dns.resolve(host).await {
                Ok(ip) => TargetAddr::from(SocketAddr::new(ip, *port)),
                Err(err) => {
                    warn!(%err, "fixed UDP target resolution failed, dropping datagram");
                    ctx.registry.counters.inc_error_bucket("dns_failure");
                    continue;
                }
            },
            None => TargetAddr::from(orig_dst),
        };
        let payload = buf[..n].to_vec();
        handle_datagram(&ctx, &listener, &sessions, client, target, payload).await;
    }
}

async fn handle_datagram(
    ctx: &AppContext,
    listener: &Arc<TProxyUdpSocket>,
    sessions: &Arc<SessionTable>,
    client: ClientAddr,
    target: TargetAddr,
    payload: Vec<u8>,
) {
    if let Some(session) = sessions.get(&client).map(|e| e.value().clone()) {
        if !session.record.is_killed() {
            match session.send(target, &payload).await {
                Ok(()) => ctx.registry.counters.add_client_to_remote(payload.len() as u64),
                Err(err) => {
                    warn!(%err, %client, "UDP send failed, tearing down session");
                    // Only signals the kill; the session's own receive loop
                    // owns removing the table/registry entry and decrementing
                    // `udp_sessions_active` exactly once.
                    session.record.kill(KillReason::IdleTimeout);
                }
            }
            return;
        }
        // A session for this client is dead but hasn't unwound yet. Fall
        // through to open a new one; the old entry is replaced below, and
        // the dying receive loop's `remove_if` will no-op against it since
        // it no longer holds the current `Arc`.
    }

    let proto = ProtocolClass::from_port(target.0.port());
    let socks_available = ctx.pool.is_available();
    let action = ctx.policy.decide(
        proto.as_str(),
        &target.0.ip().to_string(),
        target.0.port(),
        socks_available,
        true,
    );

    let use_direct = match decide(ctx, action, socks_available).await {
        None => {
            ctx.registry.counters.inc_error_bucket("policy_dropped");
            return;
        }
        Some(use_direct) => use_direct,
    };

    let session = match open_session(ctx, client, target, use_direct).await {
        Some(session) => session,
        None => return,
    };

    if let Err(err) = session.send(target, &payload).await {
        warn!(%err, %client, "initial UDP send failed");
        return;
    }
    ctx.registry.counters.add_client_to_remote(payload.len() as u64);

    ctx.registry.counters.udp_sessions_created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    ctx.registry.counters.udp_sessions_active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    ctx.registry.insert_udp(client, session.record.clone());
    sessions.insert(client, session.clone());

    tokio::spawn(session.run_receive_loop(ctx.clone(), listener.clone(), sessions.clone(), client));
}

async fn open_session(
    ctx: &AppContext,
    client: ClientAddr,
    target: TargetAddr,
    use_direct: bool,
) -> Option<Arc<UdpSession>> {
    if use_direct {
        return match UdpSession::open_direct(client, target).await {
            Ok(session) => Some(Arc::new(session)),
            Err(err) => {
                warn!(%err, %client, "direct UDP session open failed");
                ctx.registry.counters.inc_error_bucket(err.bucket());
                None
            }
        };
    }
    let backend = ctx.pool.select()?;
    match UdpSession::open_socks(ctx, client, target, backend).await {
        Ok(session) => Some(Arc::new(session)),
        Err(err) => {
            warn!(%err, %client, "SOCKS UDP association failed");
            ctx.registry.counters.inc_error_bucket(err.bucket());
            None
        }
    }
}

/// Mirrors the TCP forwarder's policy precedence (spec §4.5/§4.7 step 2)
/// for the UDP path: `None` means drop/reset the datagram without creating
/// a session, `Some(use_direct)` proceeds.
async fn decide(ctx: &AppContext, action: Option<Action>, socks_available: bool) -> Option<bool> {
    let mut socks_available = socks_available;

    if action.is_none() && !socks_available {
        match ctx.env.all_socks_down_policy {
            AllSocksDownPolicy::Drop => return None,
            AllSocksDownPolicy::Wait => {
                socks_available = wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
            }
            AllSocksDownPolicy::Direct => {}
        }
    }

    match action {
        Some(Action::Drop) | Some(Action::Reset) => return None,
        Some(Action::Direct) => return Some(true),
        Some(Action::Socks) => {
            if !socks_available {
                match ctx.env.socks_required_policy {
                    AllSocksDownPolicy::Wait => {
                        socks_available = wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
                        if !socks_available {
                            return None;
                        }
                    }
                    AllSocksDownPolicy::Direct => return Some(true),
                    AllSocksDownPolicy::Drop => return None,
                }
            }
            return Some(false);
        }
        Some(Action::Wait) => {
            socks_available = wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
        }
        None => {}
    }

    Some(!socks_available)
}

async fn wait_for_recovery(ctx: &AppContext, max_wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if ctx.pool.is_available() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return ctx.pool.is_available();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
