//! Supervisor (spec §4.10, C10): wires every collaborator at startup, then
//! owns process lifetime — signal handling and graceful drain. Grounded on
//! the teacher's `main.rs`, which spawns each service as its own task and
//! drives the TPROXY receive loop inline; generalized here to also own
//! signal-driven shutdown/reload, which the teacher leaves to the runtime's
//! default Ctrl-C behavior.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::{
    app::{accept, context::AppContext, dashboard, pool::HealthMonitor, resolve, tcp, udp},
    cli::CliArgs,
};

/// Runs the proxy until a second SIGTERM/SIGINT or a fatal startup error.
/// Returns the process exit code (spec §6).
pub(crate) async fn run(ctx: AppContext, args: CliArgs) -> i32 {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let mut handles = Vec::new();

    if !args.no_check {
        let monitor = HealthMonitor::new(ctx.pool.clone(), ctx.socks_creds.clone(), args.check_interval);
        let registry = ctx.registry.clone();
        let force_reproxy = ctx.env.force_reproxy_on_recovery;
        handles.push(tokio::spawn(async move {
            monitor
                .launch(move || {
                    if force_reproxy {
                        registry.force_reproxy_direct_flows();
                    }
                })
                .await;
        }));
    } else {
        info!("health probing disabled (--no-check)");
    }

    if args.mode.wants_tcp() {
        match bind_tcp(&args).await {
            Ok(listener) => {
                let ctx = ctx.clone();
                let admission = Arc::new(accept::Admission::new(
                    args.max_conns,
                    ctx.env.rate_limit_per_minute,
                ));
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(run_tcp_accept_loop(ctx, listener, admission, shutdown)));
            }
            Err(err) => {
                warn!(%err, "failed to bind TCP listener");
                return 2;
            }
        }
    }

    if args.mode.wants_udp() {
        let udp_addr = SocketAddr::new(args.listen_addr, args.udp_listen_port());
        match resolve::bind_tproxy_udp(&udp_addr) {
            Ok(socket) => {
                let listener = Arc::new(socket);
                let sessions = Arc::new(udp::SessionTable::new());
                let ctx_listener = ctx.clone();
                let listener_for_reaper = listener.clone();
                let sessions_for_reaper = sessions.clone();
                let ctx_reaper = ctx.clone();
                handles.push(tokio::spawn(async move {
                    udp::run(ctx_listener, listener_for_reaper, sessions).await;
                }));
                handles.push(tokio::spawn(async move {
                    udp::run_reaper(ctx_reaper, sessions_for_reaper).await;
                }));
                info!(%udp_addr, "UDP TPROXY listener bound");
            }
            Err(err) => {
                warn!(%err, %udp_addr, "failed to bind UDP TPROXY listener");
                return 2;
            }
        }
    }

    if args.web_socket {
        let dashboard_addr = SocketAddr::new(args.listen_addr, args.web_port);
        let ctx = ctx.clone();
        let shutdown_signal = shutdown.clone();
        handles.push(tokio::spawn(async move {
            dashboard::run(ctx, dashboard_addr, async move { shutdown_signal.notified().await }).await;
        }));
    }

    run_signal_loop(ctx, shutdown, args.graceful_shutdown_timeout).await
}

async fn bind_tcp(args: &CliArgs) -> std::io::Result<tokio::net::TcpListener> {
    let addr = SocketAddr::new(args.listen_addr, args.listen_port);
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(args.backlog)?;
    info!(%addr, "TCP listener bound");
    Ok(listener)
}

/// Exposed at `pub(crate)` (rather than module-private) so the in-process
/// test harness can drive the same accept loop the supervisor runs in
/// production instead of reimplementing it.
pub(crate) async fn run_tcp_accept_loop(
    ctx: AppContext,
    listener: tokio::net::TcpListener,
    admission: Arc<accept::Admission>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("TCP accept loop stopping");
                return;
            }
            accepted = accept::accept_with_timeout(&listener) => {
                let Some(accepted) = accepted else { continue };
                let (stream, client_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let permit = match admission.admit().await {
                    accept::Admitted::Permit(permit) => permit,
                    accept::Admitted::RateLimited => {
                        ctx.registry.counters.inc_error_bucket("rate_limited");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(tcp::handle_connection(ctx, stream, client_addr, permit));
            }
        }
    }
}

/// Installs SIGTERM/SIGINT/SIGHUP handlers (spec §4.10): first
/// SIGTERM/SIGINT starts a graceful drain, a second forces immediate exit;
/// SIGHUP reloads the traffic policy rules from `TRAFFIC_RULES`.
async fn run_signal_loop(ctx: AppContext, shutdown: Arc<tokio::sync::Notify>, drain_timeout: Duration) -> i32 {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler");
            return 2;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGINT handler");
            return 2;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGHUP handler");
            return 2;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading traffic policy");
                let raw = std::env::var("TRAFFIC_RULES").unwrap_or_default();
                ctx.policy.reload(&raw);
            }
        }
    }

    info!("shutdown signal received, draining");
    shutdown.notify_waiters();

    let deadline = tokio::time::Instant::now() + drain_timeout;
    loop {
        let live = ctx.registry.tcp_records().len()
            + ctx.registry.counters.udp_sessions_active.load(std::sync::atomic::Ordering::Relaxed) as usize;
        if live == 0 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = sigterm.recv() => {
                info!("second shutdown signal received, forcing exit");
                return 1;
            }
            _ = sigint.recv() => {
                info!("second shutdown signal received, forcing exit");
                return 1;
            }
        }
    }
    info!("drain complete, exiting");
    0
}
