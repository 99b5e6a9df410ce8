//! Hand-formatted Prometheus text exposition (spec §6's `/metrics`). No
//! metrics crate is pulled in for this — the format is a handful of
//! `write!` calls over the registry's counters and pool snapshot.

use std::fmt::Write;

use crate::app::context::AppContext;

pub(crate) fn render(ctx: &AppContext) -> String {
    let mut out = String::new();
    let counters = &ctx.registry.counters;
    use std::sync::atomic::Ordering::Relaxed;

    writeln!(out, "# HELP t2s_connections_total Accepted connections by protocol class.").ok();
    writeln!(out, "# TYPE t2s_connections_total counter").ok();
    for (class, value) in [
        ("http", counters.connections_http.load(Relaxed)),
        ("https", counters.connections_https.load(Relaxed)),
        ("dns", counters.connections_dns.load(Relaxed)),
        ("other", counters.connections_other.load(Relaxed)),
    ] {
        writeln!(out, "t2s_connections_total{{class=\"{class}\"}} {value}").ok();
    }

    writeln!(out, "# HELP t2s_direct_connections_total Connections routed around SOCKS.").ok();
    writeln!(out, "# TYPE t2s_direct_connections_total counter").ok();
    writeln!(out, "t2s_direct_connections_total {}", counters.direct_connections.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_policy_dropped_total Flows dropped or reset by policy.").ok();
    writeln!(out, "# TYPE t2s_policy_dropped_total counter").ok();
    writeln!(out, "t2s_policy_dropped_total {}", counters.err_policy_dropped.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_bytes_total Bytes relayed, by direction.").ok();
    writeln!(out, "# TYPE t2s_bytes_total counter").ok();
    writeln!(
        out,
        "t2s_bytes_total{{direction=\"client_to_remote\"}} {}",
        counters.bytes_client_to_remote.load(Relaxed)
    )
    .ok();
    writeln!(
        out,
        "t2s_bytes_total{{direction=\"remote_to_client\"}} {}",
        counters.bytes_remote_to_client.load(Relaxed)
    )
    .ok();

    writeln!(out, "# HELP t2s_udp_sessions_active Currently tracked UDP sessions.").ok();
    writeln!(out, "# TYPE t2s_udp_sessions_active gauge").ok();
    writeln!(out, "t2s_udp_sessions_active {}", counters.udp_sessions_active.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_udp_sessions_created_total UDP sessions ever opened.").ok();
    writeln!(out, "# TYPE t2s_udp_sessions_created_total counter").ok();
    writeln!(out, "t2s_udp_sessions_created_total {}", counters.udp_sessions_created.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_errors_total Forwarder errors by bucket.").ok();
    writeln!(out, "# TYPE t2s_errors_total counter").ok();
    for (bucket, value) in [
        ("connection_timeout", counters.err_connection_timeout.load(Relaxed)),
        ("socket_error", counters.err_socket.load(Relaxed)),
        ("socks_handshake", counters.err_socks_handshake.load(Relaxed)),
        ("dns_failure", counters.err_dns_failure.load(Relaxed)),
        ("auth_failure", counters.err_auth_failure.load(Relaxed)),
        ("original_dst_unavailable", counters.err_original_dst_unavailable.load(Relaxed)),
        ("policy_dropped", counters.err_policy_dropped.load(Relaxed)),
        ("rate_limited", counters.err_rate_limited.load(Relaxed)),
    ] {
        writeln!(out, "t2s_errors_total{{bucket=\"{bucket}\"}} {value}").ok();
    }

    writeln!(out, "# HELP t2s_socks_pool_available Global SOCKS availability signal (1/0).").ok();
    writeln!(out, "# TYPE t2s_socks_pool_available gauge").ok();
    writeln!(out, "t2s_socks_pool_available {}", ctx.pool.is_available() as u8).ok();

    writeln!(out, "# HELP t2s_socks_bypass_total Unavailable->bypassed transitions.").ok();
    writeln!(out, "# TYPE t2s_socks_bypass_total counter").ok();
    writeln!(out, "t2s_socks_bypass_total {}", ctx.pool.bypass_count.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_socks_recovered_total Bypassed->available transitions.").ok();
    writeln!(out, "# TYPE t2s_socks_recovered_total counter").ok();
    writeln!(out, "t2s_socks_recovered_total {}", ctx.pool.recovered_count.load(Relaxed)).ok();

    writeln!(out, "# HELP t2s_backend_healthy Per-backend health (1/0).").ok();
    writeln!(out, "# TYPE t2s_backend_healthy gauge").ok();
    for backend in ctx.pool.backends() {
        let status = backend.status();
        writeln!(
            out,
            "t2s_backend_healthy{{host=\"{}\",port=\"{}\"}} {}",
            backend.host, backend.port, status.healthy as u8
        )
        .ok();
    }

    writeln!(out, "# HELP t2s_backend_bytes_per_second_ema Smoothed backend throughput.").ok();
    writeln!(out, "# TYPE t2s_backend_bytes_per_second_ema gauge").ok();
    for backend in ctx.pool.backends() {
        let status = backend.status();
        writeln!(
            out,
            "t2s_backend_bytes_per_second_ema{{host=\"{}\",port=\"{}\"}} {}",
            backend.host, backend.port, status.ema_bytes_per_second
        )
        .ok();
    }

    out
}
