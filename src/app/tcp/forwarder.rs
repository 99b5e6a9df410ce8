use std::{net::SocketAddr, sync::Arc, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::{
    net::TcpStream,
    sync::OwnedSemaphorePermit,
    time::timeout,
};
use tracing::{debug, info, instrument, warn};

use crate::app::{
    context::AppContext,
    error::ProxyError,
    registry::TcpRecord,
    resolve,
    socks5,
    types::{Action, AllSocksDownPolicy, ProtocolClass, TargetAddr},
};

use super::splice;

const HTTP_PEEK_MAX_BYTES: usize = 16 * 1024;
const HTTP_PEEK_DEADLINE: Duration = Duration::from_millis(500);

/// Handles one accepted TCP connection end to end (spec §4.6). Grounded on
/// the original's `handle_client`: target resolution, then protocol
/// classification, optional HTTP `Host` peek, policy decision, dial with
/// retry, and finally the splice loop.
#[instrument(skip_all, fields(client = %client_addr))]
pub(crate) async fn handle_connection(
    ctx: AppContext,
    mut client_stream: TcpStream,
    client_addr: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    let target = match resolve_target(&ctx, &client_stream).await {
        Ok(target) => target,
        Err(err) => {
            warn!(%err, "failed to resolve original destination");
            ctx.registry.counters.inc_error_bucket(err.bucket());
            return;
        }
    };

    let conn_id = ctx.registry.next_conn_id();
    let proto = ProtocolClass::from_port(target.0.port());
    ctx.registry.counters.inc_protocol_class(proto.as_str());

    let peeked_request = if matches!(proto, ProtocolClass::Http) {
        peek_http_request(&client_stream).await
    } else {
        None
    };
    let host_display = host_display_for(&peeked_request, &target);

    let cacheable_path = peeked_request
        .as_deref()
        .and_then(parse_request_line)
        .filter(|(method, _)| method == "GET");
    if let Some((_, path)) = &cacheable_path {
        if let Some(cached) = ctx.cache.get(&host_display, path) {
            serve_from_cache(&mut client_stream, &cached).await;
            return;
        }
    }
    let cache_key = cacheable_path.map(|(_, path)| (host_display.clone(), path));

    let socks_available = ctx.pool.is_available();
    let action = ctx.policy.decide(
        proto.as_str(),
        &host_display,
        target.0.port(),
        socks_available,
        false,
    );

    let use_direct = match resolve_action(&ctx, action, socks_available, client_addr).await {
        Resolution::Proceed(use_direct) => use_direct,
        Resolution::Drop => {
            ctx.registry.counters.inc_error_bucket("policy_dropped");
            return;
        }
        Resolution::Reset => {
            ctx.registry.counters.inc_error_bucket("policy_dropped");
            set_linger_zero(&client_stream);
            return;
        }
    };

    let record = Arc::new(TcpRecord::new(conn_id, client_addr.into(), target, use_direct));
    record.set_host_display(host_display.clone());
    ctx.registry.insert_tcp(conn_id, record.clone());

    let dial_result = dial(&ctx, &target, use_direct, &record).await;
    let mut upstream = match dial_result {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%err, target = %target.0, "dial failed, closing client connection");
            ctx.registry.counters.inc_error_bucket(err.bucket());
            ctx.registry.remove_tcp(conn_id);
            return;
        }
    };
    apply_socket_tuning(&client_stream, &ctx);
    apply_socket_tuning(&upstream, &ctx);

    info!(target = %target.0, host = %host_display, direct = use_direct, "connection established");
    splice::run(&ctx, &record, &mut client_stream, &mut upstream, peeked_request, cache_key).await;

    let killed = record.is_killed();
    ctx.registry.remove_tcp(conn_id);
    let rx = bytesize::ByteSize(record.bytes_c2r.load(std::sync::atomic::Ordering::Relaxed));
    let tx = bytesize::ByteSize(record.bytes_r2c.load(std::sync::atomic::Ordering::Relaxed));
    debug!(
        killed,
        kill_reason = ?record.kill_reason(),
        %rx,
        %tx,
        "connection closed"
    );
}

async fn resolve_target(ctx: &AppContext, stream: &TcpStream) -> Result<TargetAddr, ProxyError> {
    if let Some((host, port)) = &ctx.fixed_target {
        let ip = ctx.dns.resolve(host).await?;
        return Ok(SocketAddr::new(ip, *port).into());
    }
    resolve::original_dst_tcp(stream).map(TargetAddr::from)
}

/// Peeks up to [`HTTP_PEEK_MAX_BYTES`] within [`HTTP_PEEK_DEADLINE`] without
/// consuming the bytes from the wire, so the splice loop's first client
/// read still sees them (spec §4.6 step 3). Grounded on the original's
/// header-sniff loop in `handle_client`, ported from a consuming `recv()`
/// to `TcpStream::peek`, the tokio equivalent of `MSG_PEEK`.
async fn peek_http_request(stream: &TcpStream) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; HTTP_PEEK_MAX_BYTES];
    let result = timeout(HTTP_PEEK_DEADLINE, async {
        loop {
            stream.readable().await.ok()?;
            match stream.peek(&mut buf).await {
                Ok(n) if n == 0 => return None,
                Ok(n) => {
                    if contains_header_terminator(&buf[..n]) || n >= HTTP_PEEK_MAX_BYTES {
                        buf.truncate(n);
                        return Some(buf.clone());
                    }
                }
                Err(_) => return None,
            }
        }
    })
    .await;
    result.ok().flatten()
}

fn contains_header_terminator(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Pulls `(method, path)` off an HTTP request line, for the response
/// cache's (host, path) key (spec §4.6's optional HTTP response cache, D1).
fn parse_request_line(buf: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(buf);
    let line = text.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

/// Serves a cached response directly and closes the connection, skipping
/// the dial entirely (spec §4.6's cache-hit fast path).
async fn serve_from_cache(client_stream: &mut TcpStream, cached: &bytes::Bytes) {
    use tokio::io::AsyncWriteExt;
    debug!(bytes = cached.len(), "serving cached HTTP response");
    let _ = client_stream.write_all(cached).await;
    let _ = client_stream.shutdown().await;
}

fn host_display_for(peeked: &Option<Vec<u8>>, target: &TargetAddr) -> String {
    if let Some(buf) = peeked {
        if let Some(host) = parse_host_header(buf) {
            return format!("{host}:{}", target.0.port());
        }
    }
    target.0.to_string()
}

fn parse_host_header(buf: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    text.lines()
        .find_map(|line| line.strip_prefix("Host: ").or_else(|| line.strip_prefix("host: ")))
        .map(|h| h.trim().to_string())
}

enum Resolution {
    Proceed(bool),
    Drop,
    Reset,
}

/// Applies §4.5/§4.6's policy precedence: explicit rule action first, then
/// `ALL_SOCKS_DOWN_POLICY`/`SOCKS_REQUIRED_POLICY` for the unmatched case,
/// then the historical "fall back to direct when SOCKS is down" default.
/// Grounded on the original's `handle_client`, which layers these checks in
/// exactly this order.
async fn resolve_action(
    ctx: &AppContext,
    action: Option<Action>,
    socks_available: bool,
    client_addr: SocketAddr,
) -> Resolution {
    let mut socks_available = socks_available;

    if action.is_none() && !socks_available {
        match ctx.env.all_socks_down_policy {
            AllSocksDownPolicy::Drop => return Resolution::Drop,
            AllSocksDownPolicy::Wait => {
                socks_available = wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
            }
            AllSocksDownPolicy::Direct => {}
        }
    }

    match action {
        Some(Action::Drop) => return Resolution::Drop,
        Some(Action::Reset) => return Resolution::Reset,
        Some(Action::Direct) => return Resolution::Proceed(true),
        Some(Action::Socks) => {
            if !socks_available {
                match ctx.env.socks_required_policy {
                    AllSocksDownPolicy::Wait => {
                        socks_available =
                            wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
                        if !socks_available {
                            return Resolution::Drop;
                        }
                    }
                    AllSocksDownPolicy::Direct => return Resolution::Proceed(true),
                    AllSocksDownPolicy::Drop => return Resolution::Drop,
                }
            }
            return Resolution::Proceed(false);
        }
        Some(Action::Wait) => {
            socks_available = wait_for_recovery(ctx, ctx.env.socks_required_max_wait).await;
        }
        None => {}
    }

    if !socks_available {
        debug!(client = %client_addr, "SOCKS unavailable, using direct connection");
        ctx.registry.counters.direct_connections.fetch_add(
            1,
            std::sync::atomic::Ordering::Relaxed,
        );
        return Resolution::Proceed(true);
    }
    Resolution::Proceed(false)
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

fn set_linger_zero(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let _ = sock_ref.set_linger(Some(Duration::ZERO));
}

fn apply_socket_tuning(stream: &TcpStream, ctx: &AppContext) {
    let _ = stream.set_nodelay(true);
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(ctx.keepalive.idle)
        .with_interval(ctx.keepalive.interval)
        .with_retries(ctx.keepalive.count);
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

/// Dials the chosen path with exponential backoff on dial-class failures
/// only (spec §4.6 step 5); SOCKS protocol errors (handshake/auth/CONNECT
/// refusal) are terminal and never retried.
async fn dial(
    ctx: &AppContext,
    target: &TargetAddr,
    use_direct: bool,
    record: &TcpRecord,
) -> Result<TcpStream, ProxyError> {
    if use_direct {
        return dial_with_retry(ctx, || async {
            timeout(ctx.connect_timeout, TcpStream::connect(target.0))
                .await
                .map_err(|_| ProxyError::ConnectionTimeout(target.0.to_string()))?
                .map_err(ProxyError::SocketError)
        })
        .await;
    }

    let backend = ctx.pool.select().ok_or(ProxyError::OriginalDstUnavailable)?;
    record.set_backend(backend.host.clone(), backend.port);
    let mut stream = dial_with_retry(ctx, || async {
        let ip = ctx.dns.resolve(&backend.host).await?;
        timeout(
            ctx.connect_timeout,
            TcpStream::connect(SocketAddr::new(ip, backend.port)),
        )
        .await
        .map_err(|_| ProxyError::ConnectionTimeout(backend.host.clone()))?
        .map_err(ProxyError::SocketError)
    })
    .await?;

    socks5::greet(&mut stream, ctx.socks_creds.as_ref()).await?;
    socks5::connect(&mut stream, &target.0.ip().to_string(), target.0.port()).await?;
    Ok(stream)
}

async fn dial_with_retry<F, Fut>(ctx: &AppContext, mut attempt: F) -> Result<TcpStream, ProxyError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<TcpStream, ProxyError>>,
{
    let mut last_err = None;
    for n in 0..ctx.connect_retries.max(1) {
        match attempt().await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_retryable_dial_error() => {
                warn!(attempt = n + 1, %err, "dial attempt failed");
                last_err = Some(err);
                if n + 1 < ctx.connect_retries {
                    let backoff = ctx.retry_backoff * 2f64.powi(n as i32);
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(ProxyError::OriginalDstUnavailable))
}
