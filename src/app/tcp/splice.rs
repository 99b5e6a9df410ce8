use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::app::{context::AppContext, registry::TcpRecord};

/// Wake period used to check the idle timeout between reads, matching the
/// original's `forward_loop`'s 2.0s `select()` timeout.
const WAKE_PERIOD: Duration = Duration::from_secs(2);

/// Cap on how much of an upstream response this loop buffers for the
/// response cache; larger responses are left uncached rather than held in
/// memory for the life of the connection.
const CACHE_BUFFER_CAP: usize = 2 * 1024 * 1024;

/// Bidirectional copy loop between the client and the dialed upstream
/// (spec §4.6 step 6). The forwarder's HTTP `Host` sniff uses `peek`, so
/// the sniffed bytes are still on the wire for the first `read` here to
/// pick up; nothing needs replaying. `cache_key`, when set, means the
/// request was a cacheable GET miss: the upstream response is buffered and
/// handed to the cache once it's fully received (spec §4.6's D1 cache).
pub(crate) async fn run(
    ctx: &AppContext,
    record: &TcpRecord,
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    _peeked_request: Option<Vec<u8>>,
    cache_key: Option<(String, String)>,
) {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();

    let mut client_buf = vec![0u8; ctx.buffer_size];
    let mut upstream_buf = vec![0u8; ctx.buffer_size];
    let mut last_activity = tokio::time::Instant::now();
    let mut last_rate_sample = tokio::time::Instant::now();
    let mut cache_buf = cache_key.is_some().then(Vec::new);

    loop {
        tokio::select! {
            _ = record.wait_for_kill() => {
                debug!("connection killed by registry");
                break;
            }
            result = client_rd.read(&mut client_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if upstream_wr.write_all(&client_buf[..n]).await.is_err() {
                            break;
                        }
                        last_activity = tokio::time::Instant::now();
                        record.bytes_c2r.fetch_add(n as u64, Ordering::Relaxed);
                        ctx.registry.counters.add_client_to_remote(n as u64);
                        if !record.is_direct() {
                            attribute_backend_bytes(ctx, record, n as u64, &mut last_rate_sample);
                        }
                    }
                }
            }
            result = upstream_rd.read(&mut upstream_buf) => {
                match result {
                    Ok(0) => {
                        finalize_cache(ctx, &cache_key, cache_buf.take());
                        break;
                    }
                    Err(_) => break,
                    Ok(n) => {
                        if client_wr.write_all(&upstream_buf[..n]).await.is_err() {
                            break;
                        }
                        last_activity = tokio::time::Instant::now();
                        record.bytes_r2c.fetch_add(n as u64, Ordering::Relaxed);
                        ctx.registry.counters.add_remote_to_client(n as u64);
                        if !record.is_direct() {
                            attribute_backend_bytes(ctx, record, n as u64, &mut last_rate_sample);
                        }
                        if let Some(buf) = cache_buf.as_mut() {
                            if buf.len() + n <= CACHE_BUFFER_CAP {
                                buf.extend_from_slice(&upstream_buf[..n]);
                            } else {
                                cache_buf = None;
                            }
                        }
                    }
                }
            }
            _ = tokio::time::sleep(WAKE_PERIOD) => {
                if last_activity.elapsed() >= ctx.idle_timeout {
                    debug!("connection idle timeout");
                    break;
                }
            }
        }
    }
    let _ = client_wr.shutdown().await;
    let _ = upstream_wr.shutdown().await;
}

/// Splits a fully-buffered HTTP response into headers/body and admits it to
/// the cache under `(host, path)`, content-type gated by the backing
/// store's own admission policy (spec §4.6's D1 cache).
fn finalize_cache(ctx: &AppContext, cache_key: &Option<(String, String)>, buf: Option<Vec<u8>>) {
    let (Some((host, path)), Some(buf)) = (cache_key, buf) else {
        return;
    };
    let Some(header_end) = find_header_terminator(&buf) else {
        return;
    };
    let content_type = parse_content_type(&buf[..header_end]);
    ctx.cache.set(host, path, content_type.as_deref(), Bytes::from(buf));
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_type(headers: &[u8]) -> Option<String> {
    String::from_utf8_lossy(headers)
        .lines()
        .find_map(|line| {
            line.strip_prefix("Content-Type: ")
                .or_else(|| line.strip_prefix("content-type: "))
        })
        .map(|v| v.trim().to_string())
}

fn attribute_backend_bytes(
    ctx: &AppContext,
    record: &TcpRecord,
    n: u64,
    last_rate_sample: &mut tokio::time::Instant,
) {
    let Some((host, port)) = record.backend.lock().clone() else {
        return;
    };
    let elapsed = last_rate_sample.elapsed();
    *last_rate_sample = tokio::time::Instant::now();
    if let Some(backend) = ctx
        .pool
        .backends()
        .into_iter()
        .find(|b| b.host == host && b.port == port)
    {
        backend.add_bytes(n, elapsed);
    }
}
