//! `/events` server-sent-events stream (spec §6), paced by `sse-interval`.
//! Grounded on the teacher's periodic-tick style (`tokio::time::interval`
//! drives a loop rather than pushing on every state change), adapted from a
//! plain background task to an `axum::response::sse::Event` stream.

use std::{convert::Infallible, time::Duration};

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::{wrappers::IntervalStream, StreamExt};

use crate::app::context::AppContext;

#[derive(Serialize)]
struct Snapshot {
    udp_sessions_active: u64,
    tcp_connections_active: usize,
    socks_available: bool,
    bytes_client_to_remote: u64,
    bytes_remote_to_client: u64,
}

pub(crate) fn stream(ctx: AppContext) -> impl Stream<Item = Result<Event, Infallible>> {
    let interval = tokio::time::interval(Duration::from_secs(ctx.sse_interval.max(1)));
    IntervalStream::new(interval).map(move |_| {
        use std::sync::atomic::Ordering::Relaxed;
        let counters = &ctx.registry.counters;
        let snapshot = Snapshot {
            udp_sessions_active: counters.udp_sessions_active.load(Relaxed),
            tcp_connections_active: ctx.registry.tcp_records().len(),
            socks_available: ctx.pool.is_available(),
            bytes_client_to_remote: counters.bytes_client_to_remote.load(Relaxed),
            bytes_remote_to_client: counters.bytes_remote_to_client.load(Relaxed),
        };
        Ok(Event::default().json_data(snapshot).unwrap_or_else(|_| Event::default()))
    })
}
