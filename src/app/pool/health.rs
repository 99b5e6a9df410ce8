use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{atomic::AtomicU64, Arc},
    time::{Duration, Instant},
};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::{
    net::TcpStream,
    time::{interval_at, timeout},
};
use tracing::{debug, info, instrument, trace};

use crate::app::socks5::{self, Credentials};

use super::backend::Backend;
use super::select::Pool;

/// Well-known public DNS resolvers probed for internet reachability, spec
/// §4.4's "rotate across a small list of public resolvers". Grounded on the
/// teacher's `checking/service.rs`, which probes a single configurable DNS
/// endpoint the same way (a DNS query sent through the freshly bound SOCKS
/// session, with a short read deadline).
const PUBLIC_DNS_PROBES: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
];
const DNS_PROBE_PORT: u16 = 53;

/// Probes every backend on a timer and maintains the pool's health state
/// and global availability signal (spec §4.4, C4). Grounded on
/// `checking/service.rs`'s `CheckingService`: an `interval_at` tick driving
/// a `FuturesUnordered` fan-out over every backend, folded into an
/// up/down count per cycle.
pub(crate) struct HealthMonitor {
    pool: Arc<Pool>,
    creds: Option<Credentials>,
    check_interval: Duration,
    cycle: AtomicU64,
}

impl HealthMonitor {
    pub(crate) fn new(pool: Arc<Pool>, creds: Option<Credentials>, check_interval: Duration) -> Self {
        Self {
            pool,
            creds,
            check_interval,
            cycle: AtomicU64::new(0),
        }
    }

    /// Runs forever. `on_recovered` implements the forced re-proxy action:
    /// it's invoked once per unavailable→available transition and should
    /// close every live direct-fallback connection so clients reconnect
    /// through SOCKS.
    #[instrument(skip_all)]
    pub(crate) async fn launch<F>(self, on_recovered: F) -> !
    where
        F: Fn() + Send + Sync + 'static,
    {
        debug!("health monitor started");
        let mut interval = interval_at(tokio::time::Instant::now(), self.check_interval);
        loop {
            interval.tick().await;
            self.check_all().await;
            match self.pool.recompute_availability() {
                Some(true) => on_recovered(),
                Some(false) => (),
                None => (),
            }
        }
    }

    #[instrument(skip_all)]
    async fn check_all(&self) {
        use std::sync::atomic::Ordering;
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
        let dns_probe = PUBLIC_DNS_PROBES[cycle as usize % PUBLIC_DNS_PROBES.len()];
        trace!("starting health probe cycle against {dns_probe}");
        let backends = self.pool.backends();
        let due: Vec<_> = backends.into_iter().filter(|b| b.backoff_elapsed()).collect();
        let probes: FuturesUnordered<_> = due
            .into_iter()
            .map(|backend| {
                let creds = self.creds.clone();
                Box::pin(async move {
                    let result = probe_backend(&backend, dns_probe, creds).await;
                    (backend, result)
                })
            })
            .collect();
        let (sum, ok) = probes
            .inspect(|(backend, result)| {
                let (server_ms, internet_ms) = match result {
                    Ok((server, internet)) => (Some(*server), *internet),
                    Err(_) => (None, None),
                };
                backend.record_probe(server_ms, internet_ms);
            })
            .fold((0usize, 0usize), |(sum, ok), (_, result)| {
                futures::future::ready((sum + 1, ok + usize::from(result.is_ok())))
            })
            .await;
        debug!("health probe cycle done: {ok}/{sum} reachable");
    }
}

async fn probe_backend(
    backend: &Backend,
    dns_probe: IpAddr,
    creds: Option<Credentials>,
) -> std::io::Result<(u32, Option<u32>)> {
    const PROBE_TIMEOUT: Duration = Duration::from_secs(4);
    let t0 = Instant::now();
    let mut stream = timeout(
        PROBE_TIMEOUT,
        TcpStream::connect((backend.host.as_str(), backend.port)),
    )
    .await??;
    let server_latency_ms = t0.elapsed().as_millis() as u32;

    let t1 = Instant::now();
    let internet_latency_ms = timeout(PROBE_TIMEOUT, async {
        socks5::greet(&mut stream, creds.as_ref())
            .await
            .map_err(std::io::Error::other)?;
        socks5::connect(
            &mut stream,
            &dns_probe.to_string(),
            DNS_PROBE_PORT,
        )
        .await
        .map_err(std::io::Error::other)?;
        Ok::<_, std::io::Error>(t1.elapsed().as_millis() as u32)
    })
    .await
    .ok()
    .and_then(Result::ok);

    Ok((server_latency_ms, internet_latency_ms))
}
