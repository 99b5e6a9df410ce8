use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::cli::{CliArgs, EnvConfig};

use super::{
    cache::ResponseCache,
    dns::Resolver,
    policy::PolicyEngine,
    pool::Pool,
    registry::Registry,
    socks5::Credentials,
};

/// Shared application state, cheap to clone (every field is an `Arc`),
/// passed down into every accepted connection's task. Grounded on the
/// teacher's `AppContext`, generalized from its single `socks5_servers`
/// field to the full set of C4/C5/C9/D1 collaborators this forwarder needs.
#[derive(Clone)]
pub(crate) struct AppContext {
    pub(crate) pool: Arc<Pool>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) policy: Arc<PolicyEngine>,
    pub(crate) dns: Arc<Resolver>,
    pub(crate) cache: Arc<dyn ResponseCache>,
    pub(crate) env: Arc<EnvConfig>,
    pub(crate) socks_creds: Option<Credentials>,
    pub(crate) buffer_size: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) connect_retries: u32,
    pub(crate) retry_backoff: f64,
    pub(crate) keepalive: KeepaliveParams,
    pub(crate) udp_session_timeout: Duration,
    pub(crate) udp_buffer_size: usize,
    pub(crate) enable_http2: bool,
    pub(crate) fixed_target: Option<(String, u16)>,
    pub(crate) sse_interval: u64,
    pub(crate) graceful_shutdown_timeout: Duration,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct KeepaliveParams {
    pub(crate) idle: Duration,
    pub(crate) interval: Duration,
    pub(crate) count: u32,
}

impl AppContext {
    pub(crate) fn from_cli_args(args: &CliArgs, env: EnvConfig) -> Self {
        let mut seen = std::collections::HashSet::new();
        let backends: Vec<(String, u16)> = args
            .socks_host
            .iter()
            .flat_map(|host| args.socks_port.iter().map(move |port| (host.clone(), *port)))
            .filter(|pair| {
                if seen.contains(pair) {
                    warn!(host = %pair.0, port = pair.1, "duplicated SOCKS backend, skipping");
                    false
                } else {
                    seen.insert(pair.clone());
                    true
                }
            })
            .collect();
        info!(count = backends.len(), "configured SOCKSv5 backends");
        if backends.is_empty() {
            warn!("no SOCKS backend configured");
        }

        let socks_creds = match (&args.socks_user, &args.socks_pass) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let cache: Arc<dyn ResponseCache> = super::cache::build(args);

        Self {
            pool: Arc::new(Pool::new(backends)),
            registry: Arc::new(Registry::new()),
            policy: Arc::new(PolicyEngine::load(&env.traffic_rules)),
            dns: Arc::new(Resolver::new(Duration::from_secs(args.dns_ttl), args.enable_doh)),
            cache,
            env: Arc::new(env),
            socks_creds,
            buffer_size: args.buffer_size,
            idle_timeout: Duration::from_secs(args.idle_timeout),
            connect_timeout: Duration::from_secs(args.connect_timeout),
            connect_retries: args.connect_retries,
            retry_backoff: args.retry_backoff,
            keepalive: KeepaliveParams {
                idle: Duration::from_secs(args.keepidle),
                interval: Duration::from_secs(args.keepintvl),
                count: args.keepcnt,
            },
            udp_session_timeout: Duration::from_secs(args.udp_session_timeout),
            udp_buffer_size: args.udp_buffer_size,
            enable_http2: args.enable_http2,
            fixed_target: args.fixed_target(),
            sse_interval: args.sse_interval,
            graceful_shutdown_timeout: args.graceful_shutdown_timeout,
        }
    }
}
