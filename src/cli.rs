use std::{
    fs::File,
    io::{self, Read},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;
use tracing::metadata::LevelFilter;

use crate::app::types::AllSocksDownPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Tcp,
    Udp,
    TcpUdp,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Mode::Tcp),
            "udp" => Ok(Mode::Udp),
            "tcp-udp" => Ok(Mode::TcpUdp),
            other => Err(format!("invalid mode: {other}")),
        }
    }
}

impl Mode {
    pub(crate) fn wants_tcp(&self) -> bool {
        matches!(self, Mode::Tcp | Mode::TcpUdp)
    }

    pub(crate) fn wants_udp(&self) -> bool {
        matches!(self, Mode::Udp | Mode::TcpUdp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheMode {
    Memory,
    DiskCache,
}

impl std::str::FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(CacheMode::Memory),
            "disk-cache" => Ok(CacheMode::DiskCache),
            other => Err(format!("invalid cache-mode: {other}")),
        }
    }
}

/// Transparent forwarding proxy: recovers each flow's original destination
/// and relays it through a pool of upstream SOCKSv5 servers.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct CliArgs {
    /// Address to bind the TCP/UDP listeners on.
    #[clap(long, default_value_t = Ipv4Addr::UNSPECIFIED.into())]
    pub(crate) listen_addr: IpAddr,

    /// Port to listen on for intercepted TCP connections.
    #[clap(long, default_value_t = 11290)]
    pub(crate) listen_port: u16,

    /// Port to listen on for intercepted UDP datagrams (defaults to listen-port).
    #[clap(long)]
    pub(crate) udp_listen_port: Option<u16>,

    /// Comma-separated list of SOCKSv5 hosts.
    #[clap(long, required = true, value_delimiter = ',')]
    pub(crate) socks_host: Vec<String>,

    /// Comma-separated list of SOCKSv5 ports; cartesian product with
    /// socks-host becomes the backend pool.
    #[clap(long, required = true, value_delimiter = ',')]
    pub(crate) socks_port: Vec<u16>,

    /// Username for SOCKSv5 username/password authentication.
    #[clap(long)]
    pub(crate) socks_user: Option<String>,

    /// Password for SOCKSv5 username/password authentication.
    #[clap(long)]
    pub(crate) socks_pass: Option<String>,

    /// Fix every flow's target to this host, skipping original-destination lookup.
    #[clap(long)]
    pub(crate) target_host: Option<String>,

    /// Port to pair with target-host.
    #[clap(long)]
    pub(crate) target_port: Option<u16>,

    /// Which listeners to run.
    #[clap(long, default_value = "tcp-udp")]
    pub(crate) mode: Mode,

    /// TCP splice buffer size, in bytes.
    #[clap(long, default_value_t = 131072)]
    pub(crate) buffer_size: usize,

    /// TCP connection idle timeout, in seconds.
    #[clap(long, default_value_t = 600)]
    pub(crate) idle_timeout: u64,

    /// Dial timeout (direct or backend), in seconds.
    #[clap(long, default_value_t = 30)]
    pub(crate) connect_timeout: u64,

    /// Max dial attempts on dial-class failures (never on protocol errors).
    #[clap(long, default_value_t = 2)]
    pub(crate) connect_retries: u32,

    /// Base for the exponential dial-retry backoff, in seconds.
    #[clap(long, default_value_t = 1.0)]
    pub(crate) retry_backoff: f64,

    /// TCP_KEEPIDLE, in seconds.
    #[clap(long, default_value_t = 125)]
    pub(crate) keepidle: u64,

    /// TCP_KEEPINTVL, in seconds.
    #[clap(long, default_value_t = 30)]
    pub(crate) keepintvl: u64,

    /// TCP_KEEPCNT probes.
    #[clap(long, default_value_t = 3)]
    pub(crate) keepcnt: u32,

    /// Max concurrently live TCP connections.
    #[clap(long, default_value_t = 100)]
    pub(crate) max_conns: usize,

    /// TCP listen backlog.
    #[clap(long, default_value_t = 256)]
    pub(crate) backlog: u32,

    /// Max idle time before a UDP session stops being tracked, in seconds.
    #[clap(long, default_value_t = 125)]
    pub(crate) udp_session_timeout: u64,

    /// UDP relay buffer size, in bytes.
    #[clap(long, default_value_t = 131072)]
    pub(crate) udp_buffer_size: usize,

    /// Enable the HTML/JSON/Prometheus dashboard.
    #[clap(long)]
    pub(crate) web_socket: bool,

    /// Dashboard listen port.
    #[clap(long, default_value_t = 8000)]
    pub(crate) web_port: u16,

    /// TLS certificate path, enables TLS on the dashboard.
    #[clap(long)]
    pub(crate) certificate: Option<PathBuf>,

    /// HTTP response cache backing store.
    #[clap(long, default_value = "memory")]
    pub(crate) cache_mode: CacheMode,

    /// DNS cache TTL, in seconds.
    #[clap(long, default_value_t = 600)]
    pub(crate) dns_ttl: u64,

    /// HTTP response cache TTL, in seconds.
    #[clap(long, default_value_t = 600)]
    pub(crate) cache_ttl: u64,

    /// Server-sent-events emission interval, in seconds.
    #[clap(long, default_value_t = 1)]
    pub(crate) sse_interval: u64,

    /// Best-effort cleartext HTTP/2 preface peek on port 80 (default off, see Open Question a).
    #[clap(long)]
    pub(crate) enable_http2: bool,

    /// Try DNS-over-HTTPS before falling back to the platform resolver.
    #[clap(long)]
    pub(crate) enable_doh: bool,

    /// Reserved for DNS-over-QUIC; accepted for config compatibility, not implemented.
    #[clap(long)]
    pub(crate) enable_doq: bool,

    /// Enable the HTTP response cache's enhanced admission policy.
    #[clap(long)]
    pub(crate) enhanced_cache: bool,

    /// Run startup self-checks and exit (0 on success, 2 on failure).
    #[clap(long)]
    pub(crate) self_test: bool,

    /// Optional TOML config file; CLI flags take precedence.
    #[clap(long)]
    pub(crate) config_file: Option<PathBuf>,

    /// Disable health probing (backends are assumed always SOCKS-capable).
    #[clap(long)]
    pub(crate) no_check: bool,

    /// Log verbosity.
    #[clap(long, default_value = "info")]
    pub(crate) log_level: LevelFilter,

    /// Period of time between health-probe cycles.
    #[clap(long, default_value = "35s")]
    #[clap(parse(try_from_str = parse_duration::parse))]
    pub(crate) check_interval: Duration,

    /// How long a graceful shutdown waits for live connections to drain
    /// before force-closing them.
    #[clap(long, default_value = "30s")]
    #[clap(parse(try_from_str = parse_duration::parse))]
    pub(crate) graceful_shutdown_timeout: Duration,
}

impl CliArgs {
    pub(crate) fn udp_listen_port(&self) -> u16 {
        self.udp_listen_port.unwrap_or(self.listen_port)
    }

    pub(crate) fn fixed_target(&self) -> Option<(String, u16)> {
        match (&self.target_host, self.target_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

/// TOML config file overlay, merged under CLI flags (CLI always wins).
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub(crate) traffic_rules: Option<serde_json::Value>,
    #[serde(default)]
    pub(crate) all_socks_down_policy: Option<AllSocksDownPolicy>,
    #[serde(default)]
    pub(crate) rate_limit_per_minute: Option<u32>,
}

impl ConfigFile {
    pub(crate) fn from_path<T: AsRef<Path>>(path: T) -> io::Result<Self> {
        let mut buf = String::new();
        File::open(path)?.read_to_string(&mut buf)?;
        toml::from_str(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

/// Environment-sourced knobs that are not CLI flags (spec §6).
#[derive(Debug, Clone)]
pub(crate) struct EnvConfig {
    pub(crate) traffic_rules: String,
    pub(crate) all_socks_down_policy: AllSocksDownPolicy,
    pub(crate) socks_required_policy: AllSocksDownPolicy,
    pub(crate) socks_required_max_wait: Duration,
    pub(crate) force_reproxy_on_recovery: bool,
    pub(crate) web_ui_user: Option<String>,
    pub(crate) web_ui_pass: Option<String>,
    pub(crate) rate_limit_per_minute: Option<u32>,
    pub(crate) log_format_json: bool,
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

impl EnvConfig {
    pub(crate) fn load(config: &ConfigFile) -> Self {
        let all_socks_down_policy = std::env::var("ALL_SOCKS_DOWN_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(config.all_socks_down_policy)
            .unwrap_or_default();
        let socks_required_policy = std::env::var("SOCKS_REQUIRED_POLICY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(AllSocksDownPolicy::Wait);
        let socks_required_max_wait = std::env::var("SOCKS_REQUIRED_MAX_WAIT")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(5));
        Self {
            traffic_rules: std::env::var("TRAFFIC_RULES").unwrap_or_else(|_| {
                config
                    .traffic_rules
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            }),
            all_socks_down_policy,
            socks_required_policy,
            socks_required_max_wait,
            force_reproxy_on_recovery: env_bool("FORCE_REPROXY_ON_SOCKS_RECOVERY", true),
            web_ui_user: std::env::var("WEB_UI_USER").ok(),
            web_ui_pass: std::env::var("WEB_UI_PASS").ok(),
            rate_limit_per_minute: std::env::var("T2S_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(config.rate_limit_per_minute),
            log_format_json: std::env::var("T2S_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}
