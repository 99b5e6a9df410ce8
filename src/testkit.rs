//! In-process test harness driving the real collaborators (accept loop,
//! health monitor, UDP session manager) against ephemeral ports, so the
//! scenario tests in `tests/scenarios.rs` exercise actual production code
//! paths instead of re-describing them. Not wired into the `t2s` binary.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    task::JoinHandle,
};

use crate::{
    app::{
        accept, context::AppContext, pool::HealthMonitor, registry::Counters, resolve, supervisor,
        types::AllSocksDownPolicy, udp,
    },
    cli::{CacheMode, CliArgs, EnvConfig, Mode},
};

/// Knobs for [`start`]; every field has a sensible default via
/// `TestConfig::default()` so scenarios only set what they care about.
pub struct TestConfig {
    pub socks_backend: Option<(String, u16)>,
    pub fixed_target: Option<(String, u16)>,
    pub traffic_rules: String,
    pub rate_limit_per_minute: Option<u32>,
    pub max_conns: usize,
    pub udp_session_timeout_secs: u64,
    pub check_interval: Duration,
    pub no_check: bool,
    pub enable_udp: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            socks_backend: None,
            fixed_target: None,
            traffic_rules: String::new(),
            rate_limit_per_minute: None,
            max_conns: 100,
            udp_session_timeout_secs: 125,
            check_interval: Duration::from_millis(50),
            no_check: true,
            enable_udp: false,
        }
    }
}

/// A point-in-time read of the registry counters and pool signal, the set
/// of fields the scenario assertions need.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub connections_http: u64,
    pub bytes_client_to_remote: u64,
    pub bytes_remote_to_client: u64,
    pub policy_dropped: u64,
    pub original_dst_unavailable: u64,
    pub errors_total: u64,
    pub pool_available: bool,
    pub bypass_count: u64,
    pub recovered_count: u64,
    pub udp_sessions_created: u64,
    pub udp_sessions_active: u64,
}

/// A running proxy instance bound to ephemeral ports. Dropping it aborts
/// every task it spawned.
pub struct ProxyHandle {
    ctx: AppContext,
    tcp_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn snapshot(&self) -> Snapshot {
        snapshot_counters(&self.ctx.registry.counters, &self.ctx)
    }

    /// Polls `snapshot()` until `pred` holds or `timeout` elapses, returning
    /// whether it held. Scenario assertions poll rather than sleep a fixed
    /// duration since byte counters and transition counts land at slightly
    /// different times depending on scheduler load.
    pub async fn wait_until(&self, timeout: Duration, mut pred: impl FnMut(&Snapshot) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snap = self.snapshot();
            if pred(&snap) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn snapshot_counters(counters: &Counters, ctx: &AppContext) -> Snapshot {
    use std::sync::atomic::Ordering::Relaxed;
    Snapshot {
        connections_http: counters.connections_http.load(Relaxed),
        bytes_client_to_remote: counters.bytes_client_to_remote.load(Relaxed),
        bytes_remote_to_client: counters.bytes_remote_to_client.load(Relaxed),
        policy_dropped: counters.err_policy_dropped.load(Relaxed),
        original_dst_unavailable: counters.err_original_dst_unavailable.load(Relaxed),
        errors_total: counters.errors_total(),
        pool_available: ctx.pool.is_available(),
        bypass_count: ctx.pool.bypass_count.load(Relaxed),
        recovered_count: ctx.pool.recovered_count.load(Relaxed),
        udp_sessions_created: counters.udp_sessions_created.load(Relaxed),
        udp_sessions_active: counters.udp_sessions_active.load(Relaxed),
    }
}

fn base_cli_args(config: &TestConfig) -> CliArgs {
    let (socks_host, socks_port) = match &config.socks_backend {
        Some((host, port)) => (vec![host.clone()], vec![*port]),
        None => (Vec::new(), Vec::new()),
    };
    CliArgs {
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        udp_listen_port: None,
        socks_host,
        socks_port,
        socks_user: None,
        socks_pass: None,
        target_host: config.fixed_target.as_ref().map(|(host, _)| host.clone()),
        target_port: config.fixed_target.as_ref().map(|(_, port)| *port),
        mode: Mode::TcpUdp,
        buffer_size: 16 * 1024,
        idle_timeout: 600,
        connect_timeout: 5,
        connect_retries: 1,
        retry_backoff: 1.0,
        keepidle: 125,
        keepintvl: 30,
        keepcnt: 3,
        max_conns: config.max_conns,
        backlog: 16,
        udp_session_timeout: config.udp_session_timeout_secs,
        udp_buffer_size: 16 * 1024,
        web_socket: false,
        web_port: 0,
        certificate: None,
        cache_mode: CacheMode::Memory,
        dns_ttl: 60,
        cache_ttl: 60,
        sse_interval: 1,
        enable_http2: false,
        enable_doh: false,
        enable_doq: false,
        enhanced_cache: false,
        self_test: false,
        config_file: None,
        no_check: config.no_check,
        log_level: tracing::metadata::LevelFilter::OFF,
        check_interval: config.check_interval,
        graceful_shutdown_timeout: Duration::from_secs(1),
    }
}

fn base_env_config(config: &TestConfig) -> EnvConfig {
    EnvConfig {
        traffic_rules: config.traffic_rules.clone(),
        all_socks_down_policy: AllSocksDownPolicy::Direct,
        socks_required_policy: AllSocksDownPolicy::Direct,
        socks_required_max_wait: Duration::from_millis(200),
        force_reproxy_on_recovery: true,
        web_ui_user: None,
        web_ui_pass: None,
        rate_limit_per_minute: config.rate_limit_per_minute,
        log_format_json: false,
    }
}

/// Brings up the TCP accept loop (and, when requested, the UDP listener and
/// reaper) against loopback ephemeral ports, wired to the same
/// `AppContext`, `Admission`, and `HealthMonitor` the binary uses.
///
/// UDP support binds with `IP_TRANSPARENT`, which needs `CAP_NET_ADMIN` (or
/// root); callers outside that environment should leave `enable_udp` unset.
pub async fn start(config: TestConfig) -> ProxyHandle {
    let args = base_cli_args(&config);
    let env = base_env_config(&config);
    let ctx = AppContext::from_cli_args(&args, env);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind ephemeral TCP listener");
    let tcp_addr = listener.local_addr().expect("TCP listener local addr");

    let admission = Arc::new(accept::Admission::new(
        config.max_conns,
        ctx.env.rate_limit_per_minute,
    ));
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let mut tasks = Vec::new();

    {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(supervisor::run_tcp_accept_loop(
            ctx, listener, admission, shutdown,
        )));
    }

    if !config.no_check {
        let monitor = HealthMonitor::new(ctx.pool.clone(), ctx.socks_creds.clone(), config.check_interval);
        let registry = ctx.registry.clone();
        tasks.push(tokio::spawn(async move {
            monitor.launch(move || registry.force_reproxy_direct_flows()).await;
        }));
    }

    let udp_addr = if config.enable_udp {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let socket = resolve::bind_tproxy_udp(&bind_addr)
            .expect("bind TPROXY UDP socket (requires CAP_NET_ADMIN/root)");
        let addr = socket.local_addr().expect("UDP listener local addr");
        let listener = Arc::new(socket);
        let sessions = Arc::new(udp::SessionTable::new());
        {
            let ctx = ctx.clone();
            let listener = listener.clone();
            let sessions = sessions.clone();
            tasks.push(tokio::spawn(async move {
                udp::run(ctx, listener, sessions).await;
            }));
        }
        {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                udp::run_reaper(ctx, sessions).await;
            }));
        }
        Some(addr)
    } else {
        None
    };

    ProxyHandle {
        ctx,
        tcp_addr,
        udp_addr,
        tasks,
    }
}

/// A fake upstream SOCKSv5 server: negotiates NOAUTH, handles CONNECT by
/// echoing `"ping"` as `"pong"`, and handles UDP-ASSOCIATE by echoing
/// relay-framed datagrams back verbatim. `set_healthy(false)` makes new
/// connections hang up immediately after accept, simulating a dead
/// backend for the health monitor to observe.
pub struct FakeSocks5 {
    addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FakeSocks5 {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

impl Drop for FakeSocks5 {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_fake_socks5() -> FakeSocks5 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind fake SOCKS5 listener");
    let addr = listener.local_addr().expect("fake SOCKS5 local addr");
    let healthy = Arc::new(AtomicBool::new(true));
    let healthy_for_task = healthy.clone();
    let task = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let healthy = healthy_for_task.clone();
            tokio::spawn(serve_fake_socks5(stream, healthy));
        }
    });
    FakeSocks5 { addr, healthy, task }
}

async fn serve_fake_socks5(mut stream: TcpStream, healthy: Arc<AtomicBool>) {
    if !healthy.load(Ordering::Relaxed) {
        return;
    }
    let mut greeting_hdr = [0u8; 2];
    if stream.read_exact(&mut greeting_hdr).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; greeting_hdr[1] as usize];
    if stream.read_exact(&mut methods).await.is_err() {
        return;
    }
    if stream.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    let mut req_hdr = [0u8; 4];
    if stream.read_exact(&mut req_hdr).await.is_err() {
        return;
    }
    let cmd = req_hdr[1];
    let Some(_addr) = read_socks_addr(&mut stream, req_hdr[3]).await else {
        return;
    };
    let mut port_buf = [0u8; 2];
    if stream.read_exact(&mut port_buf).await.is_err() {
        return;
    }

    match cmd {
        0x01 => serve_fake_connect(stream).await,
        0x03 => serve_fake_udp_associate(stream).await,
        _ => {}
    }
}

async fn read_socks_addr(stream: &mut TcpStream, atyp: u8) -> Option<()> {
    match atyp {
        0x01 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.ok()?;
        }
        0x04 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.ok()?;
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await.ok()?;
            let mut name = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut name).await.ok()?;
        }
        _ => return None,
    }
    Some(())
}

/// Replies `05 00` (succeeded, BND = 0.0.0.0:0) then echoes every inbound
/// chunk back as the literal bytes `b"pong"`, enough for scenario S2's
/// ping/pong round trip.
async fn serve_fake_connect(mut stream: TcpStream) {
    let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    if stream.write_all(&reply).await.is_err() {
        return;
    }
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_n) => {
                if stream.write_all(b"pong").await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Replies with a freshly bound relay `UdpSocket`'s port, then echoes every
/// relay-framed datagram back verbatim (same header, same payload) until
/// either the control connection or the relay socket gives up.
async fn serve_fake_udp_associate(mut stream: TcpStream) {
    let Ok(relay) = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await else {
        return;
    };
    let Ok(relay_addr) = relay.local_addr() else {
        return;
    };
    let mut reply = vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1];
    reply.extend_from_slice(&relay_addr.port().to_be_bytes());
    if stream.write_all(&reply).await.is_err() {
        return;
    }

    let control_watch = async {
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
    };
    let echo_loop = async {
        let mut buf = vec![0u8; 2048];
        loop {
            match relay.recv_from(&mut buf).await {
                Ok((n, peer)) => {
                    if relay.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };
    tokio::select! {
        _ = control_watch => {}
        _ = echo_loop => {}
    }
}
