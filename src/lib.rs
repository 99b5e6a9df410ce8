//! Library crate backing the `t2s` binary. Keeps almost everything
//! `pub(crate)`-scoped as before; the only two things this crate exposes to
//! the outside are [`run_from_env`], which the `t2s` binary is a thin
//! wrapper around, and [`testkit`], an in-process harness the integration
//! tests drive the real collaborators through.

pub(crate) mod app;
pub(crate) mod cli;

#[doc(hidden)]
pub mod testkit;

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::prelude::*;

use app::AppContext;
use cli::{CliArgs, ConfigFile, EnvConfig};

/// Parses CLI/env/config, then runs the proxy until shutdown. Returns the
/// process exit code (spec §6); the binary's `main` just forwards it to
/// `std::process::exit`.
pub async fn run_from_env() -> i32 {
    let args = CliArgs::parse();

    let config_path = args
        .config_file
        .clone()
        .or_else(|| std::env::var("T2S_CONFIG_FILE").ok().map(Into::into));
    let config = match &config_path {
        Some(path) => match ConfigFile::from_path(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to read config file {}: {err}", path.display());
                return 2;
            }
        },
        None => ConfigFile::default(),
    };
    let env = EnvConfig::load(&config);

    init_tracing(&args, &env);

    if args.socks_host.is_empty() || args.socks_port.is_empty() {
        tracing::error!("at least one --socks-host and --socks-port are required");
        return 2;
    }

    if args.self_test {
        return self_test(&args).await;
    }

    let ctx = AppContext::from_cli_args(&args, env);
    app::supervisor::run(ctx, args).await
}

fn init_tracing(args: &CliArgs, env: &EnvConfig) {
    let registry = tracing_subscriber::registry().with(args.log_level);
    if env.log_format_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Startup self-checks (spec §6's `--self-test`): verifies the listeners can
/// actually bind, without serving any traffic. Exits 0 on success, 2 on any
/// failure, matching the documented exit codes.
async fn self_test(args: &CliArgs) -> i32 {
    if args.mode.wants_tcp() {
        let addr = SocketAddr::new(args.listen_addr, args.listen_port);
        if let Err(err) = tokio::net::TcpListener::bind(addr).await {
            tracing::error!(%err, %addr, "self-test: TCP listener bind failed");
            return 2;
        }
    }
    if args.mode.wants_udp() {
        let addr = SocketAddr::new(args.listen_addr, args.udp_listen_port());
        if let Err(err) = app::resolve::bind_tproxy_udp(&addr) {
            tracing::error!(%err, %addr, "self-test: UDP TPROXY bind failed");
            return 2;
        }
    }
    tracing::info!("self-test passed");
    0
}
