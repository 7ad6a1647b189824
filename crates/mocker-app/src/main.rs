//! Mocker - intercepting proxy for mocking HTTP(S) traffic.
//!
//! Runs the proxy with the root CA from `--cert`/`--key` (generated when
//! missing) and serves mocks from a JSON rule file that is reloaded on change.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mocker_app::logging::{init_logging, resolve_log_level, LOG_ENV};
use mocker_app::RuleFileWatcher;
use mocker_proxy::{
    CaStore, CertificateAuthority, ProxyConfig, ProxyServer, UpstreamSpec, DEFAULT_PROXY_PORT,
};

/// Mocker - intercepting proxy for mocking HTTP(S) traffic
#[derive(Parser, Debug)]
#[command(name = "mocker", version, about)]
struct Args {
    /// JSON rule file
    rules: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Upstream: direct, "http host:port", "socks5 host:port", "pac <url>", ...
    #[arg(short, long, default_value = "direct")]
    upstream: String,

    /// Root CA private key
    #[arg(short, long, default_value = "ssl/key.pem")]
    key: PathBuf,

    /// Root CA certificate
    #[arg(short, long, default_value = "ssl/cert.pem")]
    cert: PathBuf,

    /// Store issued host certificates next to the root CA
    #[arg(long)]
    persist_certs: bool,

    /// User-Agent sent to upstream HTTP proxies
    #[arg(long)]
    user_agent: Option<String>,

    /// How often to check the rule file for changes
    #[arg(long, default_value_t = 500)]
    reload_interval_ms: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write daily rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_level = std::env::var(LOG_ENV).ok();
    let level = resolve_log_level(env_level.as_deref(), args.debug, &args.log_level);
    let _log_guard = init_logging(&level, args.log_dir.as_deref());

    let store = CaStore::new(&args.cert, &args.key);
    let root = store
        .ensure_root()
        .with_context(|| format!("Failed to load root CA from {:?}", args.cert))?;
    tracing::info!("Root CA: {:?}", store.cert_path());

    let mut authority = CertificateAuthority::new(root);
    if args.persist_certs {
        authority = authority.with_leaf_store(Arc::new(store.clone()));
    }

    let upstream: UpstreamSpec = args
        .upstream
        .parse()
        .with_context(|| format!("Invalid upstream '{}'", args.upstream))?;

    let mut config = ProxyConfig::new()
        .with_addr(SocketAddr::new(args.host, args.port))
        .with_upstream(upstream);
    if let Some(user_agent) = &args.user_agent {
        config = config.with_user_agent(user_agent.clone());
    }

    let server = ProxyServer::new(config, Arc::new(authority));

    let reload = match &args.rules {
        Some(path) => {
            let mut watcher = RuleFileWatcher::new(
                path,
                server.rules().clone(),
                Duration::from_millis(args.reload_interval_ms.max(1)),
            );
            watcher
                .load_now()
                .with_context(|| format!("Failed to load rules from {:?}", path))?;
            Some(watcher.spawn())
        }
        None => {
            tracing::warn!("No rule file given, forwarding everything");
            None
        }
    };

    let handle = server.start().await.context("Failed to start proxy")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    if let Some(reload) = reload {
        reload.abort();
    }
    handle.stop().await;

    Ok(())
}
