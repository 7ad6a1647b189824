//! Proxy server.
//!
//! Binds the listening socket and hands every accepted connection to the
//! [`Dispatcher`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::authority::CertificateAuthority;
use crate::dispatcher::Dispatcher;
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::request::Endpoint;
use crate::rules::{RuleSet, RuleStore};
use crate::tls::{crypto_provider, upstream_client_config};
use crate::upstream::{UpstreamManager, UpstreamSpec};
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// How origins are reached.
    pub upstream: UpstreamSpec,
    /// `User-Agent` sent to upstream HTTP proxies.
    pub user_agent: Option<String>,
}

impl ProxyConfig {
    /// Creates a new configuration with default settings.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            upstream: UpstreamSpec::Direct,
            user_agent: None,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the upstream strategy.
    pub fn with_upstream(mut self, upstream: UpstreamSpec) -> Self {
        self.upstream = upstream;
        self
    }

    /// Sets the `User-Agent` for upstream proxy handshakes.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Intercepting forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    rules: Arc<RuleStore>,
}

impl ProxyServer {
    /// Creates a new proxy server with an empty rule set.
    pub fn new(config: ProxyConfig, authority: Arc<CertificateAuthority>) -> Self {
        Self {
            config,
            authority,
            rules: Arc::new(RuleStore::default()),
        }
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the certificate authority.
    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Returns the rule store. Replacing its contents takes effect for the
    /// next request.
    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// Replaces the active rule set.
    pub fn set_rules(&self, rules: RuleSet) {
        self.rules.replace(rules);
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>> {
        let tls = upstream_client_config(crypto_provider())?;

        let mut upstream = UpstreamManager::new(self.config.upstream.clone(), tls.clone());
        if let Some(user_agent) = &self.config.user_agent {
            upstream = upstream.with_user_agent(user_agent.clone());
        }
        let forwarder = Arc::new(Forwarder::new(Arc::new(upstream), tls));

        Ok(Arc::new(Dispatcher::new(
            self.authority.clone(),
            self.rules.clone(),
            forwarder,
        )))
    }

    /// Starts the proxy server.
    ///
    /// This will block until the server is shut down.
    pub async fn run(self) -> Result<()> {
        self.start().await?.wait().await;
        Ok(())
    }

    /// Binds the listener and serves connections in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let dispatcher = self.dispatcher()?;

        let listener = TcpListener::bind(self.config.addr).await.map_err(|e| {
            ProxyError::Proxy(format!("Failed to bind {}: {}", self.config.addr, e))
        })?;
        let addr = listener.local_addr()?;

        info!("Mocker proxy listening on {}", addr);
        info!("Upstream: {}", self.config.upstream);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(dispatcher.clone().serve(stream, Endpoint::direct()));
                        }
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Proxy shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("rules", &self.rules.snapshot().len())
            .finish()
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
