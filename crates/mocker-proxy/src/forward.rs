//! Forwarding requests to their origin.

use std::fmt;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::body::ProxyBody;
use crate::error::{ProxyError, Result};
use crate::io::AsyncStream;
use crate::request::RequestContext;
use crate::response::ResponseContext;
use crate::tls::{crypto_provider, server_name, upstream_client_config};
use crate::upstream::{UpstreamManager, UpstreamSpec};

/// Sends requests to origins through the configured upstream.
pub struct Forwarder {
    upstream: Arc<UpstreamManager>,
    tls: TlsConnector,
}

impl Forwarder {
    /// Creates a forwarder. `tls` is the client config used toward secure
    /// origins.
    pub fn new(upstream: Arc<UpstreamManager>, tls: Arc<ClientConfig>) -> Self {
        Self {
            upstream,
            tls: TlsConnector::from(tls),
        }
    }

    /// A forwarder that connects straight to origins.
    pub fn direct() -> Result<Self> {
        let tls = upstream_client_config(crypto_provider())?;
        let upstream = Arc::new(UpstreamManager::new(UpstreamSpec::Direct, tls.clone()));
        Ok(Self::new(upstream, tls))
    }

    /// The upstream manager used to reach origins.
    pub fn upstream(&self) -> &Arc<UpstreamManager> {
        &self.upstream
    }

    /// Sends `req` to its destination.
    ///
    /// The connection is opened through the upstream manager and, for secure
    /// requests, re-encrypted with `servername` as SNI. Upgrades stay
    /// available on the returned response.
    pub async fn send(&self, req: &mut RequestContext) -> Result<ResponseContext> {
        let href = req.href();
        let stream = self
            .upstream
            .connect(req.port(), req.hostname(), &href)
            .await?;

        let outbound = req.to_outbound().await?;
        debug!("Forwarding {} {}", req.method(), href);

        let response = if req.is_secure() {
            let name = server_name(req.servername())?;
            let stream = self
                .tls
                .connect(name, stream)
                .await
                .map_err(|e| ProxyError::Tls(format!("Handshake with {} failed: {}", href, e)))?;
            exchange(stream, outbound).await?
        } else {
            exchange(stream, outbound).await?
        };

        Ok(ResponseContext::from_upstream(response, req.method().clone()))
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}

/// Runs a single HTTP/1.1 exchange over `stream`.
async fn exchange<S>(stream: S, request: Request<ProxyBody>) -> Result<Response<Incoming>>
where
    S: AsyncStream + 'static,
{
    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    Ok(sender.send_request(request).await?)
}
