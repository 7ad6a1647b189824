//! Connection dispatch.
//!
//! Every accepted connection is served as HTTP/1.1. Requests are classified
//! into three kinds:
//!
//! ```text
//! CONNECT host:port ──► 200 ──► sniff first byte ─┬─ TLS ──► terminate, serve HTTP
//!                                                  └─ plain ─► serve HTTP
//! Upgrade: ...      ──► rules ──► accepted/mocked, or spliced to origin on 101
//! anything else     ──► rules ──► mocked, or forwarded to origin
//! ```
//!
//! Both tunnel flavours are served in-process by the same HTTP service, so a
//! request looks the same to the rule table however it arrived.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mocker_core::{parse_host, HostAddress};
use rustls::server::Acceptor;
use tokio::io::{copy_bidirectional, AsyncReadExt};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

use crate::authority::CertificateAuthority;
use crate::body::{empty_body, full_body, ProxyBody};
use crate::error::{ProxyError, Result};
use crate::forward::Forwarder;
use crate::io::{AsyncStream, Rewind};
use crate::request::{Endpoint, RequestContext};
use crate::response::ResponseContext;
use crate::rules::RuleStore;

/// Bytes read from a fresh tunnel before choosing TLS or plain HTTP.
const SNIFF_BUFFER_SIZE: usize = 4096;

/// Whether `byte` starts a TLS record or a legacy SSL hello.
pub fn is_tls_start(byte: u8) -> bool {
    // 0x16: TLS handshake record; 0x80 and 0x00: SSLv2-compatible hellos
    matches!(byte, 0x16 | 0x80 | 0x00)
}

/// Serves proxy connections.
#[derive(Debug)]
pub struct Dispatcher {
    authority: Arc<CertificateAuthority>,
    rules: Arc<RuleStore>,
    forwarder: Arc<Forwarder>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        authority: Arc<CertificateAuthority>,
        rules: Arc<RuleStore>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            authority,
            rules,
            forwarder,
        }
    }

    /// Serves HTTP/1.1 on `stream` until the client goes away.
    pub fn serve<S>(self: Arc<Self>, stream: S, endpoint: Endpoint) -> BoxFuture<'static, ()>
    where
        S: AsyncStream + 'static,
    {
        Box::pin(async move {
            let service = service_fn(move |req| {
                let this = self.clone();
                let endpoint = endpoint.clone();
                async move { Ok::<_, Infallible>(this.handle(req, endpoint).await) }
            });

            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!("Connection closed with error: {}", e);
            }
        })
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        endpoint: Endpoint,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req);
        }

        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.handle_request(req, endpoint).await {
            Ok(response) => {
                info!(
                    "{} {} {} ({}ms)",
                    method,
                    uri,
                    response.status().as_u16(),
                    started.elapsed().as_millis()
                );
                response
            }
            Err(e) => {
                warn!("{} {} failed: {}", method, uri, e);
                error_response(&e)
            }
        }
    }

    /// Answers `CONNECT` and takes over the tunnel once hyper releases it.
    fn handle_connect(self: Arc<Self>, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let target = req
            .uri()
            .authority()
            .map(|authority| parse_host(authority.as_str(), 443));
        let target = match target {
            Some(Ok(target)) => target,
            Some(Err(e)) => return error_response(&e.into()),
            None => {
                return error_response(&ProxyError::InvalidRequest(format!(
                    "CONNECT target missing: {}",
                    req.uri()
                )))
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => self.tunnel(TokioIo::new(upgraded), target).await,
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        let mut response = Response::new(empty_body());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    /// Routes a tunnel to the TLS terminator or the plain HTTP service.
    async fn tunnel<S>(self: Arc<Self>, mut stream: S, target: HostAddress)
    where
        S: AsyncStream + 'static,
    {
        let mut head = vec![0u8; SNIFF_BUFFER_SIZE];
        let n = match stream.read(&mut head).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("Tunnel to {} closed before any data: {}", target, e);
                return;
            }
        };
        head.truncate(n);

        let secure = is_tls_start(head[0]);
        debug!(
            "Tunnel to {} carries {}",
            target,
            if secure { "TLS" } else { "plain HTTP" }
        );

        let stream = Rewind::new(Bytes::from(head), stream);
        if secure {
            if let Err(e) = self.terminate_tls(stream, target).await {
                warn!("TLS termination failed: {}", e);
            }
        } else {
            self.serve(stream, Endpoint::tunnel(target, false)).await;
        }
    }

    /// Completes the client handshake with a leaf for the requested name and
    /// serves the decrypted stream.
    async fn terminate_tls<S>(self: Arc<Self>, stream: S, target: HostAddress) -> Result<()>
    where
        S: AsyncStream + 'static,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("Failed to read ClientHello: {}", e)))?;

        let sni = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| target.hostname.clone());
        let config = self.authority.issue(&sni).await?;

        let tls = start
            .into_stream(config)
            .await
            .map_err(|e| ProxyError::Tls(format!("Handshake for {} failed: {}", sni, e)))?;

        self.serve(tls, Endpoint::tunnel(target, true)).await;
        Ok(())
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        endpoint: Endpoint,
    ) -> Result<Response<ProxyBody>> {
        let mut ctx = RequestContext::from_request(req, &endpoint, self.forwarder.clone())?;

        // Evaluate against the set active when the request arrived
        let rules = self.rules.snapshot();
        let handled = rules.evaluate(&mut ctx).await?;

        let mut response = if ctx.is_upgrade() {
            self.handle_upgrade(&mut ctx, handled).await?
        } else {
            match handled {
                Some(response) => response,
                None => ctx.send().await?,
            }
        };

        for hook in ctx.take_response_hooks() {
            response = hook(response).await?;
        }
        response.into_response()
    }

    /// Upgrades a rule did not answer go to the origin; a `101` from there
    /// splices the two connections.
    async fn handle_upgrade(
        &self,
        ctx: &mut RequestContext,
        handled: Option<ResponseContext>,
    ) -> Result<ResponseContext> {
        if let Some(response) = handled {
            return Ok(response);
        }
        if ctx.is_accepted() {
            return Err(ProxyError::Proxy(
                "Upgrade accepted without a response".to_string(),
            ));
        }

        let client = ctx.take_on_upgrade();
        let mut response = ctx.send().await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match (client, response.take_upgrade()) {
                (Some(client), Some(upstream)) => {
                    let href = ctx.href();
                    tokio::spawn(async move { splice(client, upstream, href).await });
                }
                _ => warn!("Upgrade for {} cannot be spliced", ctx.href()),
            }
        }
        Ok(response)
    }
}

/// Relays bytes between an upgraded client and origin until either closes.
async fn splice(client: OnUpgrade, upstream: OnUpgrade, href: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade of {} failed: {}", href, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!("Upgraded {} closed ({} bytes up, {} down)", href, sent, received)
        }
        Err(e) => debug!("Upgraded {} closed with error: {}", href, e),
    }
}

/// Maps a failure to the response the client sees.
pub fn error_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(err.to_string()));
    *response.status_mut() = error_status(err);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;

    #[test]
    fn tls_sniffing() {
        assert!(is_tls_start(0x16));
        assert!(is_tls_start(0x80));
        assert!(is_tls_start(0x00));
        assert!(!is_tls_start(b'G'));
        assert!(!is_tls_start(b'P'));
    }

    #[test]
    fn error_statuses() {
        let exhausted = ProxyError::Upstream(UpstreamError::Exhausted {
            target: "a.test:443".to_string(),
        });
        assert_eq!(error_status(&exhausted), StatusCode::BAD_GATEWAY);
        assert_eq!(
            error_status(&ProxyError::InvalidRequest("no host".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&ProxyError::Http("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_response_is_plain_text() {
        let response = error_response(&ProxyError::InvalidRequest("bad".to_string()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
