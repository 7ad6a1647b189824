//! Upstream resolution: turning a destination into a connected stream.
//!
//! The proxy reaches origins through one configured strategy:
//!
//! - `direct`: plain TCP to the origin
//! - `http`/`proxy`/`https host:port`: an HTTP proxy tunnel via `CONNECT`
//! - `socks`/`socks4`/`socks4a`/`socks5 host:port`: a SOCKS tunnel
//! - `pac url`: a proxy auto-config script choosing per destination
//!
//! A resolution yields an ordered candidate list. [`UpstreamManager::connect`]
//! tries each in turn and only fails when all of them do.

pub mod http;
pub mod pac;
pub mod socks;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mocker_core::{parse_host, stringify_host, HostAddress};
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::io::BoxedStream;
use crate::tls::server_name;

pub use pac::PacResolver;

/// Default port of a plain HTTP proxy.
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 80;
/// Default port of an HTTPS proxy.
pub const DEFAULT_HTTPS_PROXY_PORT: u16 = 443;
/// Default port of a SOCKS proxy.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// SOCKS protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    /// SOCKS4: the proxy receives an IPv4 address.
    V4,
    /// SOCKS4a: the proxy resolves the hostname.
    V4a,
    /// SOCKS5 without authentication.
    V5,
}

impl SocksVersion {
    fn as_str(self) -> &'static str {
        match self {
            SocksVersion::V4 => "socks4",
            SocksVersion::V4a => "socks4a",
            SocksVersion::V5 => "socks5",
        }
    }
}

/// Configured upstream strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpstreamSpec {
    /// Connect straight to the origin.
    #[default]
    Direct,
    /// Tunnel through an HTTP proxy, optionally over TLS.
    Http {
        /// Proxy address.
        proxy: HostAddress,
        /// Speak TLS to the proxy itself.
        secure: bool,
    },
    /// Tunnel through a SOCKS proxy.
    Socks {
        /// Proxy address.
        proxy: HostAddress,
        /// Protocol variant.
        version: SocksVersion,
    },
    /// Let a PAC script pick per destination.
    Pac {
        /// Script location: `http(s)://`, `file://` or a path.
        url: String,
    },
}

impl FromStr for UpstreamSpec {
    type Err = UpstreamError;

    /// Accepts `<type> <target>` (`socks5 127.0.0.1:1080`) and URL forms
    /// (`socks5://127.0.0.1:1080`, `pac+https://example.test/proxy.pac`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let invalid = || UpstreamError::InvalidSpec(value.to_string());

        let (kind, target) = if let Some((kind, target)) = value.split_once(char::is_whitespace) {
            (kind, Some(target.trim()))
        } else if let Some(rest) = value.strip_prefix("pac+") {
            ("pac", Some(rest))
        } else if let Some((kind, rest)) = value.split_once("://") {
            (kind, Some(rest.trim_end_matches('/')))
        } else {
            (value, None)
        };
        let target = target.filter(|t| !t.is_empty());

        let proxy_addr = |default_port: u16| -> Result<HostAddress, UpstreamError> {
            let target = target.ok_or_else(invalid)?;
            parse_host(target, default_port).map_err(|_| invalid())
        };

        match kind.to_ascii_lowercase().as_str() {
            "direct" => Ok(UpstreamSpec::Direct),
            "http" | "proxy" => Ok(UpstreamSpec::Http {
                proxy: proxy_addr(DEFAULT_HTTP_PROXY_PORT)?,
                secure: false,
            }),
            "https" => Ok(UpstreamSpec::Http {
                proxy: proxy_addr(DEFAULT_HTTPS_PROXY_PORT)?,
                secure: true,
            }),
            "socks" | "socks5" => Ok(UpstreamSpec::Socks {
                proxy: proxy_addr(DEFAULT_SOCKS_PORT)?,
                version: SocksVersion::V5,
            }),
            "socks4" => Ok(UpstreamSpec::Socks {
                proxy: proxy_addr(DEFAULT_SOCKS_PORT)?,
                version: SocksVersion::V4,
            }),
            "socks4a" => Ok(UpstreamSpec::Socks {
                proxy: proxy_addr(DEFAULT_SOCKS_PORT)?,
                version: SocksVersion::V4a,
            }),
            "pac" => Ok(UpstreamSpec::Pac {
                url: target.ok_or_else(invalid)?.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for UpstreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamSpec::Direct => write!(f, "direct"),
            UpstreamSpec::Http { proxy, secure } => write!(
                f,
                "{} {}",
                if *secure { "https" } else { "http" },
                proxy.to_host_string(None)
            ),
            UpstreamSpec::Socks { proxy, version } => {
                write!(f, "{} {}", version.as_str(), proxy.to_host_string(None))
            }
            UpstreamSpec::Pac { url } => write!(f, "pac {}", url),
        }
    }
}

/// One concrete way of reaching a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCandidate {
    /// Plain TCP to the origin.
    Direct,
    /// HTTP proxy tunnel.
    Http {
        /// Proxy address.
        proxy: HostAddress,
        /// Speak TLS to the proxy.
        secure: bool,
    },
    /// SOCKS tunnel.
    Socks {
        /// Proxy address.
        proxy: HostAddress,
        /// Protocol variant.
        version: SocksVersion,
    },
}

impl fmt::Display for UpstreamCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamCandidate::Direct => write!(f, "DIRECT"),
            UpstreamCandidate::Http { proxy, secure } => write!(
                f,
                "{} {}",
                if *secure { "HTTPS" } else { "PROXY" },
                proxy.to_host_string(None)
            ),
            UpstreamCandidate::Socks { proxy, version } => write!(
                f,
                "{} {}",
                version.as_str().to_ascii_uppercase(),
                proxy.to_host_string(None)
            ),
        }
    }
}

/// Parses a `FindProxyForURL` result such as `"PROXY a:3128; SOCKS b:1080; DIRECT"`.
///
/// Entries that cannot be understood are skipped.
pub fn parse_pac_result(result: &str) -> Vec<UpstreamCandidate> {
    result
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let candidate = parse_pac_entry(entry);
            if candidate.is_none() {
                warn!("Ignoring unsupported PAC entry '{}'", entry);
            }
            candidate
        })
        .collect()
}

fn parse_pac_entry(entry: &str) -> Option<UpstreamCandidate> {
    let mut parts = entry.split_whitespace();
    let kind = parts.next()?.to_ascii_uppercase();
    let target = parts.next();

    let addr = |default_port: u16| parse_host(target?, default_port).ok();

    match kind.as_str() {
        "DIRECT" => Some(UpstreamCandidate::Direct),
        "PROXY" | "HTTP" => Some(UpstreamCandidate::Http {
            proxy: addr(DEFAULT_HTTP_PROXY_PORT)?,
            secure: false,
        }),
        "HTTPS" => Some(UpstreamCandidate::Http {
            proxy: addr(DEFAULT_HTTPS_PROXY_PORT)?,
            secure: true,
        }),
        "SOCKS" | "SOCKS5" => Some(UpstreamCandidate::Socks {
            proxy: addr(DEFAULT_SOCKS_PORT)?,
            version: SocksVersion::V5,
        }),
        "SOCKS4" => Some(UpstreamCandidate::Socks {
            proxy: addr(DEFAULT_SOCKS_PORT)?,
            version: SocksVersion::V4,
        }),
        "SOCKS4A" => Some(UpstreamCandidate::Socks {
            proxy: addr(DEFAULT_SOCKS_PORT)?,
            version: SocksVersion::V4a,
        }),
        _ => None,
    }
}

/// Resolves destinations to candidates and connects through them.
pub struct UpstreamManager {
    spec: UpstreamSpec,
    pac: Option<PacResolver>,
    tls: TlsConnector,
    user_agent: Option<String>,
}

impl UpstreamManager {
    /// Creates a manager for `spec`. `tls` is used toward HTTPS proxies.
    pub fn new(spec: UpstreamSpec, tls: Arc<ClientConfig>) -> Self {
        let pac = match &spec {
            UpstreamSpec::Pac { url } => Some(PacResolver::new(url)),
            _ => None,
        };

        Self {
            spec,
            pac,
            tls: TlsConnector::from(tls),
            user_agent: None,
        }
    }

    /// Uses an already loaded PAC script; `url` is only reported.
    pub fn with_pac_script(url: &str, script: &str, tls: Arc<ClientConfig>) -> Self {
        Self {
            spec: UpstreamSpec::Pac {
                url: url.to_string(),
            },
            pac: Some(PacResolver::from_script(script)),
            tls: TlsConnector::from(tls),
            user_agent: None,
        }
    }

    /// Sets the `User-Agent` sent with proxy `CONNECT` requests.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// The configured strategy.
    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    /// Returns the ordered candidates for a destination.
    pub async fn resolve(
        &self,
        href: &str,
        hostname: &str,
    ) -> Result<Vec<UpstreamCandidate>, UpstreamError> {
        match &self.spec {
            UpstreamSpec::Direct => Ok(vec![UpstreamCandidate::Direct]),
            UpstreamSpec::Http { proxy, secure } => Ok(vec![UpstreamCandidate::Http {
                proxy: proxy.clone(),
                secure: *secure,
            }]),
            UpstreamSpec::Socks { proxy, version } => Ok(vec![UpstreamCandidate::Socks {
                proxy: proxy.clone(),
                version: *version,
            }]),
            UpstreamSpec::Pac { .. } => {
                let pac = self
                    .pac
                    .as_ref()
                    .ok_or_else(|| UpstreamError::Pac("PAC resolver missing".to_string()))?;
                let result = pac.find_proxy(href, hostname).await?;
                debug!("PAC for {} returned '{}'", href, result);

                let candidates = parse_pac_result(&result);
                if candidates.is_empty() {
                    Ok(vec![UpstreamCandidate::Direct])
                } else {
                    Ok(candidates)
                }
            }
        }
    }

    /// Connects to `hostname:port`, trying each candidate in order.
    ///
    /// Failures of individual candidates are logged and skipped; only
    /// [`UpstreamError::Exhausted`] reaches the caller.
    pub async fn connect(
        &self,
        port: u16,
        hostname: &str,
        href: &str,
    ) -> Result<BoxedStream, UpstreamError> {
        let candidates = self.resolve(href, hostname).await?;
        self.connect_candidates(&candidates, port, hostname).await
    }

    /// Connects through the first working candidate.
    pub async fn connect_candidates(
        &self,
        candidates: &[UpstreamCandidate],
        port: u16,
        hostname: &str,
    ) -> Result<BoxedStream, UpstreamError> {
        let target = stringify_host(hostname, port, None);

        for candidate in candidates {
            match self.connect_via(candidate, hostname, port, &target).await {
                Ok(stream) => {
                    debug!("Connected to {} via {}", target, candidate);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Upstream {} failed for {}: {}", candidate, target, e);
                }
            }
        }

        Err(UpstreamError::Exhausted { target })
    }

    async fn connect_via(
        &self,
        candidate: &UpstreamCandidate,
        hostname: &str,
        port: u16,
        target: &str,
    ) -> Result<BoxedStream, UpstreamError> {
        match candidate {
            UpstreamCandidate::Direct => Ok(Box::new(tcp_connect(hostname, port).await?)),
            UpstreamCandidate::Http { proxy, secure } => {
                let proxy_str = proxy.to_host_string(None);
                let stream = tcp_connect(&proxy.hostname, proxy.port).await?;
                let user_agent = self.user_agent.as_deref();

                if *secure {
                    let name = server_name(&proxy.hostname)
                        .map_err(|e| UpstreamError::Tls(e.to_string()))?;
                    let mut stream = self
                        .tls
                        .connect(name, stream)
                        .await
                        .map_err(|e| UpstreamError::Tls(e.to_string()))?;
                    http::connect_tunnel(&mut stream, target, user_agent, &proxy_str).await?;
                    Ok(Box::new(stream))
                } else {
                    let mut stream = stream;
                    http::connect_tunnel(&mut stream, target, user_agent, &proxy_str).await?;
                    Ok(Box::new(stream))
                }
            }
            UpstreamCandidate::Socks { proxy, version } => {
                let mut stream = tcp_connect(&proxy.hostname, proxy.port).await?;
                socks::handshake(&mut stream, *version, hostname, port).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Debug for UpstreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamManager")
            .field("spec", &self.spec)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

async fn tcp_connect(hostname: &str, port: u16) -> Result<TcpStream, UpstreamError> {
    let stream = TcpStream::connect((hostname, port))
        .await
        .map_err(|e| UpstreamError::Connect {
            addr: stringify_host(hostname, port, None),
            message: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
