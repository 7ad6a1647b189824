//! Error types for the proxy.

use mocker_core::{HostError, PatternError};
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Root CA persistence error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// Leaf certificate issuance error.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Body access error.
    #[error("Body error: {0}")]
    Body(#[from] BodyError),

    /// Rule compilation error.
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Upstream connection error.
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// The inbound request cannot be routed or a mutation was invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<HostError> for ProxyError {
    fn from(err: HostError) -> Self {
        ProxyError::InvalidRequest(err.to_string())
    }
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Leaf certificate issuance error.
///
/// Cloneable so every waiter of a coalesced generation receives it.
#[derive(Debug, Clone, Error)]
pub enum CertificateError {
    /// Key or certificate generation failed.
    #[error("Failed to generate certificate for '{host}': {message}")]
    Generation {
        /// Hostname the certificate was requested for.
        host: String,
        /// Underlying error.
        message: String,
    },

    /// The certificate could not be turned into a TLS server config.
    #[error("TLS config error: {0}")]
    Tls(String),

    /// The generation task panicked or was cancelled.
    #[error("Certificate task failed: {0}")]
    Task(String),
}

/// Body access error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    /// The retained bytes were released by a consuming reader.
    #[error("Stream already consumed")]
    AlreadyConsumed,

    /// Reading the underlying source failed.
    #[error("Body source error: {0}")]
    Source(String),

    /// Content decoding failed.
    #[error("Body decode error: {0}")]
    Decode(String),

    /// The body is not valid JSON for the requested type.
    #[error("Body JSON error: {0}")]
    Json(String),
}

/// Rule compilation error.
#[derive(Debug, Clone, Error)]
pub enum RuleError {
    /// The rule set root was not a group.
    #[error("Mock rules must be a group (sequence) at the root")]
    NotAGroup,

    /// A pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Upstream resolution and connection error.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream configuration string is invalid.
    #[error("Invalid upstream '{0}'")]
    InvalidSpec(String),

    /// TCP connection failed.
    #[error("Failed to connect to '{addr}': {message}")]
    Connect {
        /// Address we tried to reach.
        addr: String,
        /// Error message.
        message: String,
    },

    /// An HTTP proxy answered CONNECT with a non-200 status.
    #[error("Invalid proxy response {status} from '{proxy}'")]
    ProxyRejected {
        /// Proxy address.
        proxy: String,
        /// Status code returned.
        status: u16,
    },

    /// Malformed response from an HTTP proxy.
    #[error("Malformed proxy response: {0}")]
    ProxyProtocol(String),

    /// SOCKS negotiation failed.
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// PAC script fetch or evaluation failed.
    #[error("PAC error: {0}")]
    Pac(String),

    /// TLS toward an HTTPS proxy failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error during negotiation.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Every candidate failed.
    #[error("Failed to establish connection to '{target}'")]
    Exhausted {
        /// Destination `host:port`.
        target: String,
    },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
