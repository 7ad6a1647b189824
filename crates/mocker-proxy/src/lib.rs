//! Mocker Proxy - intercepting forward proxy with mock rules.
//!
//! This crate provides an HTTP(S) forward proxy that terminates TLS with
//! certificates issued on the fly, runs every request through a rule table,
//! and forwards whatever the rules leave alone to the real origin.
//!
//! ## Features
//!
//! - Generates a root CA on first run and issues per-host leaf certificates
//! - Detects TLS inside `CONNECT` tunnels by sniffing the first byte
//! - Rule tables built from URL patterns (`//api.test/users/:id#GET`)
//! - Literal, transforming and chained handlers with response hooks
//! - Lazy, shareable body buffering with gzip and deflate decoding
//! - Upstream strategies: direct, HTTP(S) proxy, SOCKS4/4a/5 and PAC
//! - WebSocket and other upgrades spliced through to the origin
//!
//! ## Architecture
//!
//! ```text
//! Client ─► Dispatcher ─┬─ CONNECT ─► sniff ─┬─ TLS ─► CertificateAuthority ─┐
//!                       │                    └─ plain ────────────────────────┤
//!                       └─ request ◄─────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                         RuleSet::evaluate ─► mock response
//!                              │ no answer
//!                              ▼
//!                     Forwarder ─► UpstreamManager ─► origin
//! ```

pub mod authority;
pub mod body;
pub mod ca;
pub mod dispatcher;
mod error;
pub mod forward;
pub mod io;
mod proxy;
pub mod request;
pub mod response;
pub mod rules;
pub mod tls;
pub mod upstream;

pub use authority::{CertificateAuthority, LeafStore};
pub use body::{BodyOptions, BodyReader, ContentCoding, MessageBody, ProxyBody};
pub use ca::{CaStore, LeafMaterial, RootCa};
pub use dispatcher::Dispatcher;
pub use error::{
    BodyError, CaManagerError, CertificateError, ProxyError, Result, RuleError, UpstreamError,
};
pub use forward::Forwarder;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use request::{Endpoint, RequestContext};
pub use response::{MockResponse, ResponseContext};
pub use rules::{Handler, Outcome, RuleEntry, RuleNode, RuleSet, RuleStore};
pub use upstream::{
    parse_pac_result, PacResolver, SocksVersion, UpstreamCandidate, UpstreamManager,
    UpstreamSpec,
};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8123;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8123);
    }
}
