//! Mocker Core - addressing and URL pattern logic for the Mocker proxy.
//!
//! This crate holds the pure, I/O free pieces the proxy builds on:
//!
//! - [`host`]: `host:port` parsing and formatting, IPv6 bracket aware
//! - [`query`]: ordered query-string model
//! - [`pattern`]: the fuzzy URL pattern DSL used by rule tables
//!
//! ## Pattern grammar
//!
//! ```text
//! protocol://hostname:port/pathname?query#METHODS
//! ```
//!
//! Every component is optional. `//api.example.com/users/:id` matches any
//! scheme and port on that host, `*.example.com` style wildcards match
//! subdomains, and `#GET|HEAD` restricts the methods.

pub mod error;
pub mod host;
pub mod pattern;
pub mod query;

pub use error::{HostError, PatternError};
pub use host::{default_port, parse_host, stringify_host, HostAddress};
pub use pattern::{MatchTarget, Params, UrlPattern};
pub use query::Query;
