//! Mocker - intercepting proxy for mocking HTTP(S) traffic.
//!
//! This crate provides the application pieces around the proxy library:
//!
//! - JSON rule files ([`rules_file`])
//! - Polling rule reload ([`reload`])
//! - Logging setup ([`logging`])
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mocker_app::reload::{RuleFileWatcher, DEFAULT_RELOAD_INTERVAL};
//! use mocker_proxy::{CaStore, CertificateAuthority, ProxyConfig, ProxyServer};
//!
//! let root = CaStore::new("ssl/cert.pem", "ssl/key.pem").ensure_root()?;
//! let server = ProxyServer::new(
//!     ProxyConfig::new(),
//!     Arc::new(CertificateAuthority::new(root)),
//! );
//!
//! let mut watcher =
//!     RuleFileWatcher::new("rules.json", server.rules().clone(), DEFAULT_RELOAD_INTERVAL);
//! watcher.load_now()?;
//! let _reload = watcher.spawn();
//!
//! server.run().await?;
//! ```

pub mod logging;
pub mod reload;
pub mod rules_file;

pub use reload::RuleFileWatcher;
pub use rules_file::{load_rules, parse_rules, RulesFileError};
