//! Per-host leaf certificate issuance.
//!
//! [`CertificateAuthority::issue`] returns a TLS server config for a hostname,
//! generating the leaf certificate at most once per host. Concurrent requests
//! for a host whose generation is in flight wait on the same task. A failed
//! generation is forgotten so the next request retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{ServerName, UnixTime};
use rustls::{RootCertStore, ServerConfig};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::ca::{random_serial, LeafMaterial, RootCa};
use crate::error::{CaManagerError, CertificateError};
use crate::tls::{crypto_provider, ALPN_HTTP1};

/// Leaf certificate validity.
const LEAF_VALIDITY_DAYS: i64 = 730;

/// Optional persistence for issued leaf certificates.
pub trait LeafStore: Send + Sync {
    /// Returns previously saved material for `hostname`.
    fn load(&self, hostname: &str) -> Option<LeafMaterial>;

    /// Saves freshly generated material for `hostname`.
    fn save(&self, hostname: &str, leaf: &LeafMaterial) -> Result<(), CaManagerError>;
}

type IssueTask = Shared<BoxFuture<'static, Result<Arc<ServerConfig>, CertificateError>>>;

enum HostEntry {
    Pending { attempt: u64, task: IssueTask },
    Ready(Arc<ServerConfig>),
}

/// Issues and caches leaf certificates signed by a [`RootCa`].
pub struct CertificateAuthority {
    root: Arc<RootCa>,
    provider: Arc<CryptoProvider>,
    store: Option<Arc<dyn LeafStore>>,
    entries: Mutex<HashMap<String, HostEntry>>,
    attempts: AtomicU64,
    generated: Arc<AtomicUsize>,
}

impl CertificateAuthority {
    /// Creates an authority with an in-memory cache only.
    pub fn new(root: RootCa) -> Self {
        Self {
            root: Arc::new(root),
            provider: crypto_provider(),
            store: None,
            entries: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
            generated: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Persists issued leaves through `store` and reuses saved ones.
    pub fn with_leaf_store(mut self, store: Arc<dyn LeafStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The root CA.
    pub fn root(&self) -> &RootCa {
        &self.root
    }

    /// Returns the server config for `hostname`, generating it if needed.
    pub async fn issue(&self, hostname: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        let key = normalize(hostname);
        if key.is_empty() {
            return Err(CertificateError::Generation {
                host: hostname.to_string(),
                message: "empty hostname".to_string(),
            });
        }

        let (attempt, task) = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(HostEntry::Ready(config)) => return Ok(config.clone()),
                Some(HostEntry::Pending { attempt, task }) => (*attempt, task.clone()),
                None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                    let task = self.start(key.clone());
                    entries.insert(
                        key.clone(),
                        HostEntry::Pending {
                            attempt,
                            task: task.clone(),
                        },
                    );
                    (attempt, task)
                }
            }
        };

        let result = task.await;

        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(&key),
            Some(HostEntry::Pending { attempt: a, .. }) if *a == attempt
        );
        if current {
            match &result {
                Ok(config) => {
                    entries.insert(key, HostEntry::Ready(config.clone()));
                }
                Err(e) => {
                    warn!("Certificate generation for {} failed: {}", key, e);
                    entries.remove(&key);
                }
            }
        }

        result
    }

    /// Checks whether a ready certificate is cached for `hostname`.
    pub fn is_cached(&self, hostname: &str) -> bool {
        matches!(
            self.entries.lock().get(&normalize(hostname)),
            Some(HostEntry::Ready(_))
        )
    }

    /// Hostnames with a ready certificate.
    pub fn cached_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, HostEntry::Ready(_)))
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// Number of leaf certificates generated (not loaded from a store).
    pub fn generation_count(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    fn start(&self, hostname: String) -> IssueTask {
        let root = self.root.clone();
        let provider = self.provider.clone();
        let store = self.store.clone();
        let generated = self.generated.clone();

        async move {
            debug!("Issuing certificate for {}", hostname);
            tokio::task::spawn_blocking(move || {
                let saved = store
                    .as_ref()
                    .and_then(|s| s.load(&hostname))
                    .filter(|material| {
                        let trusted = is_trusted_leaf(&provider, &root, &hostname, material);
                        if !trusted {
                            debug!("Saved certificate for {} is stale, regenerating", hostname);
                        }
                        trusted
                    });
                let material = match saved {
                    Some(material) => material,
                    None => {
                        let material = generate_leaf(&root, &hostname)?;
                        generated.fetch_add(1, Ordering::Relaxed);
                        if let Some(store) = &store {
                            if let Err(e) = store.save(&hostname, &material) {
                                warn!("Failed to persist certificate for {}: {}", hostname, e);
                            }
                        }
                        material
                    }
                };
                server_config(&provider, &root, &material)
            })
            .await
            .map_err(|e| CertificateError::Task(e.to_string()))?
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_hosts", &self.cached_hosts())
            .field("generated", &self.generation_count())
            .finish_non_exhaustive()
    }
}

fn normalize(hostname: &str) -> String {
    hostname
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Generates a fresh key and a leaf certificate for `hostname`.
fn generate_leaf(root: &RootCa, hostname: &str) -> Result<LeafMaterial, CertificateError> {
    let fail = |message: String| CertificateError::Generation {
        host: hostname.to_string(),
        message,
    };

    let leaf_key = KeyPair::generate().map_err(|e| fail(e.to_string()))?;

    // IP literals become IP SANs, anything else a DNS SAN
    let mut params =
        CertificateParams::new(vec![hostname.to_string()]).map_err(|e| fail(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    params.serial_number = Some(random_serial());

    let cert = params
        .signed_by(&leaf_key, root.issuer())
        .map_err(|e| fail(e.to_string()))?;

    Ok(LeafMaterial {
        cert_pem: cert.pem(),
        key_pem: leaf_key.serialize_pem(),
    })
}

/// Whether saved material was issued by `root` for `hostname` and is valid
/// now.
fn is_trusted_leaf(
    provider: &Arc<CryptoProvider>,
    root: &RootCa,
    hostname: &str,
    material: &LeafMaterial,
) -> bool {
    let Ok((leaf, _)) = material.to_der() else {
        return false;
    };
    let Ok(name) = ServerName::try_from(hostname.to_string()) else {
        return false;
    };

    let mut roots = RootCertStore::empty();
    if roots.add(root.cert_der().clone()).is_err() {
        return false;
    }
    let Ok(verifier) =
        WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()
    else {
        return false;
    };

    verifier
        .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
        .is_ok()
}

fn server_config(
    provider: &Arc<CryptoProvider>,
    root: &RootCa,
    material: &LeafMaterial,
) -> Result<Arc<ServerConfig>, CertificateError> {
    let (leaf, key) = material
        .to_der()
        .map_err(|e| CertificateError::Tls(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| CertificateError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![leaf, root.cert_der().clone()], key)
        .map_err(|e| CertificateError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaStore;
    use tempfile::TempDir;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(RootCa::generate().unwrap())
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_generation() {
        let authority = authority();

        let (a, b) = tokio::join!(
            authority.issue("example.com"),
            authority.issue("example.com")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(authority.generation_count(), 1);
        assert!(authority.is_cached("example.com"));
    }

    #[tokio::test]
    async fn cached_config_is_reused() {
        let authority = authority();

        let first = authority.issue("Example.COM").await.unwrap();
        let second = authority.issue("example.com").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(authority.generation_count(), 1);
        assert_eq!(authority.cached_hosts(), vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn distinct_hosts_get_distinct_certificates() {
        let authority = authority();

        let a = authority.issue("a.example.com").await.unwrap();
        let b = authority.issue("b.example.com").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(authority.generation_count(), 2);
    }

    #[tokio::test]
    async fn ip_literals_are_supported() {
        let authority = authority();
        assert!(authority.issue("127.0.0.1").await.is_ok());
        assert!(authority.issue("[::1]").await.is_ok());
        assert!(authority.is_cached("::1"));
    }

    #[tokio::test]
    async fn failed_generation_is_not_cached() {
        let authority = authority();

        assert!(authority.issue("bad host\u{e9}").await.is_err());
        assert!(!authority.is_cached("bad host\u{e9}"));
        assert!(authority.cached_hosts().is_empty());

        // Retry attempts a new generation rather than replaying a cached error
        assert!(authority.issue("bad host\u{e9}").await.is_err());
    }

    #[tokio::test]
    async fn empty_hostname_is_rejected() {
        let authority = authority();
        assert!(matches!(
            authority.issue("").await,
            Err(CertificateError::Generation { .. })
        ));
    }

    #[tokio::test]
    async fn leaf_store_reuses_saved_material() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(CaStore::in_dir(temp_dir.path()));
        let root = store.ensure_root().unwrap();
        let root_pem = (root.cert_pem().to_string(), root.key_pem().to_string());

        let first = CertificateAuthority::new(root).with_leaf_store(store.clone());
        first.issue("example.com").await.unwrap();
        assert_eq!(first.generation_count(), 1);
        assert!(store.load("example.com").is_some());

        let root = RootCa::from_pem(&root_pem.0, &root_pem.1).unwrap();
        let second = CertificateAuthority::new(root).with_leaf_store(store);
        second.issue("example.com").await.unwrap();
        assert_eq!(second.generation_count(), 0);
        assert!(second.is_cached("example.com"));
    }

    #[tokio::test]
    async fn leaf_from_previous_root_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(CaStore::in_dir(temp_dir.path()));

        let first = authority().with_leaf_store(store.clone());
        first.issue("example.com").await.unwrap();
        let stale = store.load("example.com").unwrap();

        let second = authority().with_leaf_store(store.clone());
        second.issue("example.com").await.unwrap();
        assert_eq!(second.generation_count(), 1);

        let fresh = store.load("example.com").unwrap();
        assert_ne!(fresh, stale);
        assert!(is_trusted_leaf(
            &crypto_provider(),
            second.root(),
            "example.com",
            &fresh
        ));
    }

    #[tokio::test]
    async fn expired_leaf_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(CaStore::in_dir(temp_dir.path()));
        let root = store.ensure_root().unwrap();

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(30);
        params.not_after = now - Duration::days(1);
        let cert = params.signed_by(&key, root.issuer()).unwrap();
        let expired = LeafMaterial {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        };
        store.save("example.com", &expired).unwrap();

        let provider = crypto_provider();
        assert!(!is_trusted_leaf(&provider, &root, "example.com", &expired));
        // Wrong host for otherwise valid material
        let valid = generate_leaf(&root, "example.com").unwrap();
        assert!(is_trusted_leaf(&provider, &root, "example.com", &valid));
        assert!(!is_trusted_leaf(&provider, &root, "other.test", &valid));

        let authority = CertificateAuthority::new(root).with_leaf_store(store.clone());
        authority.issue("example.com").await.unwrap();
        assert_eq!(authority.generation_count(), 1);
        assert_ne!(store.load("example.com").unwrap(), expired);
    }

    #[test]
    fn generated_leaf_parses() {
        let root = RootCa::generate().unwrap();
        let leaf = generate_leaf(&root, "example.com").unwrap();
        let (cert, _key) = leaf.to_der().unwrap();
        assert!(!cert.is_empty());
    }
}
