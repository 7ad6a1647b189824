//! Root certificate authority material and its on-disk store.
//!
//! The root CA signs per-host leaf certificates on the fly. [`CaStore`]
//! loads it from PEM files, generating and writing a fresh one when the
//! files are missing.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

use crate::authority::LeafStore;
pub use crate::error::CaManagerError;

/// Default certificate and key file names.
const CA_CERT_FILENAME: &str = "cert.pem";
const CA_KEY_FILENAME: &str = "key.pem";

/// Directory holding persisted leaf certificates.
const HOSTS_DIRNAME: &str = "hosts";

/// Root certificate validity.
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Root CA subject.
const ROOT_COMMON_NAME: &str = "Mocker Proxy CA";
const ROOT_ORGANIZATION: &str = "Mocker";

/// A loaded root CA: its PEM text, DER certificate and signing issuer.
pub struct RootCa {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
}

impl RootCa {
    /// Generates a new self-signed root CA.
    pub fn generate() -> Result<Self, CaManagerError> {
        // Generate key pair
        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
        params.serial_number = Some(random_serial());

        // Self-sign
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// Builds a root CA from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaManagerError> {
        let cert_der = first_certificate(cert_pem)?;

        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
            issuer,
        })
    }

    /// PEM-encoded root certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded root private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER-encoded root certificate, appended to every served chain.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

impl fmt::Debug for RootCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// PEM certificate and key for one issued host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafMaterial {
    /// PEM certificate.
    pub cert_pem: String,
    /// PEM PKCS#8 private key.
    pub key_pem: String,
}

impl LeafMaterial {
    /// Decodes the PEM text into rustls DER types.
    pub fn to_der(
        &self,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CaManagerError> {
        let cert = first_certificate(&self.cert_pem)?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| CaManagerError::Parse(e.to_string()))?
            .ok_or_else(|| CaManagerError::Parse("No private key in PEM".into()))?;
        Ok((cert, key))
    }
}

/// Loads and persists root CA material.
#[derive(Debug, Clone)]
pub struct CaStore {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CaStore {
    /// Creates a store for the given certificate and key paths.
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Creates a store with `cert.pem` and `key.pem` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join(CA_CERT_FILENAME), dir.join(CA_KEY_FILENAME))
    }

    /// Creates a store in the default Mocker data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("", "mocker", "Mocker")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        Ok(Self::in_dir(project_dirs.data_dir().join("ca")))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Checks if both CA files exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Loads the root CA, generating one when the files are missing.
    ///
    /// A freshly generated CA is still returned when writing it fails; the
    /// failure is only logged.
    pub fn ensure_root(&self) -> Result<RootCa, CaManagerError> {
        if self.ca_exists() {
            return self.load_root();
        }

        let root = RootCa::generate()?;
        match self.save_root(&root) {
            Ok(()) => tracing::info!("Generated new CA certificate at {:?}", self.cert_path),
            Err(e) => tracing::warn!("Generated CA could not be saved: {}", e),
        }
        Ok(root)
    }

    /// Loads the root CA from disk.
    pub fn load_root(&self) -> Result<RootCa, CaManagerError> {
        let cert_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = fs::read_to_string(&self.key_path)?;
        RootCa::from_pem(&cert_pem, &key_pem)
    }

    /// Writes the root CA to disk. The key is written owner-only.
    pub fn save_root(&self, root: &RootCa) -> Result<(), CaManagerError> {
        write_private(&self.key_path, root.key_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::create_dir_all(parent_dir(&self.cert_path))
            .and_then(|_| fs::write(&self.cert_path, root.cert_pem()))
            .map_err(|e| CaManagerError::Write(e.to_string()))
    }

    fn host_dir(&self, hostname: &str) -> PathBuf {
        let safe: String = hostname
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                c => c,
            })
            .collect();
        parent_dir(&self.cert_path).join(HOSTS_DIRNAME).join(safe)
    }
}

impl LeafStore for CaStore {
    fn load(&self, hostname: &str) -> Option<LeafMaterial> {
        let dir = self.host_dir(hostname);
        let cert_pem = fs::read_to_string(dir.join(CA_CERT_FILENAME)).ok()?;
        let key_pem = fs::read_to_string(dir.join(CA_KEY_FILENAME)).ok()?;
        Some(LeafMaterial { cert_pem, key_pem })
    }

    fn save(&self, hostname: &str, leaf: &LeafMaterial) -> Result<(), CaManagerError> {
        let dir = self.host_dir(hostname);
        write_private(&dir.join(CA_KEY_FILENAME), &leaf.key_pem)
            .and_then(|_| fs::write(dir.join(CA_CERT_FILENAME), &leaf.cert_pem))
            .map_err(|e| CaManagerError::Write(e.to_string()))
    }
}

/// Random positive 128-bit serial number.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

fn first_certificate(pem: &str) -> Result<CertificateDer<'static>, CaManagerError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| CaManagerError::Parse("No certificate in PEM".into()))?
        .map_err(|e| CaManagerError::Parse(e.to_string()))
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    fs::create_dir_all(parent_dir(path))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents)
    }
}
