//! TLS configuration helpers.
//!
//! The proxy speaks TLS in two directions: toward clients with leaf
//! certificates issued by the [`CertificateAuthority`](crate::CertificateAuthority),
//! and toward origins or HTTPS proxies as a client. Upstream certificates are
//! not verified, matching the behavior of a debugging proxy.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::error::{ProxyError, Result};

/// ALPN protocols offered on both legs. Forces HTTP/1.1 so hyper's HTTP/1
/// server and client can handle the decrypted stream.
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Returns the crypto provider used for every TLS config.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the client config used toward origins and HTTPS proxies.
pub fn upstream_client_config(provider: Arc<CryptoProvider>) -> Result<Arc<ClientConfig>> {
    let verifier = Arc::new(NoCertVerifier {
        provider: provider.clone(),
    });

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

    Ok(Arc::new(config))
}

/// Converts a hostname or IP literal to a rustls server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", host)))
}

/// Accepts any upstream certificate.
#[derive(Debug)]
struct NoCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_offers_http1() {
        let config = upstream_client_config(crypto_provider()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn server_names() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("").is_err());
    }
}
