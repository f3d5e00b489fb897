//! ---
//! fleet_section: "05-networking-external-interfaces"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Mutual-TLS material and rustls configuration."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Both proxies speak TLS 1.3 only, restricted to the AES-GCM and
//! ChaCha20-Poly1305 suites, and both sides present and verify certificates
//! issued by the shared fleet CA.
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use fleet_common::TlsConfig;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Result, TransportError};

/// The ring provider trimmed to the TLS 1.3 suites the fleet accepts.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ];
    Arc::new(provider)
}

/// CA roots plus this node's certificate chain and key.
pub struct TlsAssets {
    roots: Vec<CertificateDer<'static>>,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl fmt::Debug for TlsAssets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAssets")
            .field("roots", &self.roots.len())
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TlsAssets {
    /// Parse PEM-encoded CA bundle, certificate chain and private key.
    pub fn from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<Self> {
        Ok(Self {
            roots: parse_certs(ca, "CA bundle")?,
            chain: parse_certs(cert, "certificate")?,
            key: parse_key(key)?,
        })
    }

    pub fn from_files(ca: &Path, cert: &Path, key: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|err| TransportError::Tls(format!("reading {}: {err}", path.display())))
        };
        Self::from_pem(&read(ca)?, &read(cert)?, &read(key)?)
    }

    /// Load the files named by the `[tls]` section.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        Self::from_files(&config.ca_path, &config.cert_path, &config.key_path)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.roots {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }

    /// Dialing side: verifies the server against the CA and presents our chain.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Accepting side: requires a client certificate issued by the CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = crypto_provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider.clone())
                .build()
                .map_err(|err| TransportError::Tls(err.to_string()))?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Tls(format!("invalid {what} PEM: {err}")))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!("no certificates in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|err| TransportError::Tls(format!("invalid private key PEM: {err}")))?
        .ok_or_else(|| TransportError::Tls("no private key found".to_owned()))
}
