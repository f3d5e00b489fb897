//! ---
//! fleet_section: "11-test-harness"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "test"
//! fleet_description: "Throwaway CA with server and client leaves for mutual TLS."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SanType,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

/// PEM material for one CA and two leaves valid for `localhost` and `127.0.0.1`.
#[derive(Debug, Clone)]
pub struct TestPki {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

/// Where [`TestPki::write_to`] put each file.
#[derive(Debug, Clone)]
pub struct PemPaths {
    pub ca: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl TestPki {
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Fleet Test CA");
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = Certificate::from_params(params)?;

        let (server_cert_pem, server_key_pem) = issue(&ca, "cloudhub")?;
        let (client_cert_pem, client_key_pem) = issue(&ca, "edge-01")?;
        Ok(Self {
            ca_pem: ca.serialize_pem()?,
            server_cert_pem,
            server_key_pem,
            client_cert_pem,
            client_key_pem,
        })
    }

    /// Write every PEM into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<PemPaths> {
        let paths = PemPaths {
            ca: dir.join("ca.pem"),
            server_cert: dir.join("server.pem"),
            server_key: dir.join("server.key"),
            client_cert: dir.join("client.pem"),
            client_key: dir.join("client.key"),
        };
        for (path, pem) in [
            (&paths.ca, &self.ca_pem),
            (&paths.server_cert, &self.server_cert_pem),
            (&paths.server_key, &self.server_key_pem),
            (&paths.client_cert, &self.client_cert_pem),
            (&paths.client_key, &self.client_key_pem),
        ] {
            fs::write(path, pem).with_context(|| format!("writing {}", path.display()))?;
        }
        Ok(paths)
    }

    /// Server-side rustls config requiring a client certificate from this CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = Arc::new(ring::default_provider());
        let mut roots = RootCertStore::empty();
        for cert in certs(&self.ca_pem)? {
            roots.add(cert)?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs(&self.server_cert_pem)?, key(&self.server_key_pem)?)?;
        Ok(Arc::new(config))
    }
}

fn issue(ca: &Certificate, common_name: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_owned()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let cert = Certificate::from_params(params)?;
    let pem = cert.serialize_pem_with_signer(ca)?;
    let key = cert.serialize_private_key_pem();
    Ok((pem, key))
}

fn certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    Ok(rustls_pemfile::certs(&mut pem.as_bytes()).collect::<std::result::Result<Vec<_>, _>>()?)
}

fn key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())?.ok_or_else(|| anyhow!("no private key"))
}
