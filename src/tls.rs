//! TLS configuration: server certificates for LDAPS/StartTLS, client trust roots.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = fs::read(cert_file).with_context(|| format!("Open cert file: {}", cert_file))?;
    let key_pem = fs::read(key_file).with_context(|| format!("Open key file: {}", key_file))?;
    load_server_config_from_pem(&cert_pem, &key_pem)
        .with_context(|| format!("Load TLS identity from {} and {}", cert_file, key_file))
}

/// Build ServerConfig from PEM bytes.
pub fn load_server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<rustls::ServerConfig>> {
    let certs = parse_certs(cert_pem)?;
    if certs.is_empty() {
        anyhow::bail!("No certificates in PEM data");
    }
    let key = parse_private_key(key_pem)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from PEM")?;
    Ok(Arc::new(config))
}

pub fn acceptor_from_files(cert_file: &str, key_file: &str) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(load_server_config_from_files(cert_file, key_file)?))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    certs(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 key")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA key")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key in PEM data"))
}

/// Check that cert and key files exist and load (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file)?;
    Ok(())
}

/// Client TLS config: system roots plus an optional extra CA bundle, or no
/// verification at all when `skip_verify` is set.
pub fn client_config(ca_file: Option<&str>, skip_verify: bool) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(path) = ca_file {
        let pem = fs::read(path).with_context(|| format!("Open CA file: {}", path))?;
        for cert in parse_certs(&pem)? {
            root_store.add(cert).with_context(|| format!("Add CA certificate from {}", path))?;
        }
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if skip_verify {
        config.dangerous().set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

/// Accepts any server certificate. Only reachable through `tls_skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
