use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// TLS settings for the player-facing listener.
pub struct TlsSetup {
    pub config: ServerConfig,
    /// Where a generated self-signed certificate was written, so players can
    /// be pointed at it. `None` when the configured certificate is used.
    pub self_signed_pem: Option<PathBuf>,
}

/// Build a `rustls::ServerConfig` from either configured cert/key paths
/// or by generating a self-signed certificate.
pub fn build_tls_config(cert_path: Option<&str>, key_path: Option<&str>) -> Result<TlsSetup> {
    let (certs, key, self_signed_pem) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            let (certs, key) = load_certs_from_files(cert, key)?;
            (certs, key, None)
        }
        _ => {
            let generated = generate_self_signed()?;
            let pem_path = std::env::temp_dir().join("cloudplay-server-cert.pem");
            std::fs::write(&pem_path, generated.pem.as_bytes())
                .context("Failed to write self-signed cert PEM")?;
            tracing::info!("Self-signed cert written to {}", pem_path.display());
            (generated.certs, generated.key, Some(pem_path))
        }
    };

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to select TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Failed to build TLS server config")?;

    Ok(TlsSetup {
        config,
        self_signed_pem,
    })
}

/// Load certificate chain and private key from PEM files on disk.
fn load_certs_from_files(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("Failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate PEM")?;
    anyhow::ensure!(!certs.is_empty(), "No certificate found in {cert_path}");

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .context("No private key found in PEM file")?;

    tracing::info!("Loaded TLS cert from {cert_path}");
    Ok((certs, key))
}

struct SelfSigned {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    pem: String,
}

/// Generate a self-signed certificate for localhost development.
fn generate_self_signed() -> Result<SelfSigned> {
    tracing::info!("Generating self-signed TLS certificate for localhost");

    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("Failed to create certificate params")?;
    params.subject_alt_names.extend([
        SanType::IpAddress(std::net::Ipv4Addr::LOCALHOST.into()),
        SanType::IpAddress(std::net::Ipv6Addr::LOCALHOST.into()),
    ]);

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    Ok(SelfSigned {
        certs: vec![CertificateDer::from(cert.der().to_vec())],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        pem: cert.pem(),
    })
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_when_no_paths() {
        let setup = build_tls_config(None, None).unwrap();
        let pem_path = setup.self_signed_pem.unwrap();
        let pem = std::fs::read_to_string(pem_path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn configured_files_are_loaded() {
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["broker.local".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("cloudplay-tls-{}-cert.pem", std::process::id()));
        let key_path = dir.join(format!("cloudplay-tls-{}-key.pem", std::process::id()));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let setup = build_tls_config(cert_path.to_str(), key_path.to_str());
        std::fs::remove_file(&cert_path).ok();
        std::fs::remove_file(&key_path).ok();

        assert!(setup.unwrap().self_signed_pem.is_none());
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        assert!(build_tls_config(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem")).is_err());
    }
}
