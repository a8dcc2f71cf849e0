//! TLS acceptor setup from PEM files or a generated self-signed certificate

use crate::config::ServerConfig;
use anyhow::Context;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Build the acceptor for `server`, or `None` when TLS is off.
pub fn acceptor(server: &ServerConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if !server.tls_enabled() {
        return Ok(None);
    }

    let (certs, key) = match (&server.tls_cert, &server.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
            (certs, key)
        }
        _ => {
            let pair = generate_self_signed_cert()?;
            warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
            pair
        }
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

/// Every PEM section in the file named by config setting `setting`
fn read_pem(setting: &str, path: &str) -> anyhow::Result<Vec<Item>> {
    let file = File::open(path).with_context(|| format!("{} {}: cannot open", setting, path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::read_all(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("{} {}: malformed PEM", setting, path))
}

/// Certificate chain from the `tls_cert` file, leaf first
pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = read_pem("tls_cert", path)?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(cert) => Some(cert),
            _ => None,
        })
        .collect();

    if certs.is_empty() {
        anyhow::bail!("tls_cert {}: no certificates found", path);
    }
    Ok(certs)
}

/// First PKCS#1, PKCS#8 or SEC1 key in the `tls_key` file
pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    read_pem("tls_key", path)?
        .into_iter()
        .find_map(|item| match item {
            Item::Pkcs1Key(key) => Some(key.into()),
            Item::Pkcs8Key(key) => Some(key.into()),
            Item::Sec1Key(key) => Some(key.into()),
            _ => None,
        })
        .ok_or_else(|| anyhow::anyhow!("tls_key {}: no private key found", path))
}

/// Self-signed certificate for `localhost` and `127.0.0.1`
pub fn generate_self_signed_cert() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert.der().clone()], key))
}
