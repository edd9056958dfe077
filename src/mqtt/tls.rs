//! Certificate loading for TLS broker connections
//!
//! Certificate files may be PEM or raw DER (a single X.509 certificate). The
//! resulting rustls config is pinned to TLS 1.2, the newest version the
//! configurable security modes name.

use rumqttc::tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ClientConfig, RootCertStore,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::{BrokerConfig, SecurityMode};
use crate::error::BridgeError;

const PEM_MARKER: &[u8] = b"-----BEGIN";

/// Builds the rustls client configuration for a TLS broker.
pub fn client_config(config: &BrokerConfig) -> Result<Arc<ClientConfig>, BridgeError> {
    match config.security {
        SecurityMode::None => {
            return Err(BridgeError::Certificate(
                "TLS requested for a broker without security".to_string(),
            ))
        }
        SecurityMode::Tls12 => {}
        legacy => warn!(
            "Security mode {:?} is not available, negotiating TLS 1.2 for {}",
            legacy, config.name
        ),
    }

    let ca_path = config
        .ca_cert_file
        .as_deref()
        .ok_or_else(|| BridgeError::Certificate("CA certificate file is not set".to_string()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certificates(ca_path)? {
        roots.add(cert).map_err(|e| {
            BridgeError::Certificate(format!(
                "Error reading or creating certificate from CA certificate file {}: {}",
                ca_path.display(),
                e
            ))
        })?;
    }
    debug!("Loaded {} CA certificate(s) for {}", roots.len(), config.name);

    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(roots);

    let tls = match (&config.client_cert_file, &config.client_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            builder.with_client_auth_cert(chain, key).map_err(|e| {
                BridgeError::Certificate(format!(
                    "Error reading or creating certificate from client certificate file {}: {}",
                    cert_path.display(),
                    e
                ))
            })?
        }
        (Some(cert_path), None) => {
            return Err(BridgeError::Certificate(format!(
                "Client certificate {} has no private key file",
                cert_path.display()
            )))
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(tls))
}

/// Reads every certificate in a PEM file, or the single certificate of a DER file.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, BridgeError> {
    let bytes = read(path)?;

    if !is_pem(&bytes) {
        if bytes.first() != Some(&0x30) {
            return Err(BridgeError::Certificate(format!(
                "{} is neither PEM nor a DER encoded certificate",
                path.display()
            )));
        }
        return Ok(vec![CertificateDer::from(bytes)]);
    }

    let certs = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            BridgeError::Certificate(format!("Failed to parse {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(BridgeError::Certificate(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads a PEM private key (PKCS#1, PKCS#8 or SEC1) or a DER PKCS#8 key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, BridgeError> {
    let bytes = read(path)?;

    if !is_pem(&bytes) {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bytes)));
    }

    rustls_pemfile::private_key(&mut bytes.as_slice())
        .map_err(|e| BridgeError::Certificate(format!("Failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            BridgeError::Certificate(format!("No private key found in {}", path.display()))
        })
}

fn read(path: &Path) -> Result<Vec<u8>, BridgeError> {
    std::fs::read(path).map_err(|e| {
        BridgeError::Certificate(format!("Cannot read {}: {}", path.display(), e))
    })
}

fn is_pem(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(PEM_MARKER)
}
