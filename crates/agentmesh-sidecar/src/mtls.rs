//! mTLS material for sidecar-to-sidecar links.
//!
//! One [`TlsMaterial`] is loaded at startup and shared by the external
//! listener (accept side, client certificate required) and every outbound
//! dial to a remote sidecar (connect side, same identity presented).

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::info;

use crate::error::ConfigError;
use crate::identity;

/// Validated CA pool plus the local identity certificate and key.
#[derive(Clone)]
pub struct TlsMaterial {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    common_name: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Read and validate the CA bundle, identity certificate chain and key.
    pub fn load(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        install_crypto_provider();

        let ca_pem = read_pem(ca_path)?;
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;

        let ca_certs = parse_certs(&ca_pem, ca_path)?;
        let certs = parse_certs(&cert_pem, cert_path)?;
        let key = parse_private_key(&key_pem, key_path)?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|e| ConfigError::InvalidCa {
                path: ca_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let roots = Arc::new(roots);

        let common_name = certs.first().and_then(identity::common_name);
        server_config(&roots, certs.clone(), key.clone_key())?;
        client_config(&roots, certs, key)?;

        info!(
            ca = %ca_path.display(),
            cert = %cert_path.display(),
            identity = common_name.as_deref().unwrap_or("<no CN>"),
            "TLS material loaded"
        );
        Ok(Self {
            ca_pem,
            cert_pem,
            key_pem,
            common_name,
        })
    }

    /// Common name of the local identity certificate, if it carries one.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Accept-side configuration: present our identity and require a
    /// client certificate chaining to the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity())
            .client_ca_root(Certificate::from_pem(&self.ca_pem))
    }

    /// Dial-side configuration: trust the CA and present the same identity.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
            .identity(self.identity())
    }

    fn identity(&self) -> Identity {
        Identity::from_pem(&self.cert_pem, &self.key_pem)
    }
}

/// tonic builds its rustls configs against the process-wide provider.
fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse PEM certificates (identity chain or CA bundle).
fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM file.
fn parse_private_key(pem: &[u8], path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::NoPrivateKey(PathBuf::from(path)))
}

/// Validate the identity as a server that requires client certificates.
fn server_config(
    roots: &Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, ConfigError> {
    let verifier = WebPkiClientVerifier::builder(Arc::clone(roots))
        .build()
        .map_err(|e| ConfigError::InvalidIdentity(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::InvalidIdentity(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Validate the identity as a client presenting its certificate.
fn client_config(
    roots: &Arc<RootCertStore>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ClientConfig>, ConfigError> {
    let config = ClientConfig::builder()
        .with_root_certificates(Arc::clone(roots))
        .with_client_auth_cert(certs, key)
        .map_err(|e| ConfigError::InvalidIdentity(e.to_string()))?;

    Ok(Arc::new(config))
}
