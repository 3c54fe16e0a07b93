//! TLS termination: certificate providers and SNI resolution
//!
//! Listeners never own certificates. They ask a [`CertificateProvider`] for
//! the key matching the SNI name on every handshake, and route HTTP-01
//! challenge requests to it on every plaintext listener.

use parking_lot::RwLock;
use rcgen::generate_simple_self_signed;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The rustls crypto backend used for every client and server config
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Source of certificates for TLS listeners
pub trait CertificateProvider: Send + Sync + 'static {
    /// Announce a domain served over TLS. Idempotent; acquisition may
    /// continue in the background.
    fn register(&self, domain: &str);

    /// Certificate for a domain, if one is available yet
    fn resolve(&self, domain: &str) -> Option<Arc<CertifiedKey>>;

    /// Key authorization for a pending HTTP-01 challenge token
    fn challenge_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Bridges rustls' SNI callback to a [`CertificateProvider`]
pub struct SniResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl SniResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self { provider }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            debug!("TLS client sent no SNI name");
            return None;
        };

        let domain = name.to_ascii_lowercase();
        let key = self.provider.resolve(&domain);
        if key.is_none() {
            debug!(domain = %domain, "No certificate available");
        }
        key
    }
}

/// Server config resolving certificates through `provider`, offering h2 and http/1.1
pub fn server_config(
    provider: Arc<dyn CertificateProvider>,
) -> Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(provider)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Build a signing key pair for rustls
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> anyhow::Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// One certificate for every domain, read from PEM files
pub struct StaticCertificates {
    key: Arc<CertifiedKey>,
}

impl StaticCertificates {
    pub fn from_files(cert_path: &str, key_path: &str) -> anyhow::Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        info!(cert = %cert_path, key = %key_path, "Loaded TLS certificate");
        Ok(Self {
            key: certified_key(certs, &key)?,
        })
    }
}

impl CertificateProvider for StaticCertificates {
    fn register(&self, domain: &str) {
        debug!(domain = %domain, "Serving static certificate");
    }

    fn resolve(&self, _domain: &str) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

/// Generates a self-signed certificate per registered domain.
///
/// Browsers will not trust these; use for development only.
#[derive(Default)]
pub struct SelfSignedCertificates {
    keys: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl SelfSignedCertificates {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertificateProvider for SelfSignedCertificates {
    fn register(&self, domain: &str) {
        if self.keys.read().contains_key(domain) {
            return;
        }

        match generate_self_signed_cert(domain) {
            Ok((certs, key)) => match certified_key(certs, &key) {
                Ok(key) => {
                    self.keys.write().entry(domain.to_string()).or_insert(key);
                    warn!(domain = %domain, "Using self-signed certificate (not for production)");
                }
                Err(e) => warn!(domain = %domain, error = %e, "Failed to load self-signed certificate"),
            },
            Err(e) => warn!(domain = %domain, error = %e, "Failed to generate self-signed certificate"),
        }
    }

    fn resolve(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.keys.read().get(domain).cloned()
    }
}

pub fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    parse_private_key(&data).ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// First PKCS#1, PKCS#8 or SEC1 key in a PEM buffer
pub fn parse_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn generate_self_signed_cert(
    domain: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec![domain.to_string()])
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((vec![cert_der], key_der))
}
