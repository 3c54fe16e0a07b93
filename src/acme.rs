//! ACME (Let's Encrypt) certificate provider
//!
//! Each registered domain gets its own certificate, obtained with the HTTP-01
//! challenge through `instant-acme`. Challenge tokens are answered by the
//! plaintext listeners via [`CertificateProvider::challenge_response`].
//!
//! Certificates and keys are cached under `<cache>/<domain>/` and the account
//! credentials in `<cache>/account.json`. Keys are written with mode 0600 but
//! are not encrypted at rest.

use crate::config::AcmeConfig;
use crate::tls::{certified_key, parse_private_key, CertificateProvider};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

/// Renew certificates with fewer days left than this
const RENEWAL_THRESHOLD_DAYS: u64 = 30;

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

const MAX_POLL_ATTEMPTS: u32 = 30;

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.write().insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.read().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.inner.write().remove(token);
    }
}

struct AcmeInner {
    email: String,
    directory_url: String,
    cache_dir: PathBuf,
    challenges: Http01Challenges,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Every domain ever registered, in registration order
    domains: Mutex<Vec<String>>,
    in_flight: Mutex<HashSet<String>>,
    account: OnceCell<Account>,
}

/// Per-domain certificate provider backed by an ACME directory
#[derive(Clone)]
pub struct AcmeProvider {
    inner: Arc<AcmeInner>,
}

impl AcmeProvider {
    pub fn new(config: &AcmeConfig, cache_dir: &Path) -> anyhow::Result<Self> {
        let email = config
            .email
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ACME email is required"))?;

        let directory_url = match &config.directory_url {
            Some(url) => url.clone(),
            None if config.testing => LetsEncrypt::Staging.url().to_string(),
            None => LetsEncrypt::Production.url().to_string(),
        };

        let cache_dir = validate_cache_dir(cache_dir)?;
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create ACME cache directory '{}': {}",
                cache_dir.display(),
                e
            )
        })?;

        info!(
            email = %email,
            directory = %directory_url,
            cache_dir = %cache_dir.display(),
            "ACME certificate provisioning enabled"
        );

        Ok(Self {
            inner: Arc::new(AcmeInner {
                email,
                directory_url,
                cache_dir,
                challenges: Http01Challenges::new(),
                certs: RwLock::new(HashMap::new()),
                domains: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashSet::new()),
                account: OnceCell::new(),
            }),
        })
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.inner.challenges.clone()
    }

    fn domain_dir(&self, domain: &str) -> anyhow::Result<PathBuf> {
        if domain.is_empty() || domain.contains("..") || domain.contains(['/', '\\']) {
            anyhow::bail!("Refusing to cache certificate for domain {:?}", domain);
        }
        Ok(self.inner.cache_dir.join(domain))
    }

    /// Load or create the ACME account, once per provider
    async fn account(&self) -> anyhow::Result<&Account> {
        self.inner
            .account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.inner.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(email = %self.inner.email, "Creating new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.inner.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.inner.directory_url,
            None,
        )
        .await?;

        write_private(&account_path, &serde_json::to_string_pretty(&credentials)?)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Load a cached certificate that is still valid for the renewal threshold
    fn load_cached_cert(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let dir = self.domain_dir(domain).ok()?;
        let cert_data = std::fs::read(dir.join("cert.pem")).ok()?;
        let key_data = std::fs::read(dir.join("key.pem")).ok()?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .filter_map(|c| c.ok())
                .collect();
        let leaf = certs.first()?;
        if !is_cert_valid_for_days(leaf, RENEWAL_THRESHOLD_DAYS) {
            info!(domain = %domain, "Cached certificate expires soon, will renew");
            return None;
        }

        let key = parse_private_key(&key_data)?;
        match certified_key(certs, &key) {
            Ok(key) => {
                info!(domain = %domain, "Loaded cached certificate");
                Some(key)
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Ignoring unusable cached certificate");
                None
            }
        }
    }

    fn save_cert(&self, domain: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let dir = self.domain_dir(domain)?;
        std::fs::create_dir_all(&dir)?;

        std::fs::write(dir.join("cert.pem"), cert_chain_pem)?;
        write_private(&dir.join("key.pem"), private_key_pem)?;

        info!(domain = %domain, path = %dir.display(), "Certificate saved to cache");
        Ok(())
    }

    fn needs_certificate(&self, domain: &str) -> bool {
        self.inner
            .certs
            .read()
            .get(domain)
            .and_then(|key| key.cert.first())
            .map(|leaf| !is_cert_valid_for_days(leaf, RENEWAL_THRESHOLD_DAYS))
            .unwrap_or(true)
    }

    /// Obtain and install a certificate for `domain`, unless another task already is
    async fn acquire(self, domain: String) {
        if !self.inner.in_flight.lock().insert(domain.clone()) {
            return;
        }

        let result = self.obtain_certificate(&domain).await;
        self.inner.in_flight.lock().remove(&domain);

        match result {
            Ok(key) => {
                self.inner.certs.write().insert(domain.clone(), key);
                info!(domain = %domain, "Certificate installed");
            }
            Err(e) => error!(domain = %domain, error = %e, "Failed to obtain certificate"),
        }
    }

    async fn obtain_certificate(&self, domain: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];

        info!(domain = %domain, "Requesting new certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        let mut tokens = Vec::new();

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("HTTP-01 challenge not offered for {}", domain))?;

            debug!(domain = %domain, token = %challenge.token, "Setting up HTTP-01 challenge");
            let key_auth = order.key_authorization(challenge);
            self.inner
                .challenges
                .set(challenge.token.clone(), key_auth.as_str().to_string());
            tokens.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await?;
        }

        let result = self.finish_order(&mut order, domain).await;

        for token in &tokens {
            self.inner.challenges.remove(token);
        }

        let (cert_chain_pem, private_key_pem) = result?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        if certs.is_empty() {
            anyhow::bail!("ACME server returned an empty certificate chain");
        }

        let key = parse_private_key(private_key_pem.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("Failed to parse generated private key"))?;
        let certified = certified_key(certs, &key)?;

        self.save_cert(domain, &cert_chain_pem, &private_key_pem)?;
        info!(domain = %domain, "Certificate obtained successfully");

        Ok(certified)
    }

    /// Wait for the order to become ready, finalize it and download the chain
    async fn finish_order(
        &self,
        order: &mut instant_acme::Order,
        domain: &str,
    ) -> anyhow::Result<(String, String)> {
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order for {} is invalid", domain),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timeout for {}", domain);
                    }
                    debug!(domain = %domain, attempt = attempts, "Waiting for authorization");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => match order.certificate().await? {
                    Some(cert) => break cert,
                    None => anyhow::bail!("Order valid but no certificate returned"),
                },
                OrderStatus::Processing | OrderStatus::Ready => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout for {}", domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("Unexpected order status: {:?}", status),
            }
        };

        Ok((cert_chain_pem, private_key.serialize_pem()))
    }

    fn spawn_acquire(&self, domain: &str) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().acquire(domain.to_string()));
            }
            Err(_) => warn!(domain = %domain, "No runtime available, certificate deferred to renewal"),
        }
    }

    /// Renew expiring or missing certificates every 12 hours until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                    let domains = self.inner.domains.lock().clone();
                    for domain in domains {
                        if self.needs_certificate(&domain) {
                            info!(domain = %domain, "Certificate renewal needed");
                            self.clone().acquire(domain).await;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("ACME renewal loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl CertificateProvider for AcmeProvider {
    fn register(&self, domain: &str) {
        {
            let mut domains = self.inner.domains.lock();
            if domains.iter().any(|d| d == domain) {
                return;
            }
            domains.push(domain.to_string());
        }

        if let Some(key) = self.load_cached_cert(domain) {
            self.inner.certs.write().insert(domain.to_string(), key);
            return;
        }

        self.spawn_acquire(domain);
    }

    fn resolve(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.inner.certs.read().get(domain).cloned()
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.inner.challenges.get(token)
    }
}

/// Write a file readable only by its owner
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

pub fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    debug!(remaining_days, required_days = days, "Certificate validity checked");
    remaining_days >= days
}

/// Reject traversal in the cache path and canonicalize what already exists
fn validate_cache_dir(path: &Path) -> anyhow::Result<PathBuf> {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("ACME cache directory path must not contain '..'");
    }

    if path.exists() {
        let canonical = path.canonicalize().map_err(|e| {
            anyhow::anyhow!(
                "Failed to canonicalize ACME cache directory '{}': {}",
                path.display(),
                e
            )
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("ACME cache path '{}' exists but is not a directory", path.display());
        }
        return Ok(canonical);
    }

    Ok(path.to_path_buf())
}
