use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration directory
pub const CONF_DIR_ENV: &str = "PROXY_CONF";

/// Configuration directory used when `PROXY_CONF` is unset
pub const DEFAULT_CONF_DIR: &str = "/etc/tlsproxy";

/// Errors raised while loading configuration or registering sites.
///
/// These are fatal at startup and reported back to the caller on reload.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{message} at {path}")]
    Site { path: PathBuf, message: String },

    #[error("port {port} is already used by a {existing} listener, cannot add {requested} host")]
    ProtocolConflict {
        port: u16,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("host {domain} is already registered on port {port}")]
    DuplicateHost { domain: String, port: u16 },

    #[error("invalid domain name: {0:?}")]
    InvalidDomain(String),

    #[error("duplicate process id: {0}")]
    DuplicateProcess(String),

    #[error("unknown {kind}: {name}")]
    UnknownIdentity { kind: &'static str, name: String },

    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Daemon configuration, read from `<conf_dir>/config.toml`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Default user for supervised processes
    pub user: Option<String>,

    /// Default group for supervised processes
    pub group: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub control: ControlConfig,

    /// Directory the configuration was loaded from
    #[serde(skip)]
    pub conf_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for every listener (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port of the plaintext listener serving ACME challenges (default: 80)
    #[serde(default = "default_challenge_port")]
    pub challenge_port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            challenge_port: default_challenge_port(),
            pid_file: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_challenge_port() -> u16 {
    80
}

/// Static certificate used when ACME is not configured.
/// Without cert and key a self-signed certificate is generated.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Path to TLS certificate file (PEM format)
    pub cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub key: Option<String>,
}

impl TlsConfig {
    pub fn has_files(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// ACME (Let's Encrypt) configuration for automatic certificate provisioning
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AcmeConfig {
    /// Contact email. ACME is enabled when this is set.
    pub email: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub testing: bool,

    /// ACME directory URL, overrides `testing`
    pub directory_url: Option<String>,

    /// Certificate and account cache (default: `<conf_dir>/certs`)
    pub cache_dir: Option<String>,
}

impl AcmeConfig {
    pub fn enabled(&self) -> bool {
        self.email.is_some()
    }
}

/// Restart policy and stop timings for supervised processes
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Crashes tolerated before an instance stays errored (default: 15)
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,

    /// Linear backoff unit between restarts in milliseconds (default: 1000)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Uptime after which the restart count resets, in milliseconds (default: 5000)
    #[serde(default = "default_stability_ms")]
    pub stability_ms: u64,

    /// Time between SIGTERM and SIGKILL in milliseconds (default: 1000)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_limit: default_restart_limit(),
            backoff_ms: default_backoff_ms(),
            stability_ms: default_stability_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_restart_limit() -> u32 {
    15
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_stability_ms() -> u64 {
    5000
}

fn default_stop_grace_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControlConfig {
    /// Control socket path (default: `<conf_dir>/tlsproxy.sock`)
    pub socket_path: Option<String>,
}

/// Resolve the configuration directory from `PROXY_CONF`
pub fn conf_dir_from_env() -> PathBuf {
    std::env::var_os(CONF_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_DIR))
}

impl Config {
    /// Load `config.toml` from the configuration directory.
    ///
    /// A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(conf_dir: P) -> Result<Self, ConfigError> {
        let conf_dir = conf_dir.as_ref();
        let path = conf_dir.join("config.toml");

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<Config>(&content).map_err(|source| ConfigError::Toml {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        config.conf_dir = conf_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let bind = self.server.bind.trim_start_matches('[').trim_end_matches(']');
        if bind.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("server.bind is not an IP address: {}", self.server.bind));
        }

        if self.server.challenge_port == 0 {
            errors.push("server.challenge_port must not be 0".to_string());
        }

        if self.tls.cert.is_some() != self.tls.key.is_some() {
            errors.push("tls.cert and tls.key must be set together".to_string());
        }

        if let Some(email) = &self.acme.email {
            if !email.contains('@') {
                errors.push(format!("acme.email is not an email address: {}", email));
            }
        }

        if self.supervisor.backoff_ms == 0 {
            errors.push("supervisor.backoff_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }

    /// Directory holding the site definition files
    pub fn sites_dir(&self) -> PathBuf {
        self.conf_dir.join("sites")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.control
            .socket_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.conf_dir.join("tlsproxy.sock"))
    }

    pub fn acme_cache_dir(&self) -> PathBuf {
        self.acme
            .cache_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.conf_dir.join("certs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
user = "www-data"
group = "www-data"

[server]
bind = "127.0.0.1"
challenge_port = 8080
pid_file = "/run/tlsproxy.pid"

[acme]
email = "admin@example.com"
testing = true

[supervisor]
restart_limit = 3
backoff_ms = 200

[control]
socket_path = "/run/tlsproxy.sock"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.user.as_deref(), Some("www-data"));
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.challenge_port, 8080);
        assert!(config.acme.enabled());
        assert!(config.acme.testing);
        assert_eq!(config.supervisor.restart_limit, 3);
        assert_eq!(config.supervisor.backoff_unit(), Duration::from_millis(200));
        assert_eq!(config.supervisor.stability_window(), Duration::from_secs(5));
        assert_eq!(config.socket_path(), PathBuf::from("/run/tlsproxy.sock"));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.challenge_port, 80);
        assert!(!config.acme.enabled());
        assert_eq!(config.supervisor.restart_limit, 15);
        assert_eq!(config.supervisor.backoff_unit(), Duration::from_secs(1));
        assert_eq!(config.supervisor.stop_grace(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.conf_dir, dir.path());
        assert_eq!(config.sites_dir(), dir.path().join("sites"));
        assert_eq!(config.socket_path(), dir.path().join("tlsproxy.sock"));
        assert_eq!(config.acme_cache_dir(), dir.path().join("certs"));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[server\nbind=").unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.server.challenge_port = 0;
        config.tls.cert = Some("cert.pem".to_string());
        config.supervisor.backoff_ms = 0;
        config.server.bind = "localhost".to_string();

        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_ipv6_bind_is_valid() {
        let mut config = Config::default();
        config.server.bind = "::".to_string();
        assert!(config.validate().is_ok());
        config.server.bind = "[::1]".to_string();
        assert!(config.validate().is_ok());
    }
}
