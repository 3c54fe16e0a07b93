//! Site definition records
//!
//! Each JSON file in `<conf_dir>/sites/` holds one record or an array of
//! records. A record expands into one or more [`HostEntry`] registrations
//! and an optional [`ProcessSpec`] for the supervisor.

use crate::action::Action;
use crate::config::{Config, ConfigError};
use crate::identity;
use crate::process::{CommandSpec, ProcessSpec};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Plain,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Plain => "http",
            Protocol::Tls => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Plain => 80,
            Protocol::Tls => 443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (port, protocol, domain, action) registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub domain: String,
    pub port: u16,
    pub protocol: Protocol,
    pub action: Action,
}

/// A single value or a list of values
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    OneOrMany::deserialize(deserializer).map(OneOrMany::into_vec)
}

fn optional_one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<OneOrMany<T>>::deserialize(deserializer)
        .map(|v| v.map(OneOrMany::into_vec).unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    #[serde(deserialize_with = "one_or_many")]
    pub host: Vec<String>,

    pub action: Action,

    #[serde(default, deserialize_with = "optional_one_or_many")]
    pub redirect_from: Vec<String>,

    #[serde(default)]
    pub exec: Option<ExecSpec>,

    /// Disabled records are filtered out by [`parse_site_file`]
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecSpec {
    pub id: String,
    pub run: CommandSpec,
    pub at: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Everything a site file contributes to the daemon
#[derive(Debug, Default)]
pub struct SiteSet {
    pub hosts: Vec<HostEntry>,
    pub processes: Vec<ProcessSpec>,
}

/// Split `https://domain[:port]` into its protocol, domain and port
pub fn parse_host_url(url: &str) -> Result<(Protocol, String, u16), String> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| format!("invalid host URL {:?}: {}", url, e))?;

    let protocol = match uri.scheme_str() {
        Some("http") => Protocol::Plain,
        Some("https") => Protocol::Tls,
        Some(other) => return Err(format!("unsupported protocol {:?} in {:?}", other, url)),
        None => return Err(format!("host URL {:?} has no protocol", url)),
    };

    let domain = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("host URL {:?} has no domain", url))?
        .to_ascii_lowercase();

    let port = uri.port_u16().unwrap_or_else(|| protocol.default_port());
    Ok((protocol, domain, port))
}

fn origin(protocol: Protocol, domain: &str, port: u16) -> String {
    if port == protocol.default_port() {
        format!("{}://{}", protocol, domain)
    } else {
        format!("{}://{}:{}", protocol, domain, port)
    }
}

/// Port of a proxy target, used to inject `PORT` into the site's process
fn proxy_target_port(to: &str) -> Option<u16> {
    let uri: hyper::Uri = to.parse().ok()?;
    uri.port_u16().or(match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    })
}

impl SiteRecord {
    /// Expand this record into host entries and an optional process spec
    pub fn expand(&self, path: &Path, config: &Config) -> Result<SiteSet, ConfigError> {
        let site_err = |message: String| ConfigError::Site {
            path: path.to_path_buf(),
            message,
        };

        if self.host.is_empty() {
            return Err(site_err("site has no host".to_string()));
        }

        if let Action::Redirect { code, .. } = &self.action {
            if !(300..=399).contains(code) {
                return Err(site_err(format!("redirect code {} is not a 3xx status", code)));
            }
        }

        if self.redirect_from.len() > self.host.len() {
            return Err(site_err(format!(
                "redirectFrom has {} entries but host has only {}",
                self.redirect_from.len(),
                self.host.len()
            )));
        }

        let mut set = SiteSet::default();
        let mut origins = Vec::with_capacity(self.host.len());

        for host in &self.host {
            let (protocol, domain, port) = parse_host_url(host).map_err(site_err)?;
            origins.push(origin(protocol, &domain, port));
            set.hosts.push(HostEntry {
                domain,
                port,
                protocol,
                action: self.action.clone(),
            });
        }

        for (from, target) in self.redirect_from.iter().zip(&origins) {
            let (protocol, domain, port) = parse_host_url(from).map_err(site_err)?;
            set.hosts.push(HostEntry {
                domain,
                port,
                protocol,
                action: Action::Redirect {
                    to: format!("{}/$path", target),
                    code: 302,
                },
            });
        }

        if let Some(exec) = &self.exec {
            set.processes.push(self.process_spec(exec, config).map_err(|e| match e {
                ConfigError::UnknownIdentity { .. } => site_err(e.to_string()),
                other => other,
            })?);
        }

        Ok(set)
    }

    fn process_spec(&self, exec: &ExecSpec, config: &Config) -> Result<ProcessSpec, ConfigError> {
        let mut environment = exec.env.clone();
        if let Action::Proxy { to, .. } = &self.action {
            if !environment.contains_key("PORT") {
                if let Some(port) = proxy_target_port(to) {
                    environment.insert("PORT".to_string(), port.to_string());
                }
            }
        }

        let uid = exec
            .user
            .as_deref()
            .or(config.user.as_deref())
            .map(identity::resolve_user)
            .transpose()?;
        let gid = exec
            .group
            .as_deref()
            .or(config.group.as_deref())
            .map(identity::resolve_group)
            .transpose()?;

        Ok(ProcessSpec {
            id: exec.id.clone(),
            command: exec.run.clone(),
            working_dir: exec.at.clone(),
            environment,
            uid,
            gid,
        })
    }
}

/// Parse one site file: a single record or an array of records
pub fn parse_site_file(path: &Path, content: &str) -> Result<Vec<SiteRecord>, ConfigError> {
    let json_err = |source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    };

    let value: serde_json::Value = serde_json::from_str(content).map_err(json_err)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(_) => vec![value],
        other => {
            return Err(ConfigError::Site {
                path: path.to_path_buf(),
                message: format!("expected array or object, got {}", json_type(&other)),
            })
        }
    };

    // Disabled records are skipped before they are validated
    items
        .into_iter()
        .filter(|item| {
            let disabled = is_disabled(item);
            if disabled {
                info!(path = %path.display(), host = %item["host"], "Skipping disabled site");
            }
            !disabled
        })
        .map(|item| serde_json::from_value(item).map_err(json_err))
        .collect()
}

fn is_disabled(item: &serde_json::Value) -> bool {
    item.get("disabled")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Load every `*.json` file under the sites directory, in file name order
pub fn load_sites(config: &Config) -> Result<SiteSet, ConfigError> {
    let dir = config.sites_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %dir.display(), "Sites directory does not exist");
            return Ok(SiteSet::default());
        }
        Err(source) => return Err(ConfigError::Io { path: dir, source }),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut set = SiteSet::default();
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        for record in parse_site_file(&path, &content)? {
            let expanded = record.expand(&path, config)?;
            set.hosts.extend(expanded.hosts);
            set.processes.extend(expanded.processes);
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(json: &str) -> Result<SiteSet, ConfigError> {
        let path = Path::new("test.json");
        let records = parse_site_file(path, json)?;
        let mut set = SiteSet::default();
        for record in records {
            let expanded = record.expand(path, &Config::default())?;
            set.hosts.extend(expanded.hosts);
            set.processes.extend(expanded.processes);
        }
        Ok(set)
    }

    #[test]
    fn test_parse_host_url() {
        assert_eq!(
            parse_host_url("https://Example.com").unwrap(),
            (Protocol::Tls, "example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_url("http://a.test:8080").unwrap(),
            (Protocol::Plain, "a.test".to_string(), 8080)
        );
        assert!(parse_host_url("ftp://a.test").is_err());
        assert!(parse_host_url("a.test").is_err());
    }

    #[test]
    fn test_single_record() {
        let set = expand(
            r#"{"host": "http://a.test", "action": {"type": "serve", "path": "/srv/www"}}"#,
        )
        .unwrap();
        assert_eq!(set.hosts.len(), 1);
        assert_eq!(set.hosts[0].domain, "a.test");
        assert_eq!(set.hosts[0].port, 80);
        assert_eq!(set.hosts[0].protocol, Protocol::Plain);
        assert!(set.processes.is_empty());
    }

    #[test]
    fn test_array_with_multiple_hosts_and_redirect_from() {
        let set = expand(
            r#"[{
                "host": ["https://example.com", "https://blog.example.com"],
                "redirectFrom": "http://example.com",
                "action": {"type": "none"}
            }]"#,
        )
        .unwrap();

        assert_eq!(set.hosts.len(), 3);
        let redirect = &set.hosts[2];
        assert_eq!(redirect.domain, "example.com");
        assert_eq!(redirect.port, 80);
        assert_eq!(
            redirect.action,
            Action::Redirect {
                to: "https://example.com/$path".to_string(),
                code: 302
            }
        );
    }

    #[test]
    fn test_redirect_from_longer_than_host_rejected() {
        let err = expand(
            r#"{"host": "https://a.test", "redirectFrom": ["http://a.test", "http://b.test"],
                "action": {"type": "none"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("redirectFrom"));
    }

    #[test]
    fn test_exec_injects_port_from_proxy() {
        let set = expand(
            r#"{
                "host": "https://app.test",
                "action": {"type": "proxy", "to": "http://localhost:8085"},
                "exec": {"id": "app", "run": "node server.js", "at": "/srv/app", "env": {"NODE_ENV": "production"}}
            }"#,
        )
        .unwrap();

        let spec = &set.processes[0];
        assert_eq!(spec.id, "app");
        assert_eq!(spec.command, CommandSpec::Shell("node server.js".to_string()));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/app")));
        assert_eq!(spec.environment.get("PORT").map(String::as_str), Some("8085"));
        assert_eq!(
            spec.environment.get("NODE_ENV").map(String::as_str),
            Some("production")
        );
    }

    #[test]
    fn test_exec_keeps_explicit_port() {
        let set = expand(
            r#"{
                "host": "https://app.test",
                "action": {"type": "proxy", "to": "http://localhost:8085"},
                "exec": {"id": "app", "run": ["node", "server.js"], "env": {"PORT": "9000"}}
            }"#,
        )
        .unwrap();

        let spec = &set.processes[0];
        assert_eq!(
            spec.command,
            CommandSpec::Argv(vec!["node".to_string(), "server.js".to_string()])
        );
        assert_eq!(spec.environment.get("PORT").map(String::as_str), Some("9000"));
    }

    #[test]
    fn test_exec_numeric_identity() {
        let set = expand(
            r#"{
                "host": "http://a.test",
                "action": {"type": "none"},
                "exec": {"id": "a", "run": "true", "user": "1000", "group": "100"}
            }"#,
        )
        .unwrap();
        assert_eq!(set.processes[0].uid, Some(1000));
        assert_eq!(set.processes[0].gid, Some(100));
    }

    #[test]
    fn test_exec_requires_id() {
        let result = expand(
            r#"{"host": "http://a.test", "action": {"type": "none"}, "exec": {"run": "true"}}"#,
        );
        assert!(matches!(result, Err(ConfigError::Json { .. })));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = expand("42").unwrap_err();
        assert!(err.to_string().contains("expected array or object, got number"));
    }

    #[test]
    fn test_bad_redirect_code_rejected() {
        let err = expand(
            r#"{"host": "http://a.test", "action": {"type": "redirect", "to": "/x", "code": 200}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("3xx"));
    }

    #[test]
    fn test_load_sites_skips_disabled_and_non_json() {
        let dir = tempfile::tempdir().unwrap();
        let sites = dir.path().join("sites");
        std::fs::create_dir(&sites).unwrap();
        std::fs::write(
            sites.join("a.json"),
            r#"{"host": "http://a.test", "action": {"type": "none"}}"#,
        )
        .unwrap();
        std::fs::write(
            sites.join("b.json"),
            r#"{"host": "http://b.test", "action": {"type": "none"}, "disabled": true}"#,
        )
        .unwrap();
        // Broken records do not matter once disabled
        std::fs::write(
            sites.join("c.json"),
            r#"[{"host": "http://c.test", "action": {"type": "teleport"}, "disabled": true},
                {"disabled": true}]"#,
        )
        .unwrap();
        std::fs::write(sites.join("notes.txt"), "not a site").unwrap();

        let config = Config::load(dir.path()).unwrap();
        let set = load_sites(&config).unwrap();
        assert_eq!(set.hosts.len(), 1);
        assert_eq!(set.hosts[0].domain, "a.test");
    }

    #[test]
    fn test_load_sites_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        let set = load_sites(&config).unwrap();
        assert!(set.hosts.is_empty());
        assert!(set.processes.is_empty());
    }
}
