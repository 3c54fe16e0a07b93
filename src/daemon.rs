//! Daemon orchestration: wires sites into listeners and the supervisor

use crate::acme::AcmeProvider;
use crate::config::{Config, ConfigError};
use crate::control::Reloader;
use crate::listener::ListenerManager;
use crate::process::{Supervisor, SupervisorError};
use crate::proxy::UpstreamConnector;
use crate::sites::{load_sites, SiteSet};
use crate::tls::{CertificateProvider, SelfSignedCertificates, StaticCertificates};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of an additive reload
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub hosts_added: usize,
    pub hosts_skipped: usize,
    pub processes_added: usize,
    /// Processes whose id was already registered; their definition is left as is
    pub processes_skipped: usize,
    /// Entries that could not be registered
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub struct Daemon {
    config: Config,
    listeners: ListenerManager,
    supervisor: Arc<Supervisor>,
    acme: Option<AcmeProvider>,
}

impl Daemon {
    /// Build the certificate provider, listener manager and supervisor.
    ///
    /// Certificates come from ACME when an email is configured, else from
    /// `[tls]` files, else they are self-signed per domain.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let (certs, acme): (Arc<dyn CertificateProvider>, Option<AcmeProvider>) = if config.acme.enabled() {
            let provider = AcmeProvider::new(&config.acme, &config.acme_cache_dir())?;
            (Arc::new(provider.clone()), Some(provider))
        } else if let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) {
            (Arc::new(StaticCertificates::from_files(cert, key)?), None)
        } else {
            (Arc::new(SelfSignedCertificates::new()), None)
        };

        let connector = UpstreamConnector::new()
            .map_err(|e| anyhow::anyhow!("Failed to configure upstream TLS: {}", e))?;
        let listeners = ListenerManager::new(
            config.server.bind.clone(),
            config.server.challenge_port,
            certs,
            connector,
        );
        let supervisor = Supervisor::new(config.supervisor.clone());

        Ok(Self {
            config,
            listeners,
            supervisor,
            acme,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn acme(&self) -> Option<&AcmeProvider> {
        self.acme.as_ref()
    }

    /// Register every host and process of the initial site set.
    ///
    /// Any conflict is fatal; nothing is bound or spawned yet.
    pub fn register_sites(&self, sites: &SiteSet) -> Result<(), ConfigError> {
        for entry in &sites.hosts {
            self.listeners.add_host(entry)?;
        }
        for spec in &sites.processes {
            self.supervisor
                .register(spec.clone())
                .map_err(|_| ConfigError::DuplicateProcess(spec.id.clone()))?;
        }

        info!(
            hosts = sites.hosts.len(),
            processes = sites.processes.len(),
            "Sites registered"
        );
        Ok(())
    }

    /// Bind the registered listeners and start every stopped process
    pub async fn start(&self) -> anyhow::Result<()> {
        self.listeners.start_pending().await?;
        for (port, protocol, domains) in self.listeners.listeners() {
            info!(port, protocol = %protocol, domains, "Listener ready");
        }

        for status in self.supervisor.list() {
            if let Err(e) = self.supervisor.start(&status.id) {
                error!(id = %status.id, error = %e, "Failed to start process");
            }
        }

        Ok(())
    }

    /// Re-read the site definitions and add what is new.
    ///
    /// Hosts already registered on their port and processes with a known id
    /// are left untouched. Nothing is ever removed.
    pub async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let sites = load_sites(&self.config)?;
        let mut summary = ReloadSummary::default();

        for entry in &sites.hosts {
            if self.listeners.has_domain(entry.port, &entry.domain) {
                summary.hosts_skipped += 1;
                continue;
            }
            match self.listeners.add_host(entry) {
                Ok(()) => summary.hosts_added += 1,
                Err(e) => {
                    warn!(domain = %entry.domain, port = entry.port, error = %e, "Skipping host on reload");
                    summary.hosts_skipped += 1;
                    summary.errors.push(e.to_string());
                }
            }
        }

        if let Err(e) = self.listeners.start_pending().await {
            summary.errors.push(e.to_string());
        }

        for spec in &sites.processes {
            let id = spec.id.clone();
            match self.supervisor.register(spec.clone()) {
                Ok(()) => {
                    summary.processes_added += 1;
                    if let Err(e) = self.supervisor.start(&id) {
                        error!(id = %id, error = %e, "Failed to start process");
                        summary.errors.push(e.to_string());
                    }
                }
                Err(SupervisorError::Duplicate(_)) => {
                    warn!(id = %id, "Process already registered, keeping its current definition");
                    summary.processes_skipped += 1;
                }
                Err(e) => summary.errors.push(e.to_string()),
            }
        }

        info!(
            hosts_added = summary.hosts_added,
            hosts_skipped = summary.hosts_skipped,
            processes_added = summary.processes_added,
            processes_skipped = summary.processes_skipped,
            errors = summary.errors.len(),
            "Sites reloaded"
        );
        Ok(summary)
    }

    /// Stop every process and listener concurrently
    pub async fn shutdown(&self) {
        info!("Stopping processes and listeners...");
        futures::join!(self.supervisor.shutdown(), self.listeners.close());
    }

    /// Shut down, killing any process still alive once `limit` has elapsed.
    ///
    /// Returns false when the limit was hit.
    pub async fn shutdown_within(&self, limit: Duration) -> bool {
        if tokio::time::timeout(limit, self.shutdown()).await.is_ok() {
            return true;
        }
        let killed = self.supervisor.kill_all();
        warn!(
            timeout_ms = limit.as_millis() as u64,
            killed, "Shutdown timed out, killed remaining processes"
        );
        false
    }
}

impl Reloader for Daemon {
    fn reload(&self) -> BoxFuture<'_, anyhow::Result<serde_json::Value>> {
        Box::pin(async move {
            let summary = Daemon::reload(self).await?;
            Ok(serde_json::to_value(summary)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use std::path::Path;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn write_site(conf: &Path, name: &str, json: &str) {
        let sites = conf.join("sites");
        std::fs::create_dir_all(&sites).unwrap();
        std::fs::write(sites.join(name), json).unwrap();
    }

    fn daemon(conf: &Path) -> Daemon {
        std::fs::write(
            conf.join("config.toml"),
            "[server]\nbind = \"127.0.0.1\"\n\n[supervisor]\nstop_grace_ms = 200\n",
        )
        .unwrap();
        Daemon::new(Config::load(conf).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_start() {
        let conf = tempfile::tempdir().unwrap();
        let port = free_port();
        write_site(
            conf.path(),
            "app.json",
            &format!(
                r#"{{"host": "http://app.test:{port}", "action": {{"type": "none"}},
                    "exec": {{"id": "app", "run": "sleep 60"}}}}"#
            ),
        );

        let daemon = daemon(conf.path());
        let sites = load_sites(daemon.config()).unwrap();
        daemon.register_sites(&sites).unwrap();
        daemon.start().await.unwrap();

        assert!(daemon.listeners().has_domain(port, "app.test"));
        assert_eq!(
            daemon.supervisor().status("app").unwrap().state,
            ProcessState::Running
        );

        daemon.shutdown().await;
        assert_eq!(
            daemon.supervisor().status("app").unwrap().state,
            ProcessState::Stopped
        );
    }

    #[test]
    fn test_conflicting_sites_fail_registration() {
        let conf = tempfile::tempdir().unwrap();
        write_site(
            conf.path(),
            "a.json",
            r#"[{"host": "http://a.test:8080", "action": {"type": "none"}},
                {"host": "https://b.test:8080", "action": {"type": "none"}}]"#,
        );

        let daemon = daemon(conf.path());
        let sites = load_sites(daemon.config()).unwrap();
        let err = daemon.register_sites(&sites).unwrap_err();
        assert!(matches!(err, ConfigError::ProtocolConflict { port: 8080, .. }));
    }

    #[tokio::test]
    async fn test_reload_is_additive() {
        let conf = tempfile::tempdir().unwrap();
        let port = free_port();
        write_site(
            conf.path(),
            "a.json",
            &format!(r#"{{"host": "http://a.test:{port}", "action": {{"type": "none"}}}}"#),
        );

        let daemon = daemon(conf.path());
        daemon
            .register_sites(&load_sites(daemon.config()).unwrap())
            .unwrap();
        daemon.start().await.unwrap();

        write_site(
            conf.path(),
            "b.json",
            &format!(
                r#"{{"host": "http://b.test:{port}", "action": {{"type": "none"}},
                    "exec": {{"id": "b", "run": ["sleep", "60"]}}}}"#
            ),
        );

        let summary = daemon.reload().await.unwrap();
        assert_eq!(
            summary,
            ReloadSummary {
                hosts_added: 1,
                hosts_skipped: 1,
                processes_added: 1,
                processes_skipped: 0,
                errors: vec![],
            }
        );
        assert!(daemon.listeners().has_domain(port, "b.test"));
        assert_eq!(daemon.supervisor().status("b").unwrap().state, ProcessState::Running);

        // Nothing new the second time around
        let summary = daemon.reload().await.unwrap();
        assert_eq!(summary.hosts_added, 0);
        assert_eq!(summary.hosts_skipped, 2);
        assert_eq!(summary.processes_added, 0);
        assert_eq!(summary.processes_skipped, 1);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_keeps_changed_process_definition() {
        let conf = tempfile::tempdir().unwrap();
        let port = free_port();
        write_site(
            conf.path(),
            "a.json",
            &format!(
                r#"{{"host": "http://a.test:{port}", "action": {{"type": "none"}},
                    "exec": {{"id": "a", "run": "sleep 60"}}}}"#
            ),
        );

        let daemon = daemon(conf.path());
        daemon
            .register_sites(&load_sites(daemon.config()).unwrap())
            .unwrap();
        daemon.start().await.unwrap();

        write_site(
            conf.path(),
            "a.json",
            &format!(
                r#"{{"host": "http://a.test:{port}", "action": {{"type": "none"}},
                    "exec": {{"id": "a", "run": "sleep 120"}}}}"#
            ),
        );

        let summary = daemon.reload().await.unwrap();
        assert_eq!(summary.processes_added, 0);
        assert_eq!(summary.processes_skipped, 1);
        assert!(summary.errors.is_empty());

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["processes_skipped"], 1);

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_within_kills_stubborn_process() {
        let conf = tempfile::tempdir().unwrap();
        write_site(
            conf.path(),
            "stubborn.json",
            &format!(
                r#"{{"host": "http://stubborn.test:{}", "action": {{"type": "none"}},
                    "exec": {{"id": "stubborn",
                             "run": ["sh", "-c", "trap '' TERM; while true; do sleep 0.1; done"]}}}}"#,
                free_port()
            ),
        );
        // Default stop grace of one second
        std::fs::write(conf.path().join("config.toml"), "[server]\nbind = \"127.0.0.1\"\n").unwrap();

        let daemon = Daemon::new(Config::load(conf.path()).unwrap()).unwrap();
        daemon
            .register_sites(&load_sites(daemon.config()).unwrap())
            .unwrap();
        daemon.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!daemon.shutdown_within(Duration::from_millis(500)).await);
        assert_eq!(
            daemon.supervisor().status("stubborn").unwrap().state,
            ProcessState::Stopped
        );

        // Once the child is reaped there is nothing left to signal
        let reaped = tokio::time::timeout(Duration::from_secs(2), async {
            while daemon.supervisor().kill_all() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reaped.is_ok());
    }

    #[tokio::test]
    async fn test_reload_reports_conflicts() {
        let conf = tempfile::tempdir().unwrap();
        let port = free_port();
        write_site(
            conf.path(),
            "a.json",
            &format!(r#"{{"host": "http://a.test:{port}", "action": {{"type": "none"}}}}"#),
        );

        let daemon = daemon(conf.path());
        daemon
            .register_sites(&load_sites(daemon.config()).unwrap())
            .unwrap();

        write_site(
            conf.path(),
            "b.json",
            &format!(r#"{{"host": "https://b.test:{port}", "action": {{"type": "none"}}}}"#),
        );

        let value = Reloader::reload(&daemon).await.unwrap();
        assert_eq!(value["hosts_added"], 0);
        assert_eq!(value["hosts_skipped"], 2);
        assert_eq!(value["errors"].as_array().unwrap().len(), 1);
    }
}
