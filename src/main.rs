use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tlsproxy::config::{conf_dir_from_env, Config};
use tlsproxy::control::{ControlServer, VERSION};
use tlsproxy::daemon::Daemon;
use tlsproxy::sites::load_sites;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Time allowed for processes and listeners to stop before remaining children are killed
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tlsproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    // Configuration directory: first argument, then PROXY_CONF, then the default
    let conf_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(conf_dir_from_env);

    let config = Config::load(&conf_dir).map_err(|e| {
        error!(path = %conf_dir.display(), error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let daemon = Arc::new(Daemon::new(config)?);

    let sites = load_sites(daemon.config()).map_err(|e| {
        error!(error = %e, "Failed to load site definitions");
        e
    })?;
    daemon.register_sites(&sites)?;
    daemon.start().await?;

    // Spawn ACME renewal task if configured
    if let Some(acme) = daemon.acme() {
        let acme = acme.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            acme.run(shutdown).await;
        });
    }

    let control = Arc::new(ControlServer::new(
        daemon.config().socket_path(),
        Arc::clone(daemon.supervisor()),
        Arc::clone(&daemon) as Arc<dyn tlsproxy::control::Reloader>,
    ));
    let control_listener = control.bind().await?;
    let control_handle = tokio::spawn(Arc::clone(&control).run(control_listener, shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or site reload (SIGHUP)
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading sites...");
                    match daemon.reload().await {
                        Ok(summary) => {
                            if !summary.errors.is_empty() {
                                warn!(errors = ?summary.errors, "Some sites could not be added");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload sites");
                        }
                    }
                }
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Children still alive at the deadline are SIGKILLed before exiting
    if !daemon.shutdown_within(SHUTDOWN_TIMEOUT).await {
        remove_pid_file(pid_file_path.as_deref());
        std::process::exit(1);
    }

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, control_handle).await;

    remove_pid_file(pid_file_path.as_deref());

    info!("Shutdown complete");
    Ok(())
}

fn remove_pid_file(path: Option<&Path>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// PID file handle that maintains an exclusive lock
struct PidFile {
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Non-blocking so a second daemon fails fast
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

fn print_startup_banner(config: &Config) {
    info!(version = VERSION, "Starting tlsproxy");
    info!(
        conf_dir = %config.conf_dir.display(),
        bind = %config.server.bind,
        challenge_port = config.server.challenge_port,
        acme = config.acme.enabled(),
        static_tls = config.tls.has_files(),
        "Server configuration"
    );
    info!(
        restart_limit = config.supervisor.restart_limit,
        backoff_ms = config.supervisor.backoff_ms,
        stability_ms = config.supervisor.stability_ms,
        stop_grace_ms = config.supervisor.stop_grace_ms,
        "Supervisor settings"
    );
    info!(socket = %config.socket_path().display(), "Control socket");
}
