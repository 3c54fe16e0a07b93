//! Control-plane server on a Unix domain socket
//!
//! One JSON request per line, `{"name": ..., "data": {...}}`, answered by one
//! JSON line: the operation's result or `{"error": "..."}`. Errors never close
//! the connection.

use crate::process::{Supervisor, SupervisorError};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Longest accepted request line
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-reads site definitions for the `reload` operation
pub trait Reloader: Send + Sync + 'static {
    fn reload(&self) -> BoxFuture<'_, anyhow::Result<Value>>;
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("missing process id")]
    MissingId,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("reload failed: {0:#}")]
    Reload(anyhow::Error),
}

pub struct ControlServer {
    path: PathBuf,
    supervisor: Arc<Supervisor>,
    reloader: Arc<dyn Reloader>,
}

impl ControlServer {
    pub fn new(path: impl Into<PathBuf>, supervisor: Arc<Supervisor>, reloader: Arc<dyn Reloader>) -> Self {
        Self {
            path: path.into(),
            supervisor,
            reloader,
        }
    }

    /// Bind the socket. Fails if another daemon is answering on it.
    pub async fn bind(&self) -> anyhow::Result<UnixListener> {
        cleanup_stale_socket(&self.path).await?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.path)
            .map_err(|e| anyhow::anyhow!("Failed to bind control socket {}: {}", self.path.display(), e))?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %self.path.display(), "Control socket listening");
        Ok(listener)
    }

    /// Accept clients until shutdown, then remove the socket file
    pub async fn run(self: Arc<Self>, listener: UnixListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("Control client connected");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        while let Some(result) = framed.next().await {
            let response = match result {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match serde_json::from_str::<ControlRequest>(&line) {
                    Ok(request) => self.dispatch(request).await,
                    Err(e) => error_value(&ControlError::InvalidRequest(e.to_string())),
                },
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    error_value(&ControlError::InvalidRequest("request too long".to_string()))
                }
                Err(LinesCodecError::Io(e)) => {
                    debug!(error = %e, "Control connection read error");
                    break;
                }
            };

            if let Err(e) = framed.send(response.to_string()).await {
                debug!(error = %e, "Control connection write error");
                break;
            }
        }

        debug!("Control client disconnected");
    }

    /// Run one request, folding failures into `{"error": ...}`
    pub async fn dispatch(&self, request: ControlRequest) -> Value {
        debug!(name = %request.name, "Control request");
        match self.execute(&request.name, &request.data).await {
            Ok(value) => value,
            Err(e) => {
                warn!(name = %request.name, error = %e, "Control request failed");
                error_value(&e)
            }
        }
    }

    async fn execute(&self, name: &str, data: &Value) -> Result<Value, ControlError> {
        match name {
            "version" => Ok(json!({ "version": VERSION })),
            "reload" => self.reloader.reload().await.map_err(ControlError::Reload),
            "proc-list" => Ok(json!(self.supervisor.list())),
            "proc-start" => {
                self.supervisor.start(process_id(data)?)?;
                Ok(json!({}))
            }
            "proc-stop" => {
                self.supervisor.stop(process_id(data)?).await?;
                Ok(json!({}))
            }
            "proc-restart" => {
                self.supervisor.restart(process_id(data)?).await?;
                Ok(json!({}))
            }
            other => {
                debug!(name = %other, "Ignoring unknown control request");
                Ok(json!({}))
            }
        }
    }
}

fn process_id(data: &Value) -> Result<&str, ControlError> {
    data.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(ControlError::MissingId)
}

fn error_value(error: &ControlError) -> Value {
    json!({ "error": error.to_string() })
}

async fn cleanup_stale_socket(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("Another instance is already listening on {}", path.display());
        }
        info!(path = %path.display(), "Removing stale control socket");
        std::fs::remove_file(path)?;
    }
    Ok(())
}
