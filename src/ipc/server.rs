//! IPC Server - Unix socket front end of the cache manager
//!
//! Each client sends newline-delimited JSON commands and gets one response
//! line per command, in order.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::cache::SaveStatus;
use crate::ipc::protocol::{parse_command, serialize_response, Command, ErrorInfo, Response, PROTOCOL_VERSION};
use crate::manager::CacheManager;

pub struct IpcServer {
    manager: Arc<CacheManager>,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    /// Clients currently connected
    clients: Arc<AtomicUsize>,
}

/// Counts a client as connected for as long as it lives
struct ClientSlot(Arc<AtomicUsize>);

impl ClientSlot {
    fn open(clients: Arc<AtomicUsize>) -> Self {
        let now = clients.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(clients = now, "Client connected");
        Self(clients)
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(clients = now, "Client disconnected");
    }
}

impl IpcServer {
    pub fn new(manager: Arc<CacheManager>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            socket_path: socket_path.into(),
            listener: None,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the socket. A socket file left by an earlier run is replaced.
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket {}", self.socket_path.display())
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;
        info!(socket_path = %self.socket_path.display(), "Listening for cache requests");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept clients until the task is aborted
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("IPC server not started")?;

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client");
                    continue;
                }
            };
            let manager = Arc::clone(&self.manager);
            let slot = ClientSlot::open(Arc::clone(&self.clients));
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, &manager).await {
                    warn!(error = %e, "Client connection failed");
                }
                drop(slot);
            });
        }
    }

    /// Remove the socket file
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

/// Answer each command line of one client in order
async fn serve_client(stream: UnixStream, manager: &CacheManager) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read command")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match parse_command(line.as_bytes()) {
            Ok(command) => process_command(command, manager).await,
            Err(e) => {
                warn!(error = %e, "Rejected malformed command");
                Response::Error {
                    error: format!("Invalid command: {}", e),
                }
            }
        };

        let json = serialize_response(&response).context("Failed to encode response")?;
        writer.write_all(&json).await.context("Failed to write response")?;
    }
    Ok(())
}

fn failure(what: &str, e: anyhow::Error) -> Response {
    Response::Error {
        error: format!("{} failed: {:#}", what, e),
    }
}

/// Run one command against the manager
pub async fn process_command(command: Command, manager: &CacheManager) -> Response {
    match command {
        Command::Restore { request } => {
            info!(job = %request.job, caches = request.caches.len(), "Restore requested");
            match manager.restore(request).await {
                Ok(lines) => Response::Report { lines, error: None },
                Err(e) => failure("Restore", e),
            }
        }

        Command::Save {
            request,
            body_succeeded,
        } => {
            info!(job = %request.job, body_succeeded = body_succeeded, "Save requested");
            match manager.save(request, body_succeeded).await {
                Ok((lines, SaveStatus::Failed(error))) => Response::Report {
                    lines,
                    error: Some(error),
                },
                Ok((lines, _)) => Response::Report { lines, error: None },
                Err(e) => failure("Save", e),
            }
        }

        Command::Size { job } => {
            debug!(job = %job, "Size requested");
            match manager.size(&job).await {
                Ok(bytes) => Response::Size { bytes },
                Err(e) => failure("Size check", e),
            }
        }

        Command::Purge { job } => {
            info!(job = %job, "Purge requested");
            match manager.purge(&job).await {
                Ok(deleted) => Response::Success {
                    message: Some(format!("Deleted {} objects of job '{}'", deleted, job)),
                },
                Err(e) => failure("Purge", e),
            }
        }

        Command::ForgetJob { job } => {
            let forgotten = manager.forget_job(&job);
            debug!(job = %job, forgotten = forgotten, "Forget job requested");
            Response::Success {
                message: (!forgotten)
                    .then(|| format!("Job '{}' still has sessions holding its lock", job)),
            }
        }

        Command::GetStatus => {
            let store = manager.store();
            Response::Status {
                version: PROTOCOL_VERSION,
                healthy: store.health_status() != "unhealthy",
                backend: store.kind().to_string(),
                active_locks: manager.active_locks(),
                recent_errors: store.recent_errors().into_iter().map(ErrorInfo::from).collect(),
            }
        }
    }
}
