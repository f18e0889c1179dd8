//! Unix socket server for the daemon process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tapcap_core::error::ApiError;
use tapcap_core::protocol::{Command, Request, Response, ResponseData};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::daemon::paths;
use crate::orchestrator::CaptureOrchestrator;

/// Maximum number of concurrent client connections.
const MAX_CONNECTIONS: usize = 16;

/// How long to wait for in-flight connections during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// The daemon server that listens for client connections.
///
/// One orchestrator behind one async mutex: a capture cycle holds the
/// device and the ledger from pre-snapshot to append, so concurrent
/// clients serialize instead of interleaving device commands.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    orchestrator: Arc<Mutex<CaptureOrchestrator>>,
    connection_semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    /// Bind to the default socket path.
    pub async fn bind(orchestrator: CaptureOrchestrator) -> Result<Self> {
        paths::ensure_socket_dir().context("Failed to create socket directory")?;
        Self::bind_to(paths::get_socket_path(), paths::get_pid_path(), orchestrator).await
    }

    /// Bind to a specific socket path.
    ///
    /// Bind-first to avoid a check-then-bind race:
    /// 1. Try to bind directly
    /// 2. If the socket is in use, check the PID file for a live daemon
    /// 3. If the old daemon is dead, remove the stale socket and retry
    /// 4. If it is alive, fail
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        orchestrator: CaptureOrchestrator,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for {:?}", socket_path))?;
        }

        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }

                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;
                if metadata.file_type().is_symlink() {
                    anyhow::bail!(
                        "Socket path {:?} is a symlink, refusing to delete",
                        socket_path
                    );
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!(
                            "Path {:?} exists but is not a socket file",
                            socket_path
                        );
                    }
                }

                info!("Removing stale socket from dead daemon");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;
                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        info!("Daemon listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Accept connections until a shutdown command arrives, then drain
    /// in-flight connections with a timeout. The daemon never exits on
    /// idleness; a capture session legitimately has long quiet stretches.
    pub async fn run(&self) -> Result<()> {
        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let orchestrator = self.orchestrator.clone();
                            let shutdown = self.shutdown.clone();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, orchestrator, shutdown).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );
            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Whether the PID file names a live process.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid: i32 = match std::fs::read_to_string(pid_path) {
        Ok(s) => match s.trim().parse() {
            Ok(p) => p,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    // SAFETY: kill with signal 0 only checks existence, nothing is sent.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Read a line with a size cap so a misbehaving client cannot balloon
/// memory. Returns bytes read; 0 means EOF.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;
        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|p| p + 1).unwrap_or(available.len());
        if total + take > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }
        bytes.extend_from_slice(&available[..take]);
        total += take;
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Handle a single client connection, one JSON request per line.
async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<Mutex<CaptureOrchestrator>>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, &orchestrator, &shutdown).await,
            Err(e) => Response::error(
                "unknown",
                ApiError::validation_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Send one JSON object per line with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"health\"}}",
                ),
            ),
        };

        let response_json =
            serde_json::to_string(&response).context("Failed to serialize response")?;
        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        writer.flush().await.context("Failed to flush")?;
    }

    Ok(())
}

async fn handle_request(
    request: Request,
    orchestrator: &Mutex<CaptureOrchestrator>,
    shutdown: &Arc<Notify>,
) -> Response {
    debug!("Handling command: {:?}", request.command);

    match request.command {
        Command::Capture { spec } => handle_capture(&request.id, orchestrator, spec).await,
        Command::FinalSnapshot => handle_final_snapshot(&request.id, orchestrator).await,
        Command::Health => handle_health(&request.id, orchestrator).await,
        Command::Shutdown => handle_shutdown(&request.id, shutdown),
    }
}

async fn handle_capture(
    request_id: &str,
    orchestrator: &Mutex<CaptureOrchestrator>,
    spec: tapcap_core::protocol::CaptureSpec,
) -> Response {
    let capture_request = match spec.validate() {
        Ok(req) => req,
        Err(e) => return Response::error(request_id, e),
    };

    // Held across the whole cycle: device, files, and ledger move together.
    let mut orch = orchestrator.lock().await;
    match orch.capture(capture_request).await {
        Ok(record) => {
            info!(sequence_id = record.sequence_id, "capture complete");
            Response::success(
                request_id,
                ResponseData::Captured {
                    sequence_id: record.sequence_id,
                    node: record.node.clone(),
                    record,
                },
            )
        }
        Err(e) => Response::error(request_id, e),
    }
}

async fn handle_final_snapshot(
    request_id: &str,
    orchestrator: &Mutex<CaptureOrchestrator>,
) -> Response {
    let mut orch = orchestrator.lock().await;
    match orch.final_snapshot().await {
        Ok(record) => Response::success(
            request_id,
            ResponseData::Captured {
                sequence_id: record.sequence_id,
                node: None,
                record,
            },
        ),
        Err(e) => Response::error(request_id, e),
    }
}

async fn handle_health(request_id: &str, orchestrator: &Mutex<CaptureOrchestrator>) -> Response {
    let orch = orchestrator.lock().await;
    let device_ready = orch.bridge().is_ready().await;
    Response::success(
        request_id,
        ResponseData::Health {
            device_ready,
            records: orch.record_count(),
            output_dir: orch.output_dir().display().to_string(),
        },
    )
}

/// Reply first, signal the run loop shortly after so the response can
/// flush. Drop cleans up the socket and PID files.
fn handle_shutdown(request_id: &str, shutdown: &Arc<Notify>) -> Response {
    info!("Received shutdown command, stopping daemon");
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();
    });
    Response::success(
        request_id,
        ResponseData::Ok {
            message: "Daemon shutting down".to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ShellBridge;
    use tapcap_core::error::ErrorCode;
    use tapcap_core::protocol::CaptureSpec;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Orchestrator with a bridge pointing at a nonexistent adb binary,
    /// enough for protocol-level round trips.
    fn offline_orchestrator(dir: &Path) -> CaptureOrchestrator {
        let bridge = Arc::new(ShellBridge::new("tapcap-test-no-adb", None));
        CaptureOrchestrator::new(bridge, dir.to_path_buf()).unwrap()
    }

    async fn start_server(tag: &str) -> (PathBuf, tempfile::TempDir, tokio::task::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path =
            std::env::temp_dir().join(format!("tapcap-{}-{}.sock", tag, std::process::id()));
        let pid_path = socket_path.with_extension("pid");
        let _ = std::fs::remove_file(&socket_path);

        let orchestrator = offline_orchestrator(dir.path());
        let server = DaemonServer::bind_to(socket_path.clone(), pid_path, orchestrator)
            .await
            .expect("Failed to bind server");
        let handle = tokio::spawn(async move {
            let _ = timeout(Duration::from_secs(3), server.run()).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        (socket_path, dir, handle)
    }

    async fn round_trip(socket_path: &Path, request: &Request) -> Response {
        let stream = UnixStream::connect(socket_path)
            .await
            .expect("Failed to connect");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let json = serde_json::to_string(request).unwrap();
        writer.write_all(json.as_bytes()).await.expect("write");
        writer.write_all(b"\n").await.expect("newline");
        writer.flush().await.expect("flush");

        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timeout")
            .expect("read");
        serde_json::from_str(&line).expect("parse response")
    }

    #[tokio::test]
    async fn health_reports_offline_device() {
        let (socket_path, _dir, handle) = start_server("health").await;

        let response = round_trip(
            &socket_path,
            &Request {
                id: "h-1".to_string(),
                command: Command::Health,
            },
        )
        .await;

        assert!(response.success);
        assert_eq!(response.id, "h-1");
        match response.data {
            Some(ResponseData::Health {
                device_ready,
                records,
                ..
            }) => {
                assert!(!device_ready);
                assert_eq!(records, 0);
            }
            other => panic!("expected health data, got {:?}", other),
        }

        handle.abort();
        let _ = std::fs::remove_file(&socket_path);
    }

    #[tokio::test]
    async fn invalid_capture_spec_is_rejected_before_the_device() {
        let (socket_path, _dir, handle) = start_server("validate").await;

        let response = round_trip(
            &socket_path,
            &Request {
                id: "c-1".to_string(),
                command: Command::Capture {
                    spec: CaptureSpec {
                        action: Some("click".to_string()),
                        ..Default::default()
                    },
                },
            },
        )
        .await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::Validation);

        handle.abort();
        let _ = std::fs::remove_file(&socket_path);
    }

    #[tokio::test]
    async fn malformed_json_gets_a_validation_error() {
        let (socket_path, _dir, handle) = start_server("badjson").await;

        let stream = UnixStream::connect(&socket_path).await.expect("connect");
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        writer.write_all(b"this is not json\n").await.expect("write");
        writer.flush().await.expect("flush");

        let mut line = String::new();
        timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("timeout")
            .expect("read");
        let response: Response = serde_json::from_str(&line).expect("parse");
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::Validation);

        handle.abort();
        let _ = std::fs::remove_file(&socket_path);
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let (socket_path, _dir, handle) = start_server("shutdown").await;

        let response = round_trip(
            &socket_path,
            &Request {
                id: "s-1".to_string(),
                command: Command::Shutdown,
            },
        )
        .await;
        assert!(response.success);

        // The run loop should exit on its own, well before the test
        // timeout wrapped around it.
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not stop")
            .ok();
        let _ = std::fs::remove_file(&socket_path);
    }

    #[tokio::test]
    async fn stale_socket_from_dead_daemon_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = std::env::temp_dir().join(format!(
            "tapcap-stale-{}.sock",
            std::process::id()
        ));
        let pid_path = socket_path.with_extension("pid");
        let _ = std::fs::remove_file(&socket_path);

        // First server binds, then is dropped without removing the
        // socket file by hand.
        {
            let orchestrator = offline_orchestrator(dir.path());
            let server = DaemonServer::bind_to(socket_path.clone(), pid_path.clone(), orchestrator)
                .await
                .expect("first bind");
            // Simulate a crash: forget the server so Drop cleanup never runs.
            std::mem::forget(server);
        }
        // Point the PID file at a process that cannot exist.
        std::fs::write(&pid_path, "999999999").unwrap();

        let orchestrator = offline_orchestrator(dir.path());
        let server = DaemonServer::bind_to(socket_path.clone(), pid_path.clone(), orchestrator)
            .await
            .expect("rebind over stale socket");
        drop(server);
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path);
    }
}
