//! Client for connecting to the daemon process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tapcap_core::protocol::{Command, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::daemon::paths;

/// Maximum time to wait for the daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A capture can involve several device round trips plus settle delays.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for communicating with the daemon.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon, starting it if necessary.
    pub async fn connect() -> Result<Self> {
        let socket_path = paths::get_socket_path();

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            debug!("Connected to existing daemon");
            return Ok(Self { stream });
        }

        info!("Daemon not running, starting...");
        let child = Self::start_daemon()?;
        let stream = Self::wait_for_daemon(&socket_path, child).await?;
        Ok(Self { stream })
    }

    /// Connect without auto-starting. Used by commands that should fail
    /// fast when no daemon exists, like `stop`.
    pub async fn connect_existing() -> Result<Self> {
        let socket_path = paths::get_socket_path();
        let stream = UnixStream::connect(&socket_path)
            .await
            .with_context(|| format!("No daemon listening on {:?}", socket_path))?;
        Ok(Self { stream })
    }

    /// Start the daemon as a detached background process. `process_group(0)`
    /// keeps it alive when the CLI's terminal closes.
    fn start_daemon() -> Result<std::process::Child> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;
        let child = std::process::Command::new(exe)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;
        Ok(child)
    }

    /// Wait for the daemon socket, detecting an early crash so the error
    /// comes fast instead of after the full timeout.
    async fn wait_for_daemon(
        socket_path: &PathBuf,
        mut child: std::process::Child,
    ) -> Result<UnixStream> {
        let start = std::time::Instant::now();

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                bail!(
                    "Daemon exited immediately with status: {} (run 'tapcap daemon' directly to diagnose)",
                    status
                );
            }

            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    info!("Connected to daemon after {:?}", start.elapsed());
                    return Ok(stream);
                }
                Err(_) => {
                    if start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                        bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Send a command with a fresh request id and wait for the response.
    pub async fn send(&mut self, command: Command) -> Result<Response> {
        let request = Request {
            id: Uuid::new_v4().simple().to_string(),
            command,
        };
        self.request(request).await
    }

    /// Send a request and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize request")?;
        debug!("Sending: {}", request_json);

        self.stream
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.stream
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        self.stream.flush().await.context("Failed to flush")?;

        let (reader, _writer) = self.stream.split();
        let mut reader = BufReader::new(reader);
        let mut response_line = String::new();

        let bytes_read = timeout(REQUEST_TIMEOUT, reader.read_line(&mut response_line))
            .await
            .context("Request timed out")?
            .context("Failed to read response")?;
        if bytes_read == 0 {
            bail!("Daemon closed connection unexpectedly");
        }

        debug!("Received: {}", response_line.trim());
        serde_json::from_str(&response_line).context("Failed to parse response")
    }
}
