//! Streaming touch events from a long-lived device subprocess.
//!
//! The event stream is a child process (`adb shell getevent -lt` on a
//! chosen input device) whose stdout never ends on its own. A background
//! thread does the blocking reads and feeds lines into a bounded channel;
//! the async side consumes them at its own pace.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tapcap_core::error::ApiError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines buffered between the reader thread and the consumer.
const CHANNEL_CAPACITY: usize = 1000;

/// How long to wait after SIGTERM before resorting to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running event stream.
#[derive(Debug)]
pub struct EventListener {
    lines_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    child: Mutex<Child>,
    pid: i32,
    reader_thread: Option<JoinHandle<()>>,
}

impl EventListener {
    /// Spawn the stream subprocess and start the reader thread.
    pub fn spawn(argv: &[String]) -> Result<Self, ApiError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ApiError::internal("event stream command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ApiError::connection(format!("cannot start event stream: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApiError::internal("event stream child has no stdout"))?;
        let pid = child.id() as i32;

        let (lines_tx, lines_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader_thread = std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) => {
                        debug!("event stream closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim_end().to_string();
                        if lines_tx.blocking_send(trimmed).is_err() {
                            // Consumer is gone, stop reading.
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("event stream read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            lines_rx: tokio::sync::Mutex::new(lines_rx),
            child: Mutex::new(child),
            pid,
            reader_thread: Some(reader_thread),
        })
    }

    /// Next raw event line, `None` once the stream has ended.
    pub async fn next_line(&self) -> Option<String> {
        self.lines_rx.lock().await.recv().await
    }

    /// Stop the subprocess: SIGTERM, a grace period, then SIGKILL. Blocks
    /// briefly; call from shutdown paths only.
    pub fn stop(&mut self) {
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        // SAFETY: plain signal delivery to a child pid we own.
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        warn!("event stream ignored SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn lines_arrive_in_order() {
        let listener = EventListener::spawn(&argv("printf 'one\\ntwo\\nthree\\n'")).unwrap();
        assert_eq!(listener.next_line().await.as_deref(), Some("one"));
        assert_eq!(listener.next_line().await.as_deref(), Some("two"));
        assert_eq!(listener.next_line().await.as_deref(), Some("three"));
        assert_eq!(listener.next_line().await, None);
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_child() {
        let mut listener = EventListener::spawn(&argv("sleep 60")).unwrap();
        let started = Instant::now();
        listener.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(listener.next_line().await, None);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = EventListener::spawn(&[]).unwrap_err();
        assert_eq!(err.code, tapcap_core::error::ErrorCode::Internal);
    }

    #[tokio::test]
    async fn missing_program_is_a_connection_error() {
        let err = EventListener::spawn(&["definitely-not-a-real-binary".to_string()]).unwrap_err();
        assert_eq!(err.code, tapcap_core::error::ErrorCode::Connection);
    }
}
