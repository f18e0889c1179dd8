//! tapcap CLI and daemon entry point.

mod annotate;
mod args;
mod bridge;
mod daemon;
mod listener;
mod orchestrator;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tapcap_core::events::ClickDetector;
use tapcap_core::protocol::{CaptureSpec, Command};
use tracing::{error, info, warn};

use crate::args::{CaptureArgs, Cli, Commands, DeviceArgs, ListenArgs};
use crate::bridge::{AgentBridge, DeviceBridge, ShellBridge};
use crate::daemon::client::DaemonClient;
use crate::daemon::paths;
use crate::daemon::server::DaemonServer;
use crate::listener::EventListener;
use crate::orchestrator::CaptureOrchestrator;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon(device) => run_daemon(device),
        Commands::Listen(listen) => run_listen(listen),
        other => run_client_command(other),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn env_fallback(value: Option<String>, var: &str) -> Option<String> {
    value.or_else(|| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

fn resolve_out_dir(device: &DeviceArgs) -> PathBuf {
    match env_fallback(device.out.clone(), "TAPCAP_OUT_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => paths::get_output_dir(),
    }
}

fn build_shell_bridge(device: &DeviceArgs) -> ShellBridge {
    let adb = env_fallback(device.adb.clone(), "TAPCAP_ADB").unwrap_or_else(|| "adb".to_string());
    let serial = env_fallback(device.serial.clone(), "TAPCAP_SERIAL");
    ShellBridge::new(adb, serial)
}

fn build_bridge(device: &DeviceArgs) -> anyhow::Result<Arc<dyn DeviceBridge>> {
    match env_fallback(device.agent_url.clone(), "TAPCAP_AGENT_URL") {
        Some(url) => Ok(Arc::new(
            AgentBridge::new(url).context("Failed to build agent bridge")?,
        )),
        None => Ok(Arc::new(build_shell_bridge(device))),
    }
}

/// Convert capture CLI args to the wire spec; the daemon validates it.
fn capture_spec(args: &CaptureArgs) -> CaptureSpec {
    CaptureSpec {
        action: Some(args.action.as_str().to_string()),
        bounds: args.bounds.clone(),
        xpath: args.xpath.clone(),
        text: args.text.clone(),
        duration_ms: args.duration,
        dx: args.dx,
        dy: args.dy,
        direction: args.direction.clone(),
        distance: args.distance,
        wait_after_ms: args.wait_after,
        mid_capture: args.mid_capture.then_some(true),
        mid_delay_ms: args.mid_delay,
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(command: Commands) -> anyhow::Result<()> {
    let (command, auto_start) = match command {
        Commands::Capture(args) => (
            Command::Capture {
                spec: capture_spec(&args),
            },
            true,
        ),
        Commands::FinalSnapshot => (Command::FinalSnapshot, true),
        Commands::Health => (Command::Health, true),
        Commands::Stop => (Command::Shutdown, false),
        Commands::Daemon(_) | Commands::Listen(_) => {
            unreachable!("handled separately")
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = if auto_start {
            DaemonClient::connect().await?
        } else {
            DaemonClient::connect_existing().await?
        };

        let response = client.send(command).await?;
        if response.success {
            if let Some(data) = response.data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
        Ok(())
    })
}

/// Run the daemon server with graceful signal handling.
///
/// Handles SIGINT (Ctrl+C) and SIGTERM for clean shutdown; the server's
/// Drop impl cleans up the socket and PID files.
fn run_daemon(device: DeviceArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let bridge = build_bridge(&device)?;
        let orchestrator = CaptureOrchestrator::new(bridge, resolve_out_dir(&device))
            .context("Failed to set up output directory")?;
        let server = DaemonServer::bind(orchestrator)
            .await
            .context("Failed to start daemon")?;

        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
        }
        Ok(())
    })
}

/// Watch physical touches and record every completed tap.
///
/// Streams labeled touch events, feeds them through the click detector,
/// and records each gesture against the pre-armed screen state. The
/// screen is re-armed after every record so the next gesture is
/// attributed to what the user actually saw.
fn run_listen(listen: ListenArgs) -> anyhow::Result<()> {
    if env_fallback(listen.device.agent_url.clone(), "TAPCAP_AGENT_URL").is_some() {
        bail!("listen streams raw touch events and requires adb, not an agent URL");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let bridge = Arc::new(build_shell_bridge(&listen.device));
        if !bridge.is_ready().await {
            bail!("No device ready; check 'adb devices'");
        }

        let device_node = match listen.device_node {
            Some(node) => node,
            None => bridge
                .detect_touch_device()
                .await
                .context("Failed to autodetect the touchscreen")?,
        };
        info!(device = %device_node, "streaming touch events");

        let mut event_listener = EventListener::spawn(&bridge.getevent_argv(&device_node))?;
        let mut orchestrator =
            CaptureOrchestrator::new(bridge.clone(), resolve_out_dir(&listen.device))?;
        orchestrator.arm_presnapshot().await?;
        let mut detector = ClickDetector::new();
        info!("listening; tap the device, stop with Ctrl-C");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, stopping listener");
                    break;
                }
                line = event_listener.next_line() => {
                    let Some(line) = line else {
                        warn!("event stream ended");
                        break;
                    };
                    let Some(gesture) = detector.on_line(&line) else {
                        continue;
                    };
                    match orchestrator.record_observed_gesture(gesture.x, gesture.y).await {
                        Ok(Some(record)) => info!(
                            sequence_id = record.sequence_id,
                            x = gesture.x,
                            y = gesture.y,
                            "recorded tap"
                        ),
                        Ok(None) => warn!(x = gesture.x, y = gesture.y, "tap dropped"),
                        Err(e) => error!("failed to record tap: {e}"),
                    }
                    if let Err(e) = orchestrator.arm_presnapshot().await {
                        error!("failed to re-arm snapshot: {e}");
                    }
                }
            }
        }

        event_listener.stop();
        match orchestrator.final_snapshot().await {
            Ok(record) => info!(sequence_id = record.sequence_id, "final state recorded"),
            Err(e) => warn!("could not record final state: {e}"),
        }
        Ok(())
    })
}

/// Wait for SIGTERM (Unix only). Falls back to a never-completing future
/// if the handler cannot be registered.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
