//! Device bridges: how the daemon talks to the phone.
//!
//! Everything above this layer is bridge-agnostic. The orchestrator only
//! sees the [`DeviceBridge`] trait, so captures work the same whether the
//! device is driven over `adb` ([`shell::ShellBridge`]) or through an
//! on-device HTTP agent ([`agent::AgentBridge`]).

use async_trait::async_trait;
use thiserror::Error;

pub mod agent;
pub mod shell;

pub use agent::AgentBridge;
pub use shell::ShellBridge;

/// Transport-level bridge failure. Callers wrap these into the API error
/// taxonomy with the context of what they were doing.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The device rejected or failed a command.
    #[error("device command failed: {0}")]
    Command(String),
    /// No device to talk to.
    #[error("device not reachable: {0}")]
    Unreachable(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Expand a shorthand `pkg/.Activity` component to `pkg/pkg.Activity`.
/// Fully qualified components pass through unchanged.
pub fn normalize_activity_component(raw: &str) -> String {
    match raw.split_once('/') {
        Some((pkg, activity)) if activity.starts_with('.') => {
            format!("{pkg}/{pkg}{activity}")
        }
        _ => raw.to_string(),
    }
}

/// The operations a capture cycle needs from a device.
///
/// Methods take `&self` so the bridge can be shared between a mid-capture
/// snapshot and the in-flight action driving it.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Whether a device is attached and answering.
    async fn is_ready(&self) -> bool;

    /// Current UI hierarchy as an XML document.
    async fn dump_hierarchy(&self) -> Result<String, BridgeError>;

    /// Current screen as PNG bytes.
    async fn screenshot_png(&self) -> Result<Vec<u8>, BridgeError>;

    /// Component name of the foreground activity, when the device exposes
    /// one.
    async fn foreground_activity(&self) -> Result<Option<String>, BridgeError>;

    async fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError>;

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), BridgeError>;

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), BridgeError>;

    /// Type text into the focused field.
    async fn input_text(&self, text: &str) -> Result<(), BridgeError>;

    /// Press the hardware back key.
    async fn key_back(&self) -> Result<(), BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_activity_gains_its_package() {
        assert_eq!(
            normalize_activity_component("com.pkg/.MainActivity"),
            "com.pkg/com.pkg.MainActivity"
        );
        assert_eq!(
            normalize_activity_component("com.pkg/com.other.Full"),
            "com.pkg/com.other.Full"
        );
        assert_eq!(normalize_activity_component("no-slash"), "no-slash");
    }
}
