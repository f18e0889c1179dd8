//! Device bridge driving `adb` subprocesses.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::{normalize_activity_component, BridgeError, DeviceBridge};

/// Where the hierarchy dump lands on the device before it is read back.
const DEVICE_DUMP_PATH: &str = "/sdcard/tapcap_dump.xml";

/// Bridge that shells out to `adb` for every device operation.
pub struct ShellBridge {
    adb_path: String,
    serial: Option<String>,
}

impl ShellBridge {
    pub fn new(adb_path: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial,
        }
    }

    /// Run an adb command and return its stdout. Non-zero exit is a
    /// command failure carrying stderr.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, BridgeError> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        debug!(?args, "running adb");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(BridgeError::Command(format!(
                "adb {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn run_text(&self, args: &[&str]) -> Result<String, BridgeError> {
        let stdout = self.run(args).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Pick the input device node that looks most like a touchscreen, by
    /// scoring the capability listing of every device.
    pub async fn detect_touch_device(&self) -> Result<String, BridgeError> {
        let listing = self.run_text(&["shell", "getevent", "-pl"]).await?;
        pick_touch_device(&listing).ok_or_else(|| {
            BridgeError::Command("no input device with touch capabilities found".to_string())
        })
    }

    /// Full argv for streaming labeled touch events, suitable for
    /// spawning as a long-lived child process.
    pub fn getevent_argv(&self, device: &str) -> Vec<String> {
        let mut argv = vec![self.adb_path.clone()];
        if let Some(serial) = &self.serial {
            argv.push("-s".to_string());
            argv.push(serial.clone());
        }
        argv.extend(
            ["shell", "getevent", "-lt", device]
                .iter()
                .map(|s| s.to_string()),
        );
        argv
    }
}

#[async_trait]
impl DeviceBridge for ShellBridge {
    async fn is_ready(&self) -> bool {
        match self.run_text(&["devices"]).await {
            Ok(listing) => device_is_listed(&listing, self.serial.as_deref()),
            Err(_) => false,
        }
    }

    async fn dump_hierarchy(&self) -> Result<String, BridgeError> {
        self.run_text(&["shell", "uiautomator", "dump", DEVICE_DUMP_PATH])
            .await?;
        let raw = self
            .run_text(&["exec-out", "cat", DEVICE_DUMP_PATH])
            .await?;
        // uiautomator sometimes prefixes status chatter before the XML.
        match raw.find('<') {
            Some(start) => Ok(raw[start..].to_string()),
            None => Err(BridgeError::Command(format!(
                "hierarchy dump produced no XML: {}",
                raw.trim()
            ))),
        }
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BridgeError> {
        let bytes = self.run(&["exec-out", "screencap", "-p"]).await?;
        if bytes.is_empty() {
            return Err(BridgeError::Command("screencap produced no data".to_string()));
        }
        Ok(bytes)
    }

    async fn foreground_activity(&self) -> Result<Option<String>, BridgeError> {
        let dump = self
            .run_text(&["shell", "dumpsys", "activity", "activities"])
            .await?;
        Ok(parse_foreground_activity(&dump))
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError> {
        self.run(&["shell", "input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        Ok(())
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), BridgeError> {
        // `input` has no long-press primitive; a same-point swipe with a
        // duration behaves identically.
        self.swipe(x, y, x, y, duration_ms).await
    }

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), BridgeError> {
        self.run(&[
            "shell",
            "input",
            "swipe",
            &x1.to_string(),
            &y1.to_string(),
            &x2.to_string(),
            &y2.to_string(),
            &duration_ms.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn input_text(&self, text: &str) -> Result<(), BridgeError> {
        let escaped = escape_input_text(text);
        self.run(&["shell", "input", "text", &escaped]).await?;
        Ok(())
    }

    async fn key_back(&self) -> Result<(), BridgeError> {
        self.run(&["shell", "input", "keyevent", "4"]).await?;
        Ok(())
    }
}

/// Whether `adb devices` output lists a usable device. With a serial, that
/// serial must be in the `device` state; otherwise any device will do.
fn device_is_listed(listing: &str, serial: Option<&str>) -> bool {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .any(|(listed, state)| state == "device" && serial.is_none_or(|s| s == listed))
}

fn activity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"m(?:Resumed|Focused)Activity[^\n]*?\s([\w.]+/[\w.$]+)")
            .expect("activity regex is valid")
    })
}

/// Extract the foreground component from a `dumpsys activity` dump. Newer
/// builds report `mResumedActivity`, older ones `mFocusedActivity`. A
/// dot-prefixed activity is expanded with its package.
fn parse_foreground_activity(dump: &str) -> Option<String> {
    activity_regex()
        .captures(dump)
        .map(|caps| normalize_activity_component(&caps[1]))
}

/// `input text` treats spaces as argument separators; `%s` is its escape.
fn escape_input_text(text: &str) -> String {
    text.replace(' ', "%s")
}

/// Score every device block in `getevent -pl` output and return the path
/// of the best touch candidate.
fn pick_touch_device(listing: &str) -> Option<String> {
    let mut best: Option<(String, i32)> = None;
    let mut current: Option<(String, i32)> = None;
    for line in listing.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("add device ") {
            if let Some((prev_path, prev_score)) = current.take() {
                if best.as_ref().is_none_or(|(_, s)| prev_score > *s) {
                    best = Some((prev_path, prev_score));
                }
            }
            let path = rest.split(": ").nth(1)?.trim().to_string();
            current = Some((path, 0));
            continue;
        }
        let Some((_, score)) = current.as_mut() else {
            continue;
        };
        if trimmed.starts_with("name:") {
            let name = trimmed.trim_start_matches("name:").trim().to_lowercase();
            if name.contains("touch") || name.contains("ts") {
                *score += 1;
            }
        }
        if trimmed.contains("ABS_MT_POSITION_X") {
            *score += 4;
        }
        if trimmed.contains("BTN_TOUCH") {
            *score += 2;
        }
    }
    if let Some((path, score)) = current {
        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((path, score));
        }
    }
    best.filter(|(_, score)| *score > 0).map(|(path, _)| path)
}
