//! Device bridge talking to an on-device HTTP automation agent.
//!
//! The agent exposes a small REST surface: `GET /status`, `GET
//! /hierarchy`, `GET /screenshot`, `GET /activity`, and `POST /input`
//! taking a JSON body with a `type` field naming the gesture. It is
//! useful when the device is reached over the network rather than USB.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{normalize_activity_component, BridgeError, DeviceBridge};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct AgentBridge {
    base_url: String,
    client: reqwest::Client,
}

impl AgentBridge {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BridgeError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_input(&self, body: Value) -> Result<(), BridgeError> {
        debug!(%body, "posting input to agent");
        let response = self
            .client
            .post(self.url("input"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BridgeError::Command(format!(
                "agent rejected input ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn get_ok(&self, path: &str) -> Result<reqwest::Response, BridgeError> {
        let response = self.client.get(self.url(path)).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Unreachable(format!(
                "agent {} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl DeviceBridge for AgentBridge {
    async fn is_ready(&self) -> bool {
        self.get_ok("status").await.is_ok()
    }

    async fn dump_hierarchy(&self) -> Result<String, BridgeError> {
        Ok(self.get_ok("hierarchy").await?.text().await?)
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BridgeError> {
        let bytes = self.get_ok("screenshot").await?.bytes().await?;
        if bytes.is_empty() {
            return Err(BridgeError::Command(
                "agent returned an empty screenshot".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }

    async fn foreground_activity(&self) -> Result<Option<String>, BridgeError> {
        let text = self.get_ok("activity").await?.text().await?;
        let trimmed = text.trim();
        Ok((!trimmed.is_empty()).then(|| normalize_activity_component(trimmed)))
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), BridgeError> {
        self.post_input(json!({"type": "tap", "x": x, "y": y})).await
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), BridgeError> {
        self.post_input(json!({
            "type": "long_press", "x": x, "y": y, "durationMs": duration_ms
        }))
        .await
    }

    async fn swipe(
        &self,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    ) -> Result<(), BridgeError> {
        self.post_input(json!({
            "type": "swipe",
            "x1": x1, "y1": y1, "x2": x2, "y2": y2,
            "durationMs": duration_ms
        }))
        .await
    }

    async fn input_text(&self, text: &str) -> Result<(), BridgeError> {
        self.post_input(json!({"type": "text", "text": text})).await
    }

    async fn key_back(&self) -> Result<(), BridgeError> {
        self.post_input(json!({"type": "back"})).await
    }
}
