//! Protocol types for CLI-daemon communication.
//!
//! Capture parameters arrive as a loosely-typed camelCase [`CaptureSpec`]
//! (the shape automation clients send) and are validated into the strict
//! [`CaptureRequest`] the orchestrator consumes.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::hierarchy::ControlNode;
use crate::record::CaptureRecord;

/// A request from CLI to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Run one full capture cycle: snapshot, resolve, act, snapshot, record.
    Capture { spec: CaptureSpec },
    /// Record the current screen as a terminal state, no action.
    FinalSnapshot,
    /// Report device and ledger status.
    Health,
    /// Shutdown the daemon gracefully.
    Shutdown,
}

/// Raw capture parameters as sent on the wire. Everything is optional;
/// [`CaptureSpec::validate`] applies defaults and rejects contradictions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureSpec {
    pub action: Option<String>,
    pub bounds: Option<String>,
    pub xpath: Option<String>,
    pub text: Option<String>,
    pub duration_ms: Option<u64>,
    pub dx: Option<i32>,
    pub dy: Option<i32>,
    pub direction: Option<String>,
    pub distance: Option<i32>,
    pub wait_after_ms: Option<u64>,
    pub mid_capture: Option<bool>,
    pub mid_delay_ms: Option<u64>,
}

/// Default hold/swipe duration when the client does not specify one.
pub const DEFAULT_DURATION_MS: u64 = 800;
/// Default settle delay before the post-action snapshot.
pub const DEFAULT_WAIT_AFTER_MS: u64 = 400;
/// Default delay before a mid-action snapshot.
pub const DEFAULT_MID_DELAY_MS: u64 = 50;

impl CaptureSpec {
    /// Validate into a typed request. Produces `VALIDATION` errors with
    /// suggestions naming the missing or contradictory field.
    pub fn validate(self) -> Result<CaptureRequest, ApiError> {
        let action = self.parse_action()?;
        let target = match (self.bounds, self.xpath) {
            (Some(bounds), _) => Some(TargetQuery::Bounds(bounds)),
            (None, Some(path)) => Some(TargetQuery::Path(path)),
            (None, None) => None,
        };
        if target.is_none() && action.needs_target() {
            return Err(ApiError::validation_with_suggestion(
                format!("action '{}' requires a target", action.kind_name()),
                "Provide either 'bounds' or 'xpath'",
            ));
        }
        let mode = if self.mid_capture.unwrap_or(false) {
            PostCaptureMode::Mid {
                delay_ms: self.mid_delay_ms.unwrap_or(DEFAULT_MID_DELAY_MS),
            }
        } else {
            PostCaptureMode::Post
        };
        Ok(CaptureRequest {
            target,
            action,
            timing: CaptureTiming {
                wait_after_ms: self.wait_after_ms.unwrap_or(DEFAULT_WAIT_AFTER_MS),
                mode,
            },
        })
    }

    fn parse_action(&self) -> Result<ActionRequest, ApiError> {
        let name = self
            .action
            .as_deref()
            .unwrap_or("click")
            .trim()
            .to_ascii_lowercase()
            .replace('-', "_");
        let duration_ms = self.duration_ms.unwrap_or(DEFAULT_DURATION_MS);
        match name.as_str() {
            "click" | "short_click" | "tap" => Ok(ActionRequest::Click),
            "long_click" | "longclick" | "long_press" | "longpress" => {
                Ok(ActionRequest::LongClick { duration_ms })
            }
            "swipe" | "scroll" => Ok(ActionRequest::Swipe {
                motion: self.parse_motion()?,
                duration_ms,
            }),
            "text" | "input" | "input_text" | "type" => match &self.text {
                Some(text) if !text.is_empty() => Ok(ActionRequest::Text { text: text.clone() }),
                _ => Err(ApiError::validation_with_suggestion(
                    "text action without text",
                    "Provide a non-empty 'text' field",
                )),
            },
            "back" | "key_back" => Ok(ActionRequest::Back),
            other => Err(ApiError::validation_with_suggestion(
                format!("unknown action '{other}'"),
                "Use one of: click, long_click, swipe, text, back",
            )),
        }
    }

    fn parse_motion(&self) -> Result<SwipeMotion, ApiError> {
        if self.dx.is_some() || self.dy.is_some() {
            return Ok(SwipeMotion::Delta {
                dx: self.dx.unwrap_or(0),
                dy: self.dy.unwrap_or(0),
            });
        }
        match (&self.direction, self.distance) {
            (Some(direction), distance) => {
                let direction = match direction.trim().to_ascii_lowercase().as_str() {
                    "up" => SwipeDirection::Up,
                    "down" => SwipeDirection::Down,
                    "left" => SwipeDirection::Left,
                    "right" => SwipeDirection::Right,
                    other => {
                        return Err(ApiError::validation_with_suggestion(
                            format!("unknown swipe direction '{other}'"),
                            "Use one of: up, down, left, right",
                        ))
                    }
                };
                Ok(SwipeMotion::Directed {
                    direction,
                    distance: distance.unwrap_or(0).max(0),
                })
            }
            (None, _) => Err(ApiError::validation_with_suggestion(
                "swipe without motion parameters",
                "Provide 'dx'/'dy' or 'direction' plus 'distance'",
            )),
        }
    }
}

/// A validated capture request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub target: Option<TargetQuery>,
    pub action: ActionRequest,
    pub timing: CaptureTiming,
}

/// How the control is located in the pre-action hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetQuery {
    /// Exact bounds string from a prior dump. Wins over a path when both
    /// are supplied.
    Bounds(String),
    /// Path query with fallback rewrites.
    Path(String),
}

/// The action to drive after the pre-action snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    Click,
    LongClick { duration_ms: u64 },
    Swipe { motion: SwipeMotion, duration_ms: u64 },
    Text { text: String },
    Back,
}

impl ActionRequest {
    /// Whether this action is driven at a resolved control's location.
    pub fn needs_target(&self) -> bool {
        !matches!(self, ActionRequest::Back)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ActionRequest::Click => "click",
            ActionRequest::LongClick { .. } => "long_click",
            ActionRequest::Swipe { .. } => "swipe",
            ActionRequest::Text { .. } => "text",
            ActionRequest::Back => "back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Swipe geometry, either explicit deltas or a direction with a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeMotion {
    Delta { dx: i32, dy: i32 },
    Directed { direction: SwipeDirection, distance: i32 },
}

impl SwipeMotion {
    /// End point of a swipe starting at `(x, y)`. Both coordinates are
    /// clamped at zero so a long swipe never leaves the screen origin.
    pub fn destination(&self, x: i32, y: i32) -> (i32, i32) {
        let (ex, ey) = match *self {
            SwipeMotion::Delta { dx, dy } => (x + dx, y + dy),
            SwipeMotion::Directed {
                direction,
                distance,
            } => match direction {
                SwipeDirection::Up => (x, y - distance),
                SwipeDirection::Down => (x, y + distance),
                SwipeDirection::Left => (x - distance, y),
                SwipeDirection::Right => (x + distance, y),
            },
        };
        (ex.max(0), ey.max(0))
    }

    pub fn direction_name(&self) -> Option<&'static str> {
        match self {
            SwipeMotion::Delta { .. } => None,
            SwipeMotion::Directed { direction, .. } => Some(match direction {
                SwipeDirection::Up => "up",
                SwipeDirection::Down => "down",
                SwipeDirection::Left => "left",
                SwipeDirection::Right => "right",
            }),
        }
    }

    pub fn distance(&self) -> Option<i32> {
        match self {
            SwipeMotion::Delta { .. } => None,
            SwipeMotion::Directed { distance, .. } => Some(*distance),
        }
    }
}

/// When the second snapshot is taken relative to the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    pub wait_after_ms: u64,
    pub mode: PostCaptureMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCaptureMode {
    /// Snapshot after the action completes and the settle delay elapses.
    Post,
    /// Snapshot while the action is still in flight, `delay_ms` after it
    /// starts. Used to catch transient UI such as drag states.
    Mid { delay_ms: u64 },
}

/// A response from daemon to CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// A completed capture cycle.
    Captured {
        sequence_id: u64,
        record: CaptureRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        node: Option<ControlNode>,
    },
    /// Daemon and device status.
    Health {
        device_ready: bool,
        records: u64,
        output_dir: String,
    },
    /// Generic success message.
    Ok { message: String },
}
