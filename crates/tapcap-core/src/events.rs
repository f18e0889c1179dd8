//! Raw touch-event line parsing and click detection.
//!
//! The event stream (`getevent -lt` output) is noisy and loosely structured:
//! types and codes appear either as symbolic names (`EV_ABS`,
//! `ABS_MT_POSITION_X`) or as 4-hex-digit codes, values as `DOWN`/`UP`
//! tokens or hex/decimal integers, and lines may arrive truncated or
//! garbled. Parsing is strictly best-effort: anything that does not match
//! the grammar is dropped without touching detector state.
//!
//! Detection uses a single-slot model: one active touch context, no
//! multi-finger support. A completed down→(move)*→up cycle with known
//! coordinates emits exactly one [`CompletedGesture`].

use regex::Regex;
use std::sync::OnceLock;

/// Semantic event type after decoding the numeric forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Key,
    Abs,
    Other,
}

/// Event codes the detector cares about. Everything else is [`EventCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    /// EV_KEY touch-down key (also BTN_TOOL_FINGER on some devices).
    BtnTouch,
    /// EV_ABS X position, single-touch or multi-touch form.
    PositionX,
    /// EV_ABS Y position.
    PositionY,
    /// EV_ABS multi-touch tracking id; -1 means released.
    TrackingId,
    /// EV_ABS slot selector. Recognized but ignored (single-slot model).
    Slot,
    Other,
}

/// One decoded event line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event_type: EventType,
    pub code: EventCode,
    pub value: i64,
}

/// A completed down→up touch interaction with final coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedGesture {
    pub x: i32,
    pub y: i32,
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // [ timestamp ] [device path:] type code value
        Regex::new(
            r"(?i)^\[\s*\d+\.\d+\]\s+(?:(?:/dev/input/event\d+):\s+)?(EV_\w+|[0-9a-f]{4})\s+([A-Z0-9_]+|[0-9a-f]{4})\s+(DOWN|UP|[0-9a-f]+)",
        )
        .expect("event line regex is valid")
    })
}

fn decode_type(field: &str) -> EventType {
    match field {
        "EV_KEY" | "0001" => EventType::Key,
        "EV_ABS" | "0003" => EventType::Abs,
        _ => EventType::Other,
    }
}

fn decode_code(field: &str) -> EventCode {
    match field {
        "BTN_TOUCH" | "014A" | "BTN_TOOL_FINGER" | "0145" => EventCode::BtnTouch,
        "ABS_MT_POSITION_X" | "0035" | "ABS_X" | "0000" => EventCode::PositionX,
        "ABS_MT_POSITION_Y" | "0036" | "ABS_Y" | "0001" => EventCode::PositionY,
        "ABS_MT_TRACKING_ID" | "0039" => EventCode::TrackingId,
        "ABS_MT_SLOT" | "002F" => EventCode::Slot,
        _ => EventCode::Other,
    }
}

/// Decode a value field: `DOWN`/`UP` booleans, the `0xffffffff` release
/// sentinel as signed -1, other hex as unsigned magnitude, decimal as a
/// fallback. Returns `None` when nothing decodes.
fn decode_value(field: &str) -> Option<i64> {
    match field {
        "DOWN" => return Some(1),
        "UP" => return Some(0),
        "FFFFFFFF" => return Some(-1),
        _ => {}
    }
    if let Ok(v) = i64::from_str_radix(field, 16) {
        return Some(v);
    }
    field.parse::<i64>().ok()
}

/// Decode one raw event line. Returns `None` for anything that does not
/// match the grammar; the caller must treat that as silence, not an error.
pub fn decode_line(line: &str) -> Option<DecodedEvent> {
    let caps = line_regex().captures(line.trim())?;
    let type_field = caps.get(1)?.as_str().to_ascii_uppercase();
    let code_field = caps.get(2)?.as_str().to_ascii_uppercase();
    let value_field = caps.get(3)?.as_str().to_ascii_uppercase();

    // Pure-numeric codes only carry meaning when they are 4 hex digits; the
    // regex already guarantees that shape for the numeric alternatives.
    let value = decode_value(&value_field)?;
    Some(DecodedEvent {
        event_type: decode_type(&type_field),
        code: decode_code(&code_field),
        value,
    })
}

/// State machine turning decoded event lines into completed gestures.
///
/// Tracks one touch context: `Idle` until a touch-start indicator arrives,
/// `Active` until the matching touch-end, with the last seen X/Y carried
/// across the whole listener lifetime (positions often arrive before the
/// down indicator on re-taps of the same spot).
#[derive(Debug, Default)]
pub struct ClickDetector {
    active: bool,
    tracking_id: Option<i64>,
    last_x: Option<i32>,
    last_y: Option<i32>,
}

impl ClickDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a touch is currently in progress.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one raw line. Returns a gesture when this line completes a
    /// down→up cycle with known coordinates.
    pub fn on_line(&mut self, line: &str) -> Option<CompletedGesture> {
        let event = decode_line(line)?;
        self.on_event(event)
    }

    /// Feed one decoded event.
    pub fn on_event(&mut self, event: DecodedEvent) -> Option<CompletedGesture> {
        match (event.event_type, event.code) {
            (EventType::Abs, EventCode::PositionX) => {
                self.last_x = i32::try_from(event.value).ok();
                None
            }
            (EventType::Abs, EventCode::PositionY) => {
                self.last_y = i32::try_from(event.value).ok();
                None
            }
            (EventType::Abs, EventCode::TrackingId) => {
                if event.value >= 0 {
                    // Touch start (or id change while already active).
                    self.tracking_id = Some(event.value);
                    self.active = true;
                    None
                } else {
                    // -1: contact released.
                    let gesture = self.finish_touch();
                    self.tracking_id = None;
                    gesture
                }
            }
            (EventType::Key, EventCode::BtnTouch) => match event.value {
                1 => {
                    self.active = true;
                    None
                }
                0 => self.finish_touch(),
                _ => None,
            },
            _ => None,
        }
    }

    /// End the active touch, emitting a gesture when coordinates are known.
    /// Always resets to idle.
    fn finish_touch(&mut self) -> Option<CompletedGesture> {
        let gesture = if self.active {
            match (self.last_x, self.last_y) {
                (Some(x), Some(y)) => Some(CompletedGesture { x, y }),
                _ => None,
            }
        } else {
            None
        };
        self.active = false;
        gesture
    }
}
