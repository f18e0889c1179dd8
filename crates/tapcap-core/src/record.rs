//! Capture records and the on-disk ledger.
//!
//! The ledger is a single JSON array rewritten in full on every append.
//! Records are indexed by `sequence_id`, and the id of a record always
//! equals its position in the array.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::hierarchy::ControlNode;

/// What kind of interaction a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    LongClick,
    Swipe,
    Text,
    Back,
    /// Terminal screen state recorded without an action.
    Final,
}

/// Observed or driven touch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickPoint {
    pub x: i32,
    pub y: i32,
}

/// File names of the screenshots belonging to one record, relative to the
/// output image directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSet {
    /// Pre-action screenshot as captured.
    pub raw: String,
    /// Pre-action screenshot with the control outlined. Absent when the
    /// action has no target rectangle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boxed: Option<String>,
    /// Screenshot taken after (or during) the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<String>,
}

/// One control-to-effect transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub sequence_id: u64,
    /// RFC 3339 capture timestamp.
    pub time: String,
    pub action: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<ClickPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<ControlNode>,
    pub images: ImageSet,
    /// File name of the pre-action hierarchy dump.
    pub pre_xml: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_xml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swipe_direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swipe_distance: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_changed: Option<bool>,
    /// Soft action failure. The record is still written; the error is
    /// carried here instead of failing the cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_error: Option<String>,
}

/// The append-only record store.
pub struct Ledger {
    path: PathBuf,
    records: Vec<CaptureRecord>,
}

impl Ledger {
    /// Load from disk. A missing file is an empty ledger; an unreadable or
    /// corrupt file also starts empty, sacrificing old records rather than
    /// blocking new captures.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }

    /// The id the next appended record will get.
    pub fn next_sequence_id(&self) -> u64 {
        self.len()
    }

    /// Append a record and persist. The record's `sequence_id` is
    /// overwritten with its array position. On a persist failure the
    /// in-memory state is rolled back and nothing is consumed.
    pub fn append(&mut self, mut record: CaptureRecord) -> Result<u64, ApiError> {
        let id = self.next_sequence_id();
        record.sequence_id = id;
        self.records.push(record);
        if let Err(err) = self.persist() {
            self.records.pop();
            return Err(err);
        }
        Ok(id)
    }

    fn persist(&self) -> Result<(), ApiError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ApiError::ledger(format!("cannot create {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| ApiError::ledger(format!("cannot serialize records: {e}")))?;
        fs::write(&self.path, json)
            .map_err(|e| ApiError::ledger(format!("cannot write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: ActionKind) -> CaptureRecord {
        CaptureRecord {
            sequence_id: 999,
            time: "2026-08-24T12:00:00Z".to_string(),
            action,
            click: Some(ClickPoint { x: 10, y: 20 }),
            node: None,
            images: ImageSet {
                raw: "000_raw.png".to_string(),
                boxed: Some("000_boxed.png".to_string()),
                post: None,
            },
            pre_xml: "000_pre.xml".to_string(),
            post_xml: None,
            input_text: None,
            swipe_direction: None,
            swipe_distance: None,
            duration_ms: None,
            source_activity: Some("com.example/.Main".to_string()),
            dest_activity: None,
            activity_changed: None,
            action_error: None,
        }
    }

    #[test]
    fn appends_assign_dense_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path().join("records.json"));
        for expected in 0..5u64 {
            let id = ledger.append(record(ActionKind::Click)).unwrap();
            assert_eq!(id, expected);
        }
        let ids: Vec<u64> = ledger.records().iter().map(|r| r.sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reload_continues_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        {
            let mut ledger = Ledger::load(&path);
            ledger.append(record(ActionKind::Click)).unwrap();
            ledger.append(record(ActionKind::Back)).unwrap();
        }
        let mut ledger = Ledger::load(&path);
        assert_eq!(ledger.len(), 2);
        let id = ledger.append(record(ActionKind::Final)).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path().join("nope.json"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.next_sequence_id(), 0);
    }

    #[test]
    fn corrupt_file_recovers_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        fs::write(&path, "{not json").unwrap();
        let mut ledger = Ledger::load(&path);
        assert!(ledger.is_empty());
        assert_eq!(ledger.append(record(ActionKind::Click)).unwrap(), 0);
    }

    #[test]
    fn unwritable_path_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the ledger path makes the write fail.
        let path = dir.path().join("records.json");
        fs::create_dir(&path).unwrap();
        let mut ledger = Ledger::load(&path);
        let err = ledger.append(record(ActionKind::Click)).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Ledger);
        assert!(ledger.is_empty());
        assert_eq!(ledger.next_sequence_id(), 0);
    }

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let json = serde_json::to_string(&record(ActionKind::Click)).unwrap();
        assert!(!json.contains("post_xml"));
        assert!(!json.contains("action_error"));
        assert!(json.contains("\"action\":\"click\""));
    }

    #[test]
    fn action_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ActionKind::LongClick).unwrap(),
            "\"long_click\""
        );
        assert_eq!(
            serde_json::to_string(&ActionKind::Final).unwrap(),
            "\"final\""
        );
    }

    #[test]
    fn ledger_file_is_a_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let mut ledger = Ledger::load(&path);
        ledger.append(record(ActionKind::Swipe)).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        let parsed: Vec<CaptureRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].action, ActionKind::Swipe);
    }
}
