//! API error types with actionable suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for protocol responses, one per failure class of a capture
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Device bridge unreachable.
    Connection,
    /// Hierarchy dump or screenshot failed.
    Capture,
    /// No node matched the query.
    Resolution,
    /// Missing or contradictory action parameters.
    Validation,
    /// An action primitive failed.
    Action,
    /// Ledger write or serialization failure.
    Ledger,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Connection => write!(f, "CONNECTION"),
            ErrorCode::Capture => write!(f, "CAPTURE"),
            ErrorCode::Resolution => write!(f, "RESOLUTION"),
            ErrorCode::Validation => write!(f, "VALIDATION"),
            ErrorCode::Action => write!(f, "ACTION"),
            ErrorCode::Ledger => write!(f, "LEDGER"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// An error response with enough context to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Connection,
            message: message.into(),
            suggestion: Some(
                "Check that the device is attached and authorized ('adb devices'), or that the on-device agent is reachable".into(),
            ),
        }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Capture,
            message: message.into(),
            suggestion: Some(
                "Hierarchy dump or screenshot failed; the screen may be secure or the device busy. Retry the request".into(),
            ),
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Resolution,
            message: message.into(),
            suggestion: Some(
                "No node matched. Supply an exact bounds string from the current hierarchy instead of a path query".into(),
            ),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: message.into(),
            suggestion: Some("Check the request parameters and try again".into()),
        }
    }

    /// Create a validation error with a custom suggestion.
    pub fn validation_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Action,
            message: message.into(),
            suggestion: Some(
                "The device rejected the input primitive; the record was still written with action_error set".into(),
            ),
        }
    }

    pub fn ledger(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Ledger,
            message: message.into(),
            suggestion: Some(
                "Check that the output directory is writable and the records file is not held open elsewhere".into(),
            ),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// All error constructors must provide a suggestion so callers always
    /// have a next step.
    fn assert_has_suggestion(err: &ApiError, context: &str) {
        assert!(
            err.suggestion.is_some(),
            "{} should have a suggestion, but got None",
            context
        );
    }

    #[test]
    fn test_all_constructors_have_suggestions() {
        assert_has_suggestion(&ApiError::connection("device gone"), "connection");
        assert_has_suggestion(&ApiError::capture("dump failed"), "capture");
        assert_has_suggestion(&ApiError::resolution("no match"), "resolution");
        assert_has_suggestion(&ApiError::validation("bad params"), "validation");
        assert_has_suggestion(&ApiError::action("tap failed"), "action");
        assert_has_suggestion(&ApiError::ledger("write failed"), "ledger");
        assert_has_suggestion(&ApiError::internal("unexpected"), "internal");
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let err = ApiError::resolution("no node at (10, 20)");
        let display = format!("{}", err);
        assert!(display.contains("[RESOLUTION]"));
        assert!(display.contains("(10, 20)"));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_json_serialization() {
        let err = ApiError::connection("no device ready");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"CONNECTION\""));
        assert!(json.contains("\"message\""));
        assert!(json.contains("\"suggestion\""));
    }

    #[test]
    fn test_json_deserialization() {
        let json = r#"{"code":"VALIDATION","message":"text required","suggestion":"hint"}"#;
        let err: ApiError = serde_json::from_str(json).unwrap();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "text required");
        assert_eq!(err.suggestion, Some("hint".to_string()));
    }

    #[test]
    fn test_internal_error_wire_name() {
        let json = serde_json::to_string(&ErrorCode::Internal).unwrap();
        assert_eq!(json, "\"INTERNAL\"");
    }
}
