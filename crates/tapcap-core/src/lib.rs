//! Core types and logic for tapcap.
//!
//! This crate provides the shared data structures and algorithms for
//! recording UI interaction ground truth on Android devices. It's used by
//! the CLI/daemon, which adds the device bridge and orchestration on top.
//!
//! # Modules
//!
//! - [`error`]: API error types with actionable suggestions
//! - [`events`]: raw touch-event parsing and click detection
//! - [`hierarchy`]: UI hierarchy dumps and node resolution
//! - [`protocol`]: JSON-line request/response protocol
//! - [`record`]: capture records and the on-disk ledger
//!
//! # Node Resolution
//!
//! A control can be located three ways, in order of strictness:
//!
//! | Query | Semantics |
//! |-------|-----------|
//! | point | smallest node whose bounds contain the coordinate |
//! | bounds | exact `[l,t][r,b]` match, whitespace-insensitive |
//! | path | XPath-like query with a chain of rewrite fallbacks |
//!
//! Resolved nodes carry their full attribute set so records stay useful
//! even when the dump format evolves.

pub mod error;
pub mod events;
pub mod hierarchy;
pub mod protocol;
pub mod record;
