//! Daemon process serving capture requests over a Unix socket.

pub mod client;
pub mod paths;
pub mod server;

// Public API - used by main.rs
pub use client::DaemonClient;
pub use server::DaemonServer;
