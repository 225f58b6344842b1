//! Spindrift Web - HTTP range server
//!
//! Serves the currently selected file over HTTP with RFC 7233 byte-range
//! support, streaming bytes as they arrive from the swarm, plus a small JSON
//! stats endpoint for progress display.

pub mod handlers;
pub mod server;

// Re-export main types
pub use server::{AppState, router, run_server};
