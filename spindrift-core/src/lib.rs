//! Spindrift Core - playback-aware swarm streaming engine
//!
//! This crate provides the downloading heart of Spindrift: block-level piece
//! assembly, a playback-aware request scheduler, peer session bookkeeping,
//! and a streaming reader that exposes partially downloaded content as an
//! ordered byte stream. Metadata parsing, peer discovery, and wire framing
//! are external collaborators behind the `TorrentInfo` descriptor and the
//! `PeerTransport`/`BlockStore` traits.

pub mod config;
pub mod engine;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SpindriftConfig;
pub use engine::{EngineStats, StreamEngine};
pub use storage::{BlockStore, StoreError};
pub use streaming::{StreamError, StreamReader};
pub use torrent::TorrentError;

/// Core errors that can bubble up from any Spindrift subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SpindriftError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpindriftError>;
