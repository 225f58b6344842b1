//! Persistence seam for verified piece payloads.
//!
//! The scheduler core never touches disks directly: completed pieces are
//! handed to a [`BlockStore`], which verifies and persists them, and
//! streaming reads come back out of it. Verification is the store's internal
//! concern; a hash mismatch surfaces as a persist error, which the core
//! treats as "reset the piece and re-download".

pub mod file_store;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;

pub use file_store::FileBlockStore;
pub use memory::MemoryBlockStore;

use crate::torrent::PieceIndex;

/// Errors from piece persistence and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Read requested before the piece was persisted.
    #[error("Piece {index} not ready")]
    NotReady {
        /// The piece that is not yet persisted.
        index: PieceIndex,
    },

    /// Persisted payload did not match the expected piece hash.
    #[error("Piece {index} failed verification")]
    Verification {
        /// The piece that failed verification.
        index: PieceIndex,
    },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract persistence for piece payloads.
///
/// Implementations verify internally and may reorder concurrent persists;
/// callers learn about success through the returned result and, for resumed
/// downloads, through out-of-band persisted notifications.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Verifies and persists one completed piece.
    ///
    /// # Errors
    ///
    /// - `StoreError::Verification` - If the payload hash does not match
    /// - `StoreError::Io` - If the write failed
    async fn persist(&self, index: PieceIndex, data: Bytes) -> Result<(), StoreError>;

    /// Reads `length` bytes at `offset` within a persisted piece.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotReady` - If the piece is not yet persisted
    /// - `StoreError::Io` - If the read failed
    async fn read(&self, index: PieceIndex, offset: u32, length: usize)
    -> Result<Bytes, StoreError>;

    /// Whether a piece has been persisted, without touching its data.
    fn is_persisted(&self, index: PieceIndex) -> bool;
}
