//! In-memory block store for tests and simulation.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BlockStore, StoreError};
use crate::torrent::PieceIndex;

/// Keeps persisted pieces in a map; no verification.
///
/// Intended for unit tests and simulated swarms where payloads are made up
/// and hashing them would prove nothing.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    pieces: Mutex<HashMap<PieceIndex, Bytes>>,
}

impl MemoryBlockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.lock().len()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn persist(&self, index: PieceIndex, data: Bytes) -> Result<(), StoreError> {
        self.pieces.lock().insert(index, data);
        Ok(())
    }

    async fn read(
        &self,
        index: PieceIndex,
        offset: u32,
        length: usize,
    ) -> Result<Bytes, StoreError> {
        let pieces = self.pieces.lock();
        let piece = pieces.get(&index).ok_or(StoreError::NotReady { index })?;
        let start = (offset as usize).min(piece.len());
        let end = (start + length).min(piece.len());
        Ok(piece.slice(start..end))
    }

    fn is_persisted(&self, index: PieceIndex) -> bool {
        self.pieces.lock().contains_key(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_before_persist_is_not_ready() {
        let store = MemoryBlockStore::new();
        let result = store.read(PieceIndex::new(0), 0, 16).await;
        assert!(matches!(result, Err(StoreError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_persist_then_read_slice() {
        let store = MemoryBlockStore::new();
        store
            .persist(PieceIndex::new(0), Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert!(store.is_persisted(PieceIndex::new(0)));
        let data = store.read(PieceIndex::new(0), 2, 4).await.unwrap();
        assert_eq!(data.as_ref(), b"2345");
    }
}
