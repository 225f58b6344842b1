//! File-backed block store with internal hash verification.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{BlockStore, StoreError};
use crate::torrent::{Bitfield, PieceIndex, TorrentInfo};

/// Single buffer part-file holding pieces at their torrent offsets.
///
/// Every piece is written at `index * piece_length`, so the file is a sparse
/// image of the torrent payload and range reads need no translation table.
/// Each persist verifies the payload against the descriptor's piece hash
/// before anything touches the disk.
pub struct FileBlockStore {
    info: Arc<TorrentInfo>,
    file: tokio::sync::Mutex<File>,
    persisted: parking_lot::Mutex<Bitfield>,
}

impl FileBlockStore {
    /// Creates (or opens) the buffer file sized to the torrent payload.
    ///
    /// # Errors
    ///
    /// - `StoreError::Io` - If the file cannot be created or sized
    pub async fn create(path: impl AsRef<Path>, info: Arc<TorrentInfo>) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.set_len(info.total_length).await?;

        let persisted = Bitfield::new(info.piece_count as usize);
        Ok(Self {
            info,
            file: tokio::sync::Mutex::new(file),
            persisted: parking_lot::Mutex::new(persisted),
        })
    }
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn persist(&self, index: PieceIndex, data: Bytes) -> Result<(), StoreError> {
        let expected = self
            .info
            .piece_hashes
            .get(index.as_u32() as usize)
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("piece index {index} out of range"),
                ))
            })?;

        let digest = Sha1::digest(&data);
        if digest.as_slice() != expected {
            tracing::warn!(
                "piece {index} hash mismatch: expected {}, got {}",
                hex::encode(expected),
                hex::encode(digest)
            );
            return Err(StoreError::Verification { index });
        }

        let offset = index.as_u32() as u64 * self.info.piece_length as u64;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);

        self.persisted.lock().set(index);
        tracing::debug!("piece {index} verified and persisted");
        Ok(())
    }

    async fn read(
        &self,
        index: PieceIndex,
        offset: u32,
        length: usize,
    ) -> Result<Bytes, StoreError> {
        if !self.is_persisted(index) {
            return Err(StoreError::NotReady { index });
        }

        let position = index.as_u32() as u64 * self.info.piece_length as u64 + offset as u64;
        let mut buffer = vec![0u8; length];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(position)).await?;
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    fn is_persisted(&self, index: PieceIndex) -> bool {
        self.persisted.lock().has(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileInfo;

    fn test_info(pieces: &[&[u8]], piece_length: u32) -> Arc<TorrentInfo> {
        let total_length: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        Arc::new(TorrentInfo {
            piece_length,
            piece_count: pieces.len() as u32,
            total_length,
            piece_hashes: pieces
                .iter()
                .map(|p| {
                    let digest = Sha1::digest(p);
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(&digest);
                    hash
                })
                .collect(),
            files: vec![FileInfo {
                name: "payload.bin".to_string(),
                offset: 0,
                length: total_length,
            }],
        })
    }

    #[tokio::test]
    async fn test_persist_verifies_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let info = test_info(&[b"0123456789", b"abcde"], 10);
        let store = FileBlockStore::create(dir.path().join("buffer"), info)
            .await
            .unwrap();

        store
            .persist(PieceIndex::new(1), Bytes::from_static(b"abcde"))
            .await
            .unwrap();
        assert!(store.is_persisted(PieceIndex::new(1)));
        assert!(!store.is_persisted(PieceIndex::new(0)));

        let data = store.read(PieceIndex::new(1), 1, 3).await.unwrap();
        assert_eq!(data.as_ref(), b"bcd");
    }

    #[tokio::test]
    async fn test_persist_rejects_corrupt_piece() {
        let dir = tempfile::tempdir().unwrap();
        let info = test_info(&[b"0123456789"], 10);
        let store = FileBlockStore::create(dir.path().join("buffer"), info)
            .await
            .unwrap();

        let result = store
            .persist(PieceIndex::new(0), Bytes::from_static(b"0123456788"))
            .await;
        assert!(matches!(result, Err(StoreError::Verification { .. })));
        assert!(!store.is_persisted(PieceIndex::new(0)));
    }

    #[tokio::test]
    async fn test_read_before_persist_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let info = test_info(&[b"0123456789"], 10);
        let store = FileBlockStore::create(dir.path().join("buffer"), info)
            .await
            .unwrap();

        let result = store.read(PieceIndex::new(0), 0, 4).await;
        assert!(matches!(result, Err(StoreError::NotReady { .. })));
    }
}
