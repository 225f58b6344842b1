//! Swarm-facing download core: piece assembly, scheduling, and peer sessions.

pub mod bitfield;
pub mod events;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod scheduler;
pub mod store;

use std::fmt;

pub use bitfield::Bitfield;
pub use events::{EventBus, EventSubscription, StoreEvent};
pub use peer::{PeerSession, SessionState, SpeedEstimator};
pub use piece::{BLOCK_SIZE, BlockState, PieceAssembler};
pub use protocol::{PeerCommand, PeerEvent, PeerTransport};
pub use scheduler::{RequestScheduler, SchedulerStats};
pub use store::PieceStore;

use crate::storage::StoreError;

/// Zero-based index of a piece within a torrent.
///
/// Torrent content is divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-local identifier for one live peer connection.
///
/// The swarm collaborator hands over handshaken connections; the engine keys
/// sessions and transport handles by this value rather than by socket address,
/// so reconnects from the same address stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(pub u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Single file entry within a torrent.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path of the file inside the torrent.
    pub name: String,
    /// Byte offset of the file within the concatenated torrent payload.
    pub offset: u64,
    /// File length in bytes.
    pub length: u64,
}

/// Torrent descriptor produced by the metadata collaborator.
///
/// Spindrift does not parse bencoded metadata or resolve magnet links; it
/// consumes this already-resolved shape.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Nominal piece length in bytes (the final piece may be shorter).
    pub piece_length: u32,
    /// Total number of pieces.
    pub piece_count: u32,
    /// Total payload length in bytes.
    pub total_length: u64,
    /// SHA-1 hash per piece, in piece order.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Files covered by the payload, in offset order.
    pub files: Vec<FileInfo>,
}

impl TorrentInfo {
    /// Returns the actual length of a piece, accounting for the short final piece.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        if index.as_u32() + 1 == self.piece_count {
            (((self.total_length - 1) % self.piece_length as u64) + 1) as u32
        } else {
            self.piece_length
        }
    }
}

/// Piece-index range covering one selected file.
///
/// Recomputed whenever the file selection changes; pieces outside the range
/// are discarded by the store.
#[derive(Debug, Clone, Copy)]
pub struct FileSelection {
    /// Index of the selected file within [`TorrentInfo::files`].
    pub file_index: usize,
    /// First piece containing bytes of the file.
    pub start_piece: PieceIndex,
    /// Last piece containing bytes of the file.
    pub end_piece: PieceIndex,
}

impl FileSelection {
    /// Number of pieces in the selection.
    pub fn piece_span(&self) -> u32 {
        self.end_piece.as_u32() - self.start_piece.as_u32() + 1
    }

    /// Checks whether a piece index falls inside the selection.
    pub fn contains(&self, index: PieceIndex) -> bool {
        index >= self.start_piece && index <= self.end_piece
    }
}

/// Computes the piece range covering one file of the torrent.
///
/// # Errors
///
/// - `TorrentError::InvalidSelection` - If the file index is out of range or
///   the file is empty
pub fn select_file(info: &TorrentInfo, file_index: usize) -> Result<FileSelection, TorrentError> {
    let file = info
        .files
        .get(file_index)
        .ok_or_else(|| TorrentError::InvalidSelection {
            reason: format!("file index {file_index} out of range"),
        })?;
    if file.length == 0 {
        return Err(TorrentError::InvalidSelection {
            reason: format!("file {:?} is empty", file.name),
        });
    }

    let piece_length = info.piece_length as u64;
    let start = (file.offset / piece_length) as u32;
    let end = ((file.offset + file.length - 1) / piece_length) as u32;

    Ok(FileSelection {
        file_index,
        start_piece: PieceIndex::new(start),
        end_piece: PieceIndex::new(end.min(info.piece_count.saturating_sub(1))),
    })
}

/// Errors that can occur in the download core.
///
/// Everything here degrades to "retry with a different peer" or "reset and
/// re-fetch"; nothing is fatal to the engine as a whole.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Request for piece {index} at offset {offset} timed out")]
    RequestTimeout { index: PieceIndex, offset: u32 },

    #[error("Invalid file selection: {reason}")]
    InvalidSelection { reason: String },

    #[error("Store error")]
    Store(#[from] StoreError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> TorrentInfo {
        TorrentInfo {
            piece_length: 1024,
            piece_count: 10,
            total_length: 10 * 1024 - 100,
            piece_hashes: vec![[0u8; 20]; 10],
            files: vec![
                FileInfo {
                    name: "intro.txt".to_string(),
                    offset: 0,
                    length: 1500,
                },
                FileInfo {
                    name: "movie.mp4".to_string(),
                    offset: 1500,
                    length: 10 * 1024 - 100 - 1500,
                },
            ],
        }
    }

    #[test]
    fn test_piece_size_final_piece_short() {
        let info = test_info();
        assert_eq!(info.piece_size(PieceIndex::new(0)), 1024);
        assert_eq!(info.piece_size(PieceIndex::new(9)), 1024 - 100);
    }

    #[test]
    fn test_select_file_piece_range() {
        let info = test_info();

        let first = select_file(&info, 0).unwrap();
        assert_eq!(first.start_piece, PieceIndex::new(0));
        assert_eq!(first.end_piece, PieceIndex::new(1));
        assert_eq!(first.piece_span(), 2);

        let second = select_file(&info, 1).unwrap();
        assert_eq!(second.start_piece, PieceIndex::new(1));
        assert_eq!(second.end_piece, PieceIndex::new(9));
        assert!(second.contains(PieceIndex::new(5)));
        assert!(!second.contains(PieceIndex::new(0)));
    }

    #[test]
    fn test_select_file_out_of_range() {
        let info = test_info();
        assert!(matches!(
            select_file(&info, 7),
            Err(TorrentError::InvalidSelection { .. })
        ));
    }

    #[test]
    fn test_piece_index_display() {
        assert_eq!(PieceIndex::new(42).to_string(), "42");
        assert_eq!(PeerKey(3).to_string(), "peer#3");
    }
}
