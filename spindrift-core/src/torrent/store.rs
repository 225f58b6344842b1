//! Piece set and prioritized missing list for the selected file.
//!
//! Owns every in-progress piece covering the current file selection, hands
//! out block reservations, and keeps the `missing` list ordered around the
//! playback head. Persisted bytes live behind the external block store; this
//! type only tracks which pieces still need work.

use std::sync::Arc;

use bytes::Bytes;

use super::piece::PieceAssembler;
use super::{Bitfield, EventBus, EventSubscription, FileSelection, PieceIndex, StoreEvent, TorrentInfo};
use crate::streaming::media;

/// Piece bookkeeping for one selected file.
///
/// Invariant: `missing` contains exactly the indices whose piece slot is
/// live; an index leaves `missing` the instant its persistence succeeds,
/// never before.
pub struct PieceStore {
    info: Arc<TorrentInfo>,
    selection: FileSelection,
    pieces: Vec<Option<PieceAssembler>>,
    missing: Vec<PieceIndex>,
    position: PieceIndex,
    pin_trailing: bool,
    persisted: Bitfield,
    events: EventBus<StoreEvent>,
    pieces_persisted: u64,
    pieces_rejected: u64,
}

impl PieceStore {
    /// Creates a store covering `selection`'s piece range.
    pub fn new(info: Arc<TorrentInfo>, selection: FileSelection) -> Self {
        let persisted = Bitfield::new(info.piece_count as usize);
        let mut store = Self {
            info,
            selection,
            pieces: Vec::new(),
            missing: Vec::new(),
            position: selection.start_piece,
            pin_trailing: false,
            persisted,
            events: EventBus::new(),
            pieces_persisted: 0,
            pieces_rejected: 0,
        };
        store.rebuild(selection);
        store
    }

    /// Switches to a new file selection.
    ///
    /// Pieces outside the new range are discarded; pieces already persisted
    /// stay persisted and are not re-added to `missing`.
    pub fn select_file(&mut self, selection: FileSelection) {
        self.rebuild(selection);
    }

    fn rebuild(&mut self, selection: FileSelection) {
        self.selection = selection;
        self.position = selection.start_piece;
        self.pin_trailing = !self.info.files.get(selection.file_index).is_some_and(|file| {
            media::trailing_metadata_unreliable(&file.name)
        });

        self.pieces.clear();
        self.missing.clear();
        for raw in selection.start_piece.as_u32()..=selection.end_piece.as_u32() {
            let index = PieceIndex::new(raw);
            if self.persisted.has(index) {
                self.pieces.push(None);
            } else {
                self.pieces
                    .push(Some(PieceAssembler::new(self.info.piece_size(index))));
                self.missing.push(index);
            }
        }
        self.prioritize(selection.start_piece);
    }

    /// Current file selection.
    pub fn selection(&self) -> FileSelection {
        self.selection
    }

    /// Piece index currently being read for playback.
    pub fn position(&self) -> PieceIndex {
        self.position
    }

    /// Actual length of a piece in bytes.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        self.info.piece_size(index)
    }

    /// Nominal piece length of the torrent.
    pub fn piece_length(&self) -> u32 {
        self.info.piece_length
    }

    /// Ordered not-yet-complete piece indices.
    pub fn missing(&self) -> &[PieceIndex] {
        &self.missing
    }

    /// Whether a piece has been persisted and is readable.
    pub fn is_readable(&self, index: PieceIndex) -> bool {
        self.persisted.has(index)
    }

    /// Wire bitfield of persisted pieces, for `bitfield` messages.
    pub fn persisted_bitfield(&self) -> Bytes {
        self.persisted.to_bytes()
    }

    /// Pieces persisted since creation.
    pub fn pieces_persisted(&self) -> u64 {
        self.pieces_persisted
    }

    /// Completed pieces rejected by the block store (verification or I/O).
    pub fn pieces_rejected(&self) -> u64 {
        self.pieces_rejected
    }

    fn slot(&self, index: PieceIndex) -> Option<&PieceAssembler> {
        if !self.selection.contains(index) {
            return None;
        }
        let at = (index.as_u32() - self.selection.start_piece.as_u32()) as usize;
        self.pieces.get(at).and_then(|slot| slot.as_ref())
    }

    fn slot_mut(&mut self, index: PieceIndex) -> Option<&mut PieceAssembler> {
        if !self.selection.contains(index) {
            return None;
        }
        let at = (index.as_u32() - self.selection.start_piece.as_u32()) as usize;
        self.pieces.get_mut(at).and_then(|slot| slot.as_mut())
    }

    /// Reserves a block within `index`, returning its byte offset.
    ///
    /// Completed or out-of-range pieces answer `None`. A plain reservation is
    /// attempted first; only when that fails and `force` is set is a
    /// duplicate reservation of an already-reserved block returned.
    pub fn select(&mut self, index: PieceIndex, force: bool) -> Option<u32> {
        let piece = self.slot_mut(index)?;
        match piece.select(false) {
            Some(offset) => Some(offset),
            None if force => piece.select(true),
            None => None,
        }
    }

    /// Releases a block reservation. No-op for completed pieces.
    pub fn deselect(&mut self, index: PieceIndex, offset: u32) {
        if let Some(piece) = self.slot_mut(index) {
            piece.deselect(offset);
        }
    }

    /// Length of the block at `offset` within `index`; 0 for completed pieces.
    pub fn sizeof(&self, index: PieceIndex, offset: u32) -> u32 {
        self.slot(index)
            .map(|piece| piece.sizeof(offset))
            .unwrap_or(0)
    }

    /// Writes one received block.
    ///
    /// Returns the fully assembled piece on the write completing its last
    /// block; the caller persists it through the block store and reports back
    /// via [`mark_persisted`](Self::mark_persisted) or
    /// [`reset_piece`](Self::reset_piece).
    pub fn write(&mut self, index: PieceIndex, offset: u32, data: &[u8]) -> Option<Bytes> {
        let piece = self.slot_mut(index)?;
        let completed = piece.write(offset, data);
        let contiguous = piece.contiguous_progress();
        self.events.publish(StoreEvent::Progress { index, contiguous });
        completed
    }

    /// Records that the block store persisted `index`.
    ///
    /// Removes the piece from `missing`, drops its slot, and wakes readers.
    /// Returns false when the piece was already recorded (duplicate
    /// notifications are expected from resumed downloads).
    pub fn mark_persisted(&mut self, index: PieceIndex) -> bool {
        if !self.selection.contains(index) || self.persisted.has(index) {
            return false;
        }
        self.persisted.set(index);
        self.pieces_persisted += 1;

        let at = (index.as_u32() - self.selection.start_piece.as_u32()) as usize;
        if let Some(slot) = self.pieces.get_mut(at) {
            *slot = None;
        }
        self.missing.retain(|&m| m != index);

        tracing::debug!("piece {index} persisted, {} missing", self.missing.len());
        self.events.publish(StoreEvent::PieceReadable(index));
        if self.missing.is_empty() {
            tracing::info!("file selection complete");
            self.events.publish(StoreEvent::Finished);
        }
        true
    }

    /// Resets a piece whose persistence was rejected.
    ///
    /// The piece becomes fully re-requestable; rejection is recoverable by
    /// re-downloading, never fatal.
    pub fn reset_piece(&mut self, index: PieceIndex) {
        if let Some(piece) = self.slot_mut(index) {
            piece.reset();
            self.pieces_rejected += 1;
            tracing::warn!("piece {index} rejected by block store, re-queued");
        }
    }

    /// Reorders `missing` around the playback head.
    ///
    /// The trailing piece of the selected range sorts first (unless the
    /// file's format makes trailing metadata useless for progressive
    /// playback), then indices at or past `from` ascending, then the rest
    /// ascending.
    pub fn prioritize(&mut self, from: PieceIndex) {
        self.position = from;
        let end = self.selection.end_piece;
        let pin = self.pin_trailing;
        self.missing.sort_by(|&a, &b| {
            use std::cmp::Ordering;
            if pin {
                if a == end && b != end {
                    return Ordering::Less;
                }
                if b == end && a != end {
                    return Ordering::Greater;
                }
            }
            match (a >= from, b >= from) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => a.cmp(&b),
            }
        });
    }

    /// Subscribes to store notifications.
    pub fn subscribe(&mut self) -> EventSubscription<StoreEvent> {
        self.events.subscribe()
    }

    /// Explicitly removes a subscriber.
    pub fn unsubscribe(&mut self, id: u64) {
        self.events.unsubscribe(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{select_file, FileInfo};

    fn test_info(name: &str) -> Arc<TorrentInfo> {
        // 8 pieces of 32 KiB; the single file spans pieces 3..=7.
        let piece_length = 32_768u32;
        Arc::new(TorrentInfo {
            piece_length,
            piece_count: 8,
            total_length: 8 * piece_length as u64,
            piece_hashes: vec![[0u8; 20]; 8],
            files: vec![
                FileInfo {
                    name: "padding.bin".to_string(),
                    offset: 0,
                    length: 3 * piece_length as u64,
                },
                FileInfo {
                    name: name.to_string(),
                    offset: 3 * piece_length as u64,
                    length: 5 * piece_length as u64,
                },
            ],
        })
    }

    fn test_store(name: &str) -> PieceStore {
        let info = test_info(name);
        let selection = select_file(&info, 1).unwrap();
        PieceStore::new(info, selection)
    }

    fn indices(store: &PieceStore) -> Vec<u32> {
        store.missing().iter().map(|index| index.as_u32()).collect()
    }

    #[test]
    fn test_prioritize_pins_trailing_then_partitions() {
        let mut store = test_store("movie.mp4");
        assert_eq!(indices(&store), vec![7, 3, 4, 5, 6]);

        store.prioritize(PieceIndex::new(5));
        assert_eq!(indices(&store), vec![7, 5, 6, 3, 4]);
        assert_eq!(store.position(), PieceIndex::new(5));
    }

    #[test]
    fn test_prioritize_avi_skips_trailing_pin() {
        let mut store = test_store("movie.avi");
        store.prioritize(PieceIndex::new(5));
        assert_eq!(indices(&store), vec![5, 6, 7, 3, 4]);
    }

    #[test]
    fn test_select_and_write_through_slots() {
        let mut store = test_store("movie.mp4");
        let index = PieceIndex::new(3);

        let offset = store.select(index, false).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(store.sizeof(index, offset), crate::torrent::BLOCK_SIZE);

        // Out-of-range piece is not selectable.
        assert_eq!(store.select(PieceIndex::new(0), true), None);
    }

    #[test]
    fn test_completed_piece_persists_and_leaves_missing() {
        let mut store = test_store("movie.mp4");
        let index = PieceIndex::new(3);
        let block = crate::torrent::BLOCK_SIZE as usize;

        let mut completed = None;
        for i in 0..2 {
            completed = store.write(index, i * crate::torrent::BLOCK_SIZE, &vec![1u8; block]);
        }
        let assembled = completed.expect("last block completes the piece");
        assert_eq!(assembled.len(), 2 * block);

        // Still missing until the block store confirms persistence.
        assert!(store.missing().contains(&index));
        assert!(!store.is_readable(index));

        assert!(store.mark_persisted(index));
        assert!(!store.missing().contains(&index));
        assert!(store.is_readable(index));
        assert_eq!(store.pieces_persisted(), 1);
        // Slot is gone: further selects and writes are no-ops.
        assert_eq!(store.select(index, true), None);
        assert!(store.write(index, 0, &vec![2u8; block]).is_none());

        // Duplicate notification is ignored.
        assert!(!store.mark_persisted(index));
        assert_eq!(store.pieces_persisted(), 1);
    }

    #[test]
    fn test_reset_piece_requeues_all_blocks() {
        let mut store = test_store("movie.mp4");
        let index = PieceIndex::new(4);
        let block = crate::torrent::BLOCK_SIZE as usize;

        store.write(index, 0, &vec![1u8; block]);
        store.write(index, crate::torrent::BLOCK_SIZE, &vec![1u8; block]);
        store.reset_piece(index);

        assert_eq!(store.pieces_rejected(), 1);
        assert_eq!(store.select(index, false), Some(0));
        assert!(store.missing().contains(&index));
    }

    #[tokio::test]
    async fn test_readable_and_finished_events() {
        let mut store = test_store("movie.mp4");
        let mut sub = store.subscribe();
        let block = crate::torrent::BLOCK_SIZE as usize;

        store.write(PieceIndex::new(3), 0, &vec![1u8; block]);
        assert!(matches!(
            sub.try_recv(),
            Some(StoreEvent::Progress { contiguous, .. }) if contiguous == crate::torrent::BLOCK_SIZE
        ));

        for raw in 3..=7 {
            store.mark_persisted(PieceIndex::new(raw));
        }
        let mut saw_finished = false;
        while let Some(event) = sub.try_recv() {
            if event == StoreEvent::Finished {
                saw_finished = true;
            }
        }
        assert!(saw_finished);
    }

    #[test]
    fn test_reselect_keeps_persisted_pieces() {
        let info = test_info("movie.mp4");
        let mut store = PieceStore::new(info.clone(), select_file(&info, 1).unwrap());
        store.mark_persisted(PieceIndex::new(3));

        store.select_file(select_file(&info, 1).unwrap());
        assert!(!store.missing().contains(&PieceIndex::new(3)));
        assert!(store.is_readable(PieceIndex::new(3)));
    }
}
