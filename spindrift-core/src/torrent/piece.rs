//! Per-piece block assembly.
//!
//! Tracks the state of every 16 KiB block within a single piece and assembles
//! the piece payload as blocks arrive, out of order, from different peers.

use bytes::Bytes;

/// Fixed sub-piece transfer unit (BEP 3 block size).
pub const BLOCK_SIZE: u32 = 16_384;

/// Download state of one block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    /// Not requested from anyone.
    #[default]
    Blank,
    /// Assigned to an in-flight request.
    Reserved,
    /// Payload received and copied into the assembly buffer.
    Written,
}

/// Assembles one piece from out-of-order block writes.
///
/// The assembly buffer is allocated lazily on the first write so that pieces
/// far from the playback head cost nothing until a peer actually delivers
/// data for them. The completed buffer is yielded exactly once, on the write
/// that fills the last block.
#[derive(Debug)]
pub struct PieceAssembler {
    length: u32,
    blocks: Vec<BlockState>,
    buffer: Option<Vec<u8>>,
    blocks_written: usize,
    contiguous: u32,
}

impl PieceAssembler {
    /// Creates an assembler for a piece of the given length.
    pub fn new(length: u32) -> Self {
        let count = length.div_ceil(BLOCK_SIZE) as usize;
        Self {
            length,
            blocks: vec![BlockState::Blank; count],
            buffer: None,
            blocks_written: 0,
            contiguous: 0,
        }
    }

    /// Piece length in bytes.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Number of blocks in the piece.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks already written.
    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    /// Bytes contiguously written from offset 0.
    ///
    /// Monotonically non-decreasing until [`reset`](Self::reset); lets
    /// listeners gauge sequential playback readiness before the whole piece
    /// lands.
    pub fn contiguous_progress(&self) -> u32 {
        self.contiguous
    }

    /// Reserves a block and returns its byte offset.
    ///
    /// Scans blocks in index order and reserves the first `Blank` one. With
    /// `force`, a second scan returns the first `Reserved` block's offset
    /// without changing its state, accepting a duplicate in-flight request
    /// rather than letting a stalled piece deadlock near completion. Returns
    /// `None` once every block is `Written` (or, without `force`, when no
    /// block is `Blank`).
    pub fn select(&mut self, force: bool) -> Option<u32> {
        for (i, state) in self.blocks.iter_mut().enumerate() {
            if *state == BlockState::Blank {
                *state = BlockState::Reserved;
                return Some(i as u32 * BLOCK_SIZE);
            }
        }
        if force {
            for (i, state) in self.blocks.iter().enumerate() {
                if *state == BlockState::Reserved {
                    return Some(i as u32 * BLOCK_SIZE);
                }
            }
        }
        None
    }

    /// Releases a reservation, returning the block to `Blank`.
    ///
    /// No-op for `Written` blocks: writes are never undone.
    pub fn deselect(&mut self, offset: u32) {
        let i = (offset / BLOCK_SIZE) as usize;
        if let Some(state) = self.blocks.get_mut(i) {
            if *state == BlockState::Reserved {
                *state = BlockState::Blank;
            }
        }
    }

    /// Length of the block starting at `offset`; the final block of a piece
    /// is shorter when the piece length is not block-aligned.
    pub fn sizeof(&self, offset: u32) -> u32 {
        BLOCK_SIZE.min(self.length.saturating_sub(offset))
    }

    /// Writes one block's payload into the assembly buffer.
    ///
    /// Idempotent against duplicate or forced deliveries: a block already
    /// `Written` is left untouched and the call returns `None`. Returns the
    /// fully assembled piece exactly once, on the write that completes the
    /// last block.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Option<Bytes> {
        let i = (offset / BLOCK_SIZE) as usize;
        if i >= self.blocks.len() || self.blocks[i] == BlockState::Written {
            return None;
        }

        let length = self.length as usize;
        let buffer = self.buffer.get_or_insert_with(|| vec![0u8; length]);
        let start = offset as usize;
        let end = (start + data.len()).min(length);
        buffer[start..end].copy_from_slice(&data[..end - start]);

        self.blocks[i] = BlockState::Written;
        self.blocks_written += 1;

        let first_gap = self
            .blocks
            .iter()
            .position(|b| *b != BlockState::Written)
            .unwrap_or(self.blocks.len());
        self.contiguous = self.length.min(first_gap as u32 * BLOCK_SIZE);

        if self.blocks_written == self.blocks.len() {
            let assembled = self.buffer.take().unwrap_or_default();
            return Some(Bytes::from(assembled));
        }
        None
    }

    /// Clears buffer and all block state.
    ///
    /// Used after the store rejects a completed piece (failed persistence or
    /// verification); every block becomes re-requestable.
    pub fn reset(&mut self) {
        self.buffer = None;
        self.blocks.fill(BlockState::Blank);
        self.blocks_written = 0;
        self.contiguous = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_reserves_in_index_order() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 3);

        assert_eq!(piece.select(false), Some(0));
        assert_eq!(piece.select(false), Some(BLOCK_SIZE));
        assert_eq!(piece.select(false), Some(BLOCK_SIZE * 2));
        assert_eq!(piece.select(false), None);
    }

    #[test]
    fn test_forced_select_returns_first_reserved() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 2);

        assert_eq!(piece.select(false), Some(0));
        assert_eq!(piece.select(false), Some(BLOCK_SIZE));
        // All blocks reserved: only a forced select yields an offset, and it
        // does not change block state.
        assert_eq!(piece.select(false), None);
        assert_eq!(piece.select(true), Some(0));
        assert_eq!(piece.select(true), Some(0));
    }

    #[test]
    fn test_select_never_returns_written_block() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 2);
        piece.select(false);
        assert!(piece.write(0, &vec![1u8; BLOCK_SIZE as usize]).is_none());

        assert_eq!(piece.select(false), Some(BLOCK_SIZE));
        assert_eq!(piece.select(true), Some(BLOCK_SIZE));
    }

    #[test]
    fn test_deselect_releases_only_reserved() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 2);
        piece.select(false);
        piece.write(0, &vec![1u8; BLOCK_SIZE as usize]);

        // Written block is never undone.
        piece.deselect(0);
        assert_eq!(piece.select(false), Some(BLOCK_SIZE));
        piece.deselect(BLOCK_SIZE);
        assert_eq!(piece.select(false), Some(BLOCK_SIZE));
    }

    #[test]
    fn test_write_completes_exactly_once() {
        let blocks = 16u32;
        let mut piece = PieceAssembler::new(BLOCK_SIZE * blocks);

        for i in 0..blocks - 1 {
            let result = piece.write(i * BLOCK_SIZE, &vec![i as u8; BLOCK_SIZE as usize]);
            assert!(result.is_none(), "write {i} should not complete the piece");
        }
        let assembled = piece
            .write((blocks - 1) * BLOCK_SIZE, &vec![0xAB; BLOCK_SIZE as usize])
            .expect("final write returns the assembled piece");

        assert_eq!(assembled.len(), (BLOCK_SIZE * blocks) as usize);
        assert_eq!(assembled[0], 0);
        assert_eq!(assembled[(BLOCK_SIZE * 3) as usize], 3);
        assert_eq!(piece.blocks_written(), piece.block_count());

        // Duplicate delivery after completion is a no-op.
        assert!(piece.write(0, &vec![9u8; BLOCK_SIZE as usize]).is_none());
    }

    #[test]
    fn test_duplicate_write_is_noop() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 2);

        assert!(piece.write(0, &vec![1u8; BLOCK_SIZE as usize]).is_none());
        assert_eq!(piece.blocks_written(), 1);
        // Second peer delivers the same forced block: first write wins.
        assert!(piece.write(0, &vec![2u8; BLOCK_SIZE as usize]).is_none());
        assert_eq!(piece.blocks_written(), 1);

        let assembled = piece
            .write(BLOCK_SIZE, &vec![3u8; BLOCK_SIZE as usize])
            .unwrap();
        assert_eq!(assembled[0], 1);
    }

    #[test]
    fn test_contiguous_progress_tracks_leading_run() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 4);

        piece.write(BLOCK_SIZE * 2, &vec![0u8; BLOCK_SIZE as usize]);
        assert_eq!(piece.contiguous_progress(), 0);

        piece.write(0, &vec![0u8; BLOCK_SIZE as usize]);
        assert_eq!(piece.contiguous_progress(), BLOCK_SIZE);

        piece.write(BLOCK_SIZE, &vec![0u8; BLOCK_SIZE as usize]);
        assert_eq!(piece.contiguous_progress(), BLOCK_SIZE * 3);
    }

    #[test]
    fn test_short_final_block() {
        let length = BLOCK_SIZE + 100;
        let mut piece = PieceAssembler::new(length);

        assert_eq!(piece.block_count(), 2);
        assert_eq!(piece.sizeof(0), BLOCK_SIZE);
        assert_eq!(piece.sizeof(BLOCK_SIZE), 100);

        piece.write(0, &vec![1u8; BLOCK_SIZE as usize]);
        let assembled = piece.write(BLOCK_SIZE, &vec![2u8; 100]).unwrap();
        assert_eq!(assembled.len(), length as usize);
        assert_eq!(assembled[BLOCK_SIZE as usize], 2);
    }

    #[test]
    fn test_reset_clears_all_state() {
        let mut piece = PieceAssembler::new(BLOCK_SIZE * 2);
        piece.select(false);
        piece.write(BLOCK_SIZE, &vec![1u8; BLOCK_SIZE as usize]);

        piece.reset();
        assert_eq!(piece.blocks_written(), 0);
        assert_eq!(piece.contiguous_progress(), 0);
        assert_eq!(piece.select(false), Some(0));
    }
}
