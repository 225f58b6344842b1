//! Piece-availability bitmap exchanged with peers.

use bytes::Bytes;

use super::PieceIndex;

/// Which pieces a peer (or this client) has, one bit per piece.
///
/// Bits are stored most-significant-bit first within each byte, matching the
/// BitTorrent wire encoding, so the backing bytes can be sent as a `bitfield`
/// message without conversion.
#[derive(Debug, Clone)]
pub struct Bitfield {
    bits: Vec<u8>,
    length: usize,
}

impl Bitfield {
    /// Creates an all-zero bitfield for `length` pieces.
    pub fn new(length: usize) -> Self {
        Self {
            bits: vec![0; length.div_ceil(8)],
            length,
        }
    }

    /// Constructs a bitfield from wire bytes.
    ///
    /// Bytes beyond `length.div_ceil(8)` are ignored; a short buffer is
    /// zero-extended, since a malformed peer message must not take the
    /// session down.
    pub fn from_bytes(bytes: &[u8], length: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(length.div_ceil(8), 0);
        Self { bits, length }
    }

    /// Number of pieces covered.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True when the bitfield covers zero pieces.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether the piece at `index` is marked present.
    ///
    /// Out-of-range indices answer `false`.
    pub fn has(&self, index: PieceIndex) -> bool {
        let i = index.as_u32() as usize;
        if i >= self.length {
            return false;
        }
        (self.bits[i / 8] & (1 << (7 - (i % 8)))) != 0
    }

    /// Marks the piece at `index` present. Out-of-range indices are ignored.
    pub fn set(&mut self, index: PieceIndex) {
        let i = index.as_u32() as usize;
        if i < self.length {
            self.bits[i / 8] |= 1 << (7 - (i % 8));
        }
    }

    /// Number of pieces marked present.
    pub fn count(&self) -> usize {
        (0..self.length)
            .filter(|&i| self.has(PieceIndex::new(i as u32)))
            .count()
    }

    /// Wire encoding for a `bitfield` message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.bits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has_msb_first() {
        let mut field = Bitfield::new(12);
        field.set(PieceIndex::new(0));
        field.set(PieceIndex::new(9));

        assert!(field.has(PieceIndex::new(0)));
        assert!(!field.has(PieceIndex::new(1)));
        assert!(field.has(PieceIndex::new(9)));

        // Bit 0 is the high bit of byte 0; bit 9 is the second-highest of byte 1.
        assert_eq!(field.to_bytes().as_ref(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let field = Bitfield::from_bytes(&[0b1010_0000], 4);
        assert!(field.has(PieceIndex::new(0)));
        assert!(!field.has(PieceIndex::new(1)));
        assert!(field.has(PieceIndex::new(2)));
        assert_eq!(field.count(), 2);
    }

    #[test]
    fn test_short_buffer_zero_extended() {
        let field = Bitfield::from_bytes(&[], 16);
        assert_eq!(field.count(), 0);
        assert_eq!(field.to_bytes().len(), 2);
    }

    #[test]
    fn test_out_of_range_is_harmless() {
        let mut field = Bitfield::new(3);
        field.set(PieceIndex::new(100));
        assert!(!field.has(PieceIndex::new(100)));
        assert_eq!(field.count(), 0);
    }
}
