//! Typed wire seam between the engine and the swarm collaborator.
//!
//! The swarm side owns sockets, framing, and message encoding; the engine
//! consumes decoded events and emits commands through [`PeerTransport`]
//! handles. Nothing in the core touches bytes on the wire.

use async_trait::async_trait;
use bytes::Bytes;

use super::{PieceIndex, TorrentError};

/// Decoded protocol events forwarded from one peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Wire handshake completed; the session becomes schedulable.
    HandshakeComplete,
    /// Peer started choking us.
    Choke,
    /// Peer stopped choking us.
    Unchoke,
    /// Peer announced a newly acquired piece.
    Have {
        /// Announced piece.
        index: PieceIndex,
    },
    /// Peer sent its full availability bitmap.
    Bitfield {
        /// Wire-encoded bitmap, MSB-first.
        bits: Bytes,
    },
    /// Peer delivered a requested block.
    Block {
        /// Piece the block belongs to.
        index: PieceIndex,
        /// Byte offset within the piece.
        offset: u32,
        /// Block payload.
        data: Bytes,
    },
    /// Peer asked us for a block.
    Request {
        /// Requested piece.
        index: PieceIndex,
        /// Byte offset within the piece.
        offset: u32,
        /// Requested length in bytes.
        length: u32,
    },
    /// Connection closed, either side.
    Disconnected,
}

/// Commands the engine issues to one peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Request a block.
    Request {
        /// Piece to request from.
        index: PieceIndex,
        /// Byte offset within the piece.
        offset: u32,
        /// Length in bytes.
        length: u32,
    },
    /// Cancel a previously issued request.
    Cancel {
        /// Piece of the cancelled request.
        index: PieceIndex,
        /// Byte offset within the piece.
        offset: u32,
        /// Length of the cancelled request.
        length: u32,
    },
    /// Announce a newly persisted piece.
    Have {
        /// Persisted piece.
        index: PieceIndex,
    },
    /// Send our availability bitmap.
    Bitfield {
        /// Wire-encoded bitmap, MSB-first.
        bits: Bytes,
    },
    /// Stop choking the peer.
    Unchoke,
    /// Serve a block the peer requested.
    Piece {
        /// Piece the block belongs to.
        index: PieceIndex,
        /// Byte offset within the piece.
        offset: u32,
        /// Block payload.
        data: Bytes,
    },
    /// Tear the connection down.
    Close,
}

/// Command sink for one peer connection, implemented by the swarm collaborator.
///
/// Implementations are expected to enqueue onto the connection's writer; a
/// failed send means the connection is unusable and will surface as a
/// [`PeerEvent::Disconnected`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Delivers one command to the wire.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - If the connection is gone or
    ///   the write failed
    async fn send(&self, command: PeerCommand) -> Result<(), TorrentError>;
}
