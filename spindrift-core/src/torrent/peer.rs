//! Per-connection peer bookkeeping.
//!
//! Sessions hold everything the scheduler needs to judge a peer: choke
//! state, advertised pieces, outstanding block requests, and a windowed
//! throughput estimate. All time is passed in explicitly so the scheduler
//! and the tests share one clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{Bitfield, PieceIndex};

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, wire handshake not yet complete.
    Handshaking,
    /// Unchoked with no outstanding requests.
    Idle,
    /// Unchoked with requests in flight.
    Requesting,
    /// Peer is choking us.
    Choked,
    /// Connection is gone; the session only awaits cleanup.
    Disconnected,
}

/// Windowed download-rate estimate in bytes per second.
#[derive(Debug)]
pub struct SpeedEstimator {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl SpeedEstimator {
    /// Creates an estimator averaging over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records `bytes` delivered at `now`.
    pub fn record(&mut self, now: Instant, bytes: usize) {
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    /// Average rate over the window ending at `now`.
    pub fn bytes_per_sec(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(self.window);
        let total: usize = self
            .samples
            .iter()
            .filter(|(at, _)| cutoff.is_none_or(|cutoff| *at >= cutoff))
            .map(|(_, bytes)| bytes)
            .sum();
        total as f64 / self.window.as_secs_f64()
    }

    fn prune(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.window) {
            while self
                .samples
                .front()
                .is_some_and(|(at, _)| *at < cutoff)
            {
                self.samples.pop_front();
            }
        }
    }
}

/// One outstanding block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// Piece the block belongs to.
    pub index: PieceIndex,
    /// Byte offset of the block within the piece.
    pub offset: u32,
    /// When the request was issued, for timeout expiry.
    pub requested_at: Instant,
}

/// Bookkeeping for one live peer connection.
#[derive(Debug)]
pub struct PeerSession {
    state: SessionState,
    peer_choking: bool,
    have: Bitfield,
    outstanding: Vec<BlockRef>,
    downloaded_bytes: u64,
    speed: SpeedEstimator,
    connected_at: Instant,
    choked_since: Option<Instant>,
    timeout_strikes: u32,
}

impl PeerSession {
    /// Creates a session for a freshly accepted connection.
    pub fn new(now: Instant, piece_count: usize, speed_window: Duration) -> Self {
        Self {
            state: SessionState::Handshaking,
            peer_choking: true,
            have: Bitfield::new(piece_count),
            outstanding: Vec::new(),
            downloaded_bytes: 0,
            speed: SpeedEstimator::new(speed_window),
            connected_at: now,
            choked_since: None,
            timeout_strikes: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the peer currently chokes us.
    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Total bytes downloaded from this peer.
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    /// Outstanding block requests.
    pub fn outstanding(&self) -> &[BlockRef] {
        &self.outstanding
    }

    /// Number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Request-timeout strikes accumulated since the last successful block.
    pub fn timeout_strikes(&self) -> u32 {
        self.timeout_strikes
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// How long the peer has been choking us, if it is.
    pub fn choked_since(&self) -> Option<Instant> {
        self.choked_since
    }

    /// Windowed throughput estimate.
    pub fn speed_bytes_per_sec(&self, now: Instant) -> f64 {
        self.speed.bytes_per_sec(now)
    }

    /// Whether the scheduler may issue requests to this peer.
    pub fn is_eligible(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::Requesting) && !self.peer_choking
    }

    /// Whether the peer advertises `index`.
    pub fn has(&self, index: PieceIndex) -> bool {
        self.have.has(index)
    }

    /// Marks the wire handshake complete. Peers start out choking us.
    pub fn handshake_complete(&mut self, now: Instant) {
        if self.state == SessionState::Handshaking {
            self.state = SessionState::Choked;
            self.peer_choking = true;
            self.choked_since = Some(now);
        }
    }

    /// Records a `choke` from the peer.
    pub fn choke(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.peer_choking = true;
        self.state = SessionState::Choked;
        self.choked_since = Some(now);
    }

    /// Records an `unchoke`; clears the choke timeout.
    pub fn unchoke(&mut self) {
        if self.state == SessionState::Disconnected || self.state == SessionState::Handshaking {
            return;
        }
        self.peer_choking = false;
        self.choked_since = None;
        self.state = if self.outstanding.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Requesting
        };
    }

    /// Records a `have` announcement.
    pub fn record_have(&mut self, index: PieceIndex) {
        self.have.set(index);
    }

    /// Replaces the advertised piece set from a `bitfield` message.
    pub fn set_bitfield(&mut self, bits: &[u8]) {
        let length = self.have.len();
        self.have = Bitfield::from_bytes(bits, length);
    }

    /// Tracks a newly issued block request.
    pub fn begin_request(&mut self, block: BlockRef) {
        self.outstanding.push(block);
        if self.state == SessionState::Idle {
            self.state = SessionState::Requesting;
        }
    }

    /// Settles an outstanding request for a delivered block.
    ///
    /// Returns false when no matching request exists (late delivery after a
    /// cancel); the payload is still written upstream since piece writes are
    /// idempotent.
    pub fn complete_request(&mut self, index: PieceIndex, offset: u32) -> bool {
        let found = self.remove_outstanding(index, offset).is_some();
        self.timeout_strikes = 0;
        if self.outstanding.is_empty() && self.state == SessionState::Requesting {
            self.state = SessionState::Idle;
        }
        found
    }

    /// Records delivered payload bytes toward the throughput estimate.
    pub fn record_downloaded(&mut self, now: Instant, bytes: usize) {
        self.downloaded_bytes += bytes as u64;
        self.speed.record(now, bytes);
    }

    /// Removes and returns every outstanding request for one piece.
    pub fn cancel_piece(&mut self, index: PieceIndex) -> Vec<BlockRef> {
        let (cancelled, kept) = self
            .outstanding
            .drain(..)
            .partition(|block| block.index == index);
        self.outstanding = kept;
        if self.outstanding.is_empty() && self.state == SessionState::Requesting {
            self.state = SessionState::Idle;
        }
        cancelled
    }

    /// Removes and returns requests older than `timeout`, adding a strike each.
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> Vec<BlockRef> {
        let (expired, kept): (Vec<BlockRef>, Vec<BlockRef>) = self
            .outstanding
            .drain(..)
            .partition(|block| now.duration_since(block.requested_at) >= timeout);
        self.outstanding = kept;
        self.timeout_strikes += expired.len() as u32;
        if self.outstanding.is_empty() && self.state == SessionState::Requesting {
            self.state = SessionState::Idle;
        }
        expired
    }

    /// Removes every outstanding request; used when the session is destroyed
    /// so reservations can be released back to the pool.
    pub fn drain_outstanding(&mut self) -> Vec<BlockRef> {
        std::mem::take(&mut self.outstanding)
    }

    /// Marks the session disconnected.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }

    fn remove_outstanding(&mut self, index: PieceIndex, offset: u32) -> Option<BlockRef> {
        let at = self
            .outstanding
            .iter()
            .position(|block| block.index == index && block.offset == offset)?;
        Some(self.outstanding.remove(at))
    }
}
