//! Playback-aware block request scheduling.
//!
//! Decides, for every connected peer and every tick, which block to request
//! next. Fast peers compete for pieces near the playback head; slow peers are
//! pushed far ahead as background fillers; a periodic resync pass reclaims
//! blocks from underperformers when faster idle capacity could cover the
//! same slot. The scheduler mutates store and session state and emits
//! [`PeerCommand`]s, but never performs I/O itself.

use std::collections::HashMap;
use std::time::Instant;

use super::peer::BlockRef;
use super::{BLOCK_SIZE, PeerCommand, PeerKey, PeerSession, PieceIndex, PieceStore, SessionState};
use crate::config::TorrentConfig;

/// Observable scheduler counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SchedulerStats {
    /// Requests cancelled and reassigned away from slow peers.
    pub resyncs: u64,
}

/// Maintenance outcome: wire commands plus sessions to destroy.
#[derive(Debug, Default)]
pub struct MaintainActions {
    /// Commands to dispatch to peer transports.
    pub commands: Vec<(PeerKey, PeerCommand)>,
    /// Sessions that exceeded a lifecycle deadline and must be destroyed.
    pub disconnects: Vec<PeerKey>,
}

/// Event-driven request scheduler over one [`PieceStore`].
#[derive(Debug)]
pub struct RequestScheduler {
    config: TorrentConfig,
    last_resync: Option<Instant>,
    resyncs: u64,
}

impl RequestScheduler {
    /// Creates a scheduler with the given tunables.
    pub fn new(config: TorrentConfig) -> Self {
        Self {
            config,
            last_resync: None,
            resyncs: 0,
        }
    }

    /// Observable counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            resyncs: self.resyncs,
        }
    }

    /// Bytes/sec below which a peer is treated as slow: two blocks per
    /// resync interval.
    fn speed_floor(&self) -> f64 {
        (2 * BLOCK_SIZE) as f64 / self.config.resync_interval.as_secs_f64()
    }

    /// Runs one scheduling pass and returns the commands to dispatch.
    ///
    /// Invoked whenever global state relevant to scheduling changes: a peer
    /// was unchoked, announced pieces, delivered or failed a block, or
    /// disconnected. Also invoked from the heartbeat so the interval-gated
    /// resync pass runs without protocol traffic.
    pub fn tick(
        &mut self,
        now: Instant,
        store: &mut PieceStore,
        sessions: &mut HashMap<PeerKey, PeerSession>,
    ) -> Vec<(PeerKey, PeerCommand)> {
        let mut order: Vec<PeerKey> = sessions
            .iter()
            .filter(|(_, session)| session.state() != SessionState::Disconnected)
            .map(|(key, _)| *key)
            .collect();
        // Productive peers schedule first.
        order.sort_by_key(|key| std::cmp::Reverse(sessions[key].downloaded_bytes()));

        let mut commands = self.resync(now, store, sessions);

        for &key in &order {
            if !sessions[&key].is_eligible() {
                continue;
            }
            let from = self.calc_offset(now, key, sessions, store);
            loop {
                let session = sessions.get_mut(&key).expect("ordered key exists");
                if session.in_flight() >= self.config.max_in_flight {
                    break;
                }
                let mut picked = Self::pick_block(store, session, from, false);
                if picked.is_none()
                    && session.in_flight() == 0
                    && store.missing().len() < self.config.force_threshold
                {
                    // Don't let a peer idle while the tail drains: accept a
                    // duplicate in-flight request for an already-reserved block.
                    picked = Self::pick_block(store, session, from, true);
                }
                let Some((index, offset)) = picked else {
                    break;
                };
                let length = store.sizeof(index, offset);
                session.begin_request(BlockRef {
                    index,
                    offset,
                    requested_at: now,
                });
                tracing::trace!("requesting piece {index} offset {offset} from {key}");
                commands.push((key, PeerCommand::Request { index, offset, length }));
            }
        }
        commands
    }

    /// How far into the prioritized missing list a peer should look, in
    /// list-slot units.
    ///
    /// Projects the bytes this peer plus every visibly faster peer would move
    /// over one resync horizon and converts that to piece slots: peers that
    /// cannot beat the crowd to the playback head are sent past it. Slow
    /// peers (below the floor) collapse to the cap and fill in far ahead.
    /// The cap leaves `tail_reserve` slots unpinned while many pieces remain
    /// so tail selection is not fully derandomized.
    pub fn calc_offset(
        &self,
        now: Instant,
        key: PeerKey,
        sessions: &HashMap<PeerKey, PeerSession>,
        store: &PieceStore,
    ) -> usize {
        let missing_len = store.missing().len();
        if missing_len == 0 {
            return 0;
        }
        let cap = if missing_len > self.config.tail_reserve {
            missing_len - self.config.tail_reserve
        } else {
            missing_len - 1
        };

        let speed = sessions[&key].speed_bytes_per_sec(now);
        if speed < self.speed_floor() {
            return cap;
        }

        let horizon = self.config.resync_interval.as_secs_f64();
        let mut projected = speed * horizon;
        for (other_key, other) in sessions {
            if *other_key == key || other.state() == SessionState::Disconnected {
                continue;
            }
            let other_speed = other.speed_bytes_per_sec(now);
            if other_speed > speed {
                projected += other_speed * horizon;
            }
        }
        ((projected / store.piece_length() as f64) as usize).min(cap)
    }

    /// Reclaims blocks held by slow peers in the slots just ahead of the
    /// playback head, at most once per resync interval.
    ///
    /// A reservation is cancelled only when its holder is below the speed
    /// floor *and* some faster, currently idle peer advertising the piece
    /// projects to cover the same slot. A peer at or above what the
    /// replacement could sustain is never cancelled.
    fn resync(
        &mut self,
        now: Instant,
        store: &mut PieceStore,
        sessions: &mut HashMap<PeerKey, PeerSession>,
    ) -> Vec<(PeerKey, PeerCommand)> {
        if let Some(last) = self.last_resync {
            if now.duration_since(last) < self.config.resync_interval {
                return Vec::new();
            }
        }
        self.last_resync = Some(now);

        let floor = self.speed_floor();
        let mut commands = Vec::new();
        let window: Vec<(usize, PieceIndex)> = store
            .missing()
            .iter()
            .take(self.config.resync_window)
            .copied()
            .enumerate()
            .collect();

        for (slot, index) in window {
            let holders: Vec<PeerKey> = sessions
                .iter()
                .filter(|(_, session)| {
                    session.state() != SessionState::Disconnected
                        && session.outstanding().iter().any(|block| block.index == index)
                })
                .map(|(key, _)| *key)
                .collect();

            for key in holders {
                let holder_speed = sessions[&key].speed_bytes_per_sec(now);
                if holder_speed >= floor {
                    continue;
                }
                let replaceable = sessions.iter().any(|(other_key, other)| {
                    *other_key != key
                        && other.is_eligible()
                        && other.in_flight() == 0
                        && other.has(index)
                        && other.speed_bytes_per_sec(now) > holder_speed
                        && self.calc_offset(now, *other_key, sessions, store) <= slot
                });
                if !replaceable {
                    continue;
                }

                let session = sessions.get_mut(&key).expect("holder key exists");
                for block in session.cancel_piece(index) {
                    let length = store.sizeof(block.index, block.offset);
                    store.deselect(block.index, block.offset);
                    self.resyncs += 1;
                    tracing::debug!(
                        "resync: reclaimed piece {index} offset {} from {key}",
                        block.offset
                    );
                    commands.push((
                        key,
                        PeerCommand::Cancel {
                            index: block.index,
                            offset: block.offset,
                            length,
                        },
                    ));
                }
            }
        }
        commands
    }

    /// Expires timed-out requests and enforces peer lifecycle deadlines.
    ///
    /// Run from the heartbeat. A handshake that never completes destroys the
    /// connection. A choke with no matching unchoke destroys it only under
    /// queue pressure (`pending_peers` exceeding free connection slots);
    /// churning connections is wasteful when nothing is queued to replace
    /// them. Timed-out requests are reclaimed and strike the peer; repeated
    /// strikes disconnect it.
    pub fn maintain(
        &mut self,
        now: Instant,
        store: &mut PieceStore,
        sessions: &mut HashMap<PeerKey, PeerSession>,
        pending_peers: usize,
    ) -> MaintainActions {
        let mut actions = MaintainActions::default();
        let live = sessions
            .values()
            .filter(|session| session.state() != SessionState::Disconnected)
            .count();
        let slack = self.config.max_peer_connections.saturating_sub(live);

        for (&key, session) in sessions.iter_mut() {
            match session.state() {
                SessionState::Disconnected => continue,
                SessionState::Handshaking => {
                    if now.duration_since(session.connected_at()) >= self.config.handshake_timeout {
                        tracing::debug!("{key} never completed handshake, destroying");
                        actions.disconnects.push(key);
                    }
                    continue;
                }
                SessionState::Choked => {
                    let overdue = session.choked_since().is_some_and(|since| {
                        now.duration_since(since) >= self.config.choke_timeout
                    });
                    if overdue && pending_peers > slack {
                        tracing::debug!("{key} choked too long under queue pressure, destroying");
                        actions.disconnects.push(key);
                        continue;
                    }
                }
                SessionState::Idle | SessionState::Requesting => {}
            }

            for block in session.expire_requests(now, self.config.request_timeout) {
                let length = store.sizeof(block.index, block.offset);
                store.deselect(block.index, block.offset);
                tracing::warn!(
                    "request timeout: piece {} offset {} on {key}",
                    block.index,
                    block.offset
                );
                actions.commands.push((
                    key,
                    PeerCommand::Cancel {
                        index: block.index,
                        offset: block.offset,
                        length,
                    },
                ));
            }
            if session.timeout_strikes() >= self.config.timeout_strike_limit {
                actions.disconnects.push(key);
            }
        }

        actions.disconnects.dedup();
        actions
    }

    /// Releases every reservation a session still holds.
    ///
    /// Must run before a session is discarded so other peers can claim the
    /// blocks; deselect is idempotent, so racing cancels are harmless.
    pub fn release_session(store: &mut PieceStore, session: &mut PeerSession) {
        for block in session.drain_outstanding() {
            store.deselect(block.index, block.offset);
        }
    }

    fn pick_block(
        store: &mut PieceStore,
        session: &PeerSession,
        from: usize,
        force: bool,
    ) -> Option<(PieceIndex, u32)> {
        let mut at = from.min(store.missing().len());
        while at < store.missing().len() {
            let index = store.missing()[at];
            if session.has(index) {
                if let Some(offset) = store.select(index, force) {
                    return Some((index, offset));
                }
            }
            at += 1;
        }
        None
    }
}
