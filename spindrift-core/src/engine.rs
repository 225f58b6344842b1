//! Engine wiring: peer events in, wire commands out.
//!
//! One logical scheduler guards all piece and session state behind a single
//! mutex; peer socket I/O runs freely outside it. Commands are computed
//! under the lock and dispatched to transport handles after release, so a
//! slow peer's writer never stalls scheduling for everyone else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::SpindriftConfig;
use crate::storage::BlockStore;
use crate::streaming::{StreamError, StreamReader};
use crate::torrent::{
    EventSubscription, FileInfo, FileSelection, PeerCommand, PeerEvent, PeerKey, PeerSession,
    PeerTransport, PieceIndex, PieceStore, RequestScheduler, SessionState, StoreEvent,
    TorrentError, TorrentInfo, select_file,
};

/// Observable engine counters, surfaced over the stats endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    /// Live peer connections.
    pub connected_peers: usize,
    /// Peers currently unchoked and schedulable.
    pub unchoked_peers: usize,
    /// Peers queued by the swarm but not yet connected.
    pub pending_peers: usize,
    /// Total payload bytes downloaded.
    pub downloaded_bytes: u64,
    /// Pieces verified and persisted.
    pub pieces_persisted: u64,
    /// Completed pieces rejected by the block store.
    pub pieces_rejected: u64,
    /// Pieces still missing from the current selection.
    pub pieces_missing: usize,
    /// Requests cancelled and reassigned away from slow peers.
    pub resyncs: u64,
    /// Piece index at the playback head.
    pub position: u32,
}

struct EngineState {
    store: PieceStore,
    scheduler: RequestScheduler,
    sessions: HashMap<PeerKey, PeerSession>,
    links: HashMap<PeerKey, Arc<dyn PeerTransport>>,
    pending_peers: usize,
}

/// Shared handle to the download engine.
///
/// Cheap to clone; all clones share one scheduler state. The swarm
/// collaborator feeds [`PeerEvent`]s in, the block store confirms
/// persistence, and HTTP readers come out of [`open_stream`](Self::open_stream).
#[derive(Clone)]
pub struct StreamEngine {
    info: Arc<TorrentInfo>,
    config: Arc<SpindriftConfig>,
    state: Arc<Mutex<EngineState>>,
    block_store: Arc<dyn BlockStore>,
    next_peer_key: Arc<AtomicU64>,
}

impl StreamEngine {
    /// Creates an engine streaming one file of the torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidSelection` - If `file_index` is out of range
    pub fn new(
        info: Arc<TorrentInfo>,
        config: SpindriftConfig,
        block_store: Arc<dyn BlockStore>,
        file_index: usize,
    ) -> Result<Self, TorrentError> {
        let selection = select_file(&info, file_index)?;
        let store = PieceStore::new(info.clone(), selection);
        let scheduler = RequestScheduler::new(config.torrent.clone());
        Ok(Self {
            info,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(EngineState {
                store,
                scheduler,
                sessions: HashMap::new(),
                links: HashMap::new(),
                pending_peers: 0,
            })),
            block_store,
            next_peer_key: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Torrent descriptor this engine serves.
    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    /// Engine configuration.
    pub fn config(&self) -> &SpindriftConfig {
        &self.config
    }

    /// Persistence collaborator.
    pub fn block_store(&self) -> Arc<dyn BlockStore> {
        self.block_store.clone()
    }

    /// Current file selection.
    pub fn selection(&self) -> FileSelection {
        self.state.lock().store.selection()
    }

    /// Descriptor of the currently selected file.
    pub fn selected_file(&self) -> FileInfo {
        let selection = self.selection();
        self.info.files[selection.file_index].clone()
    }

    /// Switches the engine to another file of the torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidSelection` - If `file_index` is out of range
    pub fn select_file(&self, file_index: usize) -> Result<FileSelection, TorrentError> {
        let selection = select_file(&self.info, file_index)?;
        self.state.lock().store.select_file(selection);
        Ok(selection)
    }

    /// Allocates a fresh key for an incoming connection.
    pub fn allocate_peer_key(&self) -> PeerKey {
        PeerKey(self.next_peer_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers an accepted connection that has not yet handshaken.
    pub fn peer_connecting(&self, key: PeerKey, transport: Arc<dyn PeerTransport>) {
        let mut guard = self.state.lock();
        let session = PeerSession::new(
            Instant::now(),
            self.info.piece_count as usize,
            self.config.torrent.speed_window,
        );
        guard.sessions.insert(key, session);
        guard.links.insert(key, transport);
        tracing::debug!("{key} connecting");
    }

    /// Updates the swarm's pending-connection count, which gates how
    /// aggressively choked peers are destroyed.
    pub fn set_pending_peers(&self, pending: usize) {
        self.state.lock().pending_peers = pending;
    }

    /// Processes one decoded protocol event from a peer connection.
    pub async fn handle_peer_event(&self, key: PeerKey, event: PeerEvent) {
        let mut serve: Option<(PieceIndex, u32, u32)> = None;
        let mut completed: Option<(PieceIndex, Bytes)> = None;

        let commands = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let now = Instant::now();
            let mut commands: Vec<(PeerKey, PeerCommand)> = Vec::new();

            match event {
                PeerEvent::HandshakeComplete => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.handshake_complete(now);
                        commands.push((
                            key,
                            PeerCommand::Bitfield {
                                bits: state.store.persisted_bitfield(),
                            },
                        ));
                        commands.push((key, PeerCommand::Unchoke));
                    }
                }
                PeerEvent::Choke => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.choke(now);
                    }
                }
                PeerEvent::Unchoke => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.unchoke();
                    }
                }
                PeerEvent::Have { index } => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.record_have(index);
                    }
                }
                PeerEvent::Bitfield { bits } => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.set_bitfield(&bits);
                    }
                }
                PeerEvent::Block { index, offset, data } => {
                    if let Some(session) = state.sessions.get_mut(&key) {
                        session.complete_request(index, offset);
                        session.record_downloaded(now, data.len());
                    }
                    completed = state
                        .store
                        .write(index, offset, &data)
                        .map(|payload| (index, payload));
                    if completed.is_some() {
                        // Duplicate requests for the finished piece are dead weight.
                        commands.extend(Self::cancel_piece_requests(state, index));
                    }
                }
                PeerEvent::Request { index, offset, length } => {
                    serve = Some((index, offset, length));
                }
                PeerEvent::Disconnected => {
                    tracing::debug!("{key} disconnected");
                    Self::destroy_session(state, key);
                }
            }

            commands.extend(state.scheduler.tick(now, &mut state.store, &mut state.sessions));
            commands
        };
        self.dispatch(commands).await;

        if let Some((index, payload)) = completed {
            self.persist_piece(index, payload).await;
        }
        if let Some((index, offset, length)) = serve {
            self.serve_block(key, index, offset, length).await;
        }
    }

    /// Records that the block store holds a verified copy of `index`.
    ///
    /// Called after our own persists and for out-of-band notifications, e.g.
    /// pieces recovered by the store while resuming a previous download.
    pub async fn on_persisted(&self, index: PieceIndex) {
        let commands = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.store.mark_persisted(index) {
                let mut commands = Self::cancel_piece_requests(state, index);
                for &key in state.links.keys() {
                    commands.push((key, PeerCommand::Have { index }));
                }
                commands.extend(state.scheduler.tick(
                    Instant::now(),
                    &mut state.store,
                    &mut state.sessions,
                ));
                commands
            } else {
                Vec::new()
            }
        };
        self.dispatch(commands).await;
    }

    /// Resets a piece whose persistence was rejected so it re-downloads.
    pub async fn on_persist_failed(&self, index: PieceIndex) {
        let commands = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.store.reset_piece(index);
            state
                .scheduler
                .tick(Instant::now(), &mut state.store, &mut state.sessions)
        };
        self.dispatch(commands).await;
    }

    /// Runs one maintenance pass: request timeouts, lifecycle deadlines, and
    /// a scheduling tick.
    pub async fn heartbeat(&self) {
        let (commands, closes) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let now = Instant::now();
            let actions =
                state
                    .scheduler
                    .maintain(now, &mut state.store, &mut state.sessions, state.pending_peers);

            let mut closes = Vec::new();
            for key in &actions.disconnects {
                if let Some(link) = state.links.get(key) {
                    closes.push(link.clone());
                }
                Self::destroy_session(state, *key);
            }

            let mut commands = actions.commands;
            commands.extend(state.scheduler.tick(now, &mut state.store, &mut state.sessions));
            (commands, closes)
        };
        self.dispatch(commands).await;
        for link in closes {
            let _ = link.send(PeerCommand::Close).await;
        }
    }

    /// Spawns the periodic heartbeat task.
    pub fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let period = self.config.torrent.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                engine.heartbeat().await;
            }
        })
    }

    /// Opens a sequential reader over a byte range of the selected file.
    ///
    /// `range` is file-relative and inclusive; `None` covers the whole file.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidRange` - If the range is empty or outside the file
    pub fn open_stream(&self, range: Option<(u64, u64)>) -> Result<StreamReader, StreamError> {
        StreamReader::new(self.clone(), range)
    }

    /// Subscribes to store notifications (readable pieces, progress, finish).
    pub fn subscribe_store(&self) -> EventSubscription<StoreEvent> {
        self.state.lock().store.subscribe()
    }

    /// Explicitly removes a store subscriber.
    pub fn unsubscribe_store(&self, id: u64) {
        self.state.lock().store.unsubscribe(id);
    }

    /// Whether a piece is persisted and readable.
    pub fn is_piece_readable(&self, index: PieceIndex) -> bool {
        self.state.lock().store.is_readable(index)
    }

    /// Reads `length` bytes at `offset` within a persisted piece.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotReady` - If the piece is not yet persisted
    /// - `StoreError::Io` - If the block store read failed
    pub async fn read_piece(
        &self,
        index: PieceIndex,
        offset: u32,
        length: usize,
    ) -> Result<Bytes, crate::storage::StoreError> {
        self.block_store.read(index, offset, length).await
    }

    /// Moves the playback head, reordering the missing list around it.
    pub fn prioritize(&self, index: PieceIndex) {
        self.state.lock().store.prioritize(index);
    }

    /// Actual size of a piece in bytes.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        self.info.piece_size(index)
    }

    /// Observable counters.
    pub fn stats(&self) -> EngineStats {
        let guard = self.state.lock();
        let connected = guard
            .sessions
            .values()
            .filter(|session| session.state() != SessionState::Disconnected)
            .count();
        let unchoked = guard
            .sessions
            .values()
            .filter(|session| session.is_eligible())
            .count();
        let downloaded = guard
            .sessions
            .values()
            .map(|session| session.downloaded_bytes())
            .sum();
        EngineStats {
            connected_peers: connected,
            unchoked_peers: unchoked,
            pending_peers: guard.pending_peers,
            downloaded_bytes: downloaded,
            pieces_persisted: guard.store.pieces_persisted(),
            pieces_rejected: guard.store.pieces_rejected(),
            pieces_missing: guard.store.missing().len(),
            resyncs: guard.scheduler.stats().resyncs,
            position: guard.store.position().as_u32(),
        }
    }

    async fn persist_piece(&self, index: PieceIndex, payload: Bytes) {
        match self.block_store.persist(index, payload).await {
            Ok(()) => self.on_persisted(index).await,
            Err(err) => {
                tracing::warn!("persisting piece {index} failed: {err}");
                self.on_persist_failed(index).await;
            }
        }
    }

    async fn serve_block(&self, key: PeerKey, index: PieceIndex, offset: u32, length: u32) {
        if !self.block_store.is_persisted(index) {
            tracing::trace!("{key} requested unpersisted piece {index}, dropping");
            return;
        }
        match self.read_piece(index, offset, length as usize).await {
            Ok(data) => {
                self.dispatch(vec![(key, PeerCommand::Piece { index, offset, data })])
                    .await;
            }
            Err(err) => tracing::debug!("serving piece {index} to {key} failed: {err}"),
        }
    }

    async fn dispatch(&self, commands: Vec<(PeerKey, PeerCommand)>) {
        for (key, command) in commands {
            let link = self.state.lock().links.get(&key).cloned();
            let Some(link) = link else { continue };
            if let Err(err) = link.send(command).await {
                tracing::debug!("sending to {key} failed: {err}");
            }
        }
    }

    fn cancel_piece_requests(
        state: &mut EngineState,
        index: PieceIndex,
    ) -> Vec<(PeerKey, PeerCommand)> {
        let mut commands = Vec::new();
        for (&key, session) in state.sessions.iter_mut() {
            for block in session.cancel_piece(index) {
                let length = state.store.sizeof(index, block.offset);
                state.store.deselect(index, block.offset);
                commands.push((
                    key,
                    PeerCommand::Cancel {
                        index,
                        offset: block.offset,
                        length,
                    },
                ));
            }
        }
        commands
    }

    fn destroy_session(state: &mut EngineState, key: PeerKey) {
        if let Some(mut session) = state.sessions.remove(&key) {
            RequestScheduler::release_session(&mut state.store, &mut session);
        }
        state.links.remove(&key);
    }
}
