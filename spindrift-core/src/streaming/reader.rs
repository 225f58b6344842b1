//! Sequential byte-range reader gated on piece readiness.
//!
//! One reader exists per HTTP range request. It emits the range's bytes in
//! piece order, suspending whenever the lookahead window ahead of the
//! playback head is not yet persisted, and nudges the scheduler's notion of
//! the playback head on every chunk so seeks re-prioritize the download.

use bytes::Bytes;
use futures::Stream;

use crate::engine::StreamEngine;
use crate::storage::StoreError;
use crate::torrent::{EventSubscription, PieceIndex, StoreEvent};

/// Errors surfaced to the HTTP layer by a stream reader.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Requested byte range is empty or outside the selected file.
    #[error("Invalid range: {start}..={end}")]
    InvalidRange {
        /// Requested start offset.
        start: u64,
        /// Requested end offset (inclusive).
        end: u64,
    },

    /// The buffer did not fill within the stall timeout.
    ///
    /// The core only signals the stall; whether to abort the response is the
    /// HTTP layer's call.
    #[error("Stream stalled waiting for piece {index}")]
    Stalled {
        /// Piece the reader is blocked on.
        index: PieceIndex,
    },

    /// The reader was destroyed or the store went away.
    #[error("Stream closed")]
    Closed,

    /// Block store failure other than not-ready.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Sequential reader over one byte range of the selected file.
pub struct StreamReader {
    engine: StreamEngine,
    position: PieceIndex,
    remaining: u64,
    skip: u32,
    buffer_target: u32,
    subscription: Option<EventSubscription<StoreEvent>>,
    destroyed: bool,
}

impl StreamReader {
    /// Creates a reader for `range` (file-relative, inclusive); `None`
    /// covers the whole file.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidRange` - If the range is empty or outside the file
    pub(crate) fn new(
        engine: StreamEngine,
        range: Option<(u64, u64)>,
    ) -> Result<Self, StreamError> {
        let file = engine.selected_file();
        let (start, end) = range.unwrap_or((0, file.length.saturating_sub(1)));
        if start > end || end >= file.length {
            return Err(StreamError::InvalidRange { start, end });
        }

        let piece_length = engine.info().piece_length as u64;
        let position = PieceIndex::new(((start + file.offset) / piece_length) as u32);
        let skip = ((start + file.offset) % piece_length) as u32;
        let remaining = end - start + 1;

        let lookahead = engine.config().stream.lookahead_pieces(engine.info().piece_length);
        let span = lookahead.min(remaining / piece_length);
        let buffer_target = (position.as_u32() as u64 + span)
            .min(engine.selection().end_piece.as_u32() as u64 + 1) as u32;

        let subscription = engine.subscribe_store();
        engine.prioritize(position);

        Ok(Self {
            engine,
            position,
            remaining,
            skip,
            buffer_target,
            subscription: Some(subscription),
            destroyed: false,
        })
    }

    /// Piece index at the reader's head.
    pub fn position(&self) -> PieceIndex {
        self.position
    }

    /// Bytes left to emit.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Whether output must wait: some piece in the lookahead window, or the
    /// current piece itself, is not yet persisted.
    fn buffering(&self) -> bool {
        for raw in self.position.as_u32()..self.buffer_target {
            if !self.engine.is_piece_readable(PieceIndex::new(raw)) {
                return true;
            }
        }
        !self.engine.is_piece_readable(self.position)
    }

    /// Emits the next chunk, or `None` at end of range.
    ///
    /// Suspends on store notifications while buffering; a wakeup for an
    /// unrelated piece just re-checks and sleeps again. Waiting longer than
    /// the configured stall timeout surfaces [`StreamError::Stalled`].
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.destroyed {
            return Err(StreamError::Closed);
        }
        if self.remaining == 0 {
            return Ok(None);
        }

        // Keep the scheduler's playback head in step with consumption; this
        // is what makes a seek re-prioritize the swarm.
        self.engine.prioritize(self.position);

        let stall = self.engine.config().stream.stall_timeout;
        loop {
            while self.buffering() {
                self.wait_for_store_event(stall).await?;
            }

            let piece_size = self.engine.piece_size(self.position);
            let length = piece_size.saturating_sub(self.skip) as usize;
            match self.engine.read_piece(self.position, self.skip, length).await {
                Ok(mut data) => {
                    if data.len() as u64 > self.remaining {
                        data.truncate(self.remaining as usize);
                    }
                    self.remaining -= data.len() as u64;
                    self.skip = 0;
                    self.position = PieceIndex::new(self.position.as_u32() + 1);
                    return Ok(Some(data));
                }
                // Readable raced persistence settling: keep buffering.
                Err(StoreError::NotReady { .. }) => {
                    self.wait_for_store_event(stall).await?;
                }
                Err(err) => return Err(StreamError::Store(err)),
            }
        }
    }

    async fn wait_for_store_event(
        &mut self,
        stall: std::time::Duration,
    ) -> Result<(), StreamError> {
        let subscription = self.subscription.as_mut().ok_or(StreamError::Closed)?;
        match tokio::time::timeout(stall, subscription.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(StreamError::Closed),
            Err(_) => Err(StreamError::Stalled {
                index: self.position,
            }),
        }
    }

    /// Closes the reader and deregisters its store subscription.
    ///
    /// Any in-flight wakeup becomes a no-op; calling this more than once is
    /// harmless.
    pub fn destroy(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.engine.unsubscribe_store(subscription.id());
        }
        self.destroyed = true;
    }

    /// Adapts the reader into a `futures::Stream` of chunks for HTTP bodies.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamError>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, reader))),
                Ok(None) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.destroy();
    }
}
