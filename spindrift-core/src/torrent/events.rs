//! Typed publish/subscribe for store notifications.
//!
//! A small observer list with deterministic, insertion-ordered dispatch and
//! explicit unsubscribe. Stream readers and the web layer subscribe here to
//! learn when pieces become readable instead of polling the store.

use tokio::sync::mpsc;

use super::PieceIndex;

/// Notifications published by the piece store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A piece was persisted and its bytes can now be read.
    PieceReadable(PieceIndex),
    /// The contiguous run written from the start of a piece advanced.
    Progress {
        /// Piece whose leading run grew.
        index: PieceIndex,
        /// Bytes contiguously written from offset 0.
        contiguous: u32,
    },
    /// Every piece of the current selection is persisted.
    Finished,
}

/// Ordered observer list for one event type.
///
/// Publishing never blocks: each subscriber is backed by an unbounded
/// channel, and subscribers whose receiving side has gone away are pruned on
/// the next publish.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

impl<T: Clone> EventBus<T> {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }

    /// Registers a new subscriber and returns its receiving half.
    pub fn subscribe(&mut self) -> EventSubscription<T> {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push((id, tx));
        EventSubscription { id, receiver: rx }
    }

    /// Removes a subscriber by id. No-op for unknown ids.
    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Delivers `event` to every live subscriber, in subscription order.
    pub fn publish(&mut self, event: T) {
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of an [`EventBus`] subscription.
///
/// Dropping the subscription is equivalent to unsubscribing: the bus prunes
/// the dead sender on its next publish.
#[derive(Debug)]
pub struct EventSubscription<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
}

impl<T> EventSubscription<T> {
    /// Identifier for explicit [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event; `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for draining queued events.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let mut bus: EventBus<StoreEvent> = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(StoreEvent::PieceReadable(PieceIndex::new(7)));

        assert_eq!(
            first.recv().await,
            Some(StoreEvent::PieceReadable(PieceIndex::new(7)))
        );
        assert_eq!(
            second.recv().await,
            Some(StoreEvent::PieceReadable(PieceIndex::new(7)))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let mut bus: EventBus<StoreEvent> = EventBus::new();
        let mut sub = bus.subscribe();
        bus.unsubscribe(sub.id());

        bus.publish(StoreEvent::Finished);
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscriber_pruned_on_publish() {
        let mut bus: EventBus<StoreEvent> = EventBus::new();
        let sub = bus.subscribe();
        drop(sub);

        bus.publish(StoreEvent::Finished);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
