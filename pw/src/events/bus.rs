//! Event bus - pub/sub fan-out for pipeline events
//!
//! Built on tokio broadcast channels: publish never blocks on a slow
//! observer, and a subscriber that lags simply misses events (the session
//! log remains the complete record). Dropping a receiver unsubscribes.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{EventKind, PipelineEvent};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8_192;

/// Central pub/sub bus for pipeline events
///
/// Components publish; observers (feedback, activity feed, TUI) subscribe
/// read-only. Per-session ordering matches publish order.
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Publish an event to all subscribers
    ///
    /// Fire-and-forget: no subscribers is fine, and subscriber failure never
    /// reaches the publisher.
    pub fn publish(&self, event: PipelineEvent) {
        debug!(kind = event.kind().as_str(), session_id = %event.session_id, "EventBus::publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to every event variant
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Subscribe to a subset of event variants
    pub fn subscribe_filtered(&self, kinds: impl IntoIterator<Item = EventKind>) -> FilteredReceiver {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            kinds: kinds.into_iter().collect(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Create a bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}

/// A receiver that yields only the requested event kinds
pub struct FilteredReceiver {
    rx: broadcast::Receiver<PipelineEvent>,
    kinds: Vec<EventKind>,
}

impl FilteredReceiver {
    /// Receive the next matching event
    ///
    /// Lag on the underlying channel is skipped over silently; `None` means
    /// the bus was dropped.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.contains(&event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
