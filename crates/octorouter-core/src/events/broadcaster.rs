//! Event broadcaster for pipeline events.
//!
//! The `EventBroadcaster` is the bus stages publish routing decisions on.
//! Sending never fails and never blocks; with no subscribers events are dropped.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::PipelineEvent;

/// Default buffer size for the broadcast channel.
/// Events beyond this limit will cause older events to be dropped for slow receivers.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Broadcaster for pipeline events.
///
/// Cloning is cheap and every clone publishes to the same channel.
///
/// # Example
///
/// ```
/// use octorouter_core::events::{EventBroadcaster, PipelineEvent};
/// use octorouter_core::ReportId;
///
/// let broadcaster = EventBroadcaster::new();
/// let mut receiver = broadcaster.subscribe();
///
/// broadcaster.send(PipelineEvent::no_receivers(ReportId::new(), "covid-19".into(), None));
/// assert!(receiver.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new broadcaster wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns 0 if there are no active subscribers.
    pub fn send(&self, event: PipelineEvent) -> usize {
        tracing::debug!(
            event = event.name(),
            report_id = %event.report_id(),
            "Pipeline event"
        );
        self.sender.send(event).unwrap_or_default()
    }

    /// Send several events in order.
    pub fn send_all(&self, events: impl IntoIterator<Item = PipelineEvent>) -> usize {
        events.into_iter().map(|event| self.send(event)).sum()
    }

    /// Subscribe to events.
    ///
    /// Events sent before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
