//! Notification sinks.
//!
//! The engine hands every status change, anti-cheat flag and God Pack
//! event to a [`NotificationSink`] after the corresponding write has
//! committed. Sinks must not block: delivery to chat or a message bus
//! happens elsewhere, typically behind a [`ChannelSink`].

use std::sync::{Mutex, PoisonError};

use reroll_types::Notification;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives engine notifications.
pub trait NotificationSink: Send + Sync {
    /// Accept one notification. Must return promptly.
    fn publish(&self, notification: &Notification);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _notification: &Notification) {}
}

/// Sink that forwards notifications to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    /// Create a sink and the receiver its notifications arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn publish(&self, notification: &Notification) {
        if self.tx.send(notification.clone()).is_err() {
            warn!(kind = notification.kind.name(), "Notification receiver dropped");
        } else {
            debug!(kind = notification.kind.name(), "Notification queued");
        }
    }
}

/// Sink that keeps every notification in memory, for tests and
/// inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of notifications published so far.
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for CollectingSink {
    fn publish(&self, notification: &Notification) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use reroll_types::{GodPackId, NotificationKind, ParticipantId};

    use super::*;

    fn discovery() -> Notification {
        Notification::new(
            Utc::now(),
            NotificationKind::GodPackDiscovered {
                gp_id: GodPackId::new(1),
                discovered_by: ParticipantId::new(2),
            },
        )
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        assert!(sink.is_empty());
        let first = discovery();
        let second = discovery();
        sink.publish(&first);
        sink.publish(&second);
        let seen = sink.notifications();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.first().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        let n = discovery();
        sink.publish(&n);
        assert_eq!(rx.recv().await.unwrap().id, n.id);
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.publish(&discovery());
    }
}
