//! Notification fan-out.
//!
//! Drains the engine's [`ChannelSink`](reroll_core::notify::ChannelSink)
//! receiver, publishing each notification on `reroll.notify.<kind>` and
//! appending it to the `PostgreSQL` log when one is configured. Delivery
//! failures are logged and never reach the engine.

use reroll_db::NotificationLog;
use reroll_types::Notification;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Prefix of notification subjects.
pub const NOTIFY_SUBJECT_PREFIX: &str = "reroll.notify";

/// Subject a notification is published on.
pub fn subject_for(notification: &Notification) -> String {
    format!("{NOTIFY_SUBJECT_PREFIX}.{}", notification.kind.name())
}

/// Forward notifications until every sender is dropped.
///
/// Returns how many notifications were forwarded.
pub async fn forward(
    mut rx: UnboundedReceiver<Notification>,
    nats: Option<async_nats::Client>,
    log: Option<NotificationLog>,
) -> u64 {
    let mut forwarded: u64 = 0;
    while let Some(notification) = rx.recv().await {
        if let Some(client) = &nats {
            publish(client, &notification).await;
        }
        if let Some(log) = &log
            && let Err(e) = log.append(&notification).await
        {
            warn!(id = %notification.id, error = %e, "Failed to log notification");
        }
        forwarded = forwarded.saturating_add(1);
    }
    info!(forwarded, "Notification forwarder stopped");
    forwarded
}

async fn publish(client: &async_nats::Client, notification: &Notification) {
    let subject = subject_for(notification);
    let payload = match serde_json::to_vec(notification) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(subject, error = %e, "Failed to encode notification");
            return;
        }
    };
    match client.publish(subject.clone(), payload.into()).await {
        Ok(()) => debug!(subject, "Notification published"),
        Err(e) => warn!(subject, error = %e, "Failed to publish notification"),
    }
}
