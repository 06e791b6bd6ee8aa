//! Structured notification events for external formatters
//!
//! The core publishes events describing what happened (exchange, amounts,
//! resulting balances, order ids); rendering a human-readable message and
//! delivering it over a channel is an external consumer's job. Publishing is
//! fire-and-forget: a slow or absent subscriber never blocks a decision path.

pub mod types;

use once_cell::sync::Lazy;
use tokio::sync::broadcast;

use crate::logger::{self, LogTag};
pub use types::{Notification, NotificationEvent};

/// Buffered broadcast bus; slow subscribers lose oldest events, never block
static NOTIFICATION_BUS: Lazy<broadcast::Sender<Notification>> = Lazy::new(|| {
    let (sender, _receiver) = broadcast::channel(256);
    sender
});

/// Publish an event to all subscribers (fire-and-forget)
pub fn notify(event: NotificationEvent) {
    let notification = Notification::new(event);
    logger::debug(
        LogTag::Notify,
        &format!("event: {}", notification.event.kind()),
    );
    // A send error only means nobody is subscribed right now
    let _ = NOTIFICATION_BUS.send(notification);
}

/// Subscribe to the event stream
pub fn subscribe() -> broadcast::Receiver<Notification> {
    NOTIFICATION_BUS.subscribe()
}

/// Console subscriber: logs every event as a single line. Runs until the
/// channel closes; spawned by run.rs as the default consumer.
pub async fn run_log_subscriber() {
    let mut receiver = subscribe();
    loop {
        match receiver.recv().await {
            Ok(notification) => {
                logger::info(LogTag::Notify, &notification.summary());
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                logger::warning(
                    LogTag::Notify,
                    &format!("Notification subscriber lagged, {} events dropped", missed),
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
