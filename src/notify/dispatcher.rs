//! Notification Dispatcher
//!
//! Drains the queue into a [`Notifier`], retrying each message a bounded number of
//! times. Failures stay here: they are logged and counted, never reported back to
//! the request that enqueued the message.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::queue::{NotificationReceiver, NotifyStats, NotifyStatsSnapshot};
use super::types::{Notification, NotificationBody};
use crate::config::NotificationConfig;
use crate::shutdown::ShutdownSignal;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Outbound delivery channel (email, push, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Used when no delivery channel is configured.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let text = match &notification.body {
            NotificationBody::Text(text) => text.clone(),
            NotificationBody::Data(data) => data.to_string(),
        };
        info!(
            recipient = %notification.recipient,
            kind = %notification.kind,
            subject = %notification.subject,
            body = %text,
            "Notification"
        );
        Ok(())
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, config: &NotificationConfig) -> Self {
        Self {
            notifier,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Deliver until shutdown or until every queue handle is dropped.
    ///
    /// On shutdown whatever is already buffered is still delivered.
    pub async fn run(
        self,
        mut rx: NotificationReceiver,
        shutdown: Arc<ShutdownSignal>,
    ) -> NotifyStatsSnapshot {
        let stats = rx.stats();
        info!(notifier = self.notifier.name(), "Notification dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = rx.recv() => match next {
                    Some(n) => self.deliver(&n, &stats).await,
                    None => break,
                },
            }
        }

        while let Some(n) = rx.try_recv() {
            self.deliver(&n, &stats).await;
        }

        let snapshot = stats.snapshot();
        info!(%snapshot, "Notification dispatcher stopped");
        snapshot
    }

    async fn deliver(&self, notification: &Notification, stats: &NotifyStats) {
        for attempt in 1..=self.max_attempts {
            match self.notifier.deliver(notification).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        recipient = %notification.recipient,
                        kind = %notification.kind,
                        attempt,
                        "Notification delivered"
                    );
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        recipient = %notification.recipient,
                        kind = %notification.kind,
                        attempt,
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        recipient = %notification.recipient,
                        kind = %notification.kind,
                        subject = %notification.subject,
                        attempts = attempt,
                        error = %e,
                        "Notification dropped after retries"
                    );
                }
            }
        }
    }
}
