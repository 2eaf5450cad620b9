//! Outbound notification queue
//!
//! Bounded mpsc channel between the workflow and the dispatcher task. Pushing
//! never waits: a full or closed queue drops the notification and counts it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::types::Notification;

/// Delivery counters shared by the queue and its dispatcher
#[derive(Debug, Default)]
pub struct NotifyStats {
    pub enqueued: AtomicU64,
    /// Queue full or dispatcher gone
    pub dropped: AtomicU64,
    pub delivered: AtomicU64,
    /// Attempts beyond the first
    pub retries: AtomicU64,
    /// Gave up after the last attempt
    pub failed: AtomicU64,
}

impl NotifyStats {
    pub fn snapshot(&self) -> NotifyStatsSnapshot {
        NotifyStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub retries: u64,
    pub failed: u64,
}

impl std::fmt::Display for NotifyStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Notify Stats: enqueued={}, dropped={}, delivered={}, retries={}, failed={}",
            self.enqueued, self.dropped, self.delivered, self.retries, self.failed
        )
    }
}

/// Producer side, held by the workflow
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    stats: Arc<NotifyStats>,
}

impl NotificationQueue {
    /// Enqueue without waiting. Returns false if the notification was dropped.
    pub fn push(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    recipient = %n.recipient,
                    kind = %n.kind,
                    "Notification queue full, dropping"
                );
                false
            }
            Err(TrySendError::Closed(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    recipient = %n.recipient,
                    kind = %n.kind,
                    "Notification dispatcher stopped, dropping"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> NotifyStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Consumer side, owned by the dispatcher
pub struct NotificationReceiver {
    rx: mpsc::Receiver<Notification>,
    stats: Arc<NotifyStats>,
}

impl NotificationReceiver {
    /// Next notification; `None` once every queue handle is gone and the buffer is empty
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Buffered notification, if any (for draining at shutdown)
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn stats(&self) -> Arc<NotifyStats> {
        self.stats.clone()
    }
}

/// Create the queue pair. A capacity of zero is raised to one.
pub fn notification_channel(capacity: usize) -> (NotificationQueue, NotificationReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(NotifyStats::default());
    (
        NotificationQueue {
            tx,
            stats: stats.clone(),
        },
        NotificationReceiver { rx, stats },
    )
}
