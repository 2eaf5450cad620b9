//! Outbound notifications: the queue the workflow pushes to and the task that drains it.

pub mod dispatcher;
pub mod queue;
pub mod types;

pub use dispatcher::{LoggingNotifier, NotificationDispatcher, Notifier, NotifyError};
pub use queue::{NotificationQueue, NotificationReceiver, NotifyStatsSnapshot, notification_channel};
pub use types::{Notification, NotificationBody, NotificationKind};
