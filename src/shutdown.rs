//! Cooperative shutdown for background tasks

use tokio::sync::watch;

/// Shutdown signal shared by the reaper and the notification dispatcher.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once shutdown is requested (immediately if it already was)
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
