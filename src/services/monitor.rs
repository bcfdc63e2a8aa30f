//! Chunk queue change monitoring
//!
//! The queue is polled at a configurable interval. Hosts that learn about new
//! or changed chunk messages directly push notifications through
//! [`QueueMonitor::notification_sender`] instead of waiting for the next poll.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::MonitorConfig;

/// Change notification types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeNotification {
    /// A chunk message was added or changed
    MessageChanged { directory: String, entry_id: String },
    /// Something in the queue of a directory changed
    DirectoryChanged { directory: String },
    /// Time for a poll check of every directory
    PollTrigger,
    /// Rebuild every directory from scratch
    FullResync,
    /// Monitor is stopping
    Shutdown,
}

/// Polling monitor for the chunk queues
pub struct QueueMonitor {
    config: MonitorConfig,
    running: Arc<AtomicBool>,
    notification_tx: Sender<ChangeNotification>,
}

impl QueueMonitor {
    pub fn new(config: MonitorConfig) -> (Self, Receiver<ChangeNotification>) {
        let (tx, rx) = flume::unbounded();

        let monitor = Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            notification_tx: tx,
        };

        (monitor, rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark monitor as running (call before spawning the monitor task)
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop the monitor and the worker consuming its notifications
    pub fn stop(&self) {
        info!("Stopping queue monitor");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.notification_tx.send(ChangeNotification::Shutdown);
    }

    /// Get the notification sender (for external triggers)
    pub fn notification_sender(&self) -> Sender<ChangeNotification> {
        self.notification_tx.clone()
    }

    /// Run the polling loop until [`QueueMonitor::stop`] is called
    ///
    /// The running flag must be set via `mark_running()` first.
    pub async fn start(&self) {
        let interval = tokio::time::Duration::from_secs(self.config.poll_interval_seconds.max(1));
        let mut poll_interval = tokio::time::interval(interval);

        info!("Starting queue poll loop (interval: {:?})", interval);

        let mut poll_count = 0u64;
        let start_time = std::time::Instant::now();

        while self.running.load(Ordering::SeqCst) {
            poll_interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            poll_count += 1;
            debug!("Poll tick #{} (elapsed: {:?})", poll_count, start_time.elapsed());

            if let Err(e) = self.notification_tx.send(ChangeNotification::PollTrigger) {
                error!("Failed to send poll trigger #{}: {}", poll_count, e);
                break;
            }
        }

        info!(
            "Poll loop stopped after {} polls over {:?}",
            poll_count,
            start_time.elapsed()
        );
    }
}
