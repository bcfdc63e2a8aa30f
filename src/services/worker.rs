use flume::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::logger::fmt_ms;
use super::monitor::ChangeNotification;
use crate::state::SyncManager;

/// Consume change notifications until `Shutdown` or until every sender is gone
///
/// Data of directories nobody registered is removed before the first
/// notification is handled.
pub async fn run(manager: Arc<SyncManager>, rx: Receiver<ChangeNotification>) {
    info!("GAB worker started");

    match manager.check_unused().await {
        Ok(removed) if !removed.is_empty() => info!("Removed unused directories: {:?}", removed),
        Ok(_) => {}
        Err(e) => error!("Failed to check for unused directories: {}", e),
    }

    while let Ok(notification) = rx.recv_async().await {
        if !handle_notification(&manager, notification).await {
            break;
        }
    }

    info!("GAB worker stopped");
}

/// Handle one notification. Returns false when the worker should stop.
pub async fn handle_notification(
    manager: &Arc<SyncManager>,
    notification: ChangeNotification,
) -> bool {
    match notification {
        ChangeNotification::PollTrigger => {
            debug!("Poll trigger received, processing all directories");
            process_all(manager).await;
        }
        ChangeNotification::DirectoryChanged { directory } => {
            process_one(manager, &directory, None).await;
        }
        ChangeNotification::MessageChanged {
            directory,
            entry_id,
        } => {
            process_one(manager, &directory, Some(entry_id)).await;
        }
        ChangeNotification::FullResync => {
            let results = manager.full_resync_all().await;
            info!("Full resync finished for {} directories", results.len());
        }
        ChangeNotification::Shutdown => {
            info!("Shutdown notification received");
            return false;
        }
    }
    true
}

async fn process_one(manager: &SyncManager, directory: &str, entry_id: Option<String>) {
    let start = Instant::now();
    match manager.process(directory, entry_id).await {
        Ok(summary) => debug!(
            "Processed {} in {}: {} applied, {} up to date, {} stale, {} failed",
            directory,
            fmt_ms(start.elapsed()),
            summary.applied,
            summary.up_to_date,
            summary.stale,
            summary.failed
        ),
        Err(e) => warn!("Failed to process {}: {}", directory, e),
    }
}

/// Process every registered directory, directories in parallel
async fn process_all(manager: &Arc<SyncManager>) {
    let mut tasks = JoinSet::new();
    for directory in manager.directories().await {
        let manager = manager.clone();
        tasks.spawn(async move {
            process_one(&manager, &directory, None).await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Directory processing task failed: {}", e);
        }
    }
}
