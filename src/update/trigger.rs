//! Periodic update trigger.

use super::UpdateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

/// Handle to a running periodic trigger.
///
/// Dropping the handle stops the trigger at its next wait.
pub struct TriggerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TriggerHandle {
    /// Ask the trigger to stop.
    ///
    /// Observed only between attempts; a running attempt always finishes.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the trigger task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the trigger task to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked or was cancelled.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

pub(super) fn spawn(
    manager: Arc<UpdateManager>,
    initial_delay: Duration,
    interval: Duration,
) -> TriggerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(manager, initial_delay, interval, shutdown_rx));
    TriggerHandle { shutdown_tx, task }
}

async fn run(
    manager: Arc<UpdateManager>,
    initial_delay: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        "Update trigger started: first check in {}s, then every {}s",
        initial_delay.as_secs(),
        interval.as_secs()
    );

    if stop_requested(initial_delay, &mut shutdown_rx).await {
        info!("Update trigger stopped");
        return;
    }

    loop {
        let worker = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || worker.update_lock()).await {
            Ok(Ok(outcome)) => info!("Periodic update check: {outcome}"),
            Ok(Err(e)) => warn!("Periodic update check failed: {e}"),
            Err(e) => error!("Update task aborted: {e}"),
        }

        if stop_requested(interval, &mut shutdown_rx).await {
            break;
        }
    }

    info!("Update trigger stopped");
}

/// Sleep for `duration`; returns `true` if shutdown was requested first.
async fn stop_requested(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        _ = shutdown_rx.wait_for(|stop| *stop) => true,
    }
}
