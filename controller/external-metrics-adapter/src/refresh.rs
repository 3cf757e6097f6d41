//! Background configuration refresh

use crate::source::ConfigSource;
use crate::store::ConfigStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically refreshes a [`ConfigStore`] from a [`ConfigSource`]
pub struct RefreshLoop;

impl RefreshLoop {
    /// Spawn the loop; the first refresh runs immediately.
    ///
    /// Failures of a cycle are logged and never end the loop.
    pub fn spawn(
        store: ConfigStore,
        source: Arc<dyn ConfigSource>,
        interval: Duration,
    ) -> RefreshHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting configuration refresh loop");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.refresh(source.as_ref()).await {
                            Ok(summary) => debug!(?summary, "Configuration refresh completed"),
                            Err(e) => warn!(error = %e, "Configuration refresh failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Configuration refresh loop stopped");
        });

        RefreshHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running [`RefreshLoop`]
pub struct RefreshHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Stop the loop and wait for the in-flight cycle to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Configuration refresh task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
