use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::{BackendClient, BackendError};
use crate::query_cache::QueryCache;

/// Version token recorded when the backend explicitly reports itself
/// unavailable. Forces a flush, and another one once it comes back.
pub const UNAVAILABLE_VERSION: &str = "currently unavailable";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    Invalidated { version: String },
    Failed,
}

/// Polls the backend's data version and flushes the query cache whenever it
/// moves.
#[derive(Clone)]
pub struct VersionPoller {
    backend: BackendClient,
    cache: QueryCache,
    interval: Duration,
}

pub struct PollerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

impl VersionPoller {
    pub fn new(backend: BackendClient, cache: QueryCache, interval: Duration) -> Self {
        Self {
            backend,
            cache,
            interval,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let version = match self.backend.info(None).await {
            Ok(info) => info.data_version,
            Err(BackendError::Unavailable { message, .. }) => {
                tracing::warn!(%message, "backend reports itself unavailable");
                UNAVAILABLE_VERSION.to_string()
            }
            Err(err) => {
                tracing::warn!(error = %err, "data version poll failed; keeping cache");
                return TickOutcome::Failed;
            }
        };

        let previous = self.cache.observed_version().await;
        if !self.cache.observe_version(&version).await {
            tracing::debug!(version = %version, "data version unchanged");
            return TickOutcome::Unchanged;
        }

        crate::metrics::inc_cache_invalidation();
        tracing::info!(
            previous = %previous,
            version = %version,
            "data version changed; query cache invalidated"
        );
        TickOutcome::Invalidated { version }
    }

    /// Runs [`tick`](Self::tick) on a fixed period until the handle is shut
    /// down. The first tick fires immediately.
    pub fn spawn(self) -> PollerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            tracing::debug!("version poller stopped");
        });

        PollerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}
