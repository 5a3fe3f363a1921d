//! Background scan that drops chunks whose document no longer exists.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use ragfuse_core::{DocumentStore, Result};

/// Removes orphaned chunks from a store.
///
/// Document deletion already cascades to chunks; this is the backstop for
/// anything that slipped past it. Runs are idempotent.
pub struct ConsistencyReconciler<S> {
    store: Arc<S>,
}

impl<S> ConsistencyReconciler<S>
where
    S: DocumentStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Run a single scan, returning the number of chunks removed.
    pub async fn run_once(&self) -> Result<u64> {
        let start = Instant::now();
        let removed = self.store.remove_orphaned_chunks().await?;

        if removed > 0 {
            info!(
                "Reconciliation removed {} orphaned chunks in {}ms",
                removed,
                start.elapsed().as_millis()
            );
        } else {
            debug!("Reconciliation found no orphaned chunks");
        }

        Ok(removed)
    }

    /// Run a scan every `interval` until the returned handle is aborted.
    ///
    /// Failed scans are logged and retried on the next tick.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("Reconciliation failed: {}", e);
                }
            }
        })
    }
}
