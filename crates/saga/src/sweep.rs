//! Periodic detection of sagas stuck in a non-terminal status.

use std::time::Duration;

use chrono::Utc;

use crate::record::Saga;
use crate::store::SagaStore;
use crate::Result;

/// Flags sagas whose `updated_at` has not moved for longer than the stall
/// threshold.
///
/// Detection only: a stalled saga is surfaced through logs and metrics for
/// an operator to resolve. The sweep never transitions sagas itself,
/// because a stall usually means a lost message or a crashed participant
/// and the safe remediation depends on which.
pub struct StalledSagaSweep<S: SagaStore> {
    store: S,
    stall_after: Duration,
    interval: Duration,
}

impl<S: SagaStore> StalledSagaSweep<S> {
    /// Creates a sweep with the given stall threshold and polling interval.
    pub fn new(store: S, stall_after: Duration, interval: Duration) -> Self {
        Self {
            store,
            stall_after,
            interval,
        }
    }

    /// Runs one detection pass and returns the stalled sagas found.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<Vec<Saga>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stall_after)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let stalled = self.store.find_stalled(cutoff).await?;

        for saga in &stalled {
            tracing::warn!(
                saga_id = %saga.id,
                saga_type = %saga.saga_type,
                status = %saga.status,
                updated_at = %saga.updated_at,
                "saga appears stalled"
            );
        }
        metrics::gauge!("saga_stalled").set(stalled.len() as f64);

        Ok(stalled)
    }

    /// Sweeps on the configured interval until the shutdown future resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "stalled saga sweep failed");
                    }
                }
                () = &mut shutdown => {
                    tracing::info!("stalled saga sweep shutting down");
                    return;
                }
            }
        }
    }
}
