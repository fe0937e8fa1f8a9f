use std::time::Duration;

use chrono::Utc;

use crate::bus::EventBus;
use crate::store::OutboxStore;
use crate::Result;

/// Tuning knobs for the outbox publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Interval between polls of the outbox table.
    pub poll_interval: Duration,

    /// Maximum rows picked up per tick.
    pub batch_size: usize,

    /// Publish attempts before a row becomes terminal `Failed`.
    pub max_retries: u32,

    /// Age past which terminal rows are deleted by the sweep.
    pub retention: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 3,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Periodically moves pending outbox rows to the event bus.
///
/// Owns all retry bookkeeping. Ticks are serialized through an internal
/// lock so a slow tick is never overlapped by the next one, which would
/// risk double-publishing the same batch. A crash between the bus publish
/// and `mark_completed` re-sends the same `event_id` on the next tick;
/// consumers dedupe.
pub struct OutboxPublisher<S: OutboxStore, B: EventBus> {
    store: S,
    bus: B,
    config: PublisherConfig,
    tick_guard: tokio::sync::Mutex<()>,
}

impl<S: OutboxStore, B: EventBus> OutboxPublisher<S, B> {
    /// Creates a publisher over the given store and bus.
    pub fn new(store: S, bus: B, config: PublisherConfig) -> Self {
        Self {
            store,
            bus,
            config,
            tick_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs one poll: fetch eligible rows and attempt to publish each.
    ///
    /// Returns the number of rows published this tick. A publish failure is
    /// recorded on the row and does not abort the batch; a storage error
    /// propagates to the caller.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            tracing::debug!("previous tick still running, skipping");
            return Ok(0);
        };

        let batch = self
            .store
            .fetch_batch(self.config.batch_size, self.config.max_retries)
            .await?;

        let mut published = 0;
        for row in batch {
            self.store.mark_processing(row.id).await?;

            let started = std::time::Instant::now();
            match self.bus.publish(&row.to_bus_message()).await {
                Ok(()) => {
                    self.store.mark_completed(row.id).await?;
                    published += 1;
                    metrics::counter!("outbox_published_total").increment(1);
                    metrics::histogram!("outbox_publish_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %row.id,
                        topic = %row.topic,
                        retry_count = row.retry_count,
                        error = %e,
                        "outbox publish failed"
                    );
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    self.store
                        .record_failure(row.id, &e.to_string(), self.config.max_retries)
                        .await?;
                }
            }
        }

        if published > 0 {
            tracing::debug!(published, "outbox tick complete");
        }
        Ok(published)
    }

    /// Requeues rows stranded in `Processing` by a previous crash.
    ///
    /// Run once on startup, before the first poll. The publisher is the
    /// only writer that moves rows to `Processing` and its ticks never
    /// overlap, so anything still there at startup was abandoned mid-tick.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<u64> {
        let requeued = self.store.recover_processing().await?;
        if requeued > 0 {
            tracing::warn!(requeued, "requeued outbox rows stranded in Processing");
        }
        Ok(requeued)
    }

    /// Deletes terminal rows older than the retention window.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let removed = self.store.purge_terminal(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "purged terminal outbox rows");
        }
        Ok(removed)
    }

    /// Polls on a fixed interval until the shutdown future resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        if let Err(e) = self.recover().await {
            tracing::error!(error = %e, "outbox recovery failed");
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "outbox tick failed");
                    }
                }
                () = &mut shutdown => {
                    tracing::info!("outbox publisher shutting down");
                    return;
                }
            }
        }
    }

    /// The store the publisher polls.
    pub fn store(&self) -> &S {
        &self.store
    }
}
