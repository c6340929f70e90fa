use crate::metrics::FilterMetrics;
use crate::MatchedPoint;
use chrono::Utc;
use klaxon_common::types::MetricPoint;
use klaxon_store::{Store, HEARTBEAT_FILTER};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Drains matched points and writes them to the store in batches, flushing
/// on batch size or on the deadline tick, whichever comes first. Each flush
/// also records pattern membership, announces dirty patterns, and beats the
/// filter heartbeat.
pub struct Flusher {
    store: Arc<dyn Store>,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Arc<FilterMetrics>,
}

impl Flusher {
    pub fn new(
        store: Arc<dyn Store>,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<FilterMetrics>,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            flush_interval,
            metrics,
        }
    }

    pub async fn run(
        self,
        mut points: mpsc::Receiver<MatchedPoint>,
        shutdown: CancellationToken,
    ) {
        let mut batch: Vec<MatchedPoint> = Vec::with_capacity(self.batch_size);
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = points.recv() => match received {
                    Some(point) => {
                        batch.push(point);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Final drain of whatever the parser workers already handed off.
        while let Ok(point) = points.try_recv() {
            batch.push(point);
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        tracing::info!("Filter flusher stopped");
    }

    async fn flush(&self, batch: &mut Vec<MatchedPoint>) {
        let points: Vec<MetricPoint> = batch.iter().map(|m| m.point.clone()).collect();
        if let Err(e) = self.store.save_metric_points(&points).await {
            tracing::warn!(error = %e, count = batch.len(), "Failed to save batch, dropping");
            for _ in batch.drain(..) {
                self.metrics.mark_dropped();
            }
            return;
        }

        let mut touched = BTreeSet::new();
        for matched in batch.drain(..) {
            for pattern in matched.patterns {
                if let Err(e) = self
                    .store
                    .add_pattern_metric(&pattern, &matched.point.name)
                    .await
                {
                    tracing::warn!(error = %e, pattern = %pattern, "Failed to record pattern metric");
                    continue;
                }
                touched.insert(pattern);
            }
        }
        for pattern in &touched {
            self.store.publish_metric_event(pattern);
        }

        if let Err(e) = self
            .store
            .update_heartbeat(HEARTBEAT_FILTER, Utc::now().timestamp())
            .await
        {
            tracing::warn!(error = %e, "Failed to update filter heartbeat");
        }
    }
}
