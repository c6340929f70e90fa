use crate::index::IndexHandle;
use crate::metrics::FilterMetrics;
use crate::parser::parse_line;
use crate::MatchedPoint;
use klaxon_common::types::MetricPoint;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pool of parser workers: each drains the raw line channel, parses and
/// matches against the current index snapshot, and forwards matched points
/// to the flusher. Misses and malformed lines are dropped after counting.
pub struct ParserPool {
    index: Arc<IndexHandle>,
    metrics: Arc<FilterMetrics>,
    /// Retention stamped on every accepted point, in seconds.
    retention: i64,
}

impl ParserPool {
    pub fn new(index: Arc<IndexHandle>, metrics: Arc<FilterMetrics>, retention: i64) -> Self {
        Self {
            index,
            metrics,
            retention,
        }
    }

    pub fn spawn(
        self,
        worker_count: usize,
        lines: mpsc::Receiver<String>,
        points: mpsc::Sender<MatchedPoint>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let pool = Arc::new(self);
        let lines = Arc::new(Mutex::new(lines));
        (0..worker_count.max(1))
            .map(|worker| {
                let pool = pool.clone();
                let lines = lines.clone();
                let points = points.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    pool.work(worker, lines, points, token).await;
                })
            })
            .collect()
    }

    async fn work(
        &self,
        worker: usize,
        lines: Arc<Mutex<mpsc::Receiver<String>>>,
        points: mpsc::Sender<MatchedPoint>,
        shutdown: CancellationToken,
    ) {
        loop {
            let line = tokio::select! {
                line = async { lines.lock().await.recv().await } => line,
                _ = shutdown.cancelled() => None,
            };
            let Some(line) = line else {
                tracing::debug!(worker, "Parser worker stopped");
                return;
            };
            self.handle_line(&line, &points);
        }
    }

    fn handle_line(&self, line: &str, points: &mpsc::Sender<MatchedPoint>) {
        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed line");
                self.metrics.mark_dropped();
                return;
            }
        };
        self.metrics.mark_valid();

        let patterns = self.index.current().match_name(&parsed.name);
        if patterns.is_empty() {
            return;
        }
        self.metrics.mark_matched();

        let matched = MatchedPoint {
            point: MetricPoint {
                name: parsed.name,
                timestamp: parsed.timestamp,
                value: parsed.value,
                retention: self.retention,
            },
            patterns,
        };
        if points.try_send(matched).is_err() {
            self.metrics.mark_dropped();
        }
    }
}
