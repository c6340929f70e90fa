use crate::check::TriggerChecker;
use chrono::Utc;
use klaxon_store::{Store, HEARTBEAT_CHECKER};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Feeds the check worker pool from three sources: the due-trigger sorted
/// set, metric-event announcements (dirty patterns), and a periodic full
/// sweep that guarantees idle triggers still reach their TTL state.
pub struct CheckScheduler {
    store: Arc<dyn Store>,
    checker: Arc<TriggerChecker>,
    poll_interval: Duration,
    sweep_interval: Duration,
    worker_count: usize,
    queue_capacity: usize,
}

impl CheckScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        checker: Arc<TriggerChecker>,
        poll_interval: Duration,
        sweep_interval: Duration,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            store,
            checker,
            poll_interval,
            sweep_interval,
            worker_count: worker_count.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let (work_tx, work_rx) = mpsc::channel::<String>(self.queue_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let workers: Vec<JoinHandle<()>> = (0..self.worker_count)
            .map(|worker| {
                let checker = self.checker.clone();
                let work_rx = work_rx.clone();
                let token = shutdown.clone();
                tokio::spawn(async move {
                    check_worker(worker, checker, work_rx, token).await;
                })
            })
            .collect();

        let mut metric_events = self.store.subscribe_metric_events();
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut sweep = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    self.poll_due(&work_tx).await;
                }
                _ = sweep.tick() => {
                    self.sweep_all(&work_tx).await;
                }
                received = metric_events.recv() => {
                    self.handle_metric_event(received, &work_tx).await;
                }
            }
        }

        drop(work_tx);
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("Check scheduler stopped");
    }

    async fn poll_due(&self, work: &mpsc::Sender<String>) {
        let now = Utc::now().timestamp();
        if let Err(e) = self.store.update_heartbeat(HEARTBEAT_CHECKER, now).await {
            tracing::warn!(error = %e, "Failed to update checker heartbeat");
        }
        match self.store.pop_due_triggers(now).await {
            Ok(due) => {
                for trigger_id in due {
                    if work.try_send(trigger_id.clone()).is_err() {
                        // Queue full; push the trigger back so the next poll
                        // picks it up again.
                        if let Err(e) = self.store.reschedule_trigger(&trigger_id, now).await {
                            tracing::warn!(trigger_id = %trigger_id, error = %e, "Failed to requeue trigger");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to pop due triggers"),
        }
    }

    async fn sweep_all(&self, work: &mpsc::Sender<String>) {
        match self.store.get_trigger_ids().await {
            Ok(ids) => {
                tracing::debug!(count = ids.len(), "Full trigger sweep");
                for trigger_id in ids {
                    // Skipped on a full queue; the next sweep retries.
                    let _ = work.try_send(trigger_id);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list triggers for sweep"),
        }
    }

    async fn handle_metric_event(
        &self,
        received: Result<String, broadcast::error::RecvError>,
        work: &mpsc::Sender<String>,
    ) {
        match received {
            Ok(pattern) => match self.store.get_pattern_trigger_ids(&pattern).await {
                Ok(ids) => {
                    for trigger_id in ids {
                        let _ = work.try_send(trigger_id);
                    }
                }
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Failed to resolve pattern triggers");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Metric event stream lagged; sweep will cover the gap");
            }
            Err(broadcast::error::RecvError::Closed) => {}
        }
    }
}

async fn check_worker(
    worker: usize,
    checker: Arc<TriggerChecker>,
    work_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
) {
    loop {
        let trigger_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            id = async { work_rx.lock().await.recv().await } => id,
        };
        let Some(trigger_id) = trigger_id else {
            tracing::debug!(worker, "Check worker stopped");
            return;
        };
        if let Err(e) = checker.check(&trigger_id).await {
            tracing::warn!(trigger_id = %trigger_id, error = %e, "Trigger check errored");
        }
    }
}
