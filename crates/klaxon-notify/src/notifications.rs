use crate::plugin::SenderRegistry;
use chrono::Utc;
use klaxon_common::types::{ContactData, ScheduledNotification, TriggerData};
use klaxon_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry backoff ceiling, seconds.
const BACKOFF_CAP: i64 = 3600;

#[derive(Debug, Clone)]
pub struct NotificationsConfig {
    /// Due-set poll cadence; at most one second per the delivery contract.
    pub tick: Duration,
    pub max_retries: u32,
    /// First retry delay, doubled on each subsequent attempt.
    pub retry_backoff: i64,
    pub sender_workers: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: 30,
            sender_workers: 4,
        }
    }
}

/// One grouped dispatch: every due notification for the same contact,
/// trigger and throttle flag, delivered as a single sender call.
struct Package {
    contact: ContactData,
    trigger: TriggerData,
    throttled: bool,
    notifications: Vec<ScheduledNotification>,
}

/// Pops due notifications every tick, groups them by
/// `(contact, trigger, throttled)` and hands each group to a sender worker.
/// Failed sends are rescheduled with exponential backoff until the retry
/// budget runs out.
pub struct FetchNotificationsWorker {
    store: Arc<dyn Store>,
    registry: Arc<SenderRegistry>,
    config: NotificationsConfig,
}

impl FetchNotificationsWorker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SenderRegistry>,
        config: NotificationsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Package>(64);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let workers: Vec<JoinHandle<()>> = (0..self.config.sender_workers.max(1))
            .map(|worker| {
                let store = self.store.clone();
                let registry = self.registry.clone();
                let dispatch_rx = dispatch_rx.clone();
                let config = self.config.clone();
                tokio::spawn(async move {
                    sender_worker(worker, store, registry, dispatch_rx, config).await;
                })
            })
            .collect();

        let mut tick = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.dispatch_due(&dispatch_tx).await;
                }
            }
        }

        // Sender workers drain what was already popped; everything still in
        // the sorted set survives for the next start.
        drop(dispatch_tx);
        for worker in workers {
            let _ = worker.await;
        }
        tracing::info!("Notifications fetcher stopped");
    }

    async fn dispatch_due(&self, dispatch: &mpsc::Sender<Package>) {
        let now = Utc::now().timestamp();
        let due = match self.store.fetch_due_notifications(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch due notifications");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        let mut groups: HashMap<(String, String, bool), Vec<ScheduledNotification>> =
            HashMap::new();
        for notification in due {
            groups
                .entry((
                    notification.contact.id.clone(),
                    notification.trigger.id.clone(),
                    notification.throttled,
                ))
                .or_default()
                .push(notification);
        }

        for (_, mut notifications) in groups {
            notifications.sort_by_key(|n| n.event.timestamp);
            let first = &notifications[0];
            let package = Package {
                contact: first.contact.clone(),
                trigger: first.trigger.clone(),
                throttled: first.throttled,
                notifications,
            };
            if dispatch.send(package).await.is_err() {
                return;
            }
        }
    }
}

async fn sender_worker(
    worker: usize,
    store: Arc<dyn Store>,
    registry: Arc<SenderRegistry>,
    dispatch_rx: Arc<Mutex<mpsc::Receiver<Package>>>,
    config: NotificationsConfig,
) {
    loop {
        let package = { dispatch_rx.lock().await.recv().await };
        let Some(package) = package else {
            tracing::debug!(worker, "Sender worker stopped");
            return;
        };

        let Some(sender) = registry.get(&package.contact.contact_type) else {
            tracing::warn!(
                contact_type = %package.contact.contact_type,
                contact_id = %package.contact.id,
                "No sender for contact type, dropping notification"
            );
            continue;
        };

        let events: Vec<_> = package
            .notifications
            .iter()
            .map(|n| n.event.clone())
            .collect();
        match sender
            .send_events(&events, &package.contact, &package.trigger, package.throttled)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    contact_id = %package.contact.id,
                    trigger_id = %package.trigger.id,
                    events = events.len(),
                    throttled = package.throttled,
                    "Notification dispatched"
                );
            }
            Err(e) => {
                tracing::warn!(
                    contact_id = %package.contact.id,
                    trigger_id = %package.trigger.id,
                    error = %e,
                    "Send failed, rescheduling"
                );
                requeue(&store, package.notifications, &config).await;
            }
        }
    }
}

/// Puts failed notifications back with exponential backoff; drops each one
/// once its retry budget is spent.
async fn requeue(
    store: &Arc<dyn Store>,
    notifications: Vec<ScheduledNotification>,
    config: &NotificationsConfig,
) {
    let now = Utc::now().timestamp();
    for mut notification in notifications {
        notification.retries += 1;
        if notification.retries > config.max_retries {
            tracing::error!(
                contact_id = %notification.contact.id,
                trigger_id = %notification.trigger.id,
                metric = %notification.event.metric,
                retries = notification.retries - 1,
                "Notification dropped after retries were exhausted"
            );
            continue;
        }
        let backoff = (config.retry_backoff << (notification.retries - 1)).min(BACKOFF_CAP);
        notification.send_at = now + backoff;
        if let Err(e) = store.add_notification(&notification).await {
            tracing::error!(error = %e, "Failed to reschedule notification, dropping");
        }
    }
}
