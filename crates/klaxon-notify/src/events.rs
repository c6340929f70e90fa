use crate::scheduler::Scheduler;
use chrono::Utc;
use klaxon_common::types::EventData;
use klaxon_store::error::StoreResult;
use klaxon_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pop timeout; also the shutdown latency bound of the worker.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Drains the global event list, resolves tag subscriptions and schedules a
/// notification per matching contact.
pub struct FetchEventsWorker {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
}

impl FetchEventsWorker {
    pub fn new(store: Arc<dyn Store>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                fetched = self.store.fetch_event(FETCH_TIMEOUT) => {
                    match fetched {
                        Ok(Some(event)) => {
                            if let Err(e) = self.process_event(&event).await {
                                tracing::warn!(
                                    trigger_id = %event.trigger_id,
                                    error = %e,
                                    "Failed to process event"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to fetch event");
                        }
                    }
                }
            }
        }
        tracing::info!("Event fetcher stopped");
    }

    /// Resolves one event into zero or more scheduled notifications.
    pub async fn process_event(&self, event: &EventData) -> StoreResult<()> {
        let Some(trigger) = self.store.get_trigger(&event.trigger_id).await? else {
            tracing::info!(
                trigger_id = %event.trigger_id,
                "Trigger gone before its event was processed, skipping"
            );
            return Ok(());
        };

        let subscriptions = self.store.get_tag_subscriptions(&trigger.tags).await?;
        tracing::debug!(
            trigger_id = %trigger.id,
            metric = %event.metric,
            subscriptions = subscriptions.len(),
            "Processing event"
        );

        let now = Utc::now().timestamp();
        for subscription in subscriptions {
            if !subscription.sendings_enabled {
                tracing::debug!(subscription_id = %subscription.id, "Sendings disabled, skipping");
                continue;
            }
            if !subscription.schedule.is_scheduled(now) {
                tracing::debug!(subscription_id = %subscription.id, "Outside subscription schedule, skipping");
                continue;
            }

            for contact_id in &subscription.contacts {
                let Some(contact) = self.store.get_contact(contact_id).await? else {
                    tracing::warn!(contact_id = %contact_id, "Unknown contact in subscription, skipping");
                    continue;
                };
                let notification = self
                    .scheduler
                    .schedule(
                        event,
                        &trigger,
                        &contact,
                        subscription.throttling_enabled,
                        now,
                    )
                    .await?;
                self.store.add_notification(&notification).await?;
            }
        }
        Ok(())
    }
}
