use klaxon_common::types::{
    ContactData, EventData, ScheduledNotification, ThrottlingRecord, TriggerData,
};
use klaxon_store::error::StoreResult;
use klaxon_store::Store;
use std::sync::Arc;

/// Event-count thresholds and the delays they impose. Counts look at the
/// trigger's recent event history; delays stack onto the `(contact,
/// trigger)` throttle record.
#[derive(Debug, Clone)]
pub struct ThrottlingPolicy {
    /// Events per hour before the first delay applies.
    pub low_count: i64,
    /// Events per three hours before the second delay applies.
    pub medium_count: i64,
    /// Events per three hours before the longest delay applies.
    pub high_count: i64,
    pub first_delay: i64,
    pub second_delay: i64,
    pub third_delay: i64,
}

impl Default for ThrottlingPolicy {
    fn default() -> Self {
        Self {
            low_count: 10,
            medium_count: 20,
            high_count: 30,
            first_delay: 30 * 60,
            second_delay: 3600,
            third_delay: 3 * 3600,
        }
    }
}

impl ThrottlingPolicy {
    fn delay(&self, count_hour: i64, count_three_hours: i64) -> i64 {
        if count_three_hours >= self.high_count {
            self.third_delay
        } else if count_three_hours >= self.medium_count {
            self.second_delay
        } else if count_hour >= self.low_count {
            self.first_delay
        } else {
            0
        }
    }
}

/// Owns the send decision per `(contact, trigger)`: reads the throttle
/// record, extends it when the trigger is noisy, and stamps the resulting
/// send time on the notification.
pub struct Scheduler {
    store: Arc<dyn Store>,
    policy: ThrottlingPolicy,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, policy: ThrottlingPolicy) -> Self {
        Self { store, policy }
    }

    /// Produces the scheduled notification for one event/contact pair.
    /// `send_at = max(now, next_allowed)`; the `throttled` flag is set
    /// whenever a delay was applied.
    pub async fn schedule(
        &self,
        event: &EventData,
        trigger: &TriggerData,
        contact: &ContactData,
        throttling_enabled: bool,
        now: i64,
    ) -> StoreResult<ScheduledNotification> {
        let mut send_at = now;
        let mut throttled = false;

        if throttling_enabled {
            let record = self.store.get_throttling(&contact.id, &trigger.id).await?;
            if record.next_allowed > now {
                send_at = record.next_allowed;
                throttled = true;
            }

            let count_hour = self
                .store
                .count_trigger_events(&trigger.id, now - 3600)
                .await?;
            let count_three_hours = self
                .store
                .count_trigger_events(&trigger.id, now - 3 * 3600)
                .await?;
            let delay = self.policy.delay(count_hour, count_three_hours);
            if delay > 0 && now + delay > record.next_allowed {
                let next = now + delay;
                tracing::info!(
                    contact_id = %contact.id,
                    trigger_id = %trigger.id,
                    count_hour,
                    count_three_hours,
                    delay,
                    "Throttling trigger notifications"
                );
                self.store
                    .set_throttling(
                        &contact.id,
                        &trigger.id,
                        ThrottlingRecord {
                            next_allowed: next,
                            count: count_three_hours,
                        },
                    )
                    .await?;
            }
        }

        Ok(ScheduledNotification {
            event: event.clone(),
            trigger: trigger.clone(),
            contact: contact.clone(),
            send_at,
            throttled,
            retries: 0,
        })
    }
}
