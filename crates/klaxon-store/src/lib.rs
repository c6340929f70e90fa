//! Shared backing store for the alerting engine.
//!
//! Every component reads and writes through the [`Store`] trait: metric
//! series, the pattern-metric index, trigger definitions and check state,
//! the event queue, scheduled notifications, throttle records and heartbeat
//! keys. The default implementation ([`memory::MemoryStore`]) keeps
//! everything in process behind a single lock; the trait boundary is where a
//! networked key/value backend would plug in.

pub mod error;
pub mod memory;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use error::StoreResult;
use klaxon_common::types::{
    CheckData, ContactData, EventData, MetricPoint, MetricValue, ScheduledNotification,
    SubscriptionData, ThrottlingRecord, TriggerData,
};
use std::time::Duration;
use tokio::sync::broadcast;

/// Heartbeat key written by the filter on every successful flush.
pub const HEARTBEAT_FILTER: &str = "filter";
/// Heartbeat key written by the checker scheduler on every loop iteration.
pub const HEARTBEAT_CHECKER: &str = "checker";

/// Store facade shared by the filter, checker, notifier and watchdog.
///
/// Implementations must be safe to share across tasks (`Send + Sync`); every
/// worker pool holds the same `Arc<dyn Store>`. No entity has two concurrent
/// mutators: check state is written only by the checker, notifications are
/// created only by the event fetcher and consumed only by the notifications
/// fetcher, and the per-trigger advisory lock keeps evaluations exclusive.
#[async_trait]
pub trait Store: Send + Sync {
    // Metric series

    /// Appends points to their per-metric series and trims each series to
    /// its retention horizon.
    async fn save_metric_points(&self, points: &[MetricPoint]) -> StoreResult<()>;

    /// Returns the samples of `name` with `from <= timestamp <= to`, in
    /// timestamp order.
    async fn get_metric_values(&self, name: &str, from: i64, to: i64)
        -> StoreResult<Vec<MetricValue>>;

    async fn delete_metric(&self, name: &str) -> StoreResult<()>;

    // Pattern index feed

    /// All wildcard patterns referenced by stored triggers.
    async fn get_patterns(&self) -> StoreResult<Vec<String>>;

    /// Records that `metric` matched `pattern`.
    async fn add_pattern_metric(&self, pattern: &str, metric: &str) -> StoreResult<()>;

    async fn get_pattern_metrics(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn remove_pattern_metrics(&self, pattern: &str) -> StoreResult<()>;

    /// Announces fresh data under `pattern` so the checker can mark the
    /// owning triggers dirty.
    fn publish_metric_event(&self, pattern: &str);

    fn subscribe_metric_events(&self) -> broadcast::Receiver<String>;

    // Triggers

    async fn save_trigger(&self, trigger: &TriggerData) -> StoreResult<()>;

    async fn get_trigger(&self, id: &str) -> StoreResult<Option<TriggerData>>;

    async fn get_trigger_ids(&self) -> StoreResult<Vec<String>>;

    /// Trigger IDs whose patterns include `pattern`.
    async fn get_pattern_trigger_ids(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Removes the trigger together with its check state and schedule entry.
    async fn delete_trigger(&self, id: &str) -> StoreResult<()>;

    async fn get_trigger_last_check(&self, id: &str) -> StoreResult<Option<CheckData>>;

    async fn set_trigger_last_check(&self, id: &str, check: &CheckData) -> StoreResult<()>;

    async fn delete_trigger_last_check(&self, id: &str) -> StoreResult<()>;

    // Check scheduling

    /// Inserts or moves the trigger in the next-check sorted set.
    async fn reschedule_trigger(&self, id: &str, next: i64) -> StoreResult<()>;

    /// Atomically removes and returns every trigger due at or before `now`.
    async fn pop_due_triggers(&self, now: i64) -> StoreResult<Vec<String>>;

    /// Advisory lock guaranteeing at most one concurrent evaluation per
    /// trigger. Returns `false` when another holder is alive; expired
    /// holders are reclaimed.
    async fn acquire_trigger_check_lock(&self, id: &str, ttl: Duration) -> StoreResult<bool>;

    async fn release_trigger_check_lock(&self, id: &str) -> StoreResult<()>;

    // Events

    /// Appends the event to the global FIFO list and to the per-trigger
    /// history used for throttling counts.
    async fn push_event(&self, event: &EventData) -> StoreResult<()>;

    /// Blocking pop from the head of the event list. Returns `None` when no
    /// event arrives within `timeout`. Each event is delivered at most once.
    async fn fetch_event(&self, timeout: Duration) -> StoreResult<Option<EventData>>;

    /// Number of events this trigger produced since `from`.
    async fn count_trigger_events(&self, trigger_id: &str, from: i64) -> StoreResult<i64>;

    // Subscriptions and contacts

    async fn save_subscription(&self, subscription: &SubscriptionData) -> StoreResult<()>;

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<SubscriptionData>>;

    /// Every subscription whose tag set is a subset of `tags`.
    async fn get_tag_subscriptions(&self, tags: &[String]) -> StoreResult<Vec<SubscriptionData>>;

    async fn save_contact(&self, contact: &ContactData) -> StoreResult<()>;

    async fn get_contact(&self, id: &str) -> StoreResult<Option<ContactData>>;

    // Scheduled notifications

    async fn add_notification(&self, notification: &ScheduledNotification) -> StoreResult<()>;

    /// Atomically removes and returns every notification with
    /// `send_at <= now`, ordered by send time. Unpopped notifications stay
    /// in the set across restarts.
    async fn fetch_due_notifications(
        &self,
        now: i64,
    ) -> StoreResult<Vec<ScheduledNotification>>;

    // Throttling

    async fn get_throttling(&self, contact_id: &str, trigger_id: &str)
        -> StoreResult<ThrottlingRecord>;

    async fn set_throttling(
        &self,
        contact_id: &str,
        trigger_id: &str,
        record: ThrottlingRecord,
    ) -> StoreResult<()>;

    // Self-state

    async fn update_heartbeat(&self, key: &str, timestamp: i64) -> StoreResult<()>;

    async fn get_heartbeat(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Cheap reachability probe for the watchdog and the startup check.
    async fn ping(&self) -> StoreResult<()>;
}
