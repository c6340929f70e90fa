use crate::error::StoreResult;
use crate::Store;
use async_trait::async_trait;
use klaxon_common::types::{
    CheckData, ContactData, EventData, MetricPoint, MetricValue, ScheduledNotification,
    SubscriptionData, ThrottlingRecord, TriggerData,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

/// How long per-trigger event history is kept for throttling counts. Must
/// cover the longest throttling lookback window.
const EVENT_HISTORY_HORIZON: i64 = 6 * 3600;

/// Capacity of the metric-event pub/sub channel. A lagging subscriber loses
/// the oldest announcements, which only delays the next check of the
/// affected triggers until the periodic sweep.
const METRIC_EVENT_CAPACITY: usize = 16 * 1024;

#[derive(Default)]
struct Series {
    points: BTreeMap<i64, f64>,
    retention: i64,
}

#[derive(Default)]
struct Inner {
    metrics: HashMap<String, Series>,
    pattern_metrics: HashMap<String, BTreeSet<String>>,
    triggers: HashMap<String, TriggerData>,
    pattern_triggers: HashMap<String, BTreeSet<String>>,
    trigger_checks: HashMap<String, CheckData>,
    next_check: BTreeSet<(i64, String)>,
    next_check_index: HashMap<String, i64>,
    check_locks: HashMap<String, Instant>,
    events: VecDeque<EventData>,
    trigger_events: HashMap<String, Vec<i64>>,
    subscriptions: HashMap<String, SubscriptionData>,
    tag_subscriptions: HashMap<String, BTreeSet<String>>,
    contacts: HashMap<String, ContactData>,
    notifications: BTreeMap<(i64, u64), ScheduledNotification>,
    notification_seq: u64,
    throttling: HashMap<(String, String), ThrottlingRecord>,
    heartbeats: HashMap<String, i64>,
}

/// In-process [`Store`] engine.
///
/// All key families live behind one `parking_lot::RwLock`; the event list
/// additionally pairs with a [`Notify`] so `fetch_event` can block without
/// polling, and metric-name announcements go through a broadcast channel.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    event_notify: Notify,
    metric_events: broadcast::Sender<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (metric_events, _) = broadcast::channel(METRIC_EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            event_notify: Notify::new(),
            metric_events,
        }
    }

    fn unindex_trigger(inner: &mut Inner, trigger: &TriggerData) {
        for pattern in &trigger.patterns {
            if let Some(ids) = inner.pattern_triggers.get_mut(pattern) {
                ids.remove(&trigger.id);
                if ids.is_empty() {
                    inner.pattern_triggers.remove(pattern);
                }
            }
        }
    }

    fn unindex_subscription(inner: &mut Inner, subscription: &SubscriptionData) {
        for tag in &subscription.tags {
            if let Some(ids) = inner.tag_subscriptions.get_mut(tag) {
                ids.remove(&subscription.id);
                if ids.is_empty() {
                    inner.tag_subscriptions.remove(tag);
                }
            }
        }
    }

    fn remove_schedule_entry(inner: &mut Inner, id: &str) {
        if let Some(score) = inner.next_check_index.remove(id) {
            inner.next_check.remove(&(score, id.to_string()));
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_metric_points(&self, points: &[MetricPoint]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        for point in points {
            let series = inner.metrics.entry(point.name.clone()).or_default();
            series.retention = point.retention;
            series.points.insert(point.timestamp, point.value);
            let cutoff = point.timestamp - point.retention;
            series.points = series.points.split_off(&cutoff);
        }
        Ok(())
    }

    async fn get_metric_values(
        &self,
        name: &str,
        from: i64,
        to: i64,
    ) -> StoreResult<Vec<MetricValue>> {
        let inner = self.inner.read();
        let Some(series) = inner.metrics.get(name) else {
            return Ok(Vec::new());
        };
        Ok(series
            .points
            .range(from..=to)
            .map(|(&timestamp, &value)| MetricValue { timestamp, value })
            .collect())
    }

    async fn delete_metric(&self, name: &str) -> StoreResult<()> {
        self.inner.write().metrics.remove(name);
        Ok(())
    }

    async fn get_patterns(&self) -> StoreResult<Vec<String>> {
        Ok(self.inner.read().pattern_triggers.keys().cloned().collect())
    }

    async fn add_pattern_metric(&self, pattern: &str, metric: &str) -> StoreResult<()> {
        self.inner
            .write()
            .pattern_metrics
            .entry(pattern.to_string())
            .or_default()
            .insert(metric.to_string());
        Ok(())
    }

    async fn get_pattern_metrics(&self, pattern: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .read()
            .pattern_metrics
            .get(pattern)
            .map(|metrics| metrics.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_pattern_metrics(&self, pattern: &str) -> StoreResult<()> {
        self.inner.write().pattern_metrics.remove(pattern);
        Ok(())
    }

    fn publish_metric_event(&self, pattern: &str) {
        // No subscriber yet is fine; the periodic sweep covers the gap.
        let _ = self.metric_events.send(pattern.to_string());
    }

    fn subscribe_metric_events(&self) -> broadcast::Receiver<String> {
        self.metric_events.subscribe()
    }

    async fn save_trigger(&self, trigger: &TriggerData) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if let Some(old) = inner.triggers.remove(&trigger.id) {
            Self::unindex_trigger(&mut inner, &old);
        }
        for pattern in &trigger.patterns {
            inner
                .pattern_triggers
                .entry(pattern.clone())
                .or_default()
                .insert(trigger.id.clone());
        }
        inner.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, id: &str) -> StoreResult<Option<TriggerData>> {
        Ok(self.inner.read().triggers.get(id).cloned())
    }

    async fn get_trigger_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.inner.read().triggers.keys().cloned().collect())
    }

    async fn get_pattern_trigger_ids(&self, pattern: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .read()
            .pattern_triggers
            .get(pattern)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_trigger(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if let Some(trigger) = inner.triggers.remove(id) {
            Self::unindex_trigger(&mut inner, &trigger);
        }
        inner.trigger_checks.remove(id);
        inner.trigger_events.remove(id);
        Self::remove_schedule_entry(&mut inner, id);
        Ok(())
    }

    async fn get_trigger_last_check(&self, id: &str) -> StoreResult<Option<CheckData>> {
        Ok(self.inner.read().trigger_checks.get(id).cloned())
    }

    async fn set_trigger_last_check(&self, id: &str, check: &CheckData) -> StoreResult<()> {
        self.inner
            .write()
            .trigger_checks
            .insert(id.to_string(), check.clone());
        Ok(())
    }

    async fn delete_trigger_last_check(&self, id: &str) -> StoreResult<()> {
        self.inner.write().trigger_checks.remove(id);
        Ok(())
    }

    async fn reschedule_trigger(&self, id: &str, next: i64) -> StoreResult<()> {
        let mut inner = self.inner.write();
        Self::remove_schedule_entry(&mut inner, id);
        inner.next_check.insert((next, id.to_string()));
        inner.next_check_index.insert(id.to_string(), next);
        Ok(())
    }

    async fn pop_due_triggers(&self, now: i64) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write();
        let mut due = Vec::new();
        while let Some(entry) = inner.next_check.first().cloned() {
            if entry.0 > now {
                break;
            }
            inner.next_check.remove(&entry);
            inner.next_check_index.remove(&entry.1);
            due.push(entry.1);
        }
        Ok(due)
    }

    async fn acquire_trigger_check_lock(&self, id: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        if let Some(expiry) = inner.check_locks.get(id) {
            if *expiry > now {
                return Ok(false);
            }
            tracing::error!(trigger_id = %id, "Check lock expired before release, reclaiming");
        }
        inner.check_locks.insert(id.to_string(), now + ttl);
        Ok(true)
    }

    async fn release_trigger_check_lock(&self, id: &str) -> StoreResult<()> {
        self.inner.write().check_locks.remove(id);
        Ok(())
    }

    async fn push_event(&self, event: &EventData) -> StoreResult<()> {
        {
            let mut inner = self.inner.write();
            inner.events.push_back(event.clone());
            let history = inner
                .trigger_events
                .entry(event.trigger_id.clone())
                .or_default();
            history.push(event.timestamp);
            let cutoff = event.timestamp - EVENT_HISTORY_HORIZON;
            history.retain(|&timestamp| timestamp >= cutoff);
        }
        self.event_notify.notify_one();
        Ok(())
    }

    async fn fetch_event(&self, timeout: Duration) -> StoreResult<Option<EventData>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.inner.write().events.pop_front() {
                return Ok(Some(event));
            }
            let notified = self.event_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.inner.write().events.pop_front());
            }
        }
    }

    async fn count_trigger_events(&self, trigger_id: &str, from: i64) -> StoreResult<i64> {
        Ok(self
            .inner
            .read()
            .trigger_events
            .get(trigger_id)
            .map(|history| history.iter().filter(|&&ts| ts >= from).count() as i64)
            .unwrap_or(0))
    }

    async fn save_subscription(&self, subscription: &SubscriptionData) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if let Some(old) = inner.subscriptions.remove(&subscription.id) {
            Self::unindex_subscription(&mut inner, &old);
        }
        for tag in &subscription.tags {
            inner
                .tag_subscriptions
                .entry(tag.clone())
                .or_default()
                .insert(subscription.id.clone());
        }
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<SubscriptionData>> {
        Ok(self.inner.read().subscriptions.get(id).cloned())
    }

    async fn get_tag_subscriptions(
        &self,
        tags: &[String],
    ) -> StoreResult<Vec<SubscriptionData>> {
        let inner = self.inner.read();
        let mut candidates = BTreeSet::new();
        for tag in tags {
            if let Some(ids) = inner.tag_subscriptions.get(tag) {
                candidates.extend(ids.iter().cloned());
            }
        }
        Ok(candidates
            .iter()
            .filter_map(|id| inner.subscriptions.get(id))
            .filter(|subscription| subscription.matches_tags(tags))
            .cloned()
            .collect())
    }

    async fn save_contact(&self, contact: &ContactData) -> StoreResult<()> {
        self.inner
            .write()
            .contacts
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn get_contact(&self, id: &str) -> StoreResult<Option<ContactData>> {
        Ok(self.inner.read().contacts.get(id).cloned())
    }

    async fn add_notification(&self, notification: &ScheduledNotification) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let seq = inner.notification_seq;
        inner.notification_seq += 1;
        inner
            .notifications
            .insert((notification.send_at, seq), notification.clone());
        Ok(())
    }

    async fn fetch_due_notifications(
        &self,
        now: i64,
    ) -> StoreResult<Vec<ScheduledNotification>> {
        let mut inner = self.inner.write();
        let pending = inner.notifications.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut inner.notifications, pending);
        Ok(due.into_values().collect())
    }

    async fn get_throttling(
        &self,
        contact_id: &str,
        trigger_id: &str,
    ) -> StoreResult<ThrottlingRecord> {
        Ok(self
            .inner
            .read()
            .throttling
            .get(&(contact_id.to_string(), trigger_id.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn set_throttling(
        &self,
        contact_id: &str,
        trigger_id: &str,
        record: ThrottlingRecord,
    ) -> StoreResult<()> {
        self.inner
            .write()
            .throttling
            .insert((contact_id.to_string(), trigger_id.to_string()), record);
        Ok(())
    }

    async fn update_heartbeat(&self, key: &str, timestamp: i64) -> StoreResult<()> {
        self.inner
            .write()
            .heartbeats
            .insert(key.to_string(), timestamp);
        Ok(())
    }

    async fn get_heartbeat(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self.inner.read().heartbeats.get(key).copied())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
