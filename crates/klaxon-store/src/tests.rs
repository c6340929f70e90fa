use crate::memory::MemoryStore;
use crate::Store;
use klaxon_common::types::{
    ContactData, EventData, MetricPoint, ScheduleData, ScheduledNotification, State,
    SubscriptionData, ThrottlingRecord, TriggerData, TtlState,
};
use std::time::Duration;

fn point(name: &str, timestamp: i64, value: f64) -> MetricPoint {
    MetricPoint {
        name: name.to_string(),
        timestamp,
        value,
        retention: 600,
    }
}

fn trigger(id: &str, patterns: &[&str], tags: &[&str]) -> TriggerData {
    TriggerData {
        id: id.to_string(),
        name: id.to_string(),
        desc: None,
        targets: patterns.iter().map(|p| p.to_string()).collect(),
        warn_value: Some(70.0),
        error_value: Some(90.0),
        ttl: 600,
        ttl_state: TtlState::NoData,
        schedule: ScheduleData::default(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        expression: None,
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

fn event(trigger_id: &str, metric: &str, timestamp: i64) -> EventData {
    EventData {
        trigger_id: trigger_id.to_string(),
        metric: metric.to_string(),
        old_state: State::Ok,
        state: State::Error,
        timestamp,
        value: Some(95.0),
        message: None,
    }
}

fn subscription(id: &str, tags: &[&str]) -> SubscriptionData {
    SubscriptionData {
        id: id.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        contacts: vec![format!("{id}-contact")],
        schedule: ScheduleData::default(),
        throttling_enabled: true,
        sendings_enabled: true,
        plotting_enabled: false,
    }
}

fn notification(trigger_id: &str, send_at: i64) -> ScheduledNotification {
    ScheduledNotification {
        event: event(trigger_id, "srv.a.cpu", send_at),
        trigger: trigger(trigger_id, &["srv.*.cpu"], &["ops"]),
        contact: ContactData {
            id: "c1".into(),
            contact_type: "email".into(),
            value: "o@x".into(),
            user: "admin".into(),
        },
        send_at,
        throttled: false,
        retries: 0,
    }
}

#[tokio::test]
async fn metric_series_respects_retention() {
    let store = MemoryStore::new();
    store
        .save_metric_points(&[point("srv.a.cpu", 100, 1.0), point("srv.a.cpu", 400, 2.0)])
        .await
        .unwrap();
    // Point at t=1100 with retention 600 trims everything before t=500.
    store
        .save_metric_points(&[point("srv.a.cpu", 1100, 3.0)])
        .await
        .unwrap();

    let values = store.get_metric_values("srv.a.cpu", 0, 2000).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].timestamp, 1100);
}

#[tokio::test]
async fn metric_values_are_range_filtered_and_ordered() {
    let store = MemoryStore::new();
    store
        .save_metric_points(&[
            point("m", 300, 3.0),
            point("m", 100, 1.0),
            point("m", 200, 2.0),
        ])
        .await
        .unwrap();

    let values = store.get_metric_values("m", 100, 250).await.unwrap();
    let timestamps: Vec<i64> = values.iter().map(|v| v.timestamp).collect();
    assert_eq!(timestamps, vec![100, 200]);

    store.delete_metric("m").await.unwrap();
    assert!(store.get_metric_values("m", 0, 1000).await.unwrap().is_empty());
}

#[tokio::test]
async fn trigger_save_indexes_patterns() {
    let store = MemoryStore::new();
    store
        .save_trigger(&trigger("t1", &["srv.*.cpu", "srv.*.mem"], &["ops"]))
        .await
        .unwrap();
    store
        .save_trigger(&trigger("t2", &["srv.*.cpu"], &["ops"]))
        .await
        .unwrap();

    let mut patterns = store.get_patterns().await.unwrap();
    patterns.sort();
    assert_eq!(patterns, vec!["srv.*.cpu", "srv.*.mem"]);
    assert_eq!(
        store.get_pattern_trigger_ids("srv.*.cpu").await.unwrap(),
        vec!["t1".to_string(), "t2".to_string()]
    );

    // Re-saving with different patterns drops the stale index entry.
    store
        .save_trigger(&trigger("t1", &["db.*.load"], &["ops"]))
        .await
        .unwrap();
    let ids = store.get_pattern_trigger_ids("srv.*.mem").await.unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn delete_trigger_drops_state_and_schedule() {
    let store = MemoryStore::new();
    store
        .save_trigger(&trigger("t1", &["srv.*.cpu"], &["ops"]))
        .await
        .unwrap();
    store
        .set_trigger_last_check(
            "t1",
            &klaxon_common::types::CheckData::new(State::Ok, 100),
        )
        .await
        .unwrap();
    store.reschedule_trigger("t1", 500).await.unwrap();

    store.delete_trigger("t1").await.unwrap();

    assert!(store.get_trigger("t1").await.unwrap().is_none());
    assert!(store.get_trigger_last_check("t1").await.unwrap().is_none());
    assert!(store.pop_due_triggers(1000).await.unwrap().is_empty());
}

#[tokio::test]
async fn due_triggers_pop_once_in_time_order() {
    let store = MemoryStore::new();
    store.reschedule_trigger("late", 300).await.unwrap();
    store.reschedule_trigger("early", 100).await.unwrap();
    store.reschedule_trigger("future", 9_999).await.unwrap();

    let due = store.pop_due_triggers(500).await.unwrap();
    assert_eq!(due, vec!["early".to_string(), "late".to_string()]);
    assert!(store.pop_due_triggers(500).await.unwrap().is_empty());
}

#[tokio::test]
async fn reschedule_moves_existing_entry() {
    let store = MemoryStore::new();
    store.reschedule_trigger("t1", 100).await.unwrap();
    store.reschedule_trigger("t1", 9_999).await.unwrap();

    assert!(store.pop_due_triggers(500).await.unwrap().is_empty());
    assert_eq!(
        store.pop_due_triggers(10_000).await.unwrap(),
        vec!["t1".to_string()]
    );
}

#[tokio::test]
async fn check_lock_is_exclusive_until_ttl() {
    let store = MemoryStore::new();
    assert!(store
        .acquire_trigger_check_lock("t1", Duration::from_secs(30))
        .await
        .unwrap());
    assert!(!store
        .acquire_trigger_check_lock("t1", Duration::from_secs(30))
        .await
        .unwrap());

    store.release_trigger_check_lock("t1").await.unwrap();
    assert!(store
        .acquire_trigger_check_lock("t1", Duration::from_secs(30))
        .await
        .unwrap());
}

#[tokio::test]
async fn expired_check_lock_is_reclaimed() {
    let store = MemoryStore::new();
    assert!(store
        .acquire_trigger_check_lock("t1", Duration::from_millis(0))
        .await
        .unwrap());
    // Zero TTL expires immediately; a second worker may take over.
    assert!(store
        .acquire_trigger_check_lock("t1", Duration::from_secs(30))
        .await
        .unwrap());
}

#[tokio::test]
async fn events_are_consumed_at_most_once() {
    let store = MemoryStore::new();
    store.push_event(&event("t1", "m1", 100)).await.unwrap();
    store.push_event(&event("t1", "m2", 101)).await.unwrap();

    let first = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    let second = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.metric, "m1");
    assert_eq!(second.metric, "m2");
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn fetch_event_wakes_on_push() {
    let store = std::sync::Arc::new(MemoryStore::new());
    let consumer = store.clone();
    let handle = tokio::spawn(async move {
        consumer.fetch_event(Duration::from_secs(5)).await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    store.push_event(&event("t1", "m1", 100)).await.unwrap();

    let fetched = handle.await.unwrap();
    assert_eq!(fetched.unwrap().metric, "m1");
}

#[tokio::test]
async fn trigger_event_history_counts_window() {
    let store = MemoryStore::new();
    for ts in [100, 200, 300] {
        store.push_event(&event("t1", "m", ts)).await.unwrap();
    }
    assert_eq!(store.count_trigger_events("t1", 150).await.unwrap(), 2);
    assert_eq!(store.count_trigger_events("t1", 0).await.unwrap(), 3);
    assert_eq!(store.count_trigger_events("other", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn tag_subscriptions_require_subset_match() {
    let store = MemoryStore::new();
    store
        .save_subscription(&subscription("s1", &["ops"]))
        .await
        .unwrap();
    store
        .save_subscription(&subscription("s2", &["ops", "backend"]))
        .await
        .unwrap();
    store
        .save_subscription(&subscription("s3", &["frontend"]))
        .await
        .unwrap();

    let tags = vec!["ops".to_string(), "backend".to_string()];
    let mut matched: Vec<String> = store
        .get_tag_subscriptions(&tags)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    matched.sort();
    assert_eq!(matched, vec!["s1".to_string(), "s2".to_string()]);

    let fetched = store.get_subscription("s2").await.unwrap().unwrap();
    assert_eq!(fetched.tags, vec!["ops".to_string(), "backend".to_string()]);
    assert!(store.get_subscription("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn due_notifications_pop_atomically() {
    let store = MemoryStore::new();
    store.add_notification(&notification("t1", 100)).await.unwrap();
    store.add_notification(&notification("t2", 200)).await.unwrap();
    store.add_notification(&notification("t3", 900)).await.unwrap();

    let due = store.fetch_due_notifications(200).await.unwrap();
    let ids: Vec<String> = due.iter().map(|n| n.trigger.id.clone()).collect();
    assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

    // The future notification stays queued for the next pop.
    let rest = store.fetch_due_notifications(1_000).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].trigger.id, "t3");
}

#[tokio::test]
async fn notifications_with_equal_send_at_are_all_kept() {
    let store = MemoryStore::new();
    store.add_notification(&notification("t1", 100)).await.unwrap();
    store.add_notification(&notification("t2", 100)).await.unwrap();

    let due = store.fetch_due_notifications(100).await.unwrap();
    assert_eq!(due.len(), 2);
}

#[tokio::test]
async fn throttling_record_roundtrip() {
    let store = MemoryStore::new();
    assert_eq!(
        store.get_throttling("c1", "t1").await.unwrap(),
        ThrottlingRecord::default()
    );

    let record = ThrottlingRecord {
        next_allowed: 5_000,
        count: 12,
    };
    store.set_throttling("c1", "t1", record).await.unwrap();
    assert_eq!(store.get_throttling("c1", "t1").await.unwrap(), record);
    assert_eq!(
        store.get_throttling("c1", "other").await.unwrap(),
        ThrottlingRecord::default()
    );
}

#[tokio::test]
async fn heartbeats_and_pattern_metrics() {
    let store = MemoryStore::new();
    store.update_heartbeat(crate::HEARTBEAT_FILTER, 123).await.unwrap();
    assert_eq!(
        store.get_heartbeat(crate::HEARTBEAT_FILTER).await.unwrap(),
        Some(123)
    );
    assert_eq!(store.get_heartbeat("missing").await.unwrap(), None);

    store.add_pattern_metric("srv.*.cpu", "srv.a.cpu").await.unwrap();
    store.add_pattern_metric("srv.*.cpu", "srv.b.cpu").await.unwrap();
    store.add_pattern_metric("srv.*.cpu", "srv.a.cpu").await.unwrap();
    assert_eq!(
        store.get_pattern_metrics("srv.*.cpu").await.unwrap(),
        vec!["srv.a.cpu".to_string(), "srv.b.cpu".to_string()]
    );

    store.remove_pattern_metrics("srv.*.cpu").await.unwrap();
    assert!(store.get_pattern_metrics("srv.*.cpu").await.unwrap().is_empty());
}

#[tokio::test]
async fn metric_event_pubsub_delivers_patterns() {
    let store = MemoryStore::new();
    let mut receiver = store.subscribe_metric_events();
    store.publish_metric_event("srv.*.cpu");
    assert_eq!(receiver.recv().await.unwrap(), "srv.*.cpu");
}
