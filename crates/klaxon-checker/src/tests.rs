use crate::cache::TriggerCache;
use crate::check::{CheckerConfig, TriggerChecker};
use crate::error::CheckError;
use crate::expression::{eval_condition, parse, Value};
use crate::functions::{registry, Arg, TimeSeries};
use crate::target::TargetEvaluator;
use chrono::Utc;
use klaxon_common::types::{
    CheckData, MetricPoint, MetricState, MetricValue, ScheduleData, State, TriggerData, TtlState,
};
use klaxon_store::memory::MemoryStore;
use klaxon_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

fn series(name: &str, points: &[(i64, f64)]) -> TimeSeries {
    TimeSeries::new(
        name,
        points
            .iter()
            .map(|&(timestamp, value)| MetricValue { timestamp, value })
            .collect(),
    )
}

fn trigger(id: &str, targets: &[&str]) -> TriggerData {
    TriggerData {
        id: id.to_string(),
        name: format!("{id} name"),
        desc: None,
        targets: targets.iter().map(|t| t.to_string()).collect(),
        warn_value: Some(70.0),
        error_value: Some(90.0),
        ttl: 600,
        ttl_state: TtlState::NoData,
        schedule: ScheduleData::default(),
        tags: vec!["ops".into()],
        expression: None,
        patterns: targets.iter().map(|t| t.to_string()).collect(),
    }
}

fn checker(store: &Arc<MemoryStore>) -> (TriggerChecker, mpsc::Receiver<String>) {
    let (escalations_tx, escalations_rx) = mpsc::channel(8);
    let store: Arc<dyn Store> = store.clone();
    let cache = TriggerCache::new(store.clone(), Duration::from_secs(60));
    (
        TriggerChecker::new(store, cache, CheckerConfig::default(), escalations_tx),
        escalations_rx,
    )
}

async fn ingest(store: &MemoryStore, pattern: &str, metric: &str, timestamp: i64, value: f64) {
    store
        .save_metric_points(&[MetricPoint {
            name: metric.to_string(),
            timestamp,
            value,
            retention: 3600,
        }])
        .await
        .unwrap();
    store.add_pattern_metric(pattern, metric).await.unwrap();
}

// Expression language

#[test]
fn parses_and_evaluates_threshold_ternary() {
    let node = parse("t1 >= 10 ? ERROR : (t1 >= 5 ? WARN : OK)").unwrap();

    let result = eval_condition(&node, &vars(&[("t1", Value::Num(12.0))])).unwrap();
    assert_eq!(result, Value::State(State::Error));
    let result = eval_condition(&node, &vars(&[("t1", Value::Num(7.0))])).unwrap();
    assert_eq!(result, Value::State(State::Warn));
    let result = eval_condition(&node, &vars(&[("t1", Value::Num(1.0))])).unwrap();
    assert_eq!(result, Value::State(State::Ok));
}

#[test]
fn condition_sees_threshold_variables_and_prev_state() {
    let node = parse("t1 > warn_value && prev_state == OK ? WARN : prev_state").unwrap();
    let bindings = vars(&[
        ("t1", Value::Num(75.0)),
        ("warn_value", Value::Num(70.0)),
        ("prev_state", Value::State(State::Ok)),
    ]);
    assert_eq!(
        eval_condition(&node, &bindings).unwrap(),
        Value::State(State::Warn)
    );
}

#[test]
fn condition_supports_arithmetic_and_boolean_composition() {
    let node = parse("(t1 + t2) / 2 >= 50 || !(t1 < 10) ? ERROR : OK").unwrap();
    let bindings = vars(&[("t1", Value::Num(80.0)), ("t2", Value::Num(40.0))]);
    assert_eq!(
        eval_condition(&node, &bindings).unwrap(),
        Value::State(State::Error)
    );
}

#[test]
fn unknown_variable_is_an_error() {
    let node = parse("t9 > 1 ? ERROR : OK").unwrap();
    let result = eval_condition(&node, &vars(&[("t1", Value::Num(1.0))]));
    assert!(matches!(result, Err(CheckError::UnknownVariable(name)) if name == "t9"));
}

#[test]
fn syntax_errors_are_reported() {
    assert!(matches!(parse("t1 >="), Err(CheckError::Syntax(_))));
    assert!(matches!(parse(""), Err(CheckError::Syntax(_))));
    assert!(matches!(parse("foo(1,"), Err(CheckError::Syntax(_))));
    assert!(matches!(parse("t1 = 5"), Err(CheckError::Syntax(_))));
}

#[test]
fn pattern_references_lex_as_single_idents() {
    let node = parse("movingAverage(srv.{a,b}.cpu, 5)").unwrap();
    match node {
        crate::expression::Node::Call { name, args } => {
            assert_eq!(name, "movingAverage");
            assert_eq!(
                args[0],
                crate::expression::Node::Ident("srv.{a,b}.cpu".into())
            );
            assert_eq!(args[1], crate::expression::Node::Number(5.0));
        }
        other => panic!("expected call, got {other:?}"),
    }
}

// Functions

#[test]
fn moving_average_smooths_series() {
    let function = registry().get("movingAverage").unwrap();
    let out = (function.apply)(vec![
        Arg::Series(vec![series("m", &[(1, 2.0), (2, 4.0), (3, 6.0)])]),
        Arg::Number(2.0),
    ])
    .unwrap();
    let values: Vec<f64> = out[0].values.iter().map(|v| v.value).collect();
    assert_eq!(values, vec![2.0, 3.0, 5.0]);
    assert_eq!(out[0].name, "m");
}

#[test]
fn sum_series_combines_by_timestamp() {
    let function = registry().get("sumSeries").unwrap();
    let out = (function.apply)(vec![Arg::Series(vec![
        series("a", &[(1, 1.0), (2, 2.0)]),
        series("b", &[(1, 10.0), (3, 30.0)]),
    ])])
    .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name, "sumSeries(a,b)");
    assert_eq!(
        out[0].values,
        vec![
            MetricValue {
                timestamp: 1,
                value: 11.0
            },
            MetricValue {
                timestamp: 2,
                value: 2.0
            },
            MetricValue {
                timestamp: 3,
                value: 30.0
            },
        ]
    );
}

#[test]
fn derivative_diffs_consecutive_points() {
    let function = registry().get("derivative").unwrap();
    let out = (function.apply)(vec![Arg::Series(vec![series(
        "m",
        &[(1, 10.0), (2, 15.0), (3, 12.0)],
    )])])
    .unwrap();
    let values: Vec<f64> = out[0].values.iter().map(|v| v.value).collect();
    assert_eq!(values, vec![5.0, -3.0]);
}

#[test]
fn summarize_buckets_and_aggregates() {
    let function = registry().get("summarize").unwrap();
    let out = (function.apply)(vec![
        Arg::Series(vec![series("m", &[(0, 1.0), (5, 3.0), (10, 10.0)])]),
        Arg::Number(10.0),
        Arg::Str("sum".into()),
    ])
    .unwrap();
    assert_eq!(
        out[0].values,
        vec![
            MetricValue {
                timestamp: 0,
                value: 4.0
            },
            MetricValue {
                timestamp: 10,
                value: 10.0
            },
        ]
    );
}

#[test]
fn alias_renames_and_scale_multiplies() {
    let alias = registry().get("alias").unwrap();
    let out = (alias.apply)(vec![
        Arg::Series(vec![series("m", &[(1, 2.0)])]),
        Arg::Str("renamed".into()),
    ])
    .unwrap();
    assert_eq!(out[0].name, "renamed");

    let scale = registry().get("scale").unwrap();
    let out = (scale.apply)(vec![Arg::Series(out), Arg::Number(8.0)]).unwrap();
    assert_eq!(out[0].values[0].value, 16.0);
}

// Target evaluation

#[tokio::test]
async fn target_resolves_pattern_members() {
    let store = Arc::new(MemoryStore::new());
    ingest(&store, "srv.*.cpu", "srv.a.cpu", 100, 95.0).await;
    ingest(&store, "srv.*.cpu", "srv.b.cpu", 100, 40.0).await;

    let evaluator = TargetEvaluator::new(store.clone() as Arc<dyn Store>);
    let mut result = evaluator.evaluate("srv.*.cpu", 0, 200).await.unwrap();
    result.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].name, "srv.a.cpu");
    assert_eq!(result[1].name, "srv.b.cpu");
}

#[tokio::test]
async fn target_falls_back_to_literal_metric() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_metric_points(&[MetricPoint {
            name: "db.main.load".into(),
            timestamp: 100,
            value: 1.5,
            retention: 3600,
        }])
        .await
        .unwrap();

    let evaluator = TargetEvaluator::new(store.clone() as Arc<dyn Store>);
    let result = evaluator
        .evaluate("scale(db.main.load, 2)", 0, 200)
        .await
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].values[0].value, 3.0);
}

#[tokio::test]
async fn target_unknown_function_errors() {
    let store = Arc::new(MemoryStore::new());
    let evaluator = TargetEvaluator::new(store.clone() as Arc<dyn Store>);
    let result = evaluator.evaluate("bogusFn(srv.*.cpu)", 0, 200).await;
    assert!(matches!(result, Err(CheckError::UnknownFunction(name)) if name == "bogusFn"));
}

// Trigger cache

#[tokio::test]
async fn cache_serves_stale_entry_until_ttl() {
    let store = Arc::new(MemoryStore::new());
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();

    let cache = TriggerCache::new(store.clone() as Arc<dyn Store>, Duration::from_secs(60));
    assert_eq!(cache.get("t1").await.unwrap().unwrap().warn_value, Some(70.0));

    let mut updated = trigger("t1", &["srv.*.cpu"]);
    updated.warn_value = Some(50.0);
    store.save_trigger(&updated).await.unwrap();

    // Entry is younger than the TTL, so the old definition is served.
    assert_eq!(cache.get("t1").await.unwrap().unwrap().warn_value, Some(70.0));

    // A zero-TTL cache always refetches.
    let cold = TriggerCache::new(store.clone() as Arc<dyn Store>, Duration::ZERO);
    assert_eq!(cold.get("t1").await.unwrap().unwrap().warn_value, Some(50.0));
    assert!(cold.get("missing").await.unwrap().is_none());
}

// Trigger checks

#[tokio::test]
async fn threshold_crossing_emits_error_event() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 95.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    let event = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .expect("one transition event");
    assert_eq!(event.trigger_id, "t1");
    assert_eq!(event.metric, "srv.a.cpu");
    assert_eq!(event.old_state, State::Ok);
    assert_eq!(event.state, State::Error);
    assert_eq!(event.timestamp, now);
    assert_eq!(event.value, Some(95.0));

    let check = store.get_trigger_last_check("t1").await.unwrap().unwrap();
    assert_eq!(check.state, State::Error);
    assert_eq!(check.metrics["srv.a.cpu"].state, State::Error);
    assert_eq!(check.metrics["srv.a.cpu"].event_timestamp, now);
    // Trigger state weight plus the one ERROR metric.
    assert_eq!(check.score, 200);
}

#[tokio::test]
async fn steady_state_emits_no_duplicate_events() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 95.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_some());

    // Same data, same state: no second event.
    checker.check("t1").await.unwrap();
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn reversed_thresholds_treat_low_as_bad() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    let mut low_is_bad = trigger("t1", &["srv.*.free"]);
    low_is_bad.warn_value = Some(30.0);
    low_is_bad.error_value = Some(10.0);
    store.save_trigger(&low_is_bad).await.unwrap();
    ingest(&store, "srv.*.free", "srv.a.free", now, 5.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    let event = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.state, State::Error);
}

#[tokio::test]
async fn expression_trigger_uses_condition_result() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    let mut with_expression = trigger("t1", &["srv.*.cpu"]);
    with_expression.expression =
        Some("t1 >= error_value ? ERROR : (t1 >= warn_value ? WARN : OK)".into());
    store.save_trigger(&with_expression).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 75.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    let event = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.state, State::Warn);
}

#[tokio::test]
async fn stale_metric_converts_to_ttl_state_once() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();

    // Last check saw the metric 700 s ago; no data since, TTL is 600.
    let mut last = CheckData::new(State::Ok, now - 700);
    last.metrics
        .insert("srv.a.cpu".into(), MetricState::new(State::Ok, now - 700));
    store.set_trigger_last_check("t1", &last).await.unwrap();

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    let event = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .expect("NODATA transition");
    assert_eq!(event.old_state, State::Ok);
    assert_eq!(event.state, State::NoData);

    // Second check: still no data, no second event.
    checker.check("t1").await.unwrap();
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn ttl_state_del_forgets_metric_silently() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    let mut deleting = trigger("t1", &["srv.*.cpu"]);
    deleting.ttl_state = TtlState::Del;
    store.save_trigger(&deleting).await.unwrap();

    let mut last = CheckData::new(State::Ok, now - 700);
    last.metrics
        .insert("srv.a.cpu".into(), MetricState::new(State::Ok, now - 700));
    store.set_trigger_last_check("t1", &last).await.unwrap();

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
    let check = store.get_trigger_last_check("t1").await.unwrap().unwrap();
    assert!(check.metrics.is_empty());
}

#[tokio::test]
async fn evaluation_failure_emits_exception_once_and_escalates() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_trigger(&trigger("t1", &["bogusFn(srv.*.cpu)"]))
        .await
        .unwrap();

    let (checker, mut escalations) = checker(&store);
    checker.check("t1").await.unwrap();

    let event = store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .expect("EXCEPTION transition");
    assert_eq!(event.state, State::Exception);

    // Identical failing checks do not re-emit.
    checker.check("t1").await.unwrap();
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());

    // Third consecutive failure pages the administrators.
    checker.check("t1").await.unwrap();
    let message = escalations.try_recv().expect("escalation after 3 failures");
    assert!(message.contains("t1"));
}

#[tokio::test]
async fn unscheduled_transition_updates_state_without_event() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    let mut muted = trigger("t1", &["srv.*.cpu"]);
    muted.schedule.days = [false; 7];
    store.save_trigger(&muted).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 95.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
    let check = store.get_trigger_last_check("t1").await.unwrap().unwrap();
    assert_eq!(check.metrics["srv.a.cpu"].state, State::Error);
}

#[tokio::test]
async fn maintenance_window_suppresses_events() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 95.0).await;

    let mut last = CheckData::new(State::Ok, now - 60);
    let mut metric = MetricState::new(State::Ok, now - 60);
    metric.maintenance_until = Some(now + 3600);
    last.metrics.insert("srv.a.cpu".into(), metric);
    store.set_trigger_last_check("t1", &last).await.unwrap();

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
    let check = store.get_trigger_last_check("t1").await.unwrap().unwrap();
    assert_eq!(check.metrics["srv.a.cpu"].state, State::Error);
}

#[tokio::test]
async fn held_lock_skips_evaluation() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 95.0).await;

    assert!(store
        .acquire_trigger_check_lock("t1", Duration::from_secs(30))
        .await
        .unwrap());

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();
    assert!(store
        .fetch_event(Duration::from_millis(10))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn missing_trigger_drops_check_state() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_trigger_last_check("ghost", &CheckData::new(State::Ok, 100))
        .await
        .unwrap();

    let (checker, _esc) = checker(&store);
    checker.check("ghost").await.unwrap();
    assert!(store.get_trigger_last_check("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn check_reschedules_with_bounded_jitter() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp();
    store.save_trigger(&trigger("t1", &["srv.*.cpu"])).await.unwrap();
    ingest(&store, "srv.*.cpu", "srv.a.cpu", now, 10.0).await;

    let (checker, _esc) = checker(&store);
    checker.check("t1").await.unwrap();

    // Base interval 60 s, jitter at most 10 %: due strictly after now+59.
    assert!(store.pop_due_triggers(now + 59).await.unwrap().is_empty());
    let due = store.pop_due_triggers(now + 90).await.unwrap();
    assert_eq!(due, vec!["t1".to_string()]);
}
