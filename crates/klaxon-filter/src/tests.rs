use crate::flusher::Flusher;
use crate::index::{IndexHandle, PatternIndex};
use crate::metrics::FilterMetrics;
use crate::parser::{parse_line, ParseError};
use crate::worker::ParserPool;
use glob_match::glob_match;
use klaxon_store::memory::MemoryStore;
use klaxon_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[test]
fn parses_plain_line() {
    let point = parse_line("srv.a.cpu 95.5 1000\n").unwrap();
    assert_eq!(point.name, "srv.a.cpu");
    assert_eq!(point.value, 95.5);
    assert_eq!(point.timestamp, 1000);
}

#[test]
fn parses_crlf_and_fractional_timestamp() {
    let point = parse_line("srv.a.cpu 1 1000.75\r\n").unwrap();
    assert_eq!(point.timestamp, 1000);
}

#[test]
fn rejects_wrong_field_count() {
    assert_eq!(parse_line("srv.a.cpu 95.5"), Err(ParseError::FieldCount(2)));
    assert!(matches!(
        parse_line("srv.a.cpu 95.5 1000 extra"),
        Err(ParseError::FieldCount(4))
    ));
    assert!(matches!(parse_line(""), Err(ParseError::FieldCount(0))));
}

#[test]
fn rejects_bad_value_and_timestamp() {
    assert!(matches!(
        parse_line("srv.a.cpu abc 1000"),
        Err(ParseError::Value(_))
    ));
    assert!(matches!(
        parse_line("srv.a.cpu NaN 1000"),
        Err(ParseError::Value(_))
    ));
    assert!(matches!(
        parse_line("srv.a.cpu 1.0 later"),
        Err(ParseError::Timestamp(_))
    ));
}

#[test]
fn rejects_non_ascii_name() {
    assert_eq!(parse_line("srv.\u{431}.cpu 1 1000"), Err(ParseError::Name));
}

#[test]
fn index_matches_literals_and_wildcards() {
    let index = PatternIndex::build([
        "srv.*.cpu",
        "srv.a.cpu",
        "srv.?.mem",
        "srv.{a,b}.load",
        "db.[cd].queries",
    ]);

    let mut matched = index.match_name("srv.a.cpu");
    matched.sort();
    assert_eq!(matched, vec!["srv.*.cpu", "srv.a.cpu"]);

    assert_eq!(index.match_name("srv.b.cpu"), vec!["srv.*.cpu"]);
    assert_eq!(index.match_name("srv.b.mem"), vec!["srv.?.mem"]);
    assert_eq!(index.match_name("srv.b.load"), vec!["srv.{a,b}.load"]);
    assert_eq!(index.match_name("db.c.queries"), vec!["db.[cd].queries"]);
    assert!(index.match_name("db.e.queries").is_empty());
    assert!(index.match_name("unknown.a.cpu").is_empty());
}

#[test]
fn index_depth_is_exact() {
    let index = PatternIndex::build(["srv.*.cpu"]);
    assert!(index.match_name("srv.a.cpu.user").is_empty());
    assert!(index.match_name("srv.a").is_empty());
    assert!(index.match_name("srv.cpu").is_empty());
}

#[test]
fn index_matching_is_case_sensitive() {
    let index = PatternIndex::build(["srv.*.CPU"]);
    assert!(index.match_name("srv.a.cpu").is_empty());
    assert_eq!(index.match_name("srv.a.CPU"), vec!["srv.*.CPU"]);
}

#[test]
fn index_agrees_with_direct_glob_scan() {
    let patterns = [
        "srv.*.cpu",
        "srv.a.*",
        "srv.{a,b}.mem",
        "db.?.load",
        "srv.a.cpu",
        "*.a.cpu",
    ];
    let names = [
        "srv.a.cpu",
        "srv.b.cpu",
        "srv.a.mem",
        "srv.c.mem",
        "db.x.load",
        "db.xy.load",
        "other.a.cpu",
        "srv.a",
    ];
    let index = PatternIndex::build(patterns);

    for name in names {
        let mut from_index = index.match_name(name);
        from_index.sort();
        let mut from_scan: Vec<String> = patterns
            .iter()
            .filter(|pattern| {
                let p: Vec<&str> = pattern.split('.').collect();
                let n: Vec<&str> = name.split('.').collect();
                p.len() == n.len()
                    && p.iter().zip(&n).all(|(ps, ns)| glob_match(ps, ns))
            })
            .map(|p| p.to_string())
            .collect();
        from_scan.sort();
        from_scan.dedup();
        assert_eq!(from_index, from_scan, "mismatch for {name}");
    }
}

#[test]
fn index_deduplicates_patterns() {
    let index = PatternIndex::build(["srv.*.cpu", "srv.*.cpu"]);
    assert_eq!(index.len(), 1);
    assert_eq!(index.match_name("srv.a.cpu"), vec!["srv.*.cpu"]);
}

#[test]
fn handle_swap_is_visible_to_readers() {
    let handle = IndexHandle::new(PatternIndex::empty());
    assert!(handle.current().match_name("srv.a.cpu").is_empty());

    handle.swap(PatternIndex::build(["srv.*.cpu"]));
    assert_eq!(handle.current().match_name("srv.a.cpu"), vec!["srv.*.cpu"]);
}

#[tokio::test]
async fn refresher_primes_index_from_store() {
    let store = Arc::new(MemoryStore::new());
    store
        .save_trigger(&klaxon_common::types::TriggerData {
            id: "t1".into(),
            name: "cpu".into(),
            desc: None,
            targets: vec!["srv.*.cpu".into()],
            warn_value: Some(70.0),
            error_value: Some(90.0),
            ttl: 600,
            ttl_state: klaxon_common::types::TtlState::NoData,
            schedule: klaxon_common::types::ScheduleData::default(),
            tags: vec![],
            expression: None,
            patterns: vec!["srv.*.cpu".into()],
        })
        .await
        .unwrap();

    let handle = Arc::new(IndexHandle::new(PatternIndex::empty()));
    let refresher = crate::index::IndexRefresher::new(
        store.clone() as Arc<dyn Store>,
        handle.clone(),
        Duration::from_secs(1),
    );
    assert!(refresher.refresh().await);
    assert_eq!(handle.current().match_name("srv.a.cpu"), vec!["srv.*.cpu"]);
}

#[test]
fn metrics_counters_accumulate() {
    let metrics = FilterMetrics::new();
    metrics.mark_received();
    metrics.mark_received();
    metrics.mark_valid();
    metrics.mark_matched();
    metrics.mark_dropped();
    assert_eq!(metrics.received(), 2);
    assert_eq!(metrics.valid(), 1);
    assert_eq!(metrics.matched(), 1);
    assert_eq!(metrics.dropped(), 1);
}

#[tokio::test]
async fn parser_pool_matches_and_forwards() {
    let handle = Arc::new(IndexHandle::new(PatternIndex::build(["srv.*.cpu"])));
    let metrics = Arc::new(FilterMetrics::new());
    let (lines_tx, lines_rx) = mpsc::channel(16);
    let (points_tx, mut points_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    let handles = ParserPool::new(handle, metrics.clone(), 600).spawn(
        2,
        lines_rx,
        points_tx,
        shutdown.clone(),
    );

    lines_tx.send("srv.a.cpu 95 1000".to_string()).await.unwrap();
    lines_tx.send("not a line".to_string()).await.unwrap();
    lines_tx.send("other.a.cpu 1 1000".to_string()).await.unwrap();

    let matched = points_rx.recv().await.unwrap();
    assert_eq!(matched.point.name, "srv.a.cpu");
    assert_eq!(matched.point.retention, 600);
    assert_eq!(matched.patterns, vec!["srv.*.cpu"]);

    drop(lines_tx);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(metrics.valid(), 2);
    assert_eq!(metrics.matched(), 1);
    assert_eq!(metrics.dropped(), 1);
}

#[tokio::test]
async fn flusher_persists_batch_and_publishes_patterns() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(FilterMetrics::new());
    let (points_tx, points_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let mut events = store.subscribe_metric_events();

    let flusher = Flusher::new(
        store.clone() as Arc<dyn Store>,
        2,
        Duration::from_secs(60),
        metrics,
    );
    let task = tokio::spawn(flusher.run(points_rx, shutdown.clone()));

    for (name, value) in [("srv.a.cpu", 95.0), ("srv.b.cpu", 40.0)] {
        points_tx
            .send(crate::MatchedPoint {
                point: klaxon_common::types::MetricPoint {
                    name: name.to_string(),
                    timestamp: 1000,
                    value,
                    retention: 600,
                },
                patterns: vec!["srv.*.cpu".to_string()],
            })
            .await
            .unwrap();
    }

    // Batch size 2 forces an immediate flush without waiting for the tick.
    assert_eq!(events.recv().await.unwrap(), "srv.*.cpu");

    let values = store.get_metric_values("srv.a.cpu", 0, 2000).await.unwrap();
    assert_eq!(values.len(), 1);
    let mut members = store.get_pattern_metrics("srv.*.cpu").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["srv.a.cpu", "srv.b.cpu"]);
    assert!(store
        .get_heartbeat(klaxon_store::HEARTBEAT_FILTER)
        .await
        .unwrap()
        .is_some());

    shutdown.cancel();
    drop(points_tx);
    task.await.unwrap();
}

#[tokio::test]
async fn flusher_flushes_remainder_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(FilterMetrics::new());
    let (points_tx, points_rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    points_tx
        .send(crate::MatchedPoint {
            point: klaxon_common::types::MetricPoint {
                name: "srv.a.cpu".to_string(),
                timestamp: 1000,
                value: 1.0,
                retention: 600,
            },
            patterns: vec!["srv.*.cpu".to_string()],
        })
        .await
        .unwrap();

    let flusher = Flusher::new(
        store.clone() as Arc<dyn Store>,
        100,
        Duration::from_secs(60),
        metrics,
    );
    shutdown.cancel();
    flusher.run(points_rx, shutdown).await;

    let values = store.get_metric_values("srv.a.cpu", 0, 2000).await.unwrap();
    assert_eq!(values.len(), 1);
}
