mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_test::assert_ok;

use common::{frame, ingestor, pg_frame, routes, RecordingStore, StoreCall, FULL_BODY};
use pgstats_drain::MetricTable;

const TS: &str = "2024-04-28T00:03:49+00:00";

fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

fn assert_close(value: &serde_json::Value, expected: f64) {
    let actual = value.as_f64().unwrap_or_else(|| panic!("{} is not a number", value));
    assert!((actual - expected).abs() < 1e-9, "{} != {}", actual, expected);
}

#[tokio::test]
async fn end_to_end_example_batch() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let summary = ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await;
    assert_eq!(summary.frames, 1);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.written, 1);
    assert_eq!(summary.framing_error, None);

    let ensures = store.ensures();
    assert_eq!(ensures.len(), 2);
    assert!(ensures.iter().all(|(_, at)| *at == ts(TS)));
    let metrics: Vec<_> = ensures.iter().map(|(m, _)| m.as_str()).collect();
    assert!(metrics.contains(&"cpu_load"));
    assert!(metrics.contains(&"heroku_pg_stats"));

    let writes = store.writes_for("tenantA");
    assert_eq!(writes.len(), 2);

    let (_, narrow) = writes.iter().find(|(t, _)| *t == MetricTable::Narrow).unwrap();
    assert_eq!(narrow.as_object().unwrap().len(), 3);
    assert_close(&narrow["load_1min"], 0.285);
    assert_close(&narrow["load_5min"], 0.345);
    assert_close(&narrow["load_15min"], 0.39);

    let (_, wide) = writes.iter().find(|(t, _)| *t == MetricTable::Wide).unwrap();
    assert_eq!(wide.as_object().unwrap().len(), 12);
    assert_close(&wide["load_1min"], 0.285);
    assert_close(&wide["load_5min"], 0.345);
    assert_close(&wide["load_15min"], 0.39);
    assert_close(&wide["readiops"], 0.0);
    assert_close(&wide["writeiops"], 2.597);
    assert_eq!(wide["tmpdiskused"], 543633408i64);
    assert_eq!(wide["tmpdiskavailable"], 72435159040i64);
    assert_eq!(wide["memorytotal"], 3944484);
    assert_eq!(wide["memoryfree"], 74980);
    assert_eq!(wide["memorycached"], 2984436);
    assert_eq!(wide["memorypostgres"], 33960);
    assert_close(&wide["walpercentageused"], 0.0665);

    // Second batch for the same source does not initialize again.
    ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await;
    assert_eq!(store.ensures().len(), 2);
    assert_eq!(store.writes_for("tenantA").len(), 4);
}

#[tokio::test]
async fn initialization_precedes_first_write() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await;

    let calls = store.calls();
    let first_write = calls
        .iter()
        .position(|c| matches!(c, StoreCall::Write { .. }))
        .unwrap();
    let last_ensure = calls
        .iter()
        .rposition(|c| matches!(c, StoreCall::Ensure { .. }))
        .unwrap();
    assert!(last_ensure < first_write);
}

#[tokio::test]
async fn unknown_source_is_neither_initialized_nor_written() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let body = FULL_BODY.replace("source=DATABASE", "source=DATABASE_OTHER");
    let summary = ingestor.process_batch(Bytes::from(pg_frame(TS, &body))).await;

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.unrouted, 1);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn other_processes_are_filtered() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let body = format!(
        "{}{}{}",
        frame("router", TS, "at=info method=GET path=/"),
        frame("web.1", TS, FULL_BODY),
        pg_frame(TS, FULL_BODY)
    );
    let summary = ingestor.process_batch(Bytes::from(body)).await;

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.matched, 1);
    assert_eq!(store.writes().len(), 2);
}

#[tokio::test]
async fn corrupt_metric_value_only_zeroes_that_field() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let body = FULL_BODY.replace("sample#memory-free=74980kB", "sample#memory-free=lots");
    let summary = ingestor.process_batch(Bytes::from(pg_frame(TS, &body))).await;
    assert_eq!(summary.written, 1);

    let writes = store.writes_for("tenantA");
    let (_, wide) = writes.iter().find(|(t, _)| *t == MetricTable::Wide).unwrap();
    assert_eq!(wide["memoryfree"], 0);
    assert_eq!(wide["memorytotal"], 3944484);
    assert_eq!(wide["memorycached"], 2984436);
}

#[tokio::test]
async fn bad_timestamp_skips_only_that_record() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let body = format!(
        "{}{}",
        pg_frame("yesterday", FULL_BODY),
        pg_frame(TS, FULL_BODY)
    );
    let summary = ingestor.process_batch(Bytes::from(body)).await;

    assert_eq!(summary.matched, 2);
    assert_eq!(summary.timestamp_failures, 1);
    assert_eq!(summary.written, 1);
    assert_eq!(store.writes().len(), 2);
}

#[tokio::test]
async fn truncated_batch_keeps_earlier_frames() {
    let store = RecordingStore::new();
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let complete = pg_frame(TS, FULL_BODY);
    let partial = &pg_frame(TS, FULL_BODY)[..40];
    let summary = ingestor
        .process_batch(Bytes::from(format!("{}{}", complete, partial)))
        .await;

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.written, 1);
    assert!(summary.framing_error.is_some());
}

#[tokio::test]
async fn failed_wide_write_does_not_block_narrow() {
    let store = RecordingStore::new();
    store.fail_writes_to(MetricTable::Wide);
    let ingestor = ingestor(routes(&[("DATABASE", "tenantA")]), store.clone());

    let summary = ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await;

    assert_eq!(summary.written, 0);
    assert_eq!(summary.write_failures, 1);
    let writes = store.writes_for("tenantA");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, MetricTable::Narrow);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_records_initialize_once() {
    let store = RecordingStore::new();
    let gate = store.hold_init_at(ts(TS));
    let ingestor = Arc::new(ingestor(routes(&[("DATABASE", "tenantA")]), store.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ingestor = ingestor.clone();
            tokio::spawn(async move { ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await })
        })
        .collect();

    // Nothing is written while the initialization is still running.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.writes().is_empty());

    gate.add_permits(2);
    for handle in handles {
        let summary = assert_ok!(handle.await);
        assert_eq!(summary.written, 1);
    }

    assert_eq!(store.ensures().len(), 2);
    assert_eq!(store.writes_for("tenantA").len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_source_initializes_once() {
    const SOURCES: [(&str, &str); 3] = [
        ("DATABASE", "tenantA"),
        ("DATABASE_ONYX", "tenantB"),
        ("HEROKU_POSTGRESQL_RED", "tenantC"),
    ];

    let store = RecordingStore::new();
    let ingestor = Arc::new(ingestor(routes(&SOURCES), store.clone()));

    let handles: Vec<_> = SOURCES
        .iter()
        .flat_map(|(source, _)| {
            let body = FULL_BODY.replace("source=DATABASE", &format!("source={}", source));
            let batch = format!("{}{}", pg_frame(TS, &body), pg_frame(TS, &body));
            let ingestor = ingestor.clone();
            // Two concurrent requests per source.
            (0..2).map(move |_| {
                let ingestor = ingestor.clone();
                let batch = batch.clone();
                tokio::spawn(async move { ingestor.process_batch(Bytes::from(batch)).await })
            })
            .collect::<Vec<_>>()
        })
        .collect();

    for handle in handles {
        let summary = assert_ok!(handle.await);
        assert_eq!(summary.written, 2);
    }

    assert_eq!(store.ensures().len(), 2 * SOURCES.len());
    for (_, tenant) in SOURCES {
        assert_eq!(store.writes_for(tenant).len(), 8);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_first_request_still_initializes_source() {
    const LATER_TS: &str = "2024-04-28T00:04:49+00:00";

    let store = RecordingStore::new();
    let gate = store.hold_init_at(ts(TS));
    let ingestor = Arc::new(ingestor(routes(&[("DATABASE", "tenantA")]), store.clone()));

    let first = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move { ingestor.process_batch(Bytes::from(pg_frame(TS, FULL_BODY))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    let second = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move { ingestor.process_batch(Bytes::from(pg_frame(LATER_TS, FULL_BODY))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.writes().is_empty());

    gate.add_permits(2);
    let summary = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("second request must finish once initialization does");
    assert_eq!(assert_ok!(summary).written, 1);

    let ensures = store.ensures();
    assert_eq!(ensures.len(), 2);
    assert!(ensures.iter().all(|(_, at)| *at == ts(TS)));
    assert_eq!(store.writes_for("tenantA").len(), 2);

    let calls = store.calls();
    let first_write = calls
        .iter()
        .position(|c| matches!(c, StoreCall::Write { .. }))
        .unwrap();
    let last_ensure = calls
        .iter()
        .rposition(|c| matches!(c, StoreCall::Ensure { .. }))
        .unwrap();
    assert!(last_ensure < first_write);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_initialization_does_not_stall_other_sources() {
    const SLOW_TS: &str = "2024-04-28T00:04:49+00:00";

    let store = RecordingStore::new();
    let gate = store.hold_init_at(ts(SLOW_TS));
    let ingestor = Arc::new(ingestor(
        routes(&[("DATABASE", "tenantA"), ("DATABASE_ONYX", "tenantB")]),
        store.clone(),
    ));

    let slow = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move { ingestor.process_batch(Bytes::from(pg_frame(SLOW_TS, FULL_BODY))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = FULL_BODY.replace("source=DATABASE", "source=DATABASE_ONYX");
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        ingestor.process_batch(Bytes::from(pg_frame(TS, &other))),
    )
    .await
    .expect("tenantB must not wait for tenantA");

    assert_eq!(summary.written, 1);
    assert_eq!(store.writes_for("tenantB").len(), 2);
    assert!(store.writes_for("tenantA").is_empty());
    assert!(!slow.is_finished());

    gate.add_permits(2);
    let summary = assert_ok!(slow.await);
    assert_eq!(summary.written, 1);
    assert_eq!(store.writes_for("tenantA").len(), 2);
    assert_eq!(store.ensures().len(), 4);
}
