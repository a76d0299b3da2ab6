//! Integration tests for the discovery pass and the insight enqueuer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use workq::clock::mock::MockClock;
use workq::discovery::enqueuer::InsightEnqueuer;
use workq::discovery::{
    DefinitionSource, EnqueuerConfig, FileSource, Insight, Series, StaticSource,
    discover_and_enqueue, encode,
};
use workq::error::{Error, Result};
use workq::model::{NewWorkRecord, State, WorkId, priority};
use workq::store::{MemoryStore, QueueStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn series(query: &str) -> Series {
    Series {
        label: query.to_string(),
        query: query.to_string(),
        repositories: Vec::new(),
    }
}

fn insight(id: &str, queries: &[&str]) -> Insight {
    Insight {
        id: id.to_string(),
        title: id.to_string(),
        description: String::new(),
        series: queries.iter().map(|q| series(q)).collect(),
    }
}

struct FailingSource;

#[async_trait]
impl DefinitionSource for FailingSource {
    async fn discover(&self) -> Result<Vec<Insight>> {
        Err(Error::Other("definitions table unavailable".to_string()))
    }
}

// ---------------------------------------------------------------------------
// discover_and_enqueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spreads_eligibility_by_offset() {
    let source = StaticSource::new(vec![
        insight("a", &["lang:go", "lang:rust"]),
        insight("b", &["lang:python", "lang:java", "lang:c"]),
    ]);
    let emitted = Mutex::new(Vec::<NewWorkRecord>::new());

    let summary = discover_and_enqueue(t0(), &source, &EnqueuerConfig::default(), |record| {
        emitted.lock().unwrap().push(record);
        async { Ok(WorkId::new()) }
    })
    .await
    .unwrap();

    assert_eq!(summary.unique, 5);
    assert_eq!(summary.enqueued, 5);

    let offsets: Vec<i64> = emitted
        .lock()
        .unwrap()
        .iter()
        .map(|r| (r.process_after.unwrap() - t0()).num_seconds())
        .collect();
    assert_eq!(offsets, [0, 30, 60, 90, 120]);
}

#[tokio::test]
async fn same_query_across_insights_is_one_record() {
    let source = StaticSource::new(vec![
        insight("go-adoption", &["lang:go"]),
        insight("go-again", &["lang:go"]),
        insight("explicit-count", &["lang:go count:9999999"]),
    ]);
    let emitted = Mutex::new(Vec::<NewWorkRecord>::new());

    let summary = discover_and_enqueue(t0(), &source, &EnqueuerConfig::default(), |record| {
        emitted.lock().unwrap().push(record);
        async { Ok(WorkId::new()) }
    })
    .await
    .unwrap();

    assert_eq!(summary.unique, 1);
    assert_eq!(summary.repeated, 2);

    let emitted = emitted.into_inner().unwrap();
    assert_eq!(emitted.len(), 1);
    let record = &emitted[0];
    assert_eq!(record.queue_name, "insights");
    assert_eq!(record.identity, encode(&series("lang:go")));
    assert_eq!(record.priority, priority::HIGH);
    assert_eq!(
        record.payload["search_query"],
        "lang:go count:9999999"
    );
    assert_eq!(record.payload["series_id"], record.identity);
}

#[tokio::test]
async fn keeps_going_after_emit_failures() {
    let source = StaticSource::new(vec![insight("a", &["one", "two", "three"])]);
    let mut calls = 0;

    let err = discover_and_enqueue(t0(), &source, &EnqueuerConfig::default(), |_record| {
        calls += 1;
        let fail = calls == 2;
        async move {
            if fail {
                Err(Error::Other("connection reset".to_string()))
            } else {
                Ok(WorkId::new())
            }
        }
    })
    .await
    .unwrap_err();

    assert_eq!(calls, 3);
    match err {
        Error::Aggregate(list) => {
            assert_eq!(list.len(), 1);
            assert!(list.to_string().contains("connection reset"));
        }
        other => panic!("expected Aggregate, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_rejections_are_not_errors() {
    let source = StaticSource::new(vec![insight("a", &["one", "two"])]);

    let summary = discover_and_enqueue(t0(), &source, &EnqueuerConfig::default(), |record| {
        let err = Error::Duplicate {
            queue: record.queue_name.clone(),
            identity: record.identity.clone(),
        };
        async move { Err(err) }
    })
    .await
    .unwrap();

    assert_eq!(summary.already_queued, 2);
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn source_failure_emits_nothing() {
    let mut calls = 0;
    let err = discover_and_enqueue(t0(), &FailingSource, &EnqueuerConfig::default(), |_| {
        calls += 1;
        async { Ok(WorkId::new()) }
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::DiscoverySource(_)));
    assert_eq!(calls, 0);
}

// ---------------------------------------------------------------------------
// InsightEnqueuer
// ---------------------------------------------------------------------------

fn enqueuer(store: Arc<MemoryStore>, source: Arc<dyn DefinitionSource>) -> InsightEnqueuer {
    InsightEnqueuer::new(
        store,
        source,
        EnqueuerConfig::default(),
        Arc::new(MockClock::new(t0())),
    )
}

#[tokio::test]
async fn repeated_passes_do_not_duplicate_pending_work() {
    let store = Arc::new(MemoryStore::with_clock(Arc::new(MockClock::new(t0()))));
    let source = Arc::new(StaticSource::new(vec![
        insight("a", &["lang:go", "lang:rust"]),
        insight("b", &["lang:go"]),
    ]));
    let enqueuer = enqueuer(Arc::clone(&store), source);

    let first = enqueuer.run_once().await.unwrap();
    assert_eq!(first.enqueued, 2);
    assert_eq!(first.repeated, 1);

    let second = enqueuer.run_once().await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.already_queued, 2);

    let records = store.list("insights", None, 10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state == State::Queued));
}

#[tokio::test]
async fn completed_work_is_enqueued_again_next_pass() {
    let clock = Arc::new(MockClock::new(t0()));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let source = Arc::new(StaticSource::new(vec![insight("a", &["lang:go"])]));
    let enqueuer = enqueuer(Arc::clone(&store), source);

    enqueuer.run_once().await.unwrap();
    let claimed = store.claim("insights", "w").await.unwrap().unwrap();
    store
        .finalize(
            claimed.id,
            claimed.lease_token.unwrap(),
            workq::model::Outcome::success(),
        )
        .await
        .unwrap();

    let summary = enqueuer.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
}

#[tokio::test]
async fn file_source_reads_definitions_each_pass() {
    let path = std::env::temp_dir().join(format!("workq-defs-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        r#"
        [[insights]]
        id = "go"

        [[insights.series]]
        query = "lang:go"
        "#,
    )
    .unwrap();

    let store = Arc::new(MemoryStore::with_clock(Arc::new(MockClock::new(t0()))));
    let enqueuer = enqueuer(Arc::clone(&store), Arc::new(FileSource::new(&path)));
    assert_eq!(enqueuer.run_once().await.unwrap().enqueued, 1);

    std::fs::write(
        &path,
        r#"
        [[insights]]
        id = "go"

        [[insights.series]]
        query = "lang:go"

        [[insights.series]]
        query = "lang:rust"
        "#,
    )
    .unwrap();
    let summary = enqueuer.run_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.already_queued, 1);

    std::fs::remove_file(&path).unwrap();
    let err = enqueuer.run_once().await.unwrap_err();
    assert!(matches!(err, Error::DiscoverySource(_)));
}
