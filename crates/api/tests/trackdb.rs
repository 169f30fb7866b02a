#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tidewatch_api::{Clause, Filter, MockTrackDb, StoreTrackDb, TrackDb, TrackDbError, TRACKS_COLLECTION};
use tidewatch_core::{
    CircularRange, DeviceType, Metadata, PipelineConfig, RequestMode, Status, Target, Track, TrackFilter, TrackRequest,
    TrackUpdate,
};
use tidewatch_feed::{DocumentStore, MemoryStore, Query, RawRecord, RecordId, RecordStream, StoreError, TailCursor, TailStart};
use tidewatch_pipeline::{NullStage, TrackPipeline};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let env = std::env::var("TIDEWATCH_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

fn config() -> PipelineConfig {
    PipelineConfig { tail_timeout: Duration::from_millis(20), restart_pause: Duration::from_millis(10), ..Default::default() }
}

fn report(id: &str, registry: Option<&str>, time: DateTime<Utc>) -> serde_json::Value {
    let track = Track { registry_id: registry.map(String::from), ..Track::new(id) }
        .with_target(Target::new(DeviceType::Ais, time).at(1.0, 2.0));
    serde_json::to_value(track).unwrap()
}

fn minutes_ago(m: i64) -> DateTime<Utc> { Utc::now() - chrono::Duration::minutes(m) }

fn db(store: &MemoryStore) -> StoreTrackDb { StoreTrackDb::new(Arc::new(store.clone()), config()) }

async fn next(rx: &mut tokio::sync::mpsc::Receiver<TrackUpdate>) -> TrackUpdate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("stream stalled").expect("stream closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_tracks_returns_latest_report_per_track() {
    init_tracing();
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("B", None, minutes_ago(3)));
    store.insert(TRACKS_COLLECTION, report("A", None, minutes_ago(4)));
    store.insert(TRACKS_COLLECTION, report("A", None, minutes_ago(1)));
    // outside the default history window
    store.insert(TRACKS_COLLECTION, report("OLD", None, minutes_ago(120)));

    let tracks = db(&store).get_tracks(TrackRequest::default()).await.unwrap();
    let ids: Vec<_> = tracks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["A", "B"]);
    assert_eq!(tracks[0].targets.len(), 1);
    let newest = tracks[0].targets[0].time;
    assert!(newest > minutes_ago(2), "A carries its latest report");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_tracks_honours_id_and_registry_filters() {
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("A", Some("R1"), minutes_ago(1)));
    store.insert(TRACKS_COLLECTION, report("B", Some("R2"), minutes_ago(1)));
    store.insert(TRACKS_COLLECTION, report("C", None, minutes_ago(1)));

    let by_id = TrackRequest { filter: Some(TrackFilter { tracks: vec!["C".into()], ..Default::default() }), ..Default::default() };
    let tracks = db(&store).get_tracks(by_id).await.unwrap();
    assert_eq!(tracks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["C"]);

    let by_registry = TrackRequest { filter: Some(TrackFilter { registries: vec!["R2".into()], ..Default::default() }), ..Default::default() };
    let tracks = db(&store).get_tracks(by_registry).await.unwrap();
    assert_eq!(tracks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_mode_returns_best_named_tracks() {
    let store = MemoryStore::new();
    for (id, name) in [("1", "zulu"), ("2", "alpha"), ("3", "mike")] {
        let t = minutes_ago(1);
        let track = Track::new(id).with_target(Target::new(DeviceType::Ais, t)).with_metadata(Metadata::new(DeviceType::Ais, t, Some(name)));
        store.insert(TRACKS_COLLECTION, serde_json::to_value(track).unwrap());
    }
    let req = TrackRequest { mode: RequestMode::Search, limit: 2, ..Default::default() };
    let tracks = db(&store).get_tracks(req).await.unwrap();
    assert_eq!(tracks.iter().filter_map(|t| t.name()).collect::<Vec<_>>(), ["alpha", "mike"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_filter_is_a_validation_error() {
    let store = MemoryStore::new();
    let req = TrackRequest {
        filter: Some(TrackFilter { circular: vec![CircularRange { center: None, radius_nm: 1.0 }], ..Default::default() }),
        ..Default::default()
    };
    let err = db(&store).get_tracks(req).await.unwrap_err();
    assert!(matches!(err, TrackDbError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn track_stream_moves_from_backlog_to_live() {
    init_tracing();
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("A", None, minutes_ago(1)));

    let mut handle = db(&store).get_track_stream(TrackRequest::default()).await.unwrap();
    let first = next(&mut handle.rx).await;
    assert_eq!((first.status, first.track_id()), (Status::Current, Some("A")));
    assert_eq!(next(&mut handle.rx).await.status, Status::InitialLoadDone);

    store.insert(TRACKS_COLLECTION, report("B", None, Utc::now()));
    let live = next(&mut handle.rx).await;
    assert_eq!((live.status, live.track_id()), (Status::Current, Some("B")));

    handle.cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "stream closes after cancel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn historical_stream_ignores_seam_duplicate() {
    init_tracing();
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("A", None, minutes_ago(1)));

    let req = TrackRequest { history: Some(Duration::from_secs(3600)), ..Default::default() };
    let mut handle = db(&store).get_track_stream(req).await.unwrap();
    let first = next(&mut handle.rx).await;
    assert_eq!(first.track_id(), Some("A"));
    assert_eq!(first.track.as_ref().unwrap().targets.len(), 1);
    assert_eq!(next(&mut handle.rx).await.status, Status::InitialLoadDone);

    // the live tail starts at the last backlog document and replays it
    store.insert(TRACKS_COLLECTION, report("B", None, Utc::now()));
    let live = next(&mut handle.rx).await;
    assert_eq!(live.track_id(), Some("B"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.rx.try_recv().is_err(), "no second copy of A");
}

/// Store whose every operation fails.
struct BrokenStore;

#[async_trait::async_trait]
impl DocumentStore for BrokenStore {
    async fn find(&self, _collection: &str, _query: &Query) -> Result<RecordStream, StoreError> {
        Err(StoreError::Other(anyhow::anyhow!("disk on fire")))
    }

    async fn tail(&self, _collection: &str, _start: TailStart, _poll: Duration) -> Result<Box<dyn TailCursor>, StoreError> {
        Err(StoreError::Other(anyhow::anyhow!("disk on fire")))
    }

    async fn get(&self, _collection: &str, _filter: &Filter, _id: RecordId) -> Result<Option<RawRecord>, StoreError> {
        Err(StoreError::Other(anyhow::anyhow!("disk on fire")))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_failure_is_reported_by_get_tracks() {
    init_tracing();
    let db = StoreTrackDb::new(Arc::new(BrokenStore), config());
    let err = db.get_tracks(TrackRequest::default()).await.unwrap_err();
    match err {
        TrackDbError::Internal(msg) => assert!(msg.contains("disk on fire"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_pipeline_sees_raw_feed() {
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("A", None, minutes_ago(1)));
    let cancel = CancellationToken::new();
    let mut stages = TrackPipeline::new();
    stages.append(NullStage);
    let mut handle = db(&store).get_pipeline(stages, cancel.clone()).await.unwrap();
    // raw feed: the reader's own lifecycle markers are not filtered out
    assert_eq!(next(&mut handle.rx).await.status, Status::Starting);
    assert_eq!(next(&mut handle.rx).await.track_id(), Some("A"));
    assert_eq!(next(&mut handle.rx).await.status, Status::InitialLoadDone);
    drop(handle);
    assert!(cancel.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_and_last_track_by_update_time() {
    let store = MemoryStore::new();
    store.insert(TRACKS_COLLECTION, report("MID", Some("R"), minutes_ago(5)));
    store.insert(TRACKS_COLLECTION, report("OLDEST", Some("R"), minutes_ago(9)));
    store.insert(TRACKS_COLLECTION, report("NEWEST", Some("R"), minutes_ago(1)));
    store.insert(TRACKS_COLLECTION, report("OTHER", Some("X"), Utc::now()));
    let db = db(&store);

    let registry = Filter::all().and(Clause::Eq("registry_id".into(), json!("R")));
    assert_eq!(db.get_last_track(registry.clone()).await.unwrap().id, "NEWEST");
    assert_eq!(db.get_first_track(registry).await.unwrap().id, "OLDEST");

    let none = Filter::all().and(Clause::Eq("id".into(), json!("missing")));
    assert!(matches!(db.get_last_track(none).await, Err(TrackDbError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mock_serves_fixed_tracks() {
    let t = Utc::now();
    let mock = MockTrackDb::new(vec![
        Track::new("B").with_target(Target::new(DeviceType::Radar, t)),
        Track::new("A").with_target(Target::new(DeviceType::Radar, t - chrono::Duration::minutes(1))),
    ]);
    let ids: Vec<_> = mock.get_tracks(TrackRequest::default()).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, ["A", "B"]);
    assert_eq!(mock.get_last_track(Filter::all()).await.unwrap().id, "B");
    assert_eq!(mock.get_first_track(Filter::all()).await.unwrap().id, "A");

    let mut s = mock.get_track_stream(TrackRequest::default()).await.unwrap();
    assert_eq!(next(&mut s.rx).await.track_id(), Some("B"));
    assert_eq!(next(&mut s.rx).await.track_id(), Some("A"));
    assert_eq!(next(&mut s.rx).await.status, Status::InitialLoadDone);
}
