#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tidewatch_core::{
    CircularRange, DeviceType, PipelineConfig, RequestMode, Status, Target, TimeKeeper, Track, TrackError, TrackFilter,
    TrackRequest, TrackUpdate,
};
use tidewatch_pipeline::{
    GeoFilter, LogStage, MergeOptions, NullStage, PipelineStage, TimeoutPolicy, TrackMerger, TrackPipeline, TrackTimeouts,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let env = std::env::var("TIDEWATCH_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

fn at(h: u32, m: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap() }

fn ais(id: &str, time: DateTime<Utc>) -> Track { Track::new(id).with_target(Target::new(DeviceType::Ais, time)) }

async fn next(rx: &mut mpsc::Receiver<TrackUpdate>) -> Option<TrackUpdate> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("stage stalled")
}

async fn collect(mut rx: mpsc::Receiver<TrackUpdate>) -> Vec<TrackUpdate> {
    let mut out = Vec::new();
    while let Some(u) = next(&mut rx).await {
        out.push(u);
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_data_waits_for_every_backlog() {
    init_tracing();
    let cancel = CancellationToken::new();
    let mut merger = TrackMerger::new(MergeOptions::default(), cancel.clone(), 16);
    merger.service();
    let mut out = merger.output().unwrap();

    let (a_tx, a_rx) = mpsc::channel(8);
    let (b_tx, b_rx) = mpsc::channel(8);
    assert!(merger.add_stream(a_rx, "a").await);
    assert!(merger.add_stream(b_rx, "b").await);
    assert!(merger.setup_finished().await);

    a_tx.send(TrackUpdate::current(ais("A", at(10, 0)))).await.unwrap();
    a_tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    a_tx.send(TrackUpdate::current(ais("L", at(10, 30)))).await.unwrap();
    b_tx.send(TrackUpdate::current(ais("B", at(10, 1)))).await.unwrap();

    let mut seen = vec![next(&mut out).await.unwrap(), next(&mut out).await.unwrap()];
    seen.sort_by(|x, y| x.track_id().cmp(&y.track_id()));
    assert_eq!(seen.iter().map(|u| u.track_id()).collect::<Vec<_>>(), [Some("A"), Some("B")]);

    // stream b is still in backlog: the live record must not show up
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(out.try_recv().is_err());

    b_tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    assert_eq!(next(&mut out).await.unwrap().status, Status::InitialLoadDone);
    let live = next(&mut out).await.unwrap();
    assert_eq!(live.track_id(), Some("L"));

    drop(a_tx);
    drop(b_tx);
    let rest = collect(out).await;
    assert!(rest.iter().all(|u| u.status != Status::InitialLoadDone), "exactly one initial load marker");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_producer_stalls_while_another_stream_loads() {
    init_tracing();
    let cancel = CancellationToken::new();
    let mut merger = TrackMerger::new(MergeOptions::default(), cancel.clone(), 16);
    merger.service();
    let mut out = merger.output().unwrap();

    let (a_tx, a_rx) = mpsc::channel(1);
    let (b_tx, b_rx) = mpsc::channel(1);
    assert!(merger.add_stream(a_rx, "a").await);
    assert!(merger.add_stream(b_rx, "b").await);
    assert!(merger.setup_finished().await);
    a_tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();

    let producer = tokio::spawn(async move {
        for i in 0..100 {
            a_tx.send(TrackUpdate::current(ais(&format!("L{i:03}"), at(10, 30)))).await.unwrap();
        }
        a_tx
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!producer.is_finished(), "live sends block while stream b is in backlog");
    assert!(out.try_recv().is_err());

    b_tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    assert_eq!(next(&mut out).await.unwrap().status, Status::InitialLoadDone);
    for i in 0..100 {
        let u = next(&mut out).await.unwrap();
        assert_eq!(u.status, Status::Current);
        assert_eq!(u.track_id().map(str::to_string), Some(format!("L{i:03}")));
    }
    let a_tx = tokio::time::timeout(Duration::from_secs(5), producer).await.expect("producer released").unwrap();
    drop(a_tx);
    drop(b_tx);
    assert!(collect(out).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_fragment_is_not_forwarded() {
    init_tracing();
    let cancel = CancellationToken::new();
    let merger = TrackMerger::new(MergeOptions::default(), cancel, 16);
    let (tx, rx) = mpsc::channel(8);
    let out = Box::new(merger).start(rx).await.unwrap();

    for m in [0, 5, 2] {
        tx.send(TrackUpdate::current(ais("A", at(10, m)))).await.unwrap();
    }
    tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    drop(tx);

    let got = collect(out).await;
    assert_eq!(got.len(), 3);
    let times: Vec<_> = got[..2].iter().map(|u| u.track.as_ref().unwrap().targets[0].time).collect();
    assert_eq!(times, [at(10, 0), at(10, 5)]);
    assert!(got[..2].iter().all(|u| u.track.as_ref().unwrap().targets.len() == 1));
    assert_eq!(got[2].status, Status::InitialLoadDone);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn historical_merge_flushes_sorted_table_before_marker() {
    init_tracing();
    let opts = MergeOptions { historical: true, ..Default::default() };
    let merger = TrackMerger::new(opts, CancellationToken::new(), 16);
    let (tx, rx) = mpsc::channel(8);
    let out = Box::new(merger).start(rx).await.unwrap();

    tx.send(TrackUpdate::current(ais("B", at(9, 0)))).await.unwrap();
    tx.send(TrackUpdate::current(ais("A", at(9, 0)))).await.unwrap();
    tx.send(TrackUpdate::current(ais("B", at(9, 10)))).await.unwrap();
    tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    tx.send(TrackUpdate::current(ais("A", at(9, 20)))).await.unwrap();
    drop(tx);

    let got = collect(out).await;
    let ids: Vec<_> = got.iter().map(|u| (u.status, u.track_id())).collect();
    assert_eq!(
        ids,
        [
            (Status::Current, Some("A")),
            (Status::Current, Some("B")),
            (Status::InitialLoadDone, None),
            (Status::Current, Some("A")),
        ]
    );
    let b = got[1].track.as_ref().unwrap();
    assert_eq!(b.targets.iter().map(|t| t.time).collect::<Vec<_>>(), [at(9, 10), at(9, 0)]);
    assert_eq!(got[3].track.as_ref().unwrap().targets.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elapsed_one_off_report_is_forwarded_as_timeout() {
    init_tracing();
    let now = Utc::now();
    let stage = TrackTimeouts::new(TimeoutPolicy::new(chrono::Duration::minutes(15)), TimeKeeper::wall(), CancellationToken::new(), 8);
    let (tx, rx) = mpsc::channel(8);
    let mut out = Box::new(stage).start(rx).await.unwrap();

    let target = Target { update_time: Some(now), ..Target::new(DeviceType::Radar, now - chrono::Duration::minutes(20)) };
    tx.send(TrackUpdate::current(Track::new("OLD").with_target(target))).await.unwrap();
    let u = next(&mut out).await.unwrap();
    assert_eq!(u.status, Status::Timeout);
    assert_eq!(u.track_id(), Some("OLD"));

    // refreshed at its own event time, but the deadline has already passed
    let elapsed = Target::new(DeviceType::Ais, now - chrono::Duration::minutes(16));
    tx.send(TrackUpdate::current(Track::new("LATE").with_target(elapsed))).await.unwrap();
    let u = next(&mut out).await.unwrap();
    assert_eq!((u.status, u.track_id()), (Status::Timeout, Some("LATE")));

    tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    assert_eq!(next(&mut out).await.unwrap().status, Status::InitialLoadDone);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_track_times_out_once() {
    init_tracing();
    let policy = TimeoutPolicy::new(chrono::Duration::milliseconds(300));
    let stage = TrackTimeouts::new(policy, TimeKeeper::wall(), CancellationToken::new(), 8);
    let (tx, rx) = mpsc::channel(8);
    let mut out = Box::new(stage).start(rx).await.unwrap();

    tx.send(TrackUpdate::current(ais("A", Utc::now()))).await.unwrap();
    assert_eq!(next(&mut out).await.unwrap().status, Status::Current);
    let timed_out = next(&mut out).await.unwrap();
    assert_eq!(timed_out.status, Status::Timeout);
    assert_eq!(timed_out.track_id(), Some("A"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(out.try_recv().is_err());
    drop(tx);
    assert!(next(&mut out).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn geo_filter_without_ranges_is_transparent() {
    let stage = GeoFilter::new(&TrackRequest::default(), CancellationToken::new(), 8).unwrap();
    let (tx, rx) = mpsc::channel(8);
    let out = Box::new(stage).start(rx).await.unwrap();
    tx.send(TrackUpdate::current(Track::new("nowhere"))).await.unwrap();
    drop(tx);
    let got = collect(out).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].track_id(), Some("nowhere"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipeline_folds_stages_in_order() {
    let cancel = CancellationToken::new();
    let mut p = TrackPipeline::new();
    p.append(NullStage);
    p.append(LogStage::new(cancel.clone(), 4));
    p.append(NullStage);
    assert_eq!(p.len(), 3);
    let (tx, rx) = mpsc::channel(4);
    let out = p.start(rx).await.unwrap();
    for id in ["1", "2", "3"] {
        tx.send(TrackUpdate::current(Track::new(id))).await.unwrap();
    }
    drop(tx);
    let ids: Vec<_> = collect(out).await.into_iter().filter_map(|u| u.track.map(|t| t.id)).collect();
    assert_eq!(ids, ["1", "2", "3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_filter_fails_pipeline_construction() {
    let req = TrackRequest {
        filter: Some(TrackFilter { circular: vec![CircularRange { center: None, radius_nm: 5.0 }], ..Default::default() }),
        ..Default::default()
    };
    let err = TrackPipeline::for_request(&req, &PipelineConfig::default(), &CancellationToken::new()).err();
    assert!(matches!(err, Some(TrackError::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn standard_pipeline_streams_then_searches() {
    init_tracing();
    let cfg = PipelineConfig::default();
    let now = Utc::now();

    let p = TrackPipeline::for_request(&TrackRequest::default(), &cfg, &CancellationToken::new()).unwrap();
    let (tx, rx) = mpsc::channel(8);
    let out = p.start(rx).await.unwrap();
    tx.send(TrackUpdate::current(ais("A", now))).await.unwrap();
    tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    drop(tx);
    let got: Vec<_> = collect(out).await.into_iter().map(|u| u.status).collect();
    assert_eq!(got, [Status::Current, Status::InitialLoadDone]);

    let req = TrackRequest { mode: RequestMode::Search, limit: 2, ..Default::default() };
    let p = TrackPipeline::for_request(&req, &cfg, &CancellationToken::new()).unwrap();
    let (tx, rx) = mpsc::channel(8);
    let out = p.start(rx).await.unwrap();
    for id in ["C", "A", "B"] {
        tx.send(TrackUpdate::current(ais(id, now))).await.unwrap();
    }
    tx.send(TrackUpdate::marker(Status::InitialLoadDone)).await.unwrap();
    drop(tx);
    let got = collect(out).await;
    assert!(got.iter().all(|u| u.status == Status::Current));
    assert_eq!(got.iter().map(|u| u.track_id()).collect::<Vec<_>>(), [Some("A"), Some("B")]);
}
