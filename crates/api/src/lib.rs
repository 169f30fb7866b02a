//! Tidewatch public API façade (in-process).
//!
//! This crate defines the stable trait that track consumers (map views,
//! search, history replay) depend on. [`StoreTrackDb`] serves it from a
//! document store change feed; [`MockTrackDb`] serves a fixed list for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tidewatch_core::{PipelineConfig, Status, Track, TrackError, TrackRequest, TrackUpdate};
use tidewatch_feed::{Decoder, DocumentStore, FeedConfig, FeedQueries, FeedReader, Query, RawRecord};
use tidewatch_pipeline::TrackPipeline;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use tidewatch_feed::{Clause, Filter};
pub use tidewatch_pipeline::PipelineStage;

/// Collection holding one document per track report.
pub const TRACKS_COLLECTION: &str = "tracks";

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq)]
pub enum TrackDbError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("canceled")]
    Canceled,
    #[error("internal: {0}")]
    Internal(String),
}

impl From<TrackError> for TrackDbError {
    fn from(e: TrackError) -> Self {
        match e {
            TrackError::Config(m) => TrackDbError::Validation(m),
            TrackError::Store(m) => TrackDbError::Internal(m),
            TrackError::Canceled => TrackDbError::Canceled,
        }
    }
}

pub type TrackDbResult<T> = Result<T, TrackDbError>;

/// Track database surface.
#[async_trait::async_trait]
pub trait TrackDb: Send + Sync {
    /// One-shot list: backlog only, latest update per track, sorted by id.
    async fn get_tracks(&self, req: TrackRequest) -> TrackDbResult<Vec<Track>>;

    /// Backlog, then `InitialLoadDone`, then live updates until canceled.
    async fn get_track_stream(&self, req: TrackRequest) -> TrackDbResult<StreamHandle<TrackUpdate>>;

    /// Raw streaming feed through caller-built stages. The stages should
    /// watch `cancel`; the returned handle cancels it.
    async fn get_pipeline(&self, stages: TrackPipeline, cancel: CancellationToken) -> TrackDbResult<StreamHandle<TrackUpdate>>;

    /// Most recently updated track matching `filter`.
    async fn get_last_track(&self, filter: Filter) -> TrackDbResult<Track>;

    /// Least recently updated track matching `filter`.
    async fn get_first_track(&self, filter: Filter) -> TrackDbResult<Track>;
}

// ----------------- Store-backed implementation -----------------

pub struct StoreTrackDb {
    store: Arc<dyn DocumentStore>,
    cfg: PipelineConfig,
    collection: String,
}

impl StoreTrackDb {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: PipelineConfig) -> Self {
        Self { store, cfg, collection: TRACKS_COLLECTION.to_string() }
    }

    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = collection.to_string();
        self
    }

    fn map_err(e: impl std::fmt::Display) -> TrackDbError { TrackDbError::Internal(e.to_string()) }

    /// Id, registry and device constraints shared by backlog and live
    /// queries; the backlog is further bounded by the history window.
    fn queries(req: &TrackRequest) -> FeedQueries {
        let mut live = Filter::all();
        if let Some(f) = &req.filter {
            if !f.tracks.is_empty() {
                live = live.and(Clause::In("id".into(), f.tracks.iter().map(|id| json!(id)).collect()));
            }
            if !f.registries.is_empty() {
                live = live.and(Clause::In("registry_id".into(), f.registries.iter().map(|id| json!(id)).collect()));
            }
            if !f.device_types.is_empty() {
                let kinds = f.device_types.iter().filter_map(|d| serde_json::to_value(d).ok()).collect();
                live = live.and(Clause::In("targets.device_type".into(), kinds));
            }
        }
        let mut backlog = live.clone();
        let window = req.max_history.and_then(|h| chrono::Duration::from_std(h).ok());
        if let Some(since) = window.and_then(|w| req.time_keeper().now().checked_sub_signed(w)) {
            backlog = backlog.and(Clause::Gte("targets.update_time".into(), json!(since.to_rfc3339())));
        }
        FeedQueries { backlog: vec![Query::new(backlog).sorted_by("targets.update_time")], live: Query::new(live) }
    }

    fn decoder() -> Decoder<TrackUpdate> {
        Arc::new(|rec: RawRecord| -> anyhow::Result<TrackUpdate> {
            let track: Track = serde_json::from_value(rec.body).context("track document does not decode")?;
            Ok(TrackUpdate::current(track))
        })
    }

    /// Start the feed for `req` and fold `pipeline` over it. The receiver
    /// resolves with the feed's outcome once the reader has stopped.
    async fn open(
        &self,
        req: &TrackRequest,
        pipeline: TrackPipeline,
        cancel: CancellationToken,
    ) -> TrackDbResult<(StreamHandle<TrackUpdate>, oneshot::Receiver<TrackDbResult<()>>)> {
        let feed_cfg = FeedConfig::from_pipeline("tracks", &self.collection, &self.cfg, req.stream);
        let reader = FeedReader::new(self.store.clone(), feed_cfg, Self::queries(req), Self::decoder(), cancel.clone())?;
        let (tx, rx) = mpsc::channel(self.cfg.feed_queue_cap.max(1));
        let out = match pipeline.start(rx).await {
            Ok(out) => out,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };
        let feed = reader.spawn(tx);
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let outcome = match feed.await {
                Ok(Ok(())) => {
                    debug!("api: feed finished");
                    Ok(())
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "api: feed failed");
                    metrics::counter!("api_feed_failures_total", 1u64);
                    Err(Self::map_err(e))
                }
                Err(e) if e.is_cancelled() => Err(TrackDbError::Canceled),
                Err(e) => {
                    warn!(error = %e, "api: feed task panicked");
                    Err(Self::map_err(e))
                }
            };
            let _ = done_tx.send(outcome);
        });
        metrics::counter!("api_streams_opened_total", 1u64, "stream" => if req.stream { "live" } else { "snapshot" });
        Ok((StreamHandle { rx: out, cancel: CancelHandle::new(cancel, Some(task)) }, done_rx))
    }

    async fn get_one(&self, filter: Filter, first: bool) -> TrackDbResult<Track> {
        let sort = if first { "targets.update_time" } else { "-targets.update_time" };
        let query = Query::new(filter).sorted_by(sort);
        let mut cursor = self.store.find(&self.collection, &query).await.map_err(Self::map_err)?;
        let rec = match cursor.next().await {
            Some(rec) => rec.map_err(Self::map_err)?,
            None => return Err(TrackDbError::NotFound("no track matches the filter".into())),
        };
        serde_json::from_value(rec.body).map_err(Self::map_err)
    }
}

#[async_trait::async_trait]
impl TrackDb for StoreTrackDb {
    async fn get_tracks(&self, mut req: TrackRequest) -> TrackDbResult<Vec<Track>> {
        let t0 = Instant::now();
        req.stream = false;
        req.populate(&self.cfg);
        info!(mode = ?req.mode, historical = req.historical(), "api: get_tracks start");
        let cancel = CancellationToken::new();
        let pipeline = TrackPipeline::for_request(&req, &self.cfg, &cancel)?;
        let (mut handle, done) = self.open(&req, pipeline, cancel).await?;
        let mut latest: BTreeMap<String, Track> = BTreeMap::new();
        while let Some(u) = handle.rx.recv().await {
            if let Some(track) = u.track {
                latest.insert(track.id.clone(), track);
            }
        }
        // the stream also ends when the store fails; a partial list is an error
        done.await.map_err(|_| TrackDbError::Internal("feed outcome lost".into()))??;
        let tracks: Vec<Track> = latest.into_values().collect();
        info!(count = tracks.len(), took_ms = %t0.elapsed().as_millis(), "api: get_tracks ok");
        Ok(tracks)
    }

    async fn get_track_stream(&self, mut req: TrackRequest) -> TrackDbResult<StreamHandle<TrackUpdate>> {
        let t0 = Instant::now();
        req.stream = true;
        req.populate(&self.cfg);
        info!(mode = ?req.mode, historical = req.historical(), replay = req.replay_time.is_some(), "api: get_track_stream start");
        let cancel = CancellationToken::new();
        let pipeline = TrackPipeline::for_request(&req, &self.cfg, &cancel)?;
        let (handle, _) = self.open(&req, pipeline, cancel).await?;
        info!(took_ms = %t0.elapsed().as_millis(), "api: get_track_stream ok");
        Ok(handle)
    }

    async fn get_pipeline(&self, stages: TrackPipeline, cancel: CancellationToken) -> TrackDbResult<StreamHandle<TrackUpdate>> {
        info!(stages = stages.len(), "api: get_pipeline start");
        let mut req = TrackRequest { stream: true, ..Default::default() };
        req.populate(&self.cfg);
        let (handle, _) = self.open(&req, stages, cancel).await?;
        Ok(handle)
    }

    async fn get_last_track(&self, filter: Filter) -> TrackDbResult<Track> {
        let t0 = Instant::now();
        let track = self.get_one(filter, false).await?;
        info!(track = %track.id, took_ms = %t0.elapsed().as_millis(), "api: get_last_track ok");
        Ok(track)
    }

    async fn get_first_track(&self, filter: Filter) -> TrackDbResult<Track> {
        let t0 = Instant::now();
        let track = self.get_one(filter, true).await?;
        info!(track = %track.id, took_ms = %t0.elapsed().as_millis(), "api: get_first_track ok");
        Ok(track)
    }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for tests.
#[derive(Debug, Clone, Default)]
pub struct MockTrackDb {
    pub tracks: Vec<Track>,
}

impl MockTrackDb {
    pub fn new(tracks: Vec<Track>) -> Self { Self { tracks } }

    fn matching(&self, filter: &Filter) -> Vec<&Track> {
        self.tracks
            .iter()
            .filter(|t| serde_json::to_value(t).map(|doc| filter.matches(&doc)).unwrap_or(false))
            .collect()
    }

    fn replay(&self) -> mpsc::Receiver<TrackUpdate> {
        let (tx, rx) = mpsc::channel(self.tracks.len() + 1);
        for t in &self.tracks {
            let _ = tx.try_send(TrackUpdate::current(t.clone()));
        }
        let _ = tx.try_send(TrackUpdate::marker(Status::InitialLoadDone));
        rx
    }
}

#[async_trait::async_trait]
impl TrackDb for MockTrackDb {
    async fn get_tracks(&self, _req: TrackRequest) -> TrackDbResult<Vec<Track>> {
        let mut latest: BTreeMap<String, Track> = BTreeMap::new();
        for t in &self.tracks {
            latest.insert(t.id.clone(), t.clone());
        }
        Ok(latest.into_values().collect())
    }

    async fn get_track_stream(&self, _req: TrackRequest) -> TrackDbResult<StreamHandle<TrackUpdate>> {
        Ok(StreamHandle { rx: self.replay(), cancel: CancelHandle::new(CancellationToken::new(), None) })
    }

    async fn get_pipeline(&self, stages: TrackPipeline, cancel: CancellationToken) -> TrackDbResult<StreamHandle<TrackUpdate>> {
        let rx = stages.start(self.replay()).await?;
        Ok(StreamHandle { rx, cancel: CancelHandle::new(cancel, None) })
    }

    async fn get_last_track(&self, filter: Filter) -> TrackDbResult<Track> {
        self.matching(&filter)
            .into_iter()
            .max_by_key(|t| t.latest_time())
            .cloned()
            .ok_or_else(|| TrackDbError::NotFound("no track".into()))
    }

    async fn get_first_track(&self, filter: Filter) -> TrackDbResult<Track> {
        self.matching(&filter)
            .into_iter()
            .min_by_key(|t| t.latest_time())
            .cloned()
            .ok_or_else(|| TrackDbError::NotFound("no track".into()))
    }
}

// ----------------- Streaming primitives -----------------

/// Cancels the stream's pipeline; also fires when dropped.
pub struct CancelHandle {
    token: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    fn new(token: CancellationToken, task: Option<tokio::task::JoinHandle<()>>) -> Self { Self { token, task } }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    pub fn cancel(mut self) {
        self.token.cancel();
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) { self.token.cancel(); }
}

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}
