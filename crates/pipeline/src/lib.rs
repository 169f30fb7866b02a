//! Tidewatch track pipeline: independent stages connected by bounded queues.
//!
//! A request is served by folding its stages over the raw feed:
//! log → merger → geo filter → timeouts → searcher. Every stage owns its
//! state on its own task and closes its output once its input is exhausted.

#![forbid(unsafe_code)]

use tidewatch_core::chan::{recv_or_cancel, send_or_cancel};
use tidewatch_core::{PipelineConfig, TrackRequest, TrackResult, TrackUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub mod geofilter;
pub mod heap;
pub mod merge;
pub mod objects;
pub mod search;
pub mod timeout;

pub use geofilter::{GeoDb, GeoFilter, GeoRange};
pub use heap::{Deadline, DeadlineHeap, DeadlineRecord};
pub use merge::{MergeOptions, TrackMerger};
pub use objects::{ObjectTimeouts, ObjectUpdate, TimedObject};
pub use search::{TrackLimiter, TrackSearcher};
pub use timeout::{TimeoutPolicy, TrackTimeouts};

/// One step of a track pipeline.
#[async_trait::async_trait]
pub trait PipelineStage: Send {
    /// Start processing `input`; returns the stage's output queue. Stages
    /// with nothing to do hand their input straight back.
    async fn start(self: Box<Self>, input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>>;
}

#[derive(Default)]
pub struct TrackPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl TrackPipeline {
    pub fn new() -> Self { Self::default() }

    pub fn append<S: PipelineStage + 'static>(&mut self, stage: S) { self.stages.push(Box::new(stage)); }

    pub fn append_boxed(&mut self, stage: Box<dyn PipelineStage>) { self.stages.push(stage); }

    pub fn len(&self) -> usize { self.stages.len() }
    pub fn is_empty(&self) -> bool { self.stages.is_empty() }

    /// Standard stage list for a populated request.
    pub fn for_request(req: &TrackRequest, cfg: &PipelineConfig, cancel: &CancellationToken) -> TrackResult<Self> {
        req.validate()?;
        let mut p = Self::new();
        p.append(LogStage::new(cancel.clone(), cfg.stage_queue_cap));
        if !req.disable_merge {
            let opts = MergeOptions { mode: req.merge_mode, historical: req.historical() };
            p.append(TrackMerger::new(opts, cancel.clone(), cfg.stage_queue_cap));
        }
        p.append(GeoFilter::new(req, cancel.clone(), cfg.stage_queue_cap)?);
        if !req.disable_timeouts {
            let policy = TimeoutPolicy::standard(cfg);
            p.append(TrackTimeouts::new(policy, req.time_keeper(), cancel.clone(), cfg.timeout_queue_cap));
        }
        p.append(TrackSearcher::new(req, cancel.clone(), cfg.timeout_queue_cap));
        debug!(stages = p.len(), historical = req.historical(), search = req.search(), "pipeline: built");
        Ok(p)
    }

    /// Start every stage in order, feeding each one the previous output.
    /// The first construction error aborts the fold.
    pub async fn start(self, input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        let mut ch = input;
        for stage in self.stages {
            ch = stage.start(ch).await?;
        }
        Ok(ch)
    }
}

/// Hands its input back untouched.
pub struct NullStage;

#[async_trait::async_trait]
impl PipelineStage for NullStage {
    async fn start(self: Box<Self>, input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        Ok(input)
    }
}

/// Traces every update passing through.
pub struct LogStage {
    cancel: CancellationToken,
    cap: usize,
}

impl LogStage {
    pub fn new(cancel: CancellationToken, cap: usize) -> Self { Self { cancel, cap: cap.max(1) } }
}

#[async_trait::async_trait]
impl PipelineStage for LogStage {
    async fn start(self: Box<Self>, mut input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        let (tx, rx) = mpsc::channel(self.cap);
        let cancel = self.cancel;
        tokio::spawn(async move {
            while let Some(update) = recv_or_cancel(&mut input, &cancel).await {
                trace!(status = ?update.status, track = ?update.track_id(), "pipeline: update");
                if !send_or_cancel(&tx, update, &cancel).await {
                    return;
                }
            }
            debug!("pipeline: end of tracks");
        });
        Ok(rx)
    }
}
