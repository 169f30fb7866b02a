//! Bounded top-K lookup over the track flow.

use std::cmp::Ordering;

use tidewatch_core::chan::{recv_or_cancel, send_or_cancel};
use tidewatch_core::{Status, Track, TrackRequest, TrackResult, TrackUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::PipelineStage;

/// Named tracks first, by name, then by id.
fn rank(a: &Track, b: &Track) -> Ordering {
    match (a.name(), b.name()) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Keeps the best `limit` tracks seen so far.
#[derive(Debug, Clone)]
pub struct TrackLimiter {
    limit: usize,
    buf: Vec<Track>,
}

impl TrackLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self { limit, buf: Vec::with_capacity(limit + 1) }
    }

    pub fn limit(&self) -> usize { self.limit }

    pub fn add(&mut self, track: Track) {
        if let Some(slot) = self.buf.iter_mut().find(|t| t.id == track.id) {
            *slot = track;
        } else if self.buf.len() <= self.limit {
            self.buf.push(track);
        } else {
            let Some(worst) = self.buf.last_mut() else { return };
            if rank(&track, worst) != Ordering::Less {
                return;
            }
            *worst = track;
        }
        self.buf.sort_by(rank);
    }

    /// At most `limit` tracks, best first.
    pub fn tracks(&self) -> &[Track] { &self.buf[..self.buf.len().min(self.limit)] }

    pub fn into_tracks(mut self) -> Vec<Track> {
        self.buf.truncate(self.limit);
        self.buf
    }
}

pub struct TrackSearcher {
    enabled: bool,
    track_ids: Vec<String>,
    registry_ids: Vec<String>,
    limiter: TrackLimiter,
    cancel: CancellationToken,
    cap: usize,
}

impl TrackSearcher {
    pub fn new(req: &TrackRequest, cancel: CancellationToken, cap: usize) -> Self {
        let (track_ids, registry_ids) = match &req.filter {
            Some(f) => (f.tracks.clone(), f.registries.clone()),
            None => (Vec::new(), Vec::new()),
        };
        Self {
            enabled: req.search(),
            track_ids,
            registry_ids,
            limiter: TrackLimiter::new(req.limit as usize),
            cancel,
            cap: cap.max(1),
        }
    }

    pub fn admits(&self, track: &Track) -> bool {
        if self.track_ids.is_empty() && self.registry_ids.is_empty() {
            return true;
        }
        self.track_ids.iter().any(|id| *id == track.id)
            || track.registry_id.as_ref().is_some_and(|r| self.registry_ids.contains(r))
    }

    fn offer(&mut self, update: TrackUpdate) {
        if update.status == Status::Timeout {
            return;
        }
        let Some(track) = update.track else { return };
        if self.admits(&track) {
            self.limiter.add(track);
        }
    }
}

#[async_trait::async_trait]
impl PipelineStage for TrackSearcher {
    async fn start(self: Box<Self>, mut input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        if !self.enabled {
            return Ok(input);
        }
        let mut searcher = *self;
        let (tx, rx) = mpsc::channel(searcher.cap);
        debug!(limit = searcher.limiter.limit(), "search: start");
        tokio::spawn(async move {
            let cancel = searcher.cancel.clone();
            while let Some(update) = recv_or_cancel(&mut input, &cancel).await {
                searcher.offer(update);
            }
            if cancel.is_cancelled() {
                return;
            }
            let found = searcher.limiter.into_tracks();
            debug!(found = found.len(), "search: input ended");
            for track in found {
                if !send_or_cancel(&tx, TrackUpdate::current(track), &cancel).await {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
