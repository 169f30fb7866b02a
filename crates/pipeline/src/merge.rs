//! Track merger: rebuilds coherent tracks from per-sensor fragments and
//! reconciles any number of backlog+live input streams into one output.
//!
//! Each input stream gets a forwarder task that routes its backlog records
//! to the backlog queue and, after its `InitialLoadDone`, its live records to
//! the live queue. A single service task owns the track table. Forwarders
//! stop reading their input before the first live record until every stream
//! has finished its backlog and setup is complete, so consumers never see live
//! data interleaved with history and live producers stall instead of queueing.

use std::time::Duration;

use rustc_hash::FxHashMap;
use tidewatch_core::chan::send_or_cancel;
use tidewatch_core::{DeviceType, Fragment, MergeMode, Status, Track, TrackError, TrackId, TrackResult, TrackUpdate};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::PipelineStage;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOptions {
    pub mode: MergeMode,
    /// Keep every fragment instead of only the latest, and hold all output
    /// until the backlog is complete.
    pub historical: bool,
}

struct Service {
    backlog_rx: mpsc::Receiver<TrackUpdate>,
    live_rx: mpsc::Receiver<TrackUpdate>,
    state: MergeState,
}

pub struct TrackMerger {
    cancel: CancellationToken,
    backlog_tx: mpsc::Sender<TrackUpdate>,
    live_tx: mpsc::Sender<TrackUpdate>,
    barrier: watch::Receiver<bool>,
    service: Option<Service>,
    out_rx: Option<mpsc::Receiver<TrackUpdate>>,
}

impl TrackMerger {
    pub fn new(opts: MergeOptions, cancel: CancellationToken, cap: usize) -> Self {
        // minimal capacity keeps the backlog/live hand-off ordered
        let (backlog_tx, backlog_rx) = mpsc::channel(1);
        let (live_tx, live_rx) = mpsc::channel(1);
        let (out_tx, out_rx) = mpsc::channel(cap.max(1));
        let (lifted_tx, barrier) = watch::channel(false);
        let state = MergeState::new(opts, out_tx, lifted_tx, cancel.clone());
        Self {
            cancel,
            backlog_tx,
            live_tx,
            barrier,
            service: Some(Service { backlog_rx, live_rx, state }),
            out_rx: Some(out_rx),
        }
    }

    /// Spawn the service task. Only the first call has an effect.
    pub fn service(&mut self) -> Option<JoinHandle<()>> {
        let svc = self.service.take()?;
        Some(tokio::spawn(svc.run(self.cancel.clone())))
    }

    /// Output queue; available once.
    pub fn output(&mut self) -> Option<mpsc::Receiver<TrackUpdate>> { self.out_rx.take() }

    /// Register a stream and start forwarding it. Returns false when the
    /// merger was canceled first.
    pub async fn add_stream(&self, input: mpsc::Receiver<TrackUpdate>, name: &str) -> bool {
        if !send_or_cancel(&self.backlog_tx, TrackUpdate::marker(Status::Starting), &self.cancel).await {
            return false;
        }
        let fwd = Forwarder {
            name: name.to_string(),
            backlog_tx: self.backlog_tx.clone(),
            live_tx: self.live_tx.clone(),
            barrier: self.barrier.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(fwd.run(input));
        true
    }

    /// No more streams will be added.
    pub async fn setup_finished(&self) -> bool {
        send_or_cancel(&self.backlog_tx, TrackUpdate::marker(Status::SetupDone), &self.cancel).await
    }
}

#[async_trait::async_trait]
impl PipelineStage for TrackMerger {
    async fn start(self: Box<Self>, input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        let mut merger = *self;
        merger.service();
        if !merger.add_stream(input, "tracks").await {
            return Err(TrackError::Canceled);
        }
        if !merger.setup_finished().await {
            return Err(TrackError::Canceled);
        }
        merger.output().ok_or(TrackError::Canceled)
    }
}

struct Forwarder {
    name: String,
    backlog_tx: mpsc::Sender<TrackUpdate>,
    live_tx: mpsc::Sender<TrackUpdate>,
    barrier: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Forwarder {
    /// Wait until the merger lifts its backlog/live barrier. False means the
    /// merger is gone or canceled.
    async fn lifted(&mut self) -> bool {
        while !*self.barrier.borrow_and_update() {
            let changed = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                r = self.barrier.changed() => r,
            };
            if changed.is_err() {
                return false;
            }
        }
        true
    }

    async fn recv(&self, input: &mut mpsc::Receiver<TrackUpdate>) -> Option<Option<TrackUpdate>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            u = input.recv() => Some(u),
        }
    }

    async fn run(mut self, mut input: mpsc::Receiver<TrackUpdate>) {
        let mut sends = 0usize;
        // backlog phase
        loop {
            let Some(next) = self.recv(&mut input).await else { return };
            match next {
                None => {
                    let _ = send_or_cancel(&self.backlog_tx, TrackUpdate::marker(Status::Closing), &self.cancel).await;
                    debug!(stream = %self.name, sends, "merge: stream closed during backlog");
                    return;
                }
                Some(u) => match u.status {
                    Status::Closing => {
                        let _ = send_or_cancel(&self.backlog_tx, TrackUpdate::marker(Status::Closing), &self.cancel).await;
                        debug!(stream = %self.name, sends, "merge: stream closed during backlog");
                        return;
                    }
                    Status::InitialLoadDone => {
                        // counted live before it stops counting as backlog
                        if !send_or_cancel(&self.live_tx, TrackUpdate::marker(Status::Starting), &self.cancel).await {
                            return;
                        }
                        if !send_or_cancel(&self.backlog_tx, u, &self.cancel).await {
                            return;
                        }
                        info!(stream = %self.name, sends, "merge: stream switched to live");
                        break;
                    }
                    Status::Starting | Status::SetupDone => {}
                    _ => {
                        if !send_or_cancel(&self.backlog_tx, u, &self.cancel).await {
                            return;
                        }
                        sends += 1;
                    }
                },
            }
        }
        // live phase: input stays unread until the barrier lifts
        if !self.lifted().await {
            return;
        }
        loop {
            let Some(next) = self.recv(&mut input).await else { return };
            match next {
                Some(u) if u.status == Status::Closing => break,
                None => break,
                Some(u) if u.status.is_marker() => {}
                Some(u) => {
                    if !send_or_cancel(&self.live_tx, u, &self.cancel).await {
                        return;
                    }
                    sends += 1;
                }
            }
        }
        let _ = send_or_cancel(&self.live_tx, TrackUpdate::marker(Status::Closing), &self.cancel).await;
        debug!(stream = %self.name, sends, "merge: stream closed");
    }
}

impl Service {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);
        let mut backlog_open = true;
        let mut live_open = true;
        while self.state.running() && (backlog_open || live_open) {
            let ok = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                u = self.live_rx.recv(), if live_open => match u {
                    Some(u) => self.state.on_live(u).await,
                    None => { live_open = false; true }
                },
                u = self.backlog_rx.recv(), if backlog_open => match u {
                    Some(u) => self.state.on_backlog(u).await,
                    None => { backlog_open = false; true }
                },
                _ = ticker.tick() => { self.state.report(); true }
            };
            if !ok {
                return;
            }
        }
        debug!(total = self.state.total, setup_finished = self.state.setup_finished, "merge: all streams closed; draining");

        self.backlog_rx.close();
        self.live_rx.close();
        while let Some(u) = self.backlog_rx.recv().await {
            if !self.state.on_backlog(u).await {
                return;
            }
        }
        while let Some(u) = self.live_rx.recv().await {
            if !self.state.on_live(u).await {
                return;
            }
        }
        info!(total = self.state.total, tracks = self.state.tracks.len(), "merge: service stopped");
    }
}

struct MergeState {
    opts: MergeOptions,
    tracks: FxHashMap<TrackId, Track>,
    backlog: usize,
    live: usize,
    setup_finished: bool,
    streaming: bool,
    lifted: bool,
    /// Releases the forwarders' live phase.
    lifted_tx: watch::Sender<bool>,
    out: mpsc::Sender<TrackUpdate>,
    cancel: CancellationToken,
    count: u64,
    total: u64,
}

impl MergeState {
    fn new(opts: MergeOptions, out: mpsc::Sender<TrackUpdate>, lifted_tx: watch::Sender<bool>, cancel: CancellationToken) -> Self {
        Self {
            opts,
            tracks: FxHashMap::default(),
            backlog: 0,
            live: 0,
            setup_finished: false,
            streaming: !opts.historical,
            lifted: false,
            lifted_tx,
            out,
            cancel,
            count: 0,
            total: 0,
        }
    }

    fn running(&self) -> bool { !self.setup_finished || self.backlog > 0 || self.live > 0 }

    /// Returns false once the output is gone.
    async fn on_backlog(&mut self, u: TrackUpdate) -> bool {
        match u.status {
            Status::Starting => self.backlog += 1,
            Status::Closing | Status::InitialLoadDone => self.backlog = self.backlog.saturating_sub(1),
            Status::SetupDone => self.setup_finished = true,
            _ => {
                if !self.apply(u).await {
                    return false;
                }
            }
        }
        self.lift().await
    }

    async fn on_live(&mut self, u: TrackUpdate) -> bool {
        match u.status {
            Status::Starting => self.live += 1,
            Status::Closing | Status::InitialLoadDone => self.live = self.live.saturating_sub(1),
            Status::SetupDone => self.setup_finished = true,
            _ if !self.lifted => warn!(track = ?u.track_id(), "merge: live update before initial load dropped"),
            _ => {
                if !self.apply(u).await {
                    return false;
                }
            }
        }
        self.lift().await
    }

    /// Lift the backlog/live barrier once setup is done and no stream is
    /// still in backlog.
    async fn lift(&mut self) -> bool {
        if self.lifted || !self.setup_finished || self.backlog > 0 {
            return true;
        }
        self.lifted = true;
        if !self.streaming {
            self.streaming = true;
            if !self.send_all().await {
                return false;
            }
        }
        debug!(total = self.total, "merge: initial load done");
        if !send_or_cancel(&self.out, TrackUpdate::marker(Status::InitialLoadDone), &self.cancel).await {
            return false;
        }
        self.lifted_tx.send_replace(true);
        true
    }

    async fn send_all(&mut self) -> bool {
        let mut ids: Vec<&TrackId> = self.tracks.keys().collect();
        ids.sort();
        let snapshot: Vec<Track> = ids.into_iter().filter_map(|id| self.tracks.get(id).cloned()).collect();
        for track in snapshot {
            if !self.emit(track).await {
                return false;
            }
        }
        debug!(total = self.total, "merge: flushed track table");
        true
    }

    async fn apply(&mut self, u: TrackUpdate) -> bool {
        let Some(track) = u.track else { return true };
        if track.id.is_empty() {
            warn!("merge: update without a track id dropped");
            return true;
        }
        let changed = match self.opts.mode {
            MergeMode::None => self.replace(track),
            MergeMode::TrackId => self.merge(track),
        };
        match changed {
            Some(t) if self.streaming => self.emit(t).await,
            _ => true,
        }
    }

    /// Whole-track mode: keep the newest track per id.
    fn replace(&mut self, track: Track) -> Option<Track> {
        if let Some(last) = self.tracks.get(&track.id) {
            if track.latest_time() < last.latest_time() || track == *last {
                return None;
            }
        }
        self.tracks.insert(track.id.clone(), track.clone());
        Some(track)
    }

    /// Fragment mode: fold targets and metadata into the accumulated track.
    fn merge(&mut self, track: Track) -> Option<Track> {
        let historical = self.opts.historical;
        let mem = self.tracks.entry(track.id.clone()).or_insert_with(|| Track::new(track.id.clone()));
        if track.registry_id.is_some() {
            mem.registry_id = track.registry_id;
        }
        let mut changed = false;
        for t in track.targets {
            changed |= insert_fragment(&mut mem.targets, t, historical);
        }
        for m in track.metadata {
            changed |= insert_fragment(&mut mem.metadata, m, historical);
        }
        (changed && !mem.targets.is_empty()).then(|| mem.clone())
    }

    async fn emit(&mut self, track: Track) -> bool {
        if !send_or_cancel(&self.out, TrackUpdate::current(track), &self.cancel).await {
            return false;
        }
        self.count += 1;
        self.total += 1;
        metrics::counter!("merge_tracks_total", 1u64);
        true
    }

    fn report(&mut self) {
        let rate = self.count as f64 / STATUS_INTERVAL.as_secs_f64();
        debug!(tracks_per_sec = rate, total = self.total, backlog = self.backlog, live = self.live, "merge: status");
        metrics::gauge!("merge_tracks_per_sec", rate);
        self.count = 0;
    }
}

/// Place `frag` in a most-recent-first list. Outside historical mode the
/// head is replaced, and a fragment not strictly newer than the head is
/// rejected. In historical mode an exact copy of a kept fragment is ignored.
/// Returns whether the list changed.
pub fn insert_fragment<F: Fragment + PartialEq>(list: &mut Vec<F>, frag: F, historical: bool) -> bool {
    if historical && list.iter().any(|e| e.time() == frag.time() && *e == frag) {
        return false;
    }
    let fusion = frag.device_type() == DeviceType::Fusion;
    let ipos = list
        .iter()
        .position(|e| (fusion && e.device_type() != DeviceType::Fusion) || frag.time() >= e.time())
        .unwrap_or(list.len());
    let rpos = if historical || list.is_empty() { None } else { Some(0) };
    if let Some(r) = rpos {
        if frag.time() <= list[r].time() {
            return false;
        }
    }
    match rpos {
        None => list.insert(ipos, frag),
        Some(r) if r == ipos => list[r] = frag,
        Some(r) if r < ipos => {
            list[r..ipos].rotate_left(1);
            list[ipos - 1] = frag;
        }
        Some(r) => {
            list[ipos..=r].rotate_right(1);
            list[ipos] = frag;
        }
    }
    true
}
