//! Track timeout scheduler.
//!
//! Every track carries a deadline derived from its targets' refresh times.
//! When the deadline passes without a newer update the track is re-emitted
//! once with `Timeout` status.

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tidewatch_core::chan::send_or_cancel;
use tidewatch_core::{DeviceType, PipelineConfig, Status, TimeKeeper, Track, TrackResult, TrackUpdate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::heap::{DeadlineHeap, DeadlineRecord};
use crate::PipelineStage;

/// Wait used when nothing is scheduled.
const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// How long each device type may stay silent.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    default: Duration,
    overrides: FxHashMap<DeviceType, Duration>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration) -> Self { Self { default, overrides: FxHashMap::default() } }

    /// 15 minutes, or 1 minute with fast timers.
    pub fn standard(cfg: &PipelineConfig) -> Self { Self::new(cfg.default_timeout()) }

    /// One year; for consumers replaying old history.
    pub fn maximum() -> Self { Self::new(Duration::days(365)) }

    pub fn with_override(mut self, device: DeviceType, timeout: Duration) -> Self {
        self.overrides.insert(device, timeout);
        self
    }

    pub fn timeout_for(&self, device: DeviceType) -> Duration {
        self.overrides.get(&device).copied().unwrap_or(self.default)
    }
}

pub struct TrackTimeouts {
    policy: TimeoutPolicy,
    clock: TimeKeeper,
    heap: DeadlineHeap<DeadlineRecord<Track>>,
    cancel: CancellationToken,
    cap: usize,
}

impl TrackTimeouts {
    pub fn new(policy: TimeoutPolicy, clock: TimeKeeper, cancel: CancellationToken, cap: usize) -> Self {
        Self { policy, clock, heap: DeadlineHeap::new(), cancel, cap: cap.max(1) }
    }

    pub fn pending(&self) -> usize { self.heap.len() }

    /// Latest deadline implied by `track`'s targets, or `None` when the
    /// track is already timed out.
    pub fn deadline_for(&self, track: &Track, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut deadline: Option<DateTime<Utc>> = None;
        for t in &track.targets {
            if t.force_timeout || t.lost_signal {
                return None;
            }
            let Some(updated) = t.update_time else { continue };
            let timeout = self.policy.timeout_for(t.device_type);
            let backdated = !t.repeat && updated != t.time;
            if backdated && t.time + timeout < now {
                return None;
            }
            let candidate = updated + timeout;
            if deadline.map_or(true, |d| candidate > d) {
                if !backdated {
                    deadline = Some(candidate);
                } else if updated > t.time {
                    // backdated reports only live as long as their event time allows
                    deadline = Some(candidate - (updated - t.time));
                }
            }
        }
        deadline.filter(|d| *d >= now)
    }

    /// Schedule `track`; returns `Timeout` when it has already expired, in
    /// which case no record is left behind for it.
    pub fn evaluate(&mut self, track: &Track) -> Status {
        match self.deadline_for(track, self.clock.now()) {
            Some(deadline) => {
                self.heap.upsert(DeadlineRecord::new(track.id.clone(), deadline, track.clone()));
                Status::Current
            }
            None => {
                self.heap.remove(&track.id);
                Status::Timeout
            }
        }
    }

    /// Real time until the nearest deadline.
    pub fn next_wait(&self) -> std::time::Duration {
        match self.heap.peek() {
            Some(next) => self.clock.real_delay(next.deadline - self.clock.now()),
            None => IDLE_WAIT,
        }
    }

    /// Remove and return every track whose deadline has passed.
    pub fn expired(&mut self) -> Vec<Track> {
        let now = self.clock.now();
        std::iter::from_fn(|| self.heap.pop_expired(now)).map(|r| r.payload).collect()
    }

    async fn emit(&self, tx: &mpsc::Sender<TrackUpdate>, update: TrackUpdate) -> bool {
        if update.status == Status::Timeout {
            metrics::counter!("timeouts_emitted_total", 1u64);
            trace!(track = ?update.track_id(), "timeout: emitted");
        }
        send_or_cancel(tx, update, &self.cancel).await
    }

    async fn run(mut self, mut input: mpsc::Receiver<TrackUpdate>, tx: mpsc::Sender<TrackUpdate>) {
        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    for track in self.expired() {
                        if !self.emit(&tx, TrackUpdate::with_status(Status::Timeout, track)).await {
                            return;
                        }
                    }
                }
                upd = input.recv() => {
                    let Some(upd) = upd else { break };
                    let upd = match upd.track {
                        Some(track) => {
                            let status = match self.evaluate(&track) {
                                Status::Timeout => Status::Timeout,
                                _ => upd.status,
                            };
                            TrackUpdate::with_status(status, track)
                        }
                        None => upd,
                    };
                    if !self.emit(&tx, upd).await {
                        return;
                    }
                }
            }
        }
        debug!(pending = self.heap.len(), "timeout: input closed");
    }
}

#[async_trait::async_trait]
impl PipelineStage for TrackTimeouts {
    async fn start(self: Box<Self>, input: mpsc::Receiver<TrackUpdate>) -> TrackResult<mpsc::Receiver<TrackUpdate>> {
        let (tx, rx) = mpsc::channel(self.cap);
        debug!(default_secs = self.policy.default.num_seconds(), replay = self.clock.is_replay(), "timeout: stage start");
        tokio::spawn(self.run(input, tx));
        Ok(rx)
    }
}
