//! Timeout scheduler for generic timed objects (zones, notices, ...).
//!
//! Objects become visible at `creation_time` and expire at
//! `expiration_time`. Two heaps drive the schedule: time-in for objects not
//! created yet, time-out for expirations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidewatch_core::chan::send_or_cancel;
use tidewatch_core::{Status, TimeKeeper};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::heap::{DeadlineHeap, DeadlineRecord};

const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedObject {
    pub id: String,
    pub creation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectUpdate {
    pub status: Status,
    pub object: Option<TimedObject>,
}

impl ObjectUpdate {
    pub fn current(object: TimedObject) -> Self { Self { status: Status::Current, object: Some(object) } }
    pub fn timeout(object: TimedObject) -> Self { Self { status: Status::Timeout, object: Some(object) } }
    pub fn marker(status: Status) -> Self { Self { status, object: None } }
}

type Record = DeadlineRecord<TimedObject>;

pub struct ObjectTimeouts {
    clock: TimeKeeper,
    time_in: DeadlineHeap<Record>,
    time_out: DeadlineHeap<Record>,
    cancel: CancellationToken,
    cap: usize,
}

impl ObjectTimeouts {
    pub fn new(clock: TimeKeeper, cancel: CancellationToken, cap: usize) -> Self {
        Self { clock, time_in: DeadlineHeap::new(), time_out: DeadlineHeap::new(), cancel, cap: cap.max(1) }
    }

    /// Schedule `obj`. Returns whether it should be forwarded now.
    pub fn admit(&mut self, obj: &TimedObject) -> bool {
        let now = self.clock.now();
        let mut forward = true;
        if obj.creation_time > now {
            self.time_in.upsert(Record::new(obj.id.clone(), obj.creation_time, obj.clone()));
            self.time_out.upsert(Record::new(obj.id.clone(), obj.expiration_time, obj.clone()));
            forward = false;
        }
        let expiry = Record::new(obj.id.clone(), obj.expiration_time, obj.clone());
        if obj.expiration_time > now {
            self.time_out.upsert(expiry);
        } else if self.time_out.exists(&obj.id) {
            // seen before: its expiry fires from the heap
            self.time_out.upsert(expiry);
            forward = false;
        } else {
            // never seen and already expired
            forward = false;
        }
        forward
    }

    pub fn next_wait(&self) -> std::time::Duration {
        let now = self.clock.now();
        let wait = |h: &DeadlineHeap<Record>| match h.peek() {
            Some(next) => self.clock.real_delay(next.deadline - now),
            None => IDLE_WAIT,
        };
        wait(&self.time_in).min(wait(&self.time_out))
    }

    /// Time-ins due now (as `Current`) followed by expirations (as `Timeout`).
    pub fn due(&mut self) -> Vec<ObjectUpdate> {
        let now = self.clock.now();
        let mut out = Vec::new();
        while self.time_in.peek().is_some_and(|r| r.deadline <= now) {
            if let Some(r) = self.time_in.pop() {
                out.push(ObjectUpdate::current(r.payload));
            }
        }
        while let Some(r) = self.time_out.pop_expired(now) {
            out.push(ObjectUpdate::timeout(r.payload));
        }
        out
    }

    pub fn start(self, input: mpsc::Receiver<ObjectUpdate>) -> mpsc::Receiver<ObjectUpdate> {
        let (tx, rx) = mpsc::channel(self.cap);
        tokio::spawn(self.run(input, tx));
        rx
    }

    async fn run(mut self, mut input: mpsc::Receiver<ObjectUpdate>, tx: mpsc::Sender<ObjectUpdate>) {
        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    for u in self.due() {
                        if !send_or_cancel(&tx, u, &self.cancel).await {
                            return;
                        }
                    }
                }
                upd = input.recv() => {
                    let Some(upd) = upd else { break };
                    let forward = match &upd.object {
                        Some(obj) => self.admit(obj),
                        None => true,
                    };
                    if forward && !send_or_cancel(&tx, upd, &self.cancel).await {
                        return;
                    }
                }
            }
        }
        debug!(time_in = self.time_in.len(), time_out = self.time_out.len(), "objects: input closed");
    }
}
