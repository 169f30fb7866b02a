//! Change feed reader: runs the backlog queries, then tails the change log,
//! funnelling every record through a fixed pool of decode workers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tidewatch_core::chan::{recv_or_cancel, send_or_cancel};
use tidewatch_core::{PipelineConfig, Status, TrackError, TrackResult};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ChangeAction, DocumentStore, FeedItem, Query, RawRecord, RecordId, StoreError, TailEvent, TailStart};

/// Turns a stored document into a pipeline item.
pub type Decoder<T> = Arc<dyn Fn(RawRecord) -> anyhow::Result<T> + Send + Sync>;

const REOPEN_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Label used in logs and metrics.
    pub name: String,
    pub collection: String,
    pub decoders: usize,
    pub raw_queue_cap: usize,
    pub tail_timeout: Duration,
    pub restart_pause: Duration,
    /// Keep tailing after the backlog; otherwise stop at `InitialLoadDone`.
    pub stream: bool,
}

impl FeedConfig {
    pub fn from_pipeline(name: &str, collection: &str, cfg: &PipelineConfig, stream: bool) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            decoders: cfg.decode_threads.max(1),
            raw_queue_cap: cfg.raw_queue_cap.max(1),
            tail_timeout: cfg.tail_timeout,
            restart_pause: cfg.restart_pause,
            stream,
        }
    }
}

/// Backlog queries run in order; the live query's filter gates change-log
/// entries and its projection shapes the resolved documents.
#[derive(Debug, Clone, Default)]
pub struct FeedQueries {
    pub backlog: Vec<Query>,
    pub live: Query,
}

pub struct FeedReader<T> {
    store: Arc<dyn DocumentStore>,
    cfg: FeedConfig,
    queries: FeedQueries,
    decode: Decoder<T>,
    cancel: CancellationToken,
}

/// Backlog records handed to the pool but not yet forwarded.
#[derive(Default)]
struct Outstanding {
    n: AtomicUsize,
    zero: Notify,
}

impl Outstanding {
    fn add(&self) { self.n.fetch_add(1, Ordering::SeqCst); }

    fn done(&self) {
        if self.n.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.zero.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.n.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one backlog slot when dropped, even if decoding unwinds.
struct Pending(Option<Arc<Outstanding>>);

impl Drop for Pending {
    fn drop(&mut self) {
        if let Some(o) = self.0.take() {
            o.done();
        }
    }
}

struct Dispatch {
    record: RawRecord,
    backlog: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl<T: FeedItem> FeedReader<T> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cfg: FeedConfig,
        queries: FeedQueries,
        decode: Decoder<T>,
        cancel: CancellationToken,
    ) -> TrackResult<Self> {
        if cfg.collection.is_empty() {
            return Err(TrackError::Config(format!("feed {}: collection name is empty", cfg.name)));
        }
        Ok(Self { store, cfg, queries, decode, cancel })
    }

    /// Run the reader on its own task. The task ends once the feed is
    /// canceled, the snapshot is complete, or the store fails.
    pub fn spawn(self, out: mpsc::Sender<T>) -> JoinHandle<Result<(), StoreError>> {
        tokio::spawn(async move { self.run(out).await })
    }

    async fn run(self, out: mpsc::Sender<T>) -> Result<(), StoreError> {
        let t0 = Instant::now();
        let name = self.cfg.name.clone();
        info!(feed = %name, collection = %self.cfg.collection, backlog_queries = self.queries.backlog.len(), stream = self.cfg.stream, "feed: start");
        if !send_or_cancel(&out, T::marker(Status::Starting), &self.cancel).await {
            return Ok(());
        }

        let (raw_tx, raw_rx) = mpsc::channel::<Dispatch>(self.cfg.raw_queue_cap);
        let raw_rx = Arc::new(Mutex::new(raw_rx));
        let outstanding = Arc::new(Outstanding::default());
        let workers: Vec<JoinHandle<()>> = (0..self.cfg.decoders.max(1))
            .map(|worker| {
                let rx = Arc::clone(&raw_rx);
                let out = out.clone();
                let decode = Arc::clone(&self.decode);
                let outstanding = Arc::clone(&outstanding);
                let cancel = self.cancel.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            recv_or_cancel(&mut rx, &cancel).await
                        };
                        let Some(Dispatch { record, backlog }) = next else { break };
                        let id = record.id;
                        let _pending = Pending(backlog.then(|| Arc::clone(&outstanding)));
                        match std::panic::catch_unwind(AssertUnwindSafe(|| decode(record))) {
                            Ok(Ok(item)) => {
                                if send_or_cancel(&out, item, &cancel).await {
                                    metrics::counter!("feed_records_total", 1u64, "feed" => name.clone());
                                }
                            }
                            Ok(Err(e)) => warn!(feed = %name, worker, record = %id, error = %e, "feed: decode failed; record skipped"),
                            Err(_) => {
                                error!(feed = %name, worker, record = %id, "feed: decoder panicked; record skipped");
                                metrics::counter!("feed_decode_panics_total", 1u64, "feed" => name.clone());
                            }
                        }
                    }
                    debug!(feed = %name, worker, "feed: decoder stopped");
                })
            })
            .collect();

        let res = self.pump(&raw_tx, &outstanding, &out).await;
        drop(raw_tx);
        for w in workers {
            if let Err(e) = w.await {
                error!(feed = %name, error = %e, "feed: decode worker failed");
            }
        }
        if let Err(e) = &res {
            warn!(feed = %name, error = %e, "feed: store failure; reader terminated");
        }
        let closing = T::marker(Status::Closing);
        if self.cancel.is_cancelled() {
            let _ = out.try_send(closing);
        } else {
            let _ = send_or_cancel(&out, closing, &self.cancel).await;
        }
        info!(feed = %name, took_ms = %t0.elapsed().as_millis(), "feed: closed");
        res
    }

    async fn pump(&self, raw_tx: &mpsc::Sender<Dispatch>, outstanding: &Outstanding, out: &mpsc::Sender<T>) -> Result<(), StoreError> {
        let started_at = chrono::Utc::now();
        let mut last_id: Option<RecordId> = None;
        let mut backlog_sent = 0usize;

        for (i, query) in self.queries.backlog.iter().enumerate() {
            let mut cursor = self.store.find(&self.cfg.collection, query).await?;
            loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    n = cursor.next() => n,
                };
                let record = match next {
                    Some(rec) => rec?,
                    None => break,
                };
                last_id = last_id.max(Some(record.id));
                outstanding.add();
                if !send_or_cancel(raw_tx, Dispatch { record, backlog: true }, &self.cancel).await {
                    outstanding.done();
                    return Ok(());
                }
                backlog_sent += 1;
            }
            debug!(feed = %self.cfg.name, query = i, "feed: backlog query exhausted");
        }

        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            _ = outstanding.wait() => {}
        }
        info!(feed = %self.cfg.name, records = backlog_sent, "feed: initial load done");
        if !send_or_cancel(out, T::marker(Status::InitialLoadDone), &self.cancel).await {
            return Ok(());
        }
        if !self.cfg.stream {
            return Ok(());
        }

        let from = match last_id {
            Some(id) => id.floor(),
            None => RecordId::lower_bound(started_at),
        };
        self.tail(raw_tx, TailStart::From(from)).await
    }

    async fn tail(&self, raw_tx: &mpsc::Sender<Dispatch>, mut start: TailStart) -> Result<(), StoreError> {
        let coll = &self.cfg.collection;
        loop {
            debug!(feed = %self.cfg.name, start = ?start, "feed: opening live cursor");
            let mut cursor = self.store.tail(coll, start, self.cfg.tail_timeout).await?;
            let mut last_change: Option<RecordId> = None;
            loop {
                let ev = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    ev = cursor.next() => ev,
                };
                match ev {
                    Ok(TailEvent::Change(change)) => {
                        last_change = Some(change.id);
                        if change.action == ChangeAction::Delete {
                            continue;
                        }
                        let Some(mut record) = self.store.get(coll, &self.queries.live.filter, change.object_id).await? else {
                            continue;
                        };
                        record.body = self.queries.live.project(record.body);
                        if let Flow::Stop = self.dispatch(raw_tx, record).await {
                            return Ok(());
                        }
                    }
                    Ok(TailEvent::Idle) => {}
                    Ok(TailEvent::Ended) => {
                        if !self.pause(REOPEN_PAUSE).await {
                            return Ok(());
                        }
                        if let Some(id) = last_change {
                            start = TailStart::After(id);
                        }
                        break;
                    }
                    Err(StoreError::PositionLost(msg)) => {
                        warn!(feed = %self.cfg.name, reason = %msg, pause_ms = %self.cfg.restart_pause.as_millis(), "feed: live position lost; restarting from now");
                        metrics::counter!("feed_live_restarts_total", 1u64, "feed" => self.cfg.name.clone());
                        if !self.pause(self.cfg.restart_pause).await {
                            return Ok(());
                        }
                        start = TailStart::Now;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn dispatch(&self, raw_tx: &mpsc::Sender<Dispatch>, record: RawRecord) -> Flow {
        if send_or_cancel(raw_tx, Dispatch { record, backlog: false }, &self.cancel).await {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    /// Sleep unless canceled first; false means stop.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}
