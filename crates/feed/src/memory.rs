//! In-RAM document store with a capped change log per collection. Readers see
//! copy-on-write snapshots; writers are serialised and publish a new epoch
//! to wake live tails.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    ChangeAction, ChangeRecord, DocumentStore, Filter, Query, RawRecord, RecordId, RecordStream, StoreError,
    TailCursor, TailEvent, TailStart,
};

#[derive(Debug, Clone, Default)]
struct Collection {
    docs: BTreeMap<RecordId, Value>,
    log: VecDeque<ChangeRecord>,
    /// Highest change id evicted from `log`.
    trimmed: Option<RecordId>,
}

#[derive(Debug, Clone, Default)]
struct State {
    collections: FxHashMap<String, Arc<Collection>>,
}

struct IdGen {
    last_ms: u64,
    seq: u64,
}

struct Inner {
    state: ArcSwap<State>,
    writer: Mutex<IdGen>,
    epoch_tx: watch::Sender<u64>,
    log_capacity: usize,
}

/// Cheap-to-clone handle; all clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::with_log_capacity(4096) }
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Store whose change logs keep at most `cap` entries.
    pub fn with_log_capacity(cap: usize) -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                state: ArcSwap::from_pointee(State::default()),
                writer: Mutex::new(IdGen { last_ms: 0, seq: 0 }),
                epoch_tx,
                log_capacity: cap.max(1),
            }),
        }
    }

    pub fn insert(&self, collection: &str, doc: Value) -> RecordId {
        self.write(collection, |gen, coll| {
            let id = gen.next();
            coll.docs.insert(id, doc);
            Some((id, ChangeAction::Insert))
        })
        .unwrap_or_else(|| RecordId::from_parts(0, 0))
    }

    /// Replace an existing document. Returns false when `id` is unknown.
    pub fn update(&self, collection: &str, id: RecordId, doc: Value) -> bool {
        self.write(collection, |_, coll| match coll.docs.get_mut(&id) {
            Some(slot) => {
                *slot = doc;
                Some((id, ChangeAction::Update))
            }
            None => None,
        })
        .is_some()
    }

    pub fn delete(&self, collection: &str, id: RecordId) -> bool {
        self.write(collection, |_, coll| coll.docs.remove(&id).map(|_| (id, ChangeAction::Delete))).is_some()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.inner.state.load().collections.get(collection).map_or(0, |c| c.docs.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool { self.len(collection) == 0 }

    fn write<F>(&self, collection: &str, f: F) -> Option<RecordId>
    where
        F: FnOnce(&mut IdGen, &mut Collection) -> Option<(RecordId, ChangeAction)>,
    {
        let mut gen = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
        let cur = self.inner.state.load_full();
        let mut coll = cur.collections.get(collection).map(|c| (**c).clone()).unwrap_or_default();
        let (object_id, action) = f(&mut gen, &mut coll)?;
        let change = ChangeRecord { id: gen.next(), object_id, action };
        coll.log.push_back(change);
        while coll.log.len() > self.inner.log_capacity {
            if let Some(old) = coll.log.pop_front() {
                coll.trimmed = Some(old.id);
            }
        }
        let mut next = (*cur).clone();
        next.collections.insert(collection.to_string(), Arc::new(coll));
        self.inner.state.store(Arc::new(next));
        self.inner.epoch_tx.send_modify(|e| *e += 1);
        Some(object_id)
    }

    fn collection(&self, collection: &str) -> Option<Arc<Collection>> {
        self.inner.state.load().collections.get(collection).cloned()
    }
}

impl IdGen {
    fn next(&mut self) -> RecordId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        if now > self.last_ms {
            self.last_ms = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        RecordId::from_parts(self.last_ms, self.seq)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, query: &Query) -> Result<RecordStream, StoreError> {
        let mut out: Vec<RawRecord> = match self.collection(collection) {
            Some(coll) => coll
                .docs
                .iter()
                .filter(|(_, doc)| query.filter.matches(doc))
                .map(|(id, doc)| RawRecord { id: *id, body: doc.clone() })
                .collect(),
            None => Vec::new(),
        };
        if !query.sort.is_empty() {
            out.sort_by(|a, b| query.order(&a.body, &b.body));
        }
        let out: Vec<Result<RawRecord, StoreError>> = out
            .into_iter()
            .map(|r| Ok(RawRecord { id: r.id, body: query.project(r.body) }))
            .collect();
        debug!(collection, records = out.len(), "memory: find");
        Ok(Box::pin(futures::stream::iter(out)))
    }

    async fn tail(&self, collection: &str, start: TailStart, poll: Duration) -> Result<Box<dyn TailCursor>, StoreError> {
        let position = match start {
            TailStart::Now => {
                let last = self.collection(collection).and_then(|c| c.log.back().map(|e| e.id));
                match last {
                    Some(id) => Position::After(id),
                    None => Position::From(RecordId::from_parts(0, 0)),
                }
            }
            TailStart::From(id) => Position::From(id),
            TailStart::After(id) => Position::After(id),
        };
        Ok(Box::new(MemoryTail {
            store: self.clone(),
            collection: collection.to_string(),
            epoch_rx: self.inner.epoch_tx.subscribe(),
            position,
            positioned: false,
            poll,
        }))
    }

    async fn get(&self, collection: &str, filter: &Filter, id: RecordId) -> Result<Option<RawRecord>, StoreError> {
        Ok(self
            .collection(collection)
            .and_then(|c| c.docs.get(&id).cloned())
            .filter(|doc| filter.matches(doc))
            .map(|body| RawRecord { id, body }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Position {
    From(RecordId),
    After(RecordId),
}

struct MemoryTail {
    store: MemoryStore,
    collection: String,
    epoch_rx: watch::Receiver<u64>,
    position: Position,
    /// Set once the cursor has returned an entry.
    positioned: bool,
    poll: Duration,
}

#[async_trait::async_trait]
impl TailCursor for MemoryTail {
    async fn next(&mut self) -> Result<TailEvent, StoreError> {
        loop {
            self.epoch_rx.borrow_and_update();
            if let Some(coll) = self.store.collection(&self.collection) {
                if let (true, Position::After(last), Some(trimmed)) = (self.positioned, self.position, coll.trimmed) {
                    if last < trimmed {
                        return Err(StoreError::PositionLost(format!("{} log trimmed past {}", self.collection, last)));
                    }
                }
                let hit = coll.log.iter().find(|e| match self.position {
                    Position::From(lb) => e.id >= lb,
                    Position::After(last) => e.id > last,
                });
                if let Some(entry) = hit {
                    self.position = Position::After(entry.id);
                    self.positioned = true;
                    return Ok(TailEvent::Change(entry.clone()));
                }
            }
            match tokio::time::timeout(self.poll, self.epoch_rx.changed()).await {
                Err(_) => return Ok(TailEvent::Idle),
                Ok(Err(_)) => return Ok(TailEvent::Ended),
                Ok(Ok(())) => continue,
            }
        }
    }
}
