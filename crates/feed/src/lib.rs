//! Tidewatch feed: document store seam and the change feed reader that turns
//! backlog queries plus live change-log tailing into one record stream.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidewatch_core::{Status, TrackUpdate};
use uuid::Uuid;

pub mod memory;
pub mod reader;

pub use memory::MemoryStore;
pub use reader::{Decoder, FeedConfig, FeedQueries, FeedReader};

/// Insertion-ordered record identifier with an embedded millisecond
/// timestamp (UUIDv7 layout).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn from_uuid(u: Uuid) -> Self { Self(u) }
    pub fn as_uuid(&self) -> &Uuid { &self.0 }

    /// Id for the `seq`-th record written during millisecond `ms`.
    pub fn from_parts(ms: u64, seq: u64) -> Self {
        let mut tail = [0u8; 10];
        // top two bits of tail[2] are taken by the variant
        tail[2..].copy_from_slice(&(seq & (u64::MAX >> 2)).to_be_bytes());
        Self(uuid::Builder::from_unix_timestamp_millis(ms, &tail).into_uuid())
    }

    /// Smallest id that can be minted at or after `t`.
    pub fn lower_bound(t: DateTime<Utc>) -> Self {
        Self::from_parts(t.timestamp_millis().max(0) as u64, 0)
    }

    pub fn millis(&self) -> u64 {
        let b = self.0.as_bytes();
        b[..6].iter().fold(0u64, |acc, x| (acc << 8) | *x as u64)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.millis() as i64)
    }

    /// Lower bound for everything minted in the same millisecond as `self`.
    pub fn floor(&self) -> Self { Self::from_parts(self.millis(), 0) }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

/// One document as stored, before decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRecord {
    pub id: RecordId,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// Entry of a collection's append-only change log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub id: RecordId,
    pub object_id: RecordId,
    pub action: ChangeAction,
}

/// Predicate term over a dotted field path. A path that crosses an array
/// matches when any element matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Clause {
    Eq(String, Value),
    In(String, Vec<Value>),
    Gte(String, Value),
    Lte(String, Value),
}

/// Conjunction of clauses; empty matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Filter(pub Vec<Clause>);

impl Filter {
    pub fn all() -> Self { Self::default() }

    pub fn and(mut self, clause: Clause) -> Self {
        self.0.push(clause);
        self
    }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn matches(&self, doc: &Value) -> bool {
        self.0.iter().all(|c| match c {
            Clause::Eq(path, v) => lookup(doc, path).iter().any(|x| *x == v),
            Clause::In(path, vs) => lookup(doc, path).iter().any(|x| vs.iter().any(|v| *x == v)),
            Clause::Gte(path, v) => lookup(doc, path).iter().any(|x| matches!(compare(x, v), Some(Ordering::Greater | Ordering::Equal))),
            Clause::Lte(path, v) => lookup(doc, path).iter().any(|x| matches!(compare(x, v), Some(Ordering::Less | Ordering::Equal))),
        })
    }
}

/// Backlog query: filter, sort keys (`"field"` ascending, `"-field"`
/// descending) and an optional top-level projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Query {
    pub filter: Filter,
    #[serde(default)]
    pub sort: Vec<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl Query {
    pub fn new(filter: Filter) -> Self { Self { filter, sort: Vec::new(), fields: None } }

    pub fn sorted_by(mut self, key: &str) -> Self {
        self.sort.push(key.to_string());
        self
    }

    /// Order two documents by this query's sort keys.
    pub fn order(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.sort {
            let (path, desc) = match key.strip_prefix('-') {
                Some(p) => (p, true),
                None => (key.as_str(), false),
            };
            let x = lookup(a, path).into_iter().next();
            let y = lookup(b, path).into_iter().next();
            let ord = match (x, y) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ord = if desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    pub fn project(&self, doc: Value) -> Value {
        match (&self.fields, doc) {
            (Some(fields), Value::Object(map)) => {
                Value::Object(map.into_iter().filter(|(k, _)| fields.iter().any(|f| f == k)).collect())
            }
            (_, doc) => doc,
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut cur = vec![doc];
    for part in path.split('.') {
        let mut next = Vec::new();
        for v in cur {
            match v {
                Value::Object(m) => {
                    if let Some(x) = m.get(part) {
                        next.push(x);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(x) = item.get(part) {
                            next.push(x);
                        }
                    }
                }
                _ => {}
            }
        }
        cur = next;
    }
    // a terminal array matches element-wise
    cur.into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        })
        .collect()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            // RFC 3339 strings with different precision do not sort lexically
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The change log was trimmed past a positioned cursor.
    #[error("change log position lost: {0}")]
    PositionLost(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where a live tail starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    /// Only entries appended from now on.
    Now,
    /// Entries with id >= the bound.
    From(RecordId),
    /// Entries with id > the given one.
    After(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    Change(ChangeRecord),
    /// Nothing arrived within the poll window.
    Idle,
    /// Cursor finished without error; reopen to continue.
    Ended,
}

pub type RecordStream = BoxStream<'static, Result<RawRecord, StoreError>>;

#[async_trait::async_trait]
pub trait TailCursor: Send {
    async fn next(&mut self) -> Result<TailEvent, StoreError>;
}

/// Query and tailing primitives of the backing document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Bounded query over the current contents of `collection`.
    async fn find(&self, collection: &str, query: &Query) -> Result<RecordStream, StoreError>;

    /// Tail the change log of `collection`; `poll` bounds each wait before
    /// the cursor reports [`TailEvent::Idle`].
    async fn tail(&self, collection: &str, start: TailStart, poll: Duration) -> Result<Box<dyn TailCursor>, StoreError>;

    /// Current document `id` if it still exists and matches `filter`.
    async fn get(&self, collection: &str, filter: &Filter, id: RecordId) -> Result<Option<RawRecord>, StoreError>;
}

/// Items a feed can emit besides decoded records.
pub trait FeedItem: Send + 'static {
    fn marker(status: Status) -> Self;
}

impl FeedItem for TrackUpdate {
    fn marker(status: Status) -> Self { TrackUpdate::marker(status) }
}
