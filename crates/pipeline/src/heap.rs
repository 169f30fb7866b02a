//! Indexable min-heap keyed by absolute deadline.
//!
//! Besides the usual push/pop, a record can be found, replaced or removed by
//! its id in O(log n): an id→slot map is kept in sync on every swap.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

/// Something that expires at a point in time and has a stable identity.
pub trait Deadline {
    type Id: Hash + Eq + Clone + Debug;

    fn id(&self) -> &Self::Id;
    fn deadline(&self) -> DateTime<Utc>;
}

/// Heap entry pairing an id and deadline with an arbitrary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineRecord<P> {
    pub id: String,
    pub deadline: DateTime<Utc>,
    pub payload: P,
}

impl<P> DeadlineRecord<P> {
    pub fn new(id: impl Into<String>, deadline: DateTime<Utc>, payload: P) -> Self {
        Self { id: id.into(), deadline, payload }
    }
}

impl<P> Deadline for DeadlineRecord<P> {
    type Id = String;
    fn id(&self) -> &String { &self.id }
    fn deadline(&self) -> DateTime<Utc> { self.deadline }
}

pub struct DeadlineHeap<T: Deadline> {
    heap: Vec<T>,
    slots: FxHashMap<T::Id, usize>,
}

impl<T: Deadline> Default for DeadlineHeap<T> {
    fn default() -> Self { Self::with_capacity(128) }
}

impl<T: Deadline> DeadlineHeap<T> {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(cap: usize) -> Self {
        Self { heap: Vec::with_capacity(cap), slots: FxHashMap::default() }
    }

    pub fn len(&self) -> usize { self.heap.len() }
    pub fn is_empty(&self) -> bool { self.heap.is_empty() }

    /// Record with the earliest deadline.
    pub fn peek(&self) -> Option<&T> { self.heap.first() }

    pub fn exists(&self, id: &T::Id) -> bool { self.slots.contains_key(id) }

    /// Insert `item`, or replace the record with the same id. Returns true
    /// when a record was replaced.
    pub fn upsert(&mut self, item: T) -> bool {
        match self.slots.get(item.id()).copied() {
            Some(i) => {
                self.check(i, item.id());
                self.heap[i] = item;
                self.fix(i);
                true
            }
            None => {
                let i = self.heap.len();
                self.slots.insert(item.id().clone(), i);
                self.heap.push(item);
                self.sift_up(i);
                false
            }
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.take(0))
    }

    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        let i = self.slots.get(id).copied()?;
        self.check(i, id);
        Some(self.take(i))
    }

    /// Pop the earliest record if its deadline is strictly before `now`.
    pub fn pop_expired(&mut self, now: DateTime<Utc>) -> Option<T> {
        match self.peek() {
            Some(top) if top.deadline() < now => self.pop(),
            _ => None,
        }
    }

    fn take(&mut self, i: usize) -> T {
        let last = self.heap.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        let item = match self.heap.pop() {
            Some(item) => item,
            None => unreachable!("take on empty heap"),
        };
        self.slots.remove(item.id());
        if i < self.heap.len() {
            self.fix(i);
        }
        item
    }

    fn check(&self, i: usize, id: &T::Id) {
        match self.heap.get(i) {
            Some(at) if at.id() == id => {}
            other => panic!(
                "deadline heap index corrupted: slot {} for {:?} holds {:?}",
                i,
                id,
                other.map(|x| x.id())
            ),
        }
    }

    fn less(&self, a: usize, b: usize) -> bool { self.heap[a].deadline() < self.heap[b].deadline() }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slots.insert(self.heap[a].id().clone(), a);
        self.slots.insert(self.heap[b].id().clone(), b);
    }

    fn fix(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true when the element moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let l = 2 * i + 1;
            if l >= n {
                break;
            }
            let mut child = l;
            if l + 1 < n && self.less(l + 1, l) {
                child = l + 1;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}
