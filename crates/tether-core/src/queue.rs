//! Bounded priority work queue shared by both sync managers.
//!
//! Items are kept in a `BTreeMap` keyed by (priority, created_at, seq) so
//! iteration order is the processing order: priority class first, then
//! creation time, then enqueue sequence. An id index gives O(log n) lookup
//! and in-place mutation without disturbing the order.
//!
//! On overflow the queue evicts before inserting, lowest class first and
//! oldest first, and only ever touches `normal`/`low` items. When nothing
//! evictable is left the queue grows past its capacity rather than drop a
//! `critical`/`high` item.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Command, Priority, Update};

/// Anything the work queue can order.
pub trait Queued: Clone {
    fn id(&self) -> Uuid;
    fn priority(&self) -> Priority;
    fn created_at(&self) -> DateTime<Utc>;
    fn seq(&self) -> u64;
}

impl Queued for Command {
    fn id(&self) -> Uuid {
        self.id
    }
    fn priority(&self) -> Priority {
        self.priority
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn seq(&self) -> u64 {
        self.seq
    }
}

impl Queued for Update {
    fn id(&self) -> Uuid {
        self.id
    }
    fn priority(&self) -> Priority {
        self.priority
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl OrderKey {
    fn of<T: Queued>(item: &T) -> Self {
        Self {
            priority: item.priority(),
            created_at: item.created_at(),
            seq: item.seq(),
        }
    }

    fn class_start(priority: Priority) -> Self {
        Self {
            priority,
            created_at: DateTime::<Utc>::MIN_UTC,
            seq: 0,
        }
    }
}

/// Ordered, bounded store of pending work.
#[derive(Debug, Clone)]
pub struct WorkQueue<T: Queued> {
    entries: BTreeMap<OrderKey, T>,
    index: HashMap<Uuid, OrderKey>,
    capacity: usize,
    next_seq: u64,
}

impl<T: Queued> WorkQueue<T> {
    /// Create an empty queue holding at most `capacity` evictable items.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Rebuild a queue from persisted items (order is recomputed).
    pub fn restore(capacity: usize, items: impl IntoIterator<Item = T>, next_seq: u64) -> Self {
        let mut queue = Self::new(capacity);
        queue.next_seq = next_seq;
        for item in items {
            queue.insert(item);
        }
        queue
    }

    /// Reserve the next enqueue sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Sequence number the next enqueue will get (persisted for restarts).
    pub fn peek_seq(&self) -> u64 {
        self.next_seq
    }

    /// Enqueue an item, evicting `normal`/`low` entries first if full.
    ///
    /// Returns the evicted items, oldest lowest-priority first.
    pub fn push(&mut self, item: T) -> Vec<T> {
        self.push_except(item, |_| false)
    }

    /// Like [`push`](Self::push), but items matching `pinned` (work already
    /// in flight) are never evicted.
    pub fn push_except<F>(&mut self, item: T, pinned: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.evict_one(&pinned) {
                Some(dropped) => evicted.push(dropped),
                None => break,
            }
        }
        self.insert(item);
        evicted
    }

    fn insert(&mut self, item: T) {
        let key = OrderKey::of(&item);
        self.next_seq = self.next_seq.max(item.seq() + 1);
        if let Some(old_key) = self.index.insert(item.id(), key) {
            self.entries.remove(&old_key);
        }
        self.entries.insert(key, item);
    }

    /// Remove the oldest unpinned item of the lowest evictable class.
    fn evict_one<F>(&mut self, pinned: &F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        for priority in [Priority::Low, Priority::Normal] {
            let key = self
                .entries
                .range(OrderKey::class_start(priority)..)
                .take_while(|(k, _)| k.priority == priority)
                .find(|(_, item)| !pinned(item))
                .map(|(k, _)| *k);

            if let Some(key) = key {
                let item = self.entries.remove(&key)?;
                self.index.remove(&item.id());
                return Some(item);
            }
        }
        None
    }

    /// Clone up to `limit` items in processing order that satisfy `filter`.
    pub fn snapshot<F>(&self, limit: usize, filter: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.entries
            .values()
            .filter(|item| filter(item))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<&T> {
        self.index.get(id).and_then(|key| self.entries.get(key))
    }

    /// Mutable access. Callers must not change the ordering fields.
    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut T> {
        let key = self.index.get(id)?;
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<T> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    /// Items in processing order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
