//! Fixed-capacity ring buffer
//!
//! Many writers and many readers share one buffer behind an `RwLock`. Pushing
//! into a full buffer evicts the oldest element. Readers always get owned
//! copies, never references into the buffer.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub struct RingBuffer<T> {
    items: RwLock<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append `item`, returning the evicted element if the buffer was full
    pub fn push(&self, item: T) -> Option<T> {
        self.push_with(|| item).1
    }

    /// Build the item while holding the write lock and append it.
    ///
    /// Anything `make` does (such as drawing a sequence id) is ordered with
    /// every other push into this buffer. Returns a copy of the stored item
    /// and the evicted element, if any.
    pub fn push_with<F>(&self, make: F) -> (T, Option<T>)
    where
        F: FnOnce() -> T,
    {
        let mut items = self.write();
        let evicted = if items.len() == self.capacity {
            items.pop_front()
        } else {
            None
        };
        let item = make();
        items.push_back(item.clone());
        (item, evicted)
    }

    /// Newest-first page
    pub fn newest(&self, offset: usize, limit: usize) -> Vec<T> {
        self.read().iter().rev().skip(offset).take(limit).cloned().collect()
    }

    /// All items, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.read().iter().cloned().collect()
    }

    /// Items whose key is greater than `after`, oldest first.
    ///
    /// `key` must be non-decreasing in insertion order; the scan is a binary
    /// search plus a copy of the matching tail.
    pub fn after<K, F>(&self, after: K, key: F) -> Vec<T>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let items = self.read();
        let start = items.partition_point(|item| key(item) <= after);
        items.range(start..).cloned().collect()
    }

    /// Items matching `predicate`, oldest first
    pub fn filter<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        self.read().iter().filter(|item| predicate(item)).cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, VecDeque<T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, VecDeque<T>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}
