//! Comparator-ordered queue.
//!
//! Items are kept sorted by an injected comparator (`Ordering::Less` means
//! "dequeued first"). Insertion is stable: an item that compares equal to
//! queued items lands behind them, so equal keys dequeue FIFO. Unlike a
//! `BinaryHeap`, the queue supports predicate removal and in-place lookup, and
//! the comparator can be swapped at runtime.

use std::cmp::Ordering;
use std::fmt;

/// Ordering function injected into a [`PriorityQueue`].
pub type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

pub struct PriorityQueue<T> {
    items: Vec<T>,
    comparator: Comparator<T>,
}

impl<T> PriorityQueue<T> {
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            items: Vec::new(),
            comparator,
        }
    }

    /// Insert `item` behind every queued item that does not sort after it.
    pub fn enqueue(&mut self, item: T) {
        let cmp = &self.comparator;
        let at = self
            .items
            .partition_point(|queued| cmp(queued, &item) != Ordering::Greater);
        self.items.insert(at, item);
    }

    /// Remove and return the head of the queue.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn find<P>(&self, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.items.iter().find(|item| predicate(item))
    }

    /// Remove the first item matching `predicate`.
    pub fn remove_first<P>(&mut self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let idx = self.items.iter().position(|item| predicate(item))?;
        Some(self.items.remove(idx))
    }

    /// Remove every item matching `predicate`, preserving queue order.
    pub fn remove_where<P>(&mut self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if predicate(&item) {
                removed.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        removed
    }

    /// Replace the comparator and re-sort (stable) under it.
    pub fn set_comparator(&mut self, comparator: Comparator<T>) {
        self.comparator = comparator;
        self.resort();
    }

    /// Re-sort after the ordering inputs of queued items changed.
    pub fn resort(&mut self) {
        let cmp = &self.comparator;
        self.items.sort_by(|a, b| cmp(a, b));
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}
