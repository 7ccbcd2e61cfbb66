//! Bounded buffer for insertions that target a connection the client has
//! not fetched yet.

use std::collections::VecDeque;

use crate::connection::{ConnectionKey, InsertPosition};

use super::connection::EdgeRef;

/// An insertion waiting for its connection to be populated.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInsertion {
    pub key: ConnectionKey,
    pub edge: EdgeRef,
    pub position: InsertPosition,
}

/// FIFO with a hard capacity; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct PendingBuffer {
    entries: VecDeque<PendingInsertion>,
    capacity: usize,
    dropped: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue an insertion. Returns the entry evicted to make room, if any.
    pub fn push(&mut self, insertion: PendingInsertion) -> Option<PendingInsertion> {
        let evicted = if self.entries.len() >= self.capacity {
            self.dropped += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(insertion);
        evicted
    }

    /// Remove and return every entry for `key`, in arrival order.
    pub fn take_for(&mut self, key: &ConnectionKey) -> Vec<PendingInsertion> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if &entry.key == key {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted since creation
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}
