//! FIFO eviction queue.
//!
//! Entries are keyed by a monotonically increasing ticket, so the front of
//! the map is always the tile that waited longest. A tile records its own
//! ticket in its store metadata, which lets `dequeue` remove it in
//! `O(log n)` without scanning.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::tile_data::TileData;

#[derive(Debug, Default)]
pub(crate) struct EvictionQueue {
    entries: BTreeMap<u64, Arc<TileData>>,
    next_ticket: u64,
    closed: bool,
}

impl EvictionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns its ticket.
    pub(crate) fn push(&mut self, data: Arc<TileData>) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.insert(ticket, data);
        ticket
    }

    /// The oldest entry, left in place.
    pub(crate) fn front(&self) -> Option<(u64, Arc<TileData>)> {
        self.entries
            .first_key_value()
            .map(|(ticket, data)| (*ticket, Arc::clone(data)))
    }

    pub(crate) fn remove(&mut self, ticket: u64) -> Option<Arc<TileData>> {
        self.entries.remove(&ticket)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops accepting entries. Existing entries stay until drained.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}
