//! Bounded in-memory ring of region events.
//!
//! Events are write-once: appended, never mutated. When the ring is
//! full the oldest entries are dropped first.

use parking_lot::Mutex;
use shared::{RegionEvent, EVENT_LOG_CAPACITY};
use std::collections::VecDeque;

pub struct EventLog {
    entries: Mutex<VecDeque<RegionEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(EVENT_LOG_CAPACITY))),
            capacity,
        }
    }

    pub fn record(&self, event: RegionEvent) {
        let mut entries = self.entries.lock();
        entries.push_back(event);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn record_all(&self, events: &[RegionEvent]) {
        if events.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for event in events {
            entries.push_back(event.clone());
        }
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The most recent `limit` events, oldest first, optionally filtered
    /// to one region.
    pub fn recent(&self, region_id: Option<&str>, limit: usize) -> Vec<RegionEvent> {
        let entries = self.entries.lock();
        let mut matched: Vec<RegionEvent> = entries
            .iter()
            .filter(|e| region_id.map(|id| e.region_id == id).unwrap_or(true))
            .cloned()
            .collect();

        let skip = matched.len().saturating_sub(limit);
        matched.drain(..skip);
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
