use crate::api::EventRecord;
use std::collections::VecDeque;

/// Device events of the current session, in arrival order.
///
/// Bounded: once `capacity` records are held, each new record evicts the
/// oldest one.
#[derive(Debug)]
pub struct EventBuffer {
    records: VecDeque<EventRecord>,
    capacity: usize,
    evicted: u64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn push(&mut self, record: EventRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(record);
    }

    /// Append a history batch (login backfill) in the order given.
    pub fn extend(&mut self, records: impl IntoIterator<Item = EventRecord>) {
        for record in records {
            self.push(record);
        }
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
