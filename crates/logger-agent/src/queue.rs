// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-source event queue.
//!
//! Records are kept in sequence order and evicted strictly oldest-first
//! whenever the queue's payload bytes exceed the budget. Consumption by
//! clients never removes anything; eviction is the only removal path.
//!
//! # Oversized records
//!
//! A record whose payload alone is larger than the whole budget empties the
//! queue and is admitted truncated to the budget, so memory used never
//! exceeds the budget and the newest data is still delivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::source::SourceId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub source: SourceId,
    /// Per-source sequence, starting at 1 and never reused.
    pub sequence: u64,
    pub timestamp: SystemTime,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
    /// Set when the payload was cut down to fit the queue budget.
    pub truncated: bool,
}

impl EventRecord {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

fn serialize_payload<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

#[derive(Debug)]
pub struct EventQueue {
    source: SourceId,
    records: VecDeque<Arc<EventRecord>>,
    memory_used: u64,
    budget: u64,
    next_sequence: u64,
    evicted: u64,
}

impl EventQueue {
    pub fn new(source: SourceId, budget: u64) -> Self {
        Self {
            source,
            records: VecDeque::new(),
            memory_used: 0,
            budget,
            next_sequence: 1,
            evicted: 0,
        }
    }

    /// Appends a new record, assigning it the next sequence number, then
    /// evicts from the front until the queue fits its budget again.
    pub fn push(&mut self, mut payload: Vec<u8>, timestamp: SystemTime) -> Arc<EventRecord> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let truncated = payload.len() as u64 > self.budget;
        if truncated {
            warn!(
                "Record {} of source {} is {} bytes, larger than the {} byte queue budget; truncating",
                sequence,
                self.source,
                payload.len(),
                self.budget
            );
            payload.truncate(self.budget as usize);
            self.evicted += self.records.len() as u64;
            self.records.clear();
            self.memory_used = 0;
        }

        let record = Arc::new(EventRecord {
            source: self.source,
            sequence,
            timestamp,
            payload,
            truncated,
        });
        self.memory_used += record.size();
        self.records.push_back(Arc::clone(&record));

        let mut evicted = 0;
        while self.memory_used > self.budget {
            match self.records.pop_front() {
                Some(oldest) => {
                    self.memory_used -= oldest.size();
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.evicted += evicted;
            debug!(
                "Evicted {} records from source {} queue ({} bytes in use)",
                evicted, self.source, self.memory_used
            );
        }

        record
    }

    /// All retained records with a sequence strictly greater than `sequence`,
    /// oldest first.
    pub fn records_after(&self, sequence: u64) -> Vec<Arc<EventRecord>> {
        let start = self.records.partition_point(|r| r.sequence <= sequence);
        self.records.range(start..).cloned().collect()
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.records.front().map(|r| r.sequence)
    }

    pub fn newest_sequence(&self) -> Option<u64> {
        self.records.back().map(|r| r.sequence)
    }

    pub fn memory_used(&self) -> u64 {
        self.memory_used
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records dropped by eviction so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
