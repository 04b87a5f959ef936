// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client contexts: per-client, per-source delivery cursors and filters.
//!
//! Every client reads the same underlying queues; only its own cursor moves
//! when it consumes. A record is delivered at most once per client, and a
//! record rejected by the client's filter is never re-examined either.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::{Display, Into};
use regex::bytes::Regex;
use serde::Serialize;
use tracing::debug;

use crate::errors::{InvalidFilter, RequestError};
use crate::queue::{EventQueue, EventRecord};
use crate::source::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into, Serialize)]
pub struct ClientId(u32);

impl ClientId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

/// A compiled payload filter.
#[derive(Debug, Clone)]
pub struct Filter {
    pattern: String,
    regex: Regex,
}

impl Filter {
    pub fn new(pattern: &str) -> Result<Self, InvalidFilter> {
        let regex = Regex::new(pattern).map_err(|e| InvalidFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        self.regex.is_match(payload)
    }
}

#[derive(Debug, Default)]
struct SourceView {
    cursor: Option<u64>,
    filter: Option<Filter>,
}

#[derive(Debug)]
pub struct ClientContext {
    id: ClientId,
    active: bool,
    views: HashMap<SourceId, SourceView>,
}

impl ClientContext {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            active: false,
            views: HashMap::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the client has issued any request since attaching.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Last sequence delivered from `source`, or `None` before the first read.
    pub fn cursor(&self, source: SourceId) -> Option<u64> {
        self.views.get(&source).and_then(|v| v.cursor)
    }

    pub fn filter(&self, source: SourceId) -> Option<&Filter> {
        self.views.get(&source).and_then(|v| v.filter.as_ref())
    }

    fn follows(&self, source: SourceId) -> bool {
        self.views
            .get(&source)
            .is_some_and(|v| v.cursor.is_some() || v.filter.is_some())
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientContext>,
    next_id: u32,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.clients.insert(id, ClientContext::new(id));
        debug!("Client {} attached ({} attached)", id, self.clients.len());
        id
    }

    /// Drops every cursor and filter of the client. Returns false if the
    /// client was not attached.
    pub fn detach(&mut self, client: ClientId) -> bool {
        let removed = self.clients.remove(&client).is_some();
        if removed {
            debug!("Client {} detached ({} attached)", client, self.clients.len());
        }
        removed
    }

    pub fn get(&self, client: ClientId) -> Option<&ClientContext> {
        self.clients.get(&client)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub(crate) fn touch(&mut self, client: ClientId) -> Result<(), RequestError> {
        self.context_mut(client)?.active = true;
        Ok(())
    }

    /// Number of attached clients holding a cursor or a filter for `source`.
    pub fn clients_for_source(&self, source: SourceId) -> usize {
        self.clients.values().filter(|c| c.follows(source)).count()
    }

    /// Replaces the client's filter for `source`. A malformed pattern leaves
    /// any previous filter in place.
    pub fn set_filter(
        &mut self,
        client: ClientId,
        source: SourceId,
        pattern: &str,
    ) -> Result<(), RequestError> {
        let context = self.context_mut(client)?;
        let filter = Filter::new(pattern)?;
        debug!("Client {} set filter '{}' on source {}", client, pattern, source);
        context.views.entry(source).or_default().filter = Some(filter);
        Ok(())
    }

    pub fn clear_filter(&mut self, client: ClientId, source: SourceId) -> Result<(), RequestError> {
        let context = self.context_mut(client)?;
        if let Some(view) = context.views.get_mut(&source) {
            view.filter = None;
            if view.cursor.is_none() {
                context.views.remove(&source);
            }
        }
        Ok(())
    }

    /// Returns the records of `queue` the client has not scanned yet that
    /// pass its filter, and moves its cursor past everything scanned.
    ///
    /// A cursor that fell behind the oldest retained record (because of
    /// eviction) is moved forward; the client simply sees a gap.
    pub fn pending_records(
        &mut self,
        client: ClientId,
        source: SourceId,
        queue: &EventQueue,
    ) -> Result<Vec<Arc<EventRecord>>, RequestError> {
        let context = self.context_mut(client)?;
        let cursor = context.cursor(source);

        let mut after = cursor.unwrap_or(0);
        let mut advanced = None;
        if let Some(oldest) = queue.oldest_sequence() {
            if after + 1 < oldest {
                if cursor.is_some() {
                    debug!(
                        "Client {} missed records {}..{} of source {} to eviction",
                        client,
                        after + 1,
                        oldest - 1,
                        source
                    );
                }
                after = oldest - 1;
                advanced = Some(after);
            }
        }

        let scanned = queue.records_after(after);
        if let Some(newest) = scanned.last() {
            advanced = Some(newest.sequence);
        }
        if let Some(sequence) = advanced {
            context.views.entry(source).or_default().cursor = Some(sequence);
        }

        let matched = match context.filter(source) {
            Some(filter) => scanned
                .into_iter()
                .filter(|r| filter.matches(&r.payload))
                .collect(),
            None => scanned,
        };
        Ok(matched)
    }

    fn context_mut(&mut self, client: ClientId) -> Result<&mut ClientContext, RequestError> {
        self.clients
            .get_mut(&client)
            .ok_or(RequestError::UnknownClient(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::SystemTime;

    const SOURCE: SourceId = SourceId::new(0);

    fn queue_with(lines: &[&str]) -> EventQueue {
        let mut queue = EventQueue::new(SOURCE, 4096);
        for line in lines {
            queue.push(line.as_bytes().to_vec(), SystemTime::now());
        }
        queue
    }

    fn payloads(records: &[Arc<EventRecord>]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_filter_independence() {
        let mut registry = ClientRegistry::new();
        let x = registry.attach();
        let y = registry.attach();
        registry.set_filter(x, SOURCE, "ERROR").unwrap();

        let queue = queue_with(&["INFO started", "ERROR disk full", "WARN slow"]);

        let seen_x = registry.pending_records(x, SOURCE, &queue).unwrap();
        let seen_y = registry.pending_records(y, SOURCE, &queue).unwrap();

        assert_eq!(payloads(&seen_x), vec!["ERROR disk full"]);
        assert_eq!(seen_y.len(), 3);
        assert_eq!(registry.get(x).unwrap().cursor(SOURCE), Some(3));
        assert_eq!(registry.get(y).unwrap().cursor(SOURCE), Some(3));

        // nothing is redelivered, matched or not
        assert!(registry.pending_records(x, SOURCE, &queue).unwrap().is_empty());
        assert!(registry.pending_records(y, SOURCE, &queue).unwrap().is_empty());
    }

    #[test]
    fn test_detach_leaves_others_alone() {
        let mut registry = ClientRegistry::new();
        let x = registry.attach();
        let y = registry.attach();
        let mut queue = queue_with(&["one", "two"]);

        registry.pending_records(x, SOURCE, &queue).unwrap();
        registry.pending_records(y, SOURCE, &queue).unwrap();
        assert_eq!(registry.clients_for_source(SOURCE), 2);

        assert!(registry.detach(x));
        assert!(!registry.detach(x));
        assert_eq!(registry.get(y).unwrap().cursor(SOURCE), Some(2));
        assert_eq!(registry.clients_for_source(SOURCE), 1);

        queue.push(b"three".to_vec(), SystemTime::now());
        assert_eq!(
            payloads(&registry.pending_records(y, SOURCE, &queue).unwrap()),
            vec!["three"]
        );
        assert_eq!(
            registry.pending_records(x, SOURCE, &queue).unwrap_err(),
            RequestError::UnknownClient(x)
        );
    }

    #[test]
    fn test_invalid_filter_keeps_previous() {
        let mut registry = ClientRegistry::new();
        let client = registry.attach();
        registry.set_filter(client, SOURCE, "^kernel").unwrap();

        let err = registry.set_filter(client, SOURCE, "(unclosed").unwrap_err();
        assert!(matches!(err, RequestError::InvalidFilter(_)));
        assert_eq!(
            registry.get(client).unwrap().filter(SOURCE).unwrap().pattern(),
            "^kernel"
        );

        registry.clear_filter(client, SOURCE).unwrap();
        assert!(registry.get(client).unwrap().filter(SOURCE).is_none());
    }

    #[test]
    fn test_cursor_clamped_after_eviction() {
        let mut registry = ClientRegistry::new();
        let client = registry.attach();
        let mut queue = EventQueue::new(SOURCE, 4096);

        queue.push(vec![b'a'; 1000], SystemTime::now());
        assert_eq!(registry.pending_records(client, SOURCE, &queue).unwrap().len(), 1);

        for _ in 0..6 {
            queue.push(vec![b'b'; 1000], SystemTime::now());
        }
        // sequences 1..=3 are gone, 4..=7 remain
        assert_eq!(queue.oldest_sequence(), Some(4));

        let seqs: Vec<_> = registry
            .pending_records(client, SOURCE, &queue)
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);
        assert_eq!(registry.get(client).unwrap().cursor(SOURCE), Some(7));
    }

    #[test]
    fn test_empty_queue_leaves_cursor_unset() {
        let mut registry = ClientRegistry::new();
        let client = registry.attach();
        let queue = EventQueue::new(SOURCE, 4096);

        for _ in 0..3 {
            assert!(registry.pending_records(client, SOURCE, &queue).unwrap().is_empty());
        }
        assert_eq!(registry.get(client).unwrap().cursor(SOURCE), None);
        assert!(registry.get(client).unwrap().views.is_empty());
        assert_eq!(registry.clients_for_source(SOURCE), 0);
    }

    #[test]
    fn test_clearing_last_filter_forgets_source() {
        let mut registry = ClientRegistry::new();
        let client = registry.attach();
        let other = SourceId::new(1);

        registry.set_filter(client, SOURCE, "x").unwrap();
        registry.set_filter(client, other, "y").unwrap();
        registry
            .pending_records(client, other, &queue_with(&["y1"]))
            .unwrap();

        registry.clear_filter(client, SOURCE).unwrap();
        registry.clear_filter(client, other).unwrap();

        let context = registry.get(client).unwrap();
        assert!(!context.views.contains_key(&SOURCE));
        assert_eq!(context.cursor(other), Some(1));
        assert_eq!(registry.clients_for_source(SOURCE), 0);
        assert_eq!(registry.clients_for_source(other), 1);
    }

    #[test]
    fn test_touch_marks_active() {
        let mut registry = ClientRegistry::new();
        let client = registry.attach();
        assert!(!registry.get(client).unwrap().is_active());
        registry.touch(client).unwrap();
        assert!(registry.get(client).unwrap().is_active());
        assert!(registry.touch(ClientId::new(77)).is_err());
    }

    proptest! {
        #[test]
        fn prop_cursor_is_monotonic(
            ops in proptest::collection::vec((0usize..1500, any::<bool>()), 1..60),
        ) {
            let mut registry = ClientRegistry::new();
            let client = registry.attach();
            let mut queue = EventQueue::new(SOURCE, 4096);
            let mut last = None;

            for (size, read) in ops {
                queue.push(vec![b'z'; size], SystemTime::now());
                if read {
                    registry.pending_records(client, SOURCE, &queue).unwrap();
                    let cursor = registry.get(client).unwrap().cursor(SOURCE);
                    prop_assert!(cursor >= last);
                    prop_assert!(cursor <= queue.newest_sequence());
                    last = cursor;
                }
            }
        }
    }
}
