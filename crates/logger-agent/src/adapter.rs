// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Translates numeric metric requests into reads against the source table,
//! the event queues and the client registry.

use std::sync::Arc;

use serde::Serialize;

use crate::client::{ClientId, ClientRegistry};
use crate::errors::RequestError;
use crate::namespace::{Binding, Facet, GlobalMetric, MetricId, MetricNamespace};
use crate::queue::EventRecord;
use crate::source::SourceTable;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    U32(u32),
    U64(u64),
    String(String),
    Events(Vec<Arc<EventRecord>>),
}

pub struct Adapter<'a> {
    pub namespace: &'a MetricNamespace,
    pub sources: &'a SourceTable,
    pub clients: &'a mut ClientRegistry,
    pub maxmem: u64,
}

impl Adapter<'_> {
    /// Reads one metric on behalf of `client`.
    ///
    /// `Ok(None)` means the metric has nothing to report right now, which is
    /// not a failure: the diagnostic string never has a value and an event
    /// stream with no new records for this client is empty.
    pub fn fetch(
        &mut self,
        client: ClientId,
        id: MetricId,
    ) -> Result<Option<MetricValue>, RequestError> {
        let descriptor = self
            .namespace
            .descriptor(id)
            .ok_or(RequestError::UnknownMetric(id))?;

        let value = match descriptor.binding {
            Binding::Global(global) => match global {
                GlobalMetric::NumClients => MetricValue::U32(saturating_u32(self.clients.len())),
                GlobalMetric::NumLogfiles => MetricValue::U32(saturating_u32(self.sources.len())),
                GlobalMetric::ParamString => return Ok(None),
                GlobalMetric::MaxMem => MetricValue::U64(self.maxmem),
            },
            Binding::Source { source, facet } => {
                let log = self
                    .sources
                    .get(source)
                    .ok_or(RequestError::UnknownSource(source))?;
                match facet {
                    Facet::Count => MetricValue::U64(log.count()),
                    Facet::Bytes => MetricValue::U64(log.bytes()),
                    Facet::Size => MetricValue::U64(log.size()),
                    Facet::Path => MetricValue::String(log.locator().to_string()),
                    Facet::NumClients => {
                        MetricValue::U32(saturating_u32(self.clients.clients_for_source(source)))
                    }
                    Facet::Records => {
                        let records = self.clients.pending_records(client, source, log.queue())?;
                        if records.is_empty() {
                            return Ok(None);
                        }
                        MetricValue::Events(records)
                    }
                    Facet::QueueMem => MetricValue::U64(log.queue_memory()),
                }
            }
        };
        Ok(Some(value))
    }

    /// Writes one metric on behalf of `client`.
    ///
    /// Only the `records` facet accepts writes: a string value installs a
    /// filter for that client and source, and the empty string removes it.
    pub fn store(
        &mut self,
        client: ClientId,
        id: MetricId,
        value: &MetricValue,
    ) -> Result<(), RequestError> {
        let descriptor = self
            .namespace
            .descriptor(id)
            .ok_or(RequestError::UnknownMetric(id))?;

        let Binding::Source {
            source,
            facet: Facet::Records,
        } = descriptor.binding
        else {
            return Err(RequestError::Permission(id));
        };

        let MetricValue::String(pattern) = value else {
            return Err(RequestError::Conversion(format!(
                "metric {} expects a string filter",
                descriptor.name
            )));
        };

        if pattern.is_empty() {
            return self.clients.clear_filter(client, source);
        }
        self.clients
            .set_filter(client, source, pattern)
            .map_err(|e| match e {
                RequestError::InvalidFilter(invalid) => RequestError::Conversion(invalid.to_string()),
                other => other,
            })
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
