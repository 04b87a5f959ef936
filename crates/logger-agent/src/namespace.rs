// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric namespace: a bijection between dotted metric names and numeric ids.
//!
//! The namespace is built once from the finalized source table and is
//! immutable afterwards, so ids stay stable for the lifetime of the process.
//!
//! ```text
//! <root>.numclients                     id 0
//! <root>.numlogfiles                    id 1
//! <root>.param_string                   id 2
//! <root>.maxmem                         id 3
//! <root>.perfile.<source>.count         id 4 + source * 7 + 0
//! ...
//! <root>.perfile.<source>.queuemem      id 4 + source * 7 + 6
//! ```

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use derive_more::{Display, Into};
use serde::Serialize;

use crate::errors::ConfigError;
use crate::source::{SourceId, SourceTable};
use crate::util::is_valid_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into, Serialize)]
pub struct MetricId(u32);

impl MetricId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Counter,
    Gauge,
    String,
    Discrete,
    EventStream,
}

/// Encoding of the value a fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    U32,
    U64,
    String,
    Events,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalMetric {
    NumClients,
    NumLogfiles,
    ParamString,
    MaxMem,
}

impl GlobalMetric {
    pub const ALL: [GlobalMetric; 4] = [
        GlobalMetric::NumClients,
        GlobalMetric::NumLogfiles,
        GlobalMetric::ParamString,
        GlobalMetric::MaxMem,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GlobalMetric::NumClients => "numclients",
            GlobalMetric::NumLogfiles => "numlogfiles",
            GlobalMetric::ParamString => "param_string",
            GlobalMetric::MaxMem => "maxmem",
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            GlobalMetric::ParamString => ValueKind::String,
            _ => ValueKind::Discrete,
        }
    }

    fn value_type(self) -> ValueType {
        match self {
            GlobalMetric::NumClients | GlobalMetric::NumLogfiles => ValueType::U32,
            GlobalMetric::ParamString => ValueType::String,
            GlobalMetric::MaxMem => ValueType::U64,
        }
    }

    fn help(self) -> &'static str {
        match self {
            GlobalMetric::NumClients => "Number of attached clients.",
            GlobalMetric::NumLogfiles => "Number of monitored log sources.",
            GlobalMetric::ParamString => "Diagnostic string parameter; never holds a value.",
            GlobalMetric::MaxMem => "Per-source event queue memory budget, in bytes.",
        }
    }
}

/// One of the fixed metric kinds generated for every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Count,
    Bytes,
    Size,
    Path,
    NumClients,
    Records,
    QueueMem,
}

impl Facet {
    pub const ALL: [Facet; 7] = [
        Facet::Count,
        Facet::Bytes,
        Facet::Size,
        Facet::Path,
        Facet::NumClients,
        Facet::Records,
        Facet::QueueMem,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Facet::Count => "count",
            Facet::Bytes => "bytes",
            Facet::Size => "size",
            Facet::Path => "path",
            Facet::NumClients => "numclients",
            Facet::Records => "records",
            Facet::QueueMem => "queuemem",
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            Facet::Count | Facet::Bytes => ValueKind::Counter,
            Facet::Size | Facet::NumClients | Facet::QueueMem => ValueKind::Gauge,
            Facet::Path => ValueKind::String,
            Facet::Records => ValueKind::EventStream,
        }
    }

    fn value_type(self) -> ValueType {
        match self {
            Facet::Count | Facet::Bytes | Facet::Size | Facet::QueueMem => ValueType::U64,
            Facet::NumClients => ValueType::U32,
            Facet::Path => ValueType::String,
            Facet::Records => ValueType::Events,
        }
    }

    fn help(self) -> &'static str {
        match self {
            Facet::Count => "Cumulative number of events seen for this log source.",
            Facet::Bytes => "Cumulative number of event bytes seen for this log source.",
            Facet::Size => "Current size of the log file.",
            Facet::Path => "Path or command line of this log source.",
            Facet::NumClients => "Number of clients following this log source.",
            Facet::Records => "Event records for this log source.",
            Facet::QueueMem => "Memory held by queued event data for this log source.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Global(GlobalMetric),
    Source { source: SourceId, facet: Facet },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDescriptor {
    pub id: MetricId,
    pub name: String,
    pub kind: ValueKind,
    pub value_type: ValueType,
    pub binding: Binding,
    pub help: &'static str,
}

/// One entry returned by [`MetricNamespace::enumerate_children`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceChild {
    pub name: String,
    pub leaf: bool,
}

#[derive(Debug)]
pub struct MetricNamespace {
    root: String,
    descriptors: Vec<MetricDescriptor>,
    by_name: BTreeMap<String, MetricId>,
}

impl MetricNamespace {
    /// Generates the static names followed by seven names per source.
    pub fn build(root: &str, sources: &SourceTable) -> Result<Self, ConfigError> {
        if !is_valid_name(root) {
            return Err(ConfigError::InvalidName(root.to_string()));
        }

        let capacity = GlobalMetric::ALL.len() + sources.len() * Facet::ALL.len();
        let mut descriptors = Vec::with_capacity(capacity);

        for global in GlobalMetric::ALL {
            descriptors.push(MetricDescriptor {
                id: MetricId(descriptors.len() as u32),
                name: format!("{root}.{}", global.name()),
                kind: global.kind(),
                value_type: global.value_type(),
                binding: Binding::Global(global),
                help: global.help(),
            });
        }

        let mut seen = HashSet::with_capacity(sources.len());
        for source in sources.iter() {
            if !is_valid_name(source.name()) {
                return Err(ConfigError::InvalidName(source.name().to_string()));
            }
            if !seen.insert(source.name()) {
                return Err(ConfigError::DuplicateName(source.name().to_string()));
            }
            for facet in Facet::ALL {
                descriptors.push(MetricDescriptor {
                    id: MetricId(descriptors.len() as u32),
                    name: format!("{root}.perfile.{}.{}", source.name(), facet.name()),
                    kind: facet.kind(),
                    value_type: facet.value_type(),
                    binding: Binding::Source {
                        source: source.id(),
                        facet,
                    },
                    help: facet.help(),
                });
            }
        }

        let by_name = descriptors
            .iter()
            .map(|d| (d.name.clone(), d.id))
            .collect::<BTreeMap<_, _>>();

        tracing::debug!(
            "Built metric namespace '{}' with {} metrics for {} sources",
            root,
            descriptors.len(),
            sources.len()
        );

        Ok(Self {
            root: root.to_string(),
            descriptors,
            by_name,
        })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn contains(&self, id: MetricId) -> bool {
        id.index() < self.descriptors.len()
    }

    pub fn resolve_by_name(&self, name: &str) -> Option<MetricId> {
        self.by_name.get(name).copied()
    }

    pub fn resolve_by_id(&self, id: MetricId) -> Option<&str> {
        self.descriptor(id).map(|d| d.name.as_str())
    }

    pub fn descriptor(&self, id: MetricId) -> Option<&MetricDescriptor> {
        self.descriptors.get(id.index())
    }

    pub fn help_text(&self, id: MetricId) -> Option<&'static str> {
        self.descriptor(id).map(|d| d.help)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.descriptors.iter()
    }

    /// Immediate children of a namespace node, in name order.
    ///
    /// The empty prefix names the node above the root. Leaves have no
    /// children; an unknown prefix yields `None`.
    pub fn enumerate_children(&self, prefix: &str) -> Option<Vec<NamespaceChild>> {
        if prefix.is_empty() {
            return Some(vec![NamespaceChild {
                name: self.root.clone(),
                leaf: false,
            }]);
        }
        if self.by_name.contains_key(prefix) {
            return Some(Vec::new());
        }

        let mut children = BTreeMap::new();
        for name in self.names_below(prefix) {
            let rest = &name[prefix.len() + 1..];
            match rest.split_once('.') {
                Some((child, _)) => children.insert(child, false),
                None => children.insert(rest, true),
            };
        }

        if children.is_empty() {
            return None;
        }
        Some(
            children
                .into_iter()
                .map(|(name, leaf)| NamespaceChild {
                    name: name.to_string(),
                    leaf,
                })
                .collect(),
        )
    }

    /// Every metric name at or beneath `prefix`; all names for the empty prefix.
    pub fn enumerate_leaves(&self, prefix: &str) -> Vec<String> {
        if prefix.is_empty() {
            return self.by_name.keys().cloned().collect();
        }
        if self.by_name.contains_key(prefix) {
            return vec![prefix.to_string()];
        }
        self.names_below(prefix).map(str::to_string).collect()
    }

    fn names_below<'a>(&'a self, prefix: &str) -> impl Iterator<Item = &'a str> + 'a {
        let start = format!("{prefix}.");
        self.by_name
            .range::<str, _>((Bound::Included(start.as_str()), Bound::Unbounded))
            .map(|(name, _)| name.as_str())
            .take_while(move |name| name.starts_with(&start))
    }
}
