// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The source table: one entry per configured log source.
//!
//! Entries are created once at startup, in configuration order, and live until
//! shutdown. The tracker mutates descriptor state, identity and counters on
//! every tick; everything else reads them.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use derive_more::{Display, Into};
use serde::Serialize;

use crate::constants::MAX_FIELD_LEN;
use crate::errors::ConfigError;
use crate::queue::{EventQueue, EventRecord};
use crate::util::is_valid_name;

/// Position of a source in the table. Never reassigned while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into, Serialize)]
pub struct SourceId(usize);

impl SourceId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Where the events of a source come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    File(PathBuf),
    /// Shell command line whose stdout is consumed.
    Command(String),
}

impl Locator {
    /// A trailing `|` marks a command line, anything else is a path.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().strip_suffix('|') {
            Some(command) => Locator::Command(command.trim_end().to_string()),
            None => Locator::File(PathBuf::from(raw.trim())),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Locator::Command(_))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Command(command) => write!(f, "{command}|"),
        }
    }
}

/// One `(name, restricted, locator)` entry handed over by the configuration loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub restricted: bool,
    pub locator: Locator,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, restricted: bool, locator: Locator) -> Self {
        Self {
            name: name.into(),
            restricted,
            locator,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name, false, Locator::File(path.into()))
    }

    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, false, Locator::Command(command.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorState {
    Closed,
    Open,
    Error,
}

/// Rotation identity of an opened file (device and inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    // Without inode numbers the identity never changes; truncation
    // detection still catches most rotations.
    #[cfg(not(unix))]
    pub fn of(_metadata: &std::fs::Metadata) -> Self {
        Self { dev: 0, ino: 0 }
    }
}

#[derive(Debug)]
pub struct LogSource {
    id: SourceId,
    name: String,
    locator: Locator,
    restricted: bool,
    identity: Option<FileIdentity>,
    state: DescriptorState,
    count: u64,
    bytes: u64,
    size: u64,
    queue: EventQueue,
}

impl LogSource {
    fn new(id: SourceId, spec: SourceSpec, maxmem: u64) -> Self {
        Self {
            id,
            name: spec.name,
            locator: spec.locator,
            restricted: spec.restricted,
            identity: None,
            state: DescriptorState::Closed,
            count: 0,
            bytes: 0,
            size: 0,
            queue: EventQueue::new(id, maxmem),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn restricted(&self) -> bool {
        self.restricted
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    /// Cumulative number of records seen, across rotations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Cumulative number of payload bytes seen, across rotations.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn queue_memory(&self) -> u64 {
        self.queue.memory_used()
    }

    pub(crate) fn mark_open(&mut self, identity: Option<FileIdentity>) {
        self.identity = identity;
        self.state = DescriptorState::Open;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.identity = None;
        self.state = DescriptorState::Closed;
        self.size = 0;
    }

    pub(crate) fn mark_error(&mut self) {
        self.identity = None;
        self.state = DescriptorState::Error;
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Appends one record to the queue and bumps the cumulative counters by
    /// the full observed size, even when the queued copy gets truncated.
    pub(crate) fn ingest(&mut self, payload: Vec<u8>, timestamp: SystemTime) -> Arc<EventRecord> {
        self.count += 1;
        self.bytes += payload.len() as u64;
        self.queue.push(payload, timestamp)
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id,
            name: self.name.clone(),
            locator: self.locator.to_string(),
            restricted: self.restricted,
            state: self.state,
        }
    }
}

/// Read-only snapshot of a source for the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub name: String,
    pub locator: String,
    pub restricted: bool,
    pub state: DescriptorState,
}

#[derive(Debug)]
pub struct SourceTable {
    sources: Vec<LogSource>,
}

impl SourceTable {
    /// Builds the table from the configured list, refusing empty lists and
    /// invalid, overlong or duplicate names.
    pub fn new(specs: Vec<SourceSpec>, maxmem: u64) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut seen = HashSet::with_capacity(specs.len());
        let mut sources = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            if spec.name.len() > MAX_FIELD_LEN {
                return Err(ConfigError::FieldTooLong {
                    field: "NAME",
                    len: spec.name.len(),
                    max: MAX_FIELD_LEN,
                });
            }
            if !is_valid_name(&spec.name) {
                return Err(ConfigError::InvalidName(spec.name));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateName(spec.name));
            }
            sources.push(LogSource::new(SourceId(index), spec, maxmem));
        }

        Ok(Self { sources })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: SourceId) -> Option<&LogSource> {
        self.sources.get(id.0)
    }

    pub fn get_mut(&mut self, id: SourceId) -> Option<&mut LogSource> {
        self.sources.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogSource> {
        self.sources.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogSource> {
        self.sources.iter_mut()
    }
}
