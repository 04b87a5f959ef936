// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::client::ClientId;
use crate::namespace::MetricId;
use crate::source::SourceId;

/// Errors raised while loading or validating configuration. All of them are
/// fatal: the agent refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no log sources configured")]
    NoSources,

    #[error("source name isn't a valid namespace name: '{0}'")]
    InvalidName(String),

    #[error("duplicate source name: '{0}'")]
    DuplicateName(String),

    #[error("{field} is too long ({len} bytes, max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("badly formatted config file line {line}: {content}")]
    BadLine { line: usize, content: String },

    #[error("invalid max memory '{value}' (min={min})")]
    InvalidMemory { value: String, min: u64 },

    #[error("invalid poll interval '{0}'")]
    InvalidInterval(String),

    #[error("invalid log level '{0}'. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("no sources file configured")]
    MissingSourcesFile,

    #[error("{path}: {reason}")]
    Io { path: String, reason: String },
}

/// The supplied filter pattern is not a well-formed expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter '{pattern}': {reason}")]
pub struct InvalidFilter {
    pub pattern: String,
    pub reason: String,
}

/// Per-request failures. These are reported back to the caller and never
/// affect other requests or other clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("unknown metric id {0}")]
    UnknownMetric(MetricId),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("metric {0} is not writable")]
    Permission(MetricId),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error(transparent)]
    InvalidFilter(#[from] InvalidFilter),
}

/// Errors surfaced by [`crate::agent_service::AgentHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("agent service is not running")]
    NotRunning,

    #[error("agent service sent an unexpected response")]
    UnexpectedResponse,

    #[error(transparent)]
    Request(#[from] RequestError),
}
