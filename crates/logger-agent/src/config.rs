// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::constants::{
    DEFAULT_LOG_LEVEL, DEFAULT_MAXMEM, DEFAULT_POLL_INTERVAL, DEFAULT_ROOT, MAX_FIELD_LEN,
    MIN_MAXMEM, MIN_POLL_INTERVAL, VALID_LOG_LEVELS,
};
use crate::errors::ConfigError;
use crate::source::{Locator, SourceSpec};
use crate::util::{is_valid_name, parse_interval, parse_memory_size};

/// Process-wide agent configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// File listing the log sources, one per line
    pub sources_path: Option<PathBuf>,
    /// Queue memory budget applied to every source, in bytes
    pub maxmem: u64,
    /// Delay between ingestion ticks
    pub poll_interval: Duration,
    /// First component of every metric name
    pub root: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sources_path: None,
            maxmem: DEFAULT_MAXMEM,
            poll_interval: DEFAULT_POLL_INTERVAL,
            root: DEFAULT_ROOT.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let sources_path = env::var("LOGGER_AGENT_CONFIG").ok().map(PathBuf::from);
        let maxmem = match env::var("LOGGER_AGENT_MAXMEM") {
            Ok(value) => parse_memory_size(&value)?,
            Err(_) => DEFAULT_MAXMEM,
        };
        let poll_interval = match env::var("LOGGER_AGENT_INTERVAL") {
            Ok(value) => parse_interval(&value)?,
            Err(_) => DEFAULT_POLL_INTERVAL,
        };
        let root = env::var("LOGGER_AGENT_ROOT").unwrap_or_else(|_| DEFAULT_ROOT.to_string());
        let log_level = env::var("LOGGER_AGENT_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

        let config = Self {
            sources_path,
            maxmem,
            poll_interval,
            root,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maxmem < MIN_MAXMEM {
            return Err(ConfigError::InvalidMemory {
                value: self.maxmem.to_string(),
                min: MIN_MAXMEM,
            });
        }

        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::InvalidInterval(format!(
                "{}ms",
                self.poll_interval.as_millis()
            )));
        }

        if !is_valid_name(&self.root) {
            return Err(ConfigError::InvalidName(self.root.clone()));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        Ok(())
    }

    /// Reads the configured sources file.
    pub fn load_sources(&self) -> Result<Vec<SourceSpec>, ConfigError> {
        let path = self
            .sources_path
            .as_deref()
            .ok_or(ConfigError::MissingSourcesFile)?;
        read_sources_file(path)
    }
}

pub fn read_sources_file(path: &Path) -> Result<Vec<SourceSpec>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_sources(&content)
}

/// Parses a sources file.
///
/// Each non-blank, non-comment line holds `NAME ACCESS LOCATOR`, separated by
/// whitespace. `ACCESS` starting with `y` or `Y` marks the source restricted.
/// `LOCATOR` is the rest of the line; a trailing `|` makes it a command.
///
/// ```text
/// # name      restricted  path or command
/// messages    n           /var/log/messages
/// journal     y           journalctl -f |
/// ```
pub fn parse_sources(content: &str) -> Result<Vec<SourceSpec>, ConfigError> {
    let mut specs = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let bad_line = || ConfigError::BadLine {
            line: index + 1,
            content: line.to_string(),
        };

        let line = line.trim_start();
        let (name, rest) = line
            .split_once(|c: char| c.is_whitespace())
            .ok_or_else(bad_line)?;
        if name.len() > MAX_FIELD_LEN {
            return Err(ConfigError::FieldTooLong {
                field: "NAME",
                len: name.len(),
                max: MAX_FIELD_LEN,
            });
        }
        if !is_valid_name(name) {
            return Err(ConfigError::InvalidName(name.to_string()));
        }

        let (access, locator) = rest
            .trim_start()
            .split_once(|c: char| c.is_whitespace())
            .ok_or_else(bad_line)?;
        let locator = locator.trim_start();
        if locator.is_empty() {
            return Err(bad_line());
        }
        if locator.len() > MAX_FIELD_LEN {
            return Err(ConfigError::FieldTooLong {
                field: "PATHNAME",
                len: locator.len(),
                max: MAX_FIELD_LEN,
            });
        }

        let restricted = access.starts_with(['y', 'Y']);
        debug!("Saw log source {} ({})", locator, name);
        specs.push(SourceSpec::new(name, restricted, Locator::parse(locator)));
    }

    Ok(specs)
}
