// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Default per-source event queue budget, in bytes.
pub const DEFAULT_MAXMEM: u64 = 2 * 1024 * 1024;

/// Smallest accepted queue budget: one memory page.
pub const MIN_MAXMEM: u64 = 4096;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Root of the metric namespace unless overridden.
pub const DEFAULT_ROOT: &str = "logger";

/// Longest source name or locator accepted from the sources file.
pub const MAX_FIELD_LEN: usize = 4096;

/// A line fragment that grows to this size without a newline is emitted as a record.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Chunk size for reads from file descriptors and command pipes.
pub const READ_BUFFER_SIZE: usize = 8192;

pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
