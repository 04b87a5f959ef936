// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing helpers for configuration values.

use std::time::Duration;

use crate::constants::{MIN_MAXMEM, MIN_POLL_INTERVAL};
use crate::errors::ConfigError;

/// Checks that a name can be used as one component of a metric name.
///
/// A valid name must start with an ASCII letter and contain only ASCII
/// alphanumerics or underscores.
///
/// # Examples
///
/// ```
/// use logger_agent::util::is_valid_name;
///
/// assert!(is_valid_name("syslog"));
/// assert!(is_valid_name("app_2"));
/// assert!(!is_valid_name("2app"));
/// assert!(!is_valid_name("my-app"));
/// assert!(!is_valid_name(""));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        _ => false,
    }
}

/// Parses a queue memory budget.
///
/// Accepts a decimal byte count with an optional single `b`, `k`, `m` or `g`
/// suffix (case-insensitive). The result must be at least one memory page.
///
/// # Examples
///
/// ```
/// use logger_agent::util::parse_memory_size;
///
/// assert_eq!(parse_memory_size("8192").unwrap(), 8192);
/// assert_eq!(parse_memory_size("64k").unwrap(), 64 * 1024);
/// assert_eq!(parse_memory_size("2M").unwrap(), 2 * 1024 * 1024);
/// assert!(parse_memory_size("1k").is_err());
/// assert!(parse_memory_size("12kb").is_err());
/// ```
pub fn parse_memory_size(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidMemory {
        value: value.to_string(),
        min: MIN_MAXMEM,
    };

    let trimmed = value.trim();
    let digits_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);
    let base: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match suffix {
        "" | "b" | "B" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    let bytes = base.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes < MIN_MAXMEM {
        return Err(invalid());
    }
    Ok(bytes)
}

/// Parses a poll interval.
///
/// A bare number is taken as seconds; `ms`, `s`, `m` and `h` suffixes are
/// also accepted. Intervals shorter than 100ms are refused.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use logger_agent::util::parse_interval;
///
/// assert_eq!(parse_interval("2").unwrap(), Duration::from_secs(2));
/// assert_eq!(parse_interval("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
/// assert!(parse_interval("10ms").is_err());
/// ```
pub fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidInterval(value.to_string());

    let trimmed = value.trim();
    let digits_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let interval = match suffix.trim() {
        "ms" => Duration::from_millis(amount),
        "" | "s" | "sec" => Duration::from_secs(amount),
        "m" | "min" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
        "h" | "hour" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };

    if interval < MIN_POLL_INTERVAL {
        return Err(invalid());
    }
    Ok(interval)
}
