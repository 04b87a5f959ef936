// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log source metrics agent.
//!
//! Watches a configured set of log sources (plain files or subprocess pipes),
//! keeps a memory-budgeted queue of recent event records per source and
//! exposes counters and event streams through a stable, dynamically generated
//! metric namespace. Many clients can consume the same event streams
//! independently, each with its own cursor and optional filter.
//!
//! The core ([`agent::Agent`]) is single-threaded and driven by two entry
//! points, `on_tick` and `on_request`. [`agent_service::AgentService`] owns
//! the core inside one task so that the two never interleave.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod adapter;
pub mod agent;
pub mod agent_service;
pub mod client;
pub mod config;
pub mod constants;
pub mod errors;
pub mod ingest;
pub mod namespace;
pub mod queue;
pub mod source;
pub mod util;
