// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent core.
//!
//! [`Agent`] owns every piece of mutable state: the source table (with its
//! queues), the ingestion tracker and the client registry. It has two entry
//! points, [`Agent::on_tick`] and [`Agent::on_request`], both taking
//! `&mut self`; neither can run while the other is in progress, so a tick
//! always completes before a request is served and vice versa.

use std::sync::Arc;

use tracing::{debug, info};

use crate::adapter::{Adapter, MetricValue};
use crate::client::{ClientId, ClientRegistry};
use crate::config::AgentConfig;
use crate::errors::{ConfigError, RequestError};
use crate::ingest::{TickReport, Tracker};
use crate::namespace::{MetricId, MetricNamespace};
use crate::source::{SourceInfo, SourceSpec, SourceTable};

/// Outcome of fetching a single metric.
pub type FetchResult = Result<Option<MetricValue>, RequestError>;

/// Requests delivered by the connection layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Attach,
    Detach(ClientId),
    Fetch {
        client: ClientId,
        ids: Vec<MetricId>,
    },
    Store {
        client: ClientId,
        id: MetricId,
        value: MetricValue,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Attached(ClientId),
    Detached(bool),
    /// One result per requested id, in request order.
    Fetched(Result<Vec<FetchResult>, RequestError>),
    Stored(Result<(), RequestError>),
}

#[derive(Debug)]
pub struct Agent {
    maxmem: u64,
    sources: SourceTable,
    tracker: Tracker,
    clients: ClientRegistry,
    namespace: Arc<MetricNamespace>,
}

impl Agent {
    /// Validates the configuration, builds the source table and the metric
    /// namespace. Any failure here is fatal.
    pub fn new(config: &AgentConfig, specs: Vec<SourceSpec>) -> Result<Self, ConfigError> {
        config.validate()?;
        let sources = SourceTable::new(specs, config.maxmem)?;
        let namespace = Arc::new(MetricNamespace::build(&config.root, &sources)?);
        let tracker = Tracker::new(&sources);

        info!(
            "Monitoring {} log sources, {} metrics, {} byte queue budget per source",
            sources.len(),
            namespace.len(),
            config.maxmem
        );

        Ok(Self {
            maxmem: config.maxmem,
            sources,
            tracker,
            clients: ClientRegistry::new(),
            namespace,
        })
    }

    /// Runs one ingestion pass over every source.
    pub fn on_tick(&mut self) -> TickReport {
        self.tracker.poll(&mut self.sources)
    }

    pub fn on_request(&mut self, request: Request) -> Response {
        match request {
            Request::Attach => Response::Attached(self.attach()),
            Request::Detach(client) => Response::Detached(self.detach(client)),
            Request::Fetch { client, ids } => Response::Fetched(self.fetch(client, &ids)),
            Request::Store { client, id, value } => {
                Response::Stored(self.store(client, id, &value))
            }
        }
    }

    pub fn attach(&mut self) -> ClientId {
        self.clients.attach()
    }

    pub fn detach(&mut self, client: ClientId) -> bool {
        self.clients.detach(client)
    }

    /// Fetches a batch of metrics. Failures are reported per id, except for
    /// an unknown client which rejects the whole batch.
    pub fn fetch(
        &mut self,
        client: ClientId,
        ids: &[MetricId],
    ) -> Result<Vec<FetchResult>, RequestError> {
        self.clients.touch(client)?;
        let mut adapter = self.adapter();
        let results = ids
            .iter()
            .map(|&id| {
                if !adapter.namespace.contains(id) {
                    debug!("Fetch of unknown metric {} by client {}", id, client);
                    return Err(RequestError::UnknownMetric(id));
                }
                adapter.fetch(client, id)
            })
            .collect();
        Ok(results)
    }

    pub fn store(
        &mut self,
        client: ClientId,
        id: MetricId,
        value: &MetricValue,
    ) -> Result<(), RequestError> {
        if !self.namespace.contains(id) {
            return Err(RequestError::UnknownMetric(id));
        }
        self.clients.touch(client)?;
        self.adapter().store(client, id, value)
    }

    pub fn namespace(&self) -> &Arc<MetricNamespace> {
        &self.namespace
    }

    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn source_infos(&self) -> Vec<SourceInfo> {
        self.sources.iter().map(|s| s.info()).collect()
    }

    fn adapter(&mut self) -> Adapter<'_> {
        Adapter {
            namespace: self.namespace.as_ref(),
            sources: &self.sources,
            clients: &mut self.clients,
            maxmem: self.maxmem,
        }
    }
}
