// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor wrapper around the agent core.
//!
//! ```text
//!    ┌──────────────┐   ┌──────────────┐
//!    │   Handles    │   │  Poll timer  │
//!    │   (Clone)    │   │  (interval)  │
//!    └──────┬───────┘   └──────┬───────┘
//!           │ commands         │ ticks
//!           v                  v
//!    ┌─────────────────────────────────┐
//!    │        AgentService task        │
//!    │   owns Agent, one event at a    │
//!    │   time: tick OR request         │
//!    └─────────────────────────────────┘
//! ```
//!
//! The service task is the only owner of the [`Agent`], so ticks and
//! requests are serialized without any locking. The metric namespace never
//! changes after startup and is shared with handles directly, so name
//! lookups do not go through the service at all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::adapter::MetricValue;
use crate::agent::{Agent, FetchResult, Request, Response};
use crate::client::ClientId;
use crate::config::AgentConfig;
use crate::errors::{ConfigError, ServiceError};
use crate::ingest::TickReport;
use crate::namespace::{MetricId, MetricNamespace};
use crate::source::{SourceInfo, SourceSpec};

#[derive(Debug)]
pub enum AgentCommand {
    Request {
        request: Request,
        response_tx: oneshot::Sender<Response>,
    },
    /// Runs a tick immediately, outside the timer.
    Tick(oneshot::Sender<TickReport>),
    Sources(oneshot::Sender<Vec<SourceInfo>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentCommand>,
    namespace: Arc<MetricNamespace>,
}

impl AgentHandle {
    /// The metric namespace, fixed for the lifetime of the service.
    pub fn namespace(&self) -> &MetricNamespace {
        &self.namespace
    }

    pub async fn request(&self, request: Request) -> Result<Response, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Request {
                request,
                response_tx,
            })
            .map_err(|_| ServiceError::NotRunning)?;
        response_rx.await.map_err(|_| ServiceError::NotRunning)
    }

    pub async fn attach(&self) -> Result<ClientId, ServiceError> {
        match self.request(Request::Attach).await? {
            Response::Attached(client) => Ok(client),
            _ => Err(ServiceError::UnexpectedResponse),
        }
    }

    pub async fn detach(&self, client: ClientId) -> Result<bool, ServiceError> {
        match self.request(Request::Detach(client)).await? {
            Response::Detached(removed) => Ok(removed),
            _ => Err(ServiceError::UnexpectedResponse),
        }
    }

    pub async fn fetch(
        &self,
        client: ClientId,
        ids: Vec<MetricId>,
    ) -> Result<Vec<FetchResult>, ServiceError> {
        match self.request(Request::Fetch { client, ids }).await? {
            Response::Fetched(results) => Ok(results?),
            _ => Err(ServiceError::UnexpectedResponse),
        }
    }

    pub async fn store(
        &self,
        client: ClientId,
        id: MetricId,
        value: MetricValue,
    ) -> Result<(), ServiceError> {
        match self.request(Request::Store { client, id, value }).await? {
            Response::Stored(result) => Ok(result?),
            _ => Err(ServiceError::UnexpectedResponse),
        }
    }

    pub async fn tick(&self) -> Result<TickReport, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Tick(response_tx))
            .map_err(|_| ServiceError::NotRunning)?;
        response_rx.await.map_err(|_| ServiceError::NotRunning)
    }

    pub async fn sources(&self) -> Result<Vec<SourceInfo>, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Sources(response_tx))
            .map_err(|_| ServiceError::NotRunning)?;
        response_rx.await.map_err(|_| ServiceError::NotRunning)
    }

    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.tx
            .send(AgentCommand::Shutdown)
            .map_err(|_| ServiceError::NotRunning)
    }
}

pub struct AgentService {
    agent: Agent,
    rx: mpsc::UnboundedReceiver<AgentCommand>,
    poll_interval: Duration,
    cancel_token: CancellationToken,
}

impl AgentService {
    pub fn new(
        config: &AgentConfig,
        specs: Vec<SourceSpec>,
        cancel_token: CancellationToken,
    ) -> Result<(Self, AgentHandle), ConfigError> {
        let agent = Agent::new(config, specs)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = AgentHandle {
            tx,
            namespace: Arc::clone(agent.namespace()),
        };

        let service = Self {
            agent,
            rx,
            poll_interval: config.poll_interval,
            cancel_token,
        };

        Ok((service, handle))
    }

    pub async fn run(mut self) {
        debug!(
            "Agent service started, polling every {:?}",
            self.poll_interval
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    debug!("Agent service cancelled");
                    break;
                }

                command = self.rx.recv() => match command {
                    Some(AgentCommand::Shutdown) | None => {
                        debug!("Agent service shutting down");
                        break;
                    }
                    Some(command) => self.handle(command),
                },

                _ = ticker.tick() => {
                    self.agent.on_tick();
                }
            }
        }

        debug!("Agent service stopped");
    }

    fn handle(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Request {
                request,
                response_tx,
            } => {
                let response = self.agent.on_request(request);
                if response_tx.send(response).is_err() {
                    error!("Failed to send request response - receiver dropped");
                }
            }
            AgentCommand::Tick(response_tx) => {
                let report = self.agent.on_tick();
                if response_tx.send(report).is_err() {
                    error!("Failed to send tick report - receiver dropped");
                }
            }
            AgentCommand::Sources(response_tx) => {
                if response_tx.send(self.agent.source_infos()).is_err() {
                    error!("Failed to send source list - receiver dropped");
                }
            }
            AgentCommand::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RequestError;
    use std::io::Write;

    fn start(dir: &std::path::Path) -> (AgentHandle, tokio::task::JoinHandle<()>) {
        let config = AgentConfig {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let specs = vec![SourceSpec::file("app", dir.join("app.log"))];
        let (service, handle) =
            AgentService::new(&config, specs, CancellationToken::new()).expect("service");
        let task = tokio::spawn(service.run());
        (handle, task)
    }

    fn append(path: &std::path::Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_service_basic_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = start(dir.path());

        append(&dir.path().join("app.log"), "one\ntwo\n");
        let report = handle.tick().await.expect("tick");
        assert_eq!(report.records, 2);

        let client = handle.attach().await.expect("attach");
        let count = handle
            .namespace()
            .resolve_by_name("logger.perfile.app.count")
            .unwrap();
        let results = handle.fetch(client, vec![count]).await.expect("fetch");
        assert_eq!(results, vec![Ok(Some(MetricValue::U64(2)))]);

        let sources = handle.sources().await.expect("sources");
        assert_eq!(sources[0].name, "app");

        handle.shutdown().expect("shutdown");
        task.await.expect("service task failed");

        assert!(matches!(handle.attach().await, Err(ServiceError::NotRunning)));
    }

    #[tokio::test]
    async fn test_service_reports_request_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = start(dir.path());

        let client = handle.attach().await.expect("attach");
        let size = handle
            .namespace()
            .resolve_by_name("logger.perfile.app.size")
            .unwrap();
        let err = handle
            .store(client, size, MetricValue::String("x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Request(RequestError::Permission(id)) if id == size
        ));

        assert!(handle.detach(client).await.expect("detach"));
        assert!(!handle.detach(client).await.expect("detach"));

        handle.shutdown().expect("shutdown");
        task.await.expect("service task failed");
    }

    #[tokio::test]
    async fn test_service_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let specs = vec![SourceSpec::file("app", dir.path().join("app.log"))];
        let (service, handle) =
            AgentService::new(&AgentConfig::default(), specs, token.clone()).expect("service");
        let task = tokio::spawn(service.run());

        token.cancel();
        task.await.expect("service task failed");
        assert!(matches!(handle.tick().await, Err(ServiceError::NotRunning)));
    }
}
