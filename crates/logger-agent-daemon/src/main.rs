// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logger_agent::{
    agent_service::AgentService,
    config::AgentConfig,
    constants::DEFAULT_LOG_LEVEL,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGGER_AGENT_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or(DEFAULT_LOG_LEVEL.to_string());

    let env_filter = EnvFilter::try_new(&log_level)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))
        .unwrap_or_default();

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }

    debug!("Logging subsystem enabled");

    let mut config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on logger agent startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    // A positional argument overrides LOGGER_AGENT_CONFIG.
    if let Some(path) = env::args_os().nth(1) {
        config.sources_path = Some(PathBuf::from(path));
    }

    let specs = match config.load_sources() {
        Ok(specs) => specs,
        Err(e) => {
            error!("Error reading log sources: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel_token = CancellationToken::new();
    let (service, handle) = match AgentService::new(&config, specs, cancel_token.clone()) {
        Ok(started) => started,
        Err(e) => {
            error!("Error starting logger agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    let service_task = tokio::spawn(service.run());

    for source in handle.sources().await.unwrap_or_default() {
        info!(
            "Source {} ({}): {}{}",
            source.id,
            source.name,
            source.locator,
            if source.restricted { " [restricted]" } else { "" }
        );
    }
    info!(
        "Logger agent running with {} metrics under '{}'",
        handle.namespace().len(),
        handle.namespace().root()
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }

    info!("Shutting down logger agent");
    cancel_token.cancel();
    if let Err(e) = service_task.await {
        error!("Agent service task failed: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
