// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fleet_telemetry::{
    dynatrace::DynatraceClient,
    http::build_client,
    iothub::IotHubClient,
    trigger::{self, Triggers},
    ConnectivityPipeline, FleetConfig, Pipeline, RunOptions, TelemetryBackend,
};

const LISTEN_HOST: [u8; 4] = [0, 0, 0, 0];

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match FleetConfig::from_os_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration, shutting down: {e}");
            return;
        }
    };

    let client = match build_client(config.https_proxy.as_deref(), config.request_timeout) {
        Ok(client) => client,
        Err(e) => {
            error!("Unable to create HTTP client, shutting down: {e}");
            return;
        }
    };

    let backend: Arc<dyn TelemetryBackend> =
        match DynatraceClient::new(client.clone(), &config.backend) {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!("Unable to create telemetry backend client, shutting down: {e}");
                return;
            }
        };
    let options = RunOptions {
        max_in_flight: config.max_in_flight,
    };

    let connectivity: Option<Arc<dyn Pipeline>> = match &config.iot_hub {
        Some(settings) => match IotHubClient::new(client.clone(), settings) {
            Ok(hub) => {
                let pipeline: Arc<dyn Pipeline> = Arc::new(ConnectivityPipeline::new(
                    Arc::new(hub),
                    Arc::clone(&backend),
                    options,
                ));
                Some(pipeline)
            }
            Err(e) => {
                error!("Unable to create IoT hub client, shutting down: {e}");
                return;
            }
        },
        None => {
            info!("IOT_HUB_HOST not set, device connectivity disabled");
            None
        }
    };

    let capacity = match &config.resource_manager {
        Some(settings) => Some(trigger::arm_capacity_factory(
            client.clone(),
            settings.clone(),
            Arc::clone(&backend),
            config.tier_multipliers.clone(),
            options,
        )),
        None => {
            info!("AZURE_SUBSCRIPTION_ID not set, hub capacity disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if let Some(pipeline) = &connectivity {
        tasks.spawn(trigger::run_on_interval(
            Arc::clone(pipeline),
            config.poll_interval,
            cancel.clone(),
        ));
    }

    if config.listen_port != 0 {
        let addr = SocketAddr::from((LISTEN_HOST, config.listen_port));
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Unable to listen on {addr}, shutting down: {e}");
                return;
            }
        };
        let triggers = Triggers {
            connectivity,
            capacity,
        };
        let server_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = trigger::serve(listener, triggers, server_cancel).await {
                error!("Request trigger stopped: {e}");
            }
        });
    } else {
        info!("LISTEN_PORT is 0, request trigger disabled");
    }

    if tasks.is_empty() {
        error!("Nothing to run: configure IOT_HUB_HOST or LISTEN_PORT");
        return;
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
            }
            info!("Shutdown requested");
        }
        Some(_) = tasks.join_next() => {
            error!("A trigger stopped unexpectedly, shutting down");
        }
    }

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    info!("Fleet telemetry exporter stopped");
}
