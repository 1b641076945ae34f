// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fleet telemetry for IoT deployments.
//!
//! Two pipelines share the same core. The connectivity pipeline tags every device twin with
//! its connection state and publishes a gauge per device. The capacity pipeline derives each
//! hub's daily message limit from its tier and publishes it. Both declare metric metadata
//! before sending any data point.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod arm;
pub mod capacity;
pub mod config;
pub mod connectivity;
pub mod dynatrace;
pub mod entity;
pub mod enumerator;
pub mod error;
pub mod http;
pub mod hub_capacity;
pub mod iothub;
pub mod metric;
pub mod pipeline;
pub mod publisher;
pub mod reconciler;
pub mod trigger;

pub use config::FleetConfig;
pub use connectivity::ConnectivityPipeline;
pub use entity::{CatalogClient, ConcurrencyToken, ConnectionState, Entity, ResourceManagerClient};
pub use error::{ConfigError, FleetError, UpstreamError};
pub use hub_capacity::CapacityPipeline;
pub use pipeline::{Pipeline, PipelineRun, RunOptions, Stage};
pub use publisher::{MetricPublisher, TelemetryBackend};
