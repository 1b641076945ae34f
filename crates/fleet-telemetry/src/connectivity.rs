// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device connectivity: tag every device with its connection state and publish it as a gauge.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entity::{CatalogClient, CatalogQuery, Entity};
use crate::enumerator::DeviceSource;
use crate::error::FleetError;
use crate::metric::{sanitize_identifier, MetricMetadata, MetricPoint, CONNECTIVITY_METRIC_KEY};
use crate::pipeline::{run_pipeline, EntityProcessor, Pipeline, PipelineRun, RunOptions};
use crate::publisher::{MetricPublisher, TelemetryBackend};
use crate::reconciler::{StateReconciler, CONNECTION_STATUS_TAG};

pub const PIPELINE_NAME: &str = "device-connectivity";

pub fn connectivity_metadata() -> MetricMetadata {
    MetricMetadata::new(
        CONNECTIVITY_METRIC_KEY,
        "Device Connectivity",
        vec![CONNECTION_STATUS_TAG.to_string()],
    )
}

/// `1` for a connected device, `0` otherwise, dimensioned by device id and state.
pub fn connectivity_point(entity: &Entity) -> MetricPoint {
    let state = entity.status.as_str();
    let value = if entity.status.is_connected() { 1.0 } else { 0.0 };
    MetricPoint::gauge(CONNECTIVITY_METRIC_KEY, value)
        .with_dimension("deviceid", format!("uuid{}", sanitize_identifier(&entity.id)))
        .with_dimension("status", state)
        .with_dimension("tags", state)
}

struct ConnectivityProcessor {
    reconciler: StateReconciler,
    publisher: MetricPublisher,
    metadata: MetricMetadata,
}

#[async_trait]
impl EntityProcessor for ConnectivityProcessor {
    type Item = String;

    fn entity_id(&self, item: &String) -> String {
        item.clone()
    }

    async fn process(&self, device_id: String) -> Result<(), FleetError> {
        let entity = self.reconciler.reconcile(&device_id).await?;
        self.publisher
            .publish(&self.metadata, &connectivity_point(&entity))
            .await
    }
}

pub struct ConnectivityPipeline {
    catalog: Arc<dyn CatalogClient>,
    backend: Arc<dyn TelemetryBackend>,
    query: CatalogQuery,
    options: RunOptions,
}

impl ConnectivityPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        backend: Arc<dyn TelemetryBackend>,
        options: RunOptions,
    ) -> Self {
        Self {
            catalog,
            backend,
            query: CatalogQuery::default(),
            options,
        }
    }

    pub fn with_query(mut self, query: CatalogQuery) -> Self {
        self.query = query;
        self
    }
}

#[async_trait]
impl Pipeline for ConnectivityPipeline {
    fn name(&self) -> &'static str {
        PIPELINE_NAME
    }

    async fn run(&self, cancel: CancellationToken) -> PipelineRun {
        let processor = Arc::new(ConnectivityProcessor {
            reconciler: StateReconciler::new(Arc::clone(&self.catalog)),
            publisher: MetricPublisher::new(Arc::clone(&self.backend)),
            metadata: connectivity_metadata(),
        });
        run_pipeline(
            PIPELINE_NAME,
            DeviceSource::new(Arc::clone(&self.catalog), self.query.clone()),
            processor,
            self.options,
            cancel,
        )
        .await
    }
}
