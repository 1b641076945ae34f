// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! IoT hub capacity: derive each hub's daily message limit and publish it under the
//! subscription's namespace.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::capacity::CapacityDeriver;
use crate::config::{ResourceScope, TierMultipliers};
use crate::entity::{ResourceManagerClient, ResourceRef};
use crate::enumerator::ResourceSource;
use crate::error::{FleetError, UpstreamError};
use crate::metric::{sanitize_identifier, sanitize_key_segment, MetricMetadata, MetricPoint};
use crate::pipeline::{run_pipeline, EntityProcessor, Pipeline, PipelineRun, RunOptions};
use crate::publisher::{MetricPublisher, TelemetryBackend};

pub const PIPELINE_NAME: &str = "hub-capacity";

/// Metric key of a hub: `<subscription>.<hub>.<capacity>`.
pub fn capacity_metric_key(namespace: &str, hub_name: &str, capacity: u64) -> String {
    format!("{namespace}.{}.{capacity}", sanitize_key_segment(hub_name))
}

pub fn capacity_metadata(key: &str) -> MetricMetadata {
    MetricMetadata::new(key, "IoT Hub Capacity", vec![format!("IoTHub-Capacity-{key}")])
}

struct CapacityProcessor {
    resource_manager: Arc<dyn ResourceManagerClient>,
    scope: ResourceScope,
    namespace: String,
    deriver: CapacityDeriver,
    publisher: MetricPublisher,
}

#[async_trait]
impl EntityProcessor for CapacityProcessor {
    type Item = ResourceRef;

    fn entity_id(&self, item: &ResourceRef) -> String {
        format!("{}/{}", item.resource_group, item.name)
    }

    async fn process(&self, resource: ResourceRef) -> Result<(), FleetError> {
        let detail = self
            .resource_manager
            .get_resource_detail(&self.scope, &resource)
            .await?;
        let capacity = self.deriver.derive(&detail.tier, detail.capacity_unit)?;
        debug!(
            "{} ({} x{}) has a daily limit of {capacity}",
            detail.name, detail.tier, detail.capacity_unit
        );

        let key = capacity_metric_key(&self.namespace, &resource.name, capacity);
        let point = MetricPoint::gauge(key.as_str(), capacity as f64)
            .with_dimension("metric", sanitize_identifier(&detail.name));
        self.publisher
            .publish(&capacity_metadata(&key), &point)
            .await
    }
}

pub struct CapacityPipeline {
    resource_manager: Arc<dyn ResourceManagerClient>,
    backend: Arc<dyn TelemetryBackend>,
    scope: ResourceScope,
    multipliers: TierMultipliers,
    options: RunOptions,
}

impl CapacityPipeline {
    pub fn new(
        resource_manager: Arc<dyn ResourceManagerClient>,
        backend: Arc<dyn TelemetryBackend>,
        scope: ResourceScope,
        multipliers: TierMultipliers,
        options: RunOptions,
    ) -> Self {
        Self {
            resource_manager,
            backend,
            scope,
            multipliers,
            options,
        }
    }
}

#[async_trait]
impl Pipeline for CapacityPipeline {
    fn name(&self) -> &'static str {
        PIPELINE_NAME
    }

    async fn run(&self, cancel: CancellationToken) -> PipelineRun {
        let started = Instant::now();
        // Every key is namespaced by the subscription, so without it nothing can be published.
        let resolved = self
            .resource_manager
            .scope_display_name(&self.scope)
            .await
            .and_then(|name| match sanitize_key_segment(&name) {
                namespace if namespace.is_empty() => Err(UpstreamError::Decode(format!(
                    "subscription display name '{name}' has no usable characters"
                ))),
                namespace => Ok(namespace),
            });
        let namespace = match resolved {
            Ok(namespace) => namespace,
            Err(e) => {
                error!(
                    "{PIPELINE_NAME}: cannot resolve subscription {}: {e}",
                    self.scope.subscription_id
                );
                return PipelineRun::failed(PIPELINE_NAME, FleetError::Enumeration(e), started);
            }
        };

        let processor = Arc::new(CapacityProcessor {
            resource_manager: Arc::clone(&self.resource_manager),
            scope: self.scope.clone(),
            namespace,
            deriver: CapacityDeriver::new(self.multipliers.clone()),
            publisher: MetricPublisher::new(Arc::clone(&self.backend)),
        });
        run_pipeline(
            PIPELINE_NAME,
            ResourceSource::new(Arc::clone(&self.resource_manager), self.scope.clone()),
            processor,
            self.options,
            cancel,
        )
        .await
    }
}
