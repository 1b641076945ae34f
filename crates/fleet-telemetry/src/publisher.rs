// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::error::{FleetError, UpstreamError};
use crate::metric::{MetricMetadata, MetricPoint};

/// Time-series backend receiving metric metadata and data points.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Idempotent: declaring identical metadata twice must succeed both times.
    async fn declare_metric_metadata(&self, metadata: &MetricMetadata) -> Result<(), UpstreamError>;

    async fn ingest_line(&self, line: &str) -> Result<(), UpstreamError>;
}

type Declaration = Arc<OnceCell<Result<(), String>>>;

/// Two-phase publication for one run: metadata first, then data.
///
/// Each metric key is declared at most once per publisher, even when entities are processed
/// concurrently. A failed declaration is remembered and every point under that key is then
/// refused without reaching the backend.
pub struct MetricPublisher {
    backend: Arc<dyn TelemetryBackend>,
    declarations: Mutex<HashMap<String, Declaration>>,
}

impl MetricPublisher {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self {
            backend,
            declarations: Mutex::new(HashMap::new()),
        }
    }

    fn declaration(&self, key: &str) -> Declaration {
        let mut declarations = match self.declarations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(declarations.entry(key.to_string()).or_default())
    }

    /// Phase 1. Declares `metadata` unless this publisher already attempted its key.
    pub async fn ensure_declared(&self, metadata: &MetricMetadata) -> Result<(), FleetError> {
        let declaration = self.declaration(&metadata.key);
        let outcome = declaration
            .get_or_init(|| async {
                match self.backend.declare_metric_metadata(metadata).await {
                    Ok(()) => {
                        debug!("Declared metadata for {}", metadata.key);
                        Ok(())
                    }
                    Err(e) => {
                        error!(
                            "Failed to declare metadata for {}, its points are dropped for this run: {e}",
                            metadata.key
                        );
                        Err(e.to_string())
                    }
                }
            })
            .await;

        outcome
            .clone()
            .map_err(|reason| FleetError::MetadataDeclaration {
                key: metadata.key.clone(),
                reason,
            })
    }

    /// Phase 2 for a single point, gated on phase 1 for its key.
    pub async fn publish(
        &self,
        metadata: &MetricMetadata,
        point: &MetricPoint,
    ) -> Result<(), FleetError> {
        self.ensure_declared(metadata).await?;

        let line = point.to_line();
        match self.backend.ingest_line(&line).await {
            Ok(()) => {
                debug!("Ingested {line}");
                Ok(())
            }
            Err(source) => {
                error!("Failed to ingest point for {}: {source}", point.key);
                Err(FleetError::Ingestion {
                    key: point.key.clone(),
                    source,
                })
            }
        }
    }

    /// Publishes every point under `metadata`, reporting each point's result separately.
    pub async fn publish_all(
        &self,
        metadata: &MetricMetadata,
        points: &[MetricPoint],
    ) -> Vec<Result<(), FleetError>> {
        let mut results = Vec::with_capacity(points.len());
        for point in points {
            results.push(self.publish(metadata, point).await);
        }
        results
    }

    /// Keys whose declaration has completed, successfully or not.
    pub fn attempted_keys(&self) -> Vec<String> {
        let declarations = match self.declarations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = declarations
            .iter()
            .filter(|(_, declaration)| declaration.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}
