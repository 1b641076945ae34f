// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory device registry, resource manager and telemetry backend

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_telemetry::config::ResourceScope;
use fleet_telemetry::entity::{
    CatalogClient, CatalogQuery, ConcurrencyToken, ConnectionState, Entity, Page, ResourceDetail,
    ResourceManagerClient, ResourceRef,
};
use fleet_telemetry::metric::MetricMetadata;
use fleet_telemetry::publisher::TelemetryBackend;
use fleet_telemetry::{FleetError, UpstreamError};

fn unavailable() -> UpstreamError {
    UpstreamError::Status {
        status: 503,
        body: "ServiceUnavailable".to_string(),
    }
}

/// Offset-based cursor over `items`, `page_size` at a time.
fn page_of<T: Clone>(items: &[T], page_size: usize, cursor: Option<&str>) -> Page<T> {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + page_size.max(1)).min(items.len());
    Page {
        items: items[start.min(end)..end].to_vec(),
        continuation: (end < items.len()).then(|| end.to_string()),
    }
}

#[derive(Debug, Clone)]
struct StoredDevice {
    tags: BTreeMap<String, String>,
    version: u64,
    status: ConnectionState,
}

impl StoredDevice {
    fn entity(&self, id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            tags: self.tags.clone(),
            token: ConcurrencyToken::new(format!("v{}", self.version)),
            status: self.status,
        }
    }
}

/// Device registry whose tokens are the twin versions.
#[derive(Default)]
pub struct InMemoryCatalog {
    devices: Mutex<BTreeMap<String, StoredDevice>>,
    /// Devices changed by another writer right after being read.
    raced: Mutex<HashSet<String>>,
    /// Devices whose reads fail.
    unreadable: Mutex<HashSet<String>>,
    /// Zero-based page index from which the listing fails.
    failing_page: Mutex<Option<usize>>,
    pub writes: Mutex<Vec<String>>,
    pub queries: Mutex<usize>,
}

impl InMemoryCatalog {
    pub fn with_devices(devices: &[(&str, ConnectionState)]) -> Self {
        let catalog = Self::default();
        {
            let mut stored = catalog.devices.lock().unwrap();
            for (id, status) in devices {
                stored.insert(
                    id.to_string(),
                    StoredDevice {
                        tags: BTreeMap::new(),
                        version: 1,
                        status: *status,
                    },
                );
            }
        }
        catalog
    }

    pub fn race_on(&self, id: &str) {
        self.raced.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_reads_of(&self, id: &str) {
        self.unreadable.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_from_page(&self, page: usize) {
        *self.failing_page.lock().unwrap() = Some(page);
    }

    pub fn set_tag(&self, id: &str, key: &str, value: &str) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.tags.insert(key.to_string(), value.to_string());
            device.version += 1;
        }
    }

    pub fn set_status(&self, id: &str, status: ConnectionState) {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.status = status;
        }
    }

    pub fn tags(&self, id: &str) -> BTreeMap<String, String> {
        self.devices.lock().unwrap()[id].tags.clone()
    }

    pub fn version(&self, id: &str) -> u64 {
        self.devices.lock().unwrap()[id].version
    }
}

#[async_trait]
impl CatalogClient for InMemoryCatalog {
    async fn query(
        &self,
        query: &CatalogQuery,
        continuation: Option<&str>,
    ) -> Result<Page<String>, UpstreamError> {
        let page_index = {
            let mut queries = self.queries.lock().unwrap();
            *queries += 1;
            *queries - 1
        };
        if matches!(*self.failing_page.lock().unwrap(), Some(failing) if page_index >= failing) {
            return Err(unavailable());
        }
        let ids: Vec<String> = self.devices.lock().unwrap().keys().cloned().collect();
        Ok(page_of(&ids, query.page_size as usize, continuation))
    }

    async fn get_entity(&self, id: &str) -> Result<Entity, FleetError> {
        if self.unreadable.lock().unwrap().contains(id) {
            return Err(FleetError::UpstreamUnavailable(unavailable()));
        }
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| FleetError::UpstreamUnavailable(UpstreamError::Status {
                status: 404,
                body: format!("{id} not found"),
            }))?;
        let entity = device.entity(id);
        if self.raced.lock().unwrap().contains(id) {
            device.tags.insert("owner".to_string(), "someone-else".to_string());
            device.version += 1;
        }
        Ok(entity)
    }

    async fn update_entity(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
        token: &ConcurrencyToken,
    ) -> Result<Entity, FleetError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(id).ok_or_else(|| FleetError::Conflict {
            entity_id: id.to_string(),
        })?;
        if token.as_str() != format!("v{}", device.version) {
            return Err(FleetError::Conflict {
                entity_id: id.to_string(),
            });
        }
        device.tags = tags.clone();
        device.version += 1;
        self.writes.lock().unwrap().push(id.to_string());
        Ok(device.entity(id))
    }
}

/// Backend that records what it receives, keyed like the real settings store.
#[derive(Default)]
pub struct RecordingBackend {
    pub metadata: Mutex<BTreeMap<String, MetricMetadata>>,
    pub declare_calls: Mutex<Vec<String>>,
    pub lines: Mutex<Vec<String>>,
    rejected_keys: Mutex<HashSet<String>>,
    rejected_line_prefixes: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn reject_metadata_for(&self, key: &str) {
        self.rejected_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn reject_lines_starting_with(&self, prefix: &str) {
        self.rejected_line_prefixes
            .lock()
            .unwrap()
            .push(prefix.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap().clone();
        lines.sort();
        lines
    }

    pub fn declare_calls(&self) -> Vec<String> {
        self.declare_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetryBackend for RecordingBackend {
    async fn declare_metric_metadata(&self, metadata: &MetricMetadata) -> Result<(), UpstreamError> {
        self.declare_calls.lock().unwrap().push(metadata.key.clone());
        if self.rejected_keys.lock().unwrap().contains(&metadata.key) {
            return Err(UpstreamError::Status {
                status: 400,
                body: "Validation failed".to_string(),
            });
        }
        self.metadata
            .lock()
            .unwrap()
            .insert(metadata.key.clone(), metadata.clone());
        Ok(())
    }

    async fn ingest_line(&self, line: &str) -> Result<(), UpstreamError> {
        let rejected = self
            .rejected_line_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|prefix| line.starts_with(prefix.as_str()));
        if rejected {
            return Err(UpstreamError::Status {
                status: 400,
                body: r#"{"linesOk":0,"linesInvalid":1}"#.to_string(),
            });
        }
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Resource inventory listing fixed hubs.
pub struct InMemoryResourceManager {
    hubs: Vec<(ResourceRef, ResourceDetail)>,
    display_name: Option<String>,
    page_size: usize,
    unreadable: HashSet<String>,
}

impl InMemoryResourceManager {
    pub fn new(display_name: Option<&str>, hubs: &[(&str, &str, u64)]) -> Self {
        Self {
            hubs: hubs
                .iter()
                .map(|(name, tier, unit)| {
                    (
                        ResourceRef {
                            name: name.to_string(),
                            resource_group: "rg-1".to_string(),
                        },
                        ResourceDetail {
                            name: name.to_string(),
                            tier: tier.to_string(),
                            capacity_unit: *unit,
                        },
                    )
                })
                .collect(),
            display_name: display_name.map(str::to_string),
            page_size: 2,
            unreadable: HashSet::new(),
        }
    }

    pub fn fail_detail_of(mut self, name: &str) -> Self {
        self.unreadable.insert(name.to_string());
        self
    }
}

#[async_trait]
impl ResourceManagerClient for InMemoryResourceManager {
    async fn list_resources(
        &self,
        _scope: &ResourceScope,
        continuation: Option<&str>,
    ) -> Result<Page<ResourceRef>, UpstreamError> {
        let refs: Vec<ResourceRef> = self.hubs.iter().map(|(r, _)| r.clone()).collect();
        Ok(page_of(&refs, self.page_size, continuation))
    }

    async fn get_resource_detail(
        &self,
        _scope: &ResourceScope,
        resource: &ResourceRef,
    ) -> Result<ResourceDetail, UpstreamError> {
        if self.unreadable.contains(&resource.name) {
            return Err(unavailable());
        }
        self.hubs
            .iter()
            .find(|(r, _)| r == resource)
            .map(|(_, detail)| detail.clone())
            .ok_or_else(|| UpstreamError::Status {
                status: 404,
                body: format!("{} not found", resource.name),
            })
    }

    async fn scope_display_name(&self, scope: &ResourceScope) -> Result<String, UpstreamError> {
        self.display_name.clone().ok_or_else(|| UpstreamError::Status {
            status: 403,
            body: format!("no access to {}", scope.subscription_id),
        })
    }
}
