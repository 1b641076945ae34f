// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entities tracked by the exporter and the collaborator interfaces used to read and update them.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ResourceScope;
use crate::error::{FleetError, UpstreamError};

/// Device-to-cloud connection state reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque version marker (an ETag) required for every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote-managed device as seen in one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub tags: BTreeMap<String, String>,
    pub token: ConcurrencyToken,
    pub status: ConnectionState,
}

/// Query sent to the catalog when enumerating devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub filter: String,
    pub page_size: u32,
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            filter: "SELECT deviceId FROM devices".to_string(),
            page_size: 100,
        }
    }
}

/// One page of results plus the cursor to the next page, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<String>,
}

/// Reference to a hosted IoT hub resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub name: String,
    pub resource_group: String,
}

/// Capacity-relevant details of a hosted resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDetail {
    pub name: String,
    pub tier: String,
    /// Number of provisioned units of the tier.
    pub capacity_unit: u64,
}

/// Device registry operations.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn query(
        &self,
        query: &CatalogQuery,
        continuation: Option<&str>,
    ) -> Result<Page<String>, UpstreamError>;

    async fn get_entity(&self, id: &str) -> Result<Entity, FleetError>;

    /// Writes `tags` if and only if the stored token still equals `token`.
    ///
    /// A token mismatch must be reported as [`FleetError::Conflict`], never as a generic
    /// upstream error.
    async fn update_entity(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
        token: &ConcurrencyToken,
    ) -> Result<Entity, FleetError>;
}

/// Hosted resource inventory operations.
#[async_trait]
pub trait ResourceManagerClient: Send + Sync {
    async fn list_resources(
        &self,
        scope: &ResourceScope,
        continuation: Option<&str>,
    ) -> Result<Page<ResourceRef>, UpstreamError>;

    async fn get_resource_detail(
        &self,
        scope: &ResourceScope,
        resource: &ResourceRef,
    ) -> Result<ResourceDetail, UpstreamError>;

    /// Human readable name of the subscription the scope belongs to.
    async fn scope_display_name(&self, scope: &ResourceScope) -> Result<String, UpstreamError>;
}
