// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::{CatalogClient, Entity};
use crate::error::FleetError;

/// Tag carrying the last observed device-to-cloud connection state.
pub const CONNECTION_STATUS_TAG: &str = "D2C-CONNECTION-STATUS";

/// Tags derived from the entity's current status.
pub fn derive_status_tags(entity: &Entity) -> BTreeMap<String, String> {
    let mut tags = entity.tags.clone();
    tags.insert(
        CONNECTION_STATUS_TAG.to_string(),
        entity.status.as_str().to_string(),
    );
    tags
}

/// Read-modify-write of an entity's status tag under optimistic concurrency.
pub struct StateReconciler {
    catalog: Arc<dyn CatalogClient>,
}

impl StateReconciler {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self { catalog }
    }

    /// Reads the entity, derives its tags and writes them back with the token from that read.
    ///
    /// Conflicts are returned as-is; retrying is left to the next cycle.
    pub async fn reconcile(&self, entity_id: &str) -> Result<Entity, FleetError> {
        let current = self.catalog.get_entity(entity_id).await?;
        let tags = derive_status_tags(&current);

        match self
            .catalog
            .update_entity(entity_id, &tags, &current.token)
            .await
        {
            Ok(updated) => {
                debug!(
                    "Tagged {entity_id} as {} (token {} -> {})",
                    current.status, current.token, updated.token
                );
                Ok(updated)
            }
            Err(e @ FleetError::Conflict { .. }) => {
                warn!("{entity_id} changed between read and write, skipping this cycle");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
