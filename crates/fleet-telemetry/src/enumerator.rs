// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lazy, paginated discovery of entities.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::ResourceScope;
use crate::entity::{CatalogClient, CatalogQuery, Page, ResourceManagerClient, ResourceRef};
use crate::error::{FleetError, UpstreamError};

/// A cursor-paginated listing.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send + 'static;

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page<Self::Item>, UpstreamError>;
}

/// Device identifiers from the registry.
pub struct DeviceSource {
    catalog: Arc<dyn CatalogClient>,
    query: CatalogQuery,
}

impl DeviceSource {
    pub fn new(catalog: Arc<dyn CatalogClient>, query: CatalogQuery) -> Self {
        Self { catalog, query }
    }
}

#[async_trait]
impl PageSource for DeviceSource {
    type Item = String;

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page<String>, UpstreamError> {
        self.catalog.query(&self.query, cursor).await
    }
}

/// Hosted resources within one scope.
pub struct ResourceSource {
    resource_manager: Arc<dyn ResourceManagerClient>,
    scope: ResourceScope,
}

impl ResourceSource {
    pub fn new(resource_manager: Arc<dyn ResourceManagerClient>, scope: ResourceScope) -> Self {
        Self {
            resource_manager,
            scope,
        }
    }
}

#[async_trait]
impl PageSource for ResourceSource {
    type Item = ResourceRef;

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<Page<ResourceRef>, UpstreamError> {
        self.resource_manager
            .list_resources(&self.scope, cursor)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Start,
    Next(String),
    Exhausted,
}

/// Single-pass iterator over every item of a [`PageSource`].
///
/// Pages are only fetched when the buffered items run out. A failed page fetch is yielded
/// once as [`FleetError::Enumeration`] and ends the sequence: items past that page are
/// unknowable for this run.
pub struct EntityEnumerator<S: PageSource> {
    source: S,
    buffer: VecDeque<S::Item>,
    cursor: Cursor,
    pages_fetched: usize,
}

impl<S: PageSource> EntityEnumerator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: VecDeque::new(),
            cursor: Cursor::Start,
            pages_fetched: 0,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub async fn next(&mut self) -> Option<Result<S::Item, FleetError>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }

            let cursor = match &self.cursor {
                Cursor::Exhausted => return None,
                Cursor::Start => None,
                Cursor::Next(token) => Some(token.clone()),
            };

            match self.source.fetch_page(cursor.as_deref()).await {
                Ok(page) => {
                    self.pages_fetched += 1;
                    debug!(
                        "Fetched page {} with {} items",
                        self.pages_fetched,
                        page.items.len()
                    );
                    self.buffer.extend(page.items);
                    self.cursor = match page.continuation {
                        Some(next) if !next.is_empty() => Cursor::Next(next),
                        _ => Cursor::Exhausted,
                    };
                }
                Err(e) => {
                    error!(
                        "Failed to fetch page {} of the entity listing: {e}",
                        self.pages_fetched + 1
                    );
                    self.cursor = Cursor::Exhausted;
                    return Some(Err(FleetError::Enumeration(e)));
                }
            }
        }
    }

    /// Drains the remaining sequence, stopping at the first enumeration failure.
    pub async fn collect_all(mut self) -> Result<Vec<S::Item>, FleetError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}
