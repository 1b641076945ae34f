// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hub inventory client backed by the Azure Resource Manager REST API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::debug;

use crate::config::{ResourceManagerSettings, ResourceScope};
use crate::entity::{Page, ResourceDetail, ResourceManagerClient, ResourceRef};
use crate::error::UpstreamError;
use crate::http::{check_status, read_json};

const IOT_HUB_API_VERSION: &str = "2023-06-30";
const SUBSCRIPTION_API_VERSION: &str = "2020-01-01";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubList {
    #[serde(default)]
    value: Vec<HubListItem>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubListItem {
    name: String,
    #[serde(rename = "resourcegroup")]
    resource_group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubDescription {
    name: String,
    sku: Option<HubSku>,
}

#[derive(Debug, Deserialize)]
struct HubSku {
    tier: Option<String>,
    capacity: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    display_name: Option<String>,
}

pub struct ArmClient {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
}

impl ArmClient {
    /// `access_token` is a bearer token for the management plane, issued by the caller.
    pub fn new(
        client: Client,
        settings: &ResourceManagerSettings,
        access_token: &str,
    ) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| UpstreamError::Decode(format!("invalid management url: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .map_err(|_| UpstreamError::Decode("access token is not a valid header".into()))?,
        );
        Ok(Self {
            client,
            base_url,
            headers,
        })
    }

    fn url(&self, segments: &[&str], api_version: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", api_version);
        url
    }

    fn hubs_url(&self, scope: &ResourceScope, hub: Option<&str>) -> Url {
        let mut segments = vec![
            "subscriptions",
            scope.subscription_id.as_str(),
            "resourceGroups",
            scope.resource_group.as_str(),
            "providers",
            "Microsoft.Devices",
            "IotHubs",
        ];
        segments.extend(hub);
        self.url(&segments, IOT_HUB_API_VERSION)
    }

    /// Next links are absolute; only links pointing back at the management endpoint are followed.
    fn next_link_url(&self, link: &str) -> Result<Url, UpstreamError> {
        let url = Url::parse(link)
            .map_err(|e| UpstreamError::Decode(format!("invalid next link '{link}': {e}")))?;
        if url.origin() != self.base_url.origin() {
            return Err(UpstreamError::Decode(format!(
                "next link '{link}' leaves the management endpoint"
            )));
        }
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, UpstreamError> {
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        read_json(check_status(response).await?).await
    }
}

#[async_trait]
impl ResourceManagerClient for ArmClient {
    async fn list_resources(
        &self,
        scope: &ResourceScope,
        continuation: Option<&str>,
    ) -> Result<Page<ResourceRef>, UpstreamError> {
        let url = match continuation {
            Some(link) => self.next_link_url(link)?,
            None => self.hubs_url(scope, None),
        };
        let list: HubList = self.get(url).await?;
        debug!(
            "Listed {} hubs in {}, more pages: {}",
            list.value.len(),
            scope.resource_group,
            list.next_link.is_some()
        );

        let items = list
            .value
            .into_iter()
            .map(|hub| ResourceRef {
                resource_group: hub
                    .resource_group
                    .unwrap_or_else(|| scope.resource_group.clone()),
                name: hub.name,
            })
            .collect();
        Ok(Page {
            items,
            continuation: list.next_link.filter(|link| !link.is_empty()),
        })
    }

    async fn get_resource_detail(
        &self,
        scope: &ResourceScope,
        resource: &ResourceRef,
    ) -> Result<ResourceDetail, UpstreamError> {
        let scope = ResourceScope {
            subscription_id: scope.subscription_id.clone(),
            resource_group: resource.resource_group.clone(),
        };
        let hub: HubDescription = self
            .get(self.hubs_url(&scope, Some(&resource.name)))
            .await?;

        let sku = hub
            .sku
            .ok_or_else(|| UpstreamError::Decode(format!("hub {} has no sku", hub.name)))?;
        let tier = sku
            .tier
            .ok_or_else(|| UpstreamError::Decode(format!("hub {} has no sku tier", hub.name)))?;
        let capacity_unit = sku.capacity.ok_or_else(|| {
            UpstreamError::Decode(format!("hub {} has no sku capacity", hub.name))
        })?;
        Ok(ResourceDetail {
            name: hub.name,
            tier,
            capacity_unit,
        })
    }

    async fn scope_display_name(&self, scope: &ResourceScope) -> Result<String, UpstreamError> {
        let subscription: Subscription = self
            .get(self.url(
                &["subscriptions", scope.subscription_id.as_str()],
                SUBSCRIPTION_API_VERSION,
            ))
            .await?;
        subscription.display_name.ok_or_else(|| {
            UpstreamError::Decode(format!(
                "subscription {} has no display name",
                scope.subscription_id
            ))
        })
    }
}
