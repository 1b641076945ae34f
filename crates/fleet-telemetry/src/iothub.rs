// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device registry client backed by the IoT Hub service REST API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, IF_MATCH};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::IotHubSettings;
use crate::entity::{CatalogClient, CatalogQuery, ConcurrencyToken, ConnectionState, Entity, Page};
use crate::error::{FleetError, UpstreamError};
use crate::http::{check_status, is_precondition_failed, read_json};

const API_VERSION: &str = "2021-04-12";
const CONTINUATION_HEADER: &str = "x-ms-continuation";
const MAX_ITEM_COUNT_HEADER: &str = "x-ms-max-item-count";

#[derive(Debug, Deserialize)]
struct DeviceIdRow {
    #[serde(rename = "deviceId")]
    device_id: String,
}

/// Twin document as returned by the registry. Only the fields used here are decoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TwinDocument {
    device_id: String,
    etag: Option<String>,
    connection_state: Option<ConnectionState>,
    #[serde(default)]
    tags: Option<Map<String, Value>>,
}

impl TryFrom<TwinDocument> for Entity {
    type Error = UpstreamError;

    fn try_from(twin: TwinDocument) -> Result<Self, Self::Error> {
        let token = twin.etag.ok_or_else(|| {
            UpstreamError::Decode(format!("twin of {} has no etag", twin.device_id))
        })?;
        let status = twin.connection_state.ok_or_else(|| {
            UpstreamError::Decode(format!("twin of {} has no connection state", twin.device_id))
        })?;
        // Nested tag objects are not managed here; only plain string tags are kept.
        let tags = twin
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect();
        Ok(Entity {
            id: twin.device_id,
            tags,
            token: ConcurrencyToken::new(token),
            status,
        })
    }
}

pub struct IotHubClient {
    client: Client,
    base_url: Url,
    headers: HeaderMap,
}

impl IotHubClient {
    pub fn new(client: Client, settings: &IotHubSettings) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| UpstreamError::Decode(format!("invalid hub url: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&settings.sas_token)
                .map_err(|_| UpstreamError::Decode("SAS token is not a valid header".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            client,
            base_url,
            headers,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        url
    }
}

/// ETags travel quoted in `If-Match`.
fn if_match_value(token: &ConcurrencyToken) -> Result<HeaderValue, UpstreamError> {
    let raw = token.as_str();
    let quoted = if raw.starts_with('"') || raw == "*" {
        raw.to_string()
    } else {
        format!("\"{raw}\"")
    };
    HeaderValue::from_str(&quoted)
        .map_err(|_| UpstreamError::Decode(format!("etag '{raw}' is not a valid header")))
}

#[async_trait]
impl CatalogClient for IotHubClient {
    async fn query(
        &self,
        query: &CatalogQuery,
        continuation: Option<&str>,
    ) -> Result<Page<String>, UpstreamError> {
        let mut request = self
            .client
            .post(self.url(&["devices", "query"]))
            .headers(self.headers.clone())
            .header(MAX_ITEM_COUNT_HEADER, query.page_size.to_string())
            .json(&json!({ "query": query.filter }));
        if let Some(token) = continuation {
            request = request.header(CONTINUATION_HEADER, token);
        }

        let response = check_status(request.send().await?).await?;
        let next = response
            .headers()
            .get(CONTINUATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let rows: Vec<DeviceIdRow> = read_json(response).await?;
        debug!(
            "Device query returned {} ids, more pages: {}",
            rows.len(),
            next.is_some()
        );

        Ok(Page {
            items: rows.into_iter().map(|row| row.device_id).collect(),
            continuation: next,
        })
    }

    async fn get_entity(&self, id: &str) -> Result<Entity, FleetError> {
        let response = self
            .client
            .get(self.url(&["twins", id]))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(UpstreamError::from)?;
        let twin: TwinDocument = read_json(check_status(response).await?).await?;
        Ok(Entity::try_from(twin)?)
    }

    async fn update_entity(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
        token: &ConcurrencyToken,
    ) -> Result<Entity, FleetError> {
        let response = self
            .client
            .patch(self.url(&["twins", id]))
            .headers(self.headers.clone())
            .header(IF_MATCH, if_match_value(token)?)
            .json(&json!({ "tags": tags }))
            .send()
            .await
            .map_err(UpstreamError::from)?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) if is_precondition_failed(&e) => {
                return Err(FleetError::Conflict {
                    entity_id: id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let twin: TwinDocument = read_json(response).await?;
        Ok(Entity::try_from(twin)?)
    }
}
