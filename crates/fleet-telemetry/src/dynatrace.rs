// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry backend speaking the Dynatrace settings and metric ingest APIs.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::BackendSettings;
use crate::error::UpstreamError;
use crate::http::check_status;
use crate::metric::MetricMetadata;
use crate::publisher::TelemetryBackend;

const SETTINGS_PATH: &str = "/api/v2/settings/objects";
const INGEST_PATH: &str = "/api/v2/metrics/ingest";
const METADATA_SCHEMA: &str = "builtin:metric.metadata";

/// Per-object result of a settings write.
#[derive(Debug, Deserialize)]
struct SettingsResult {
    code: Option<u16>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

pub struct DynatraceClient {
    client: Client,
    settings_url: String,
    ingest_url: String,
    headers: HeaderMap,
}

impl DynatraceClient {
    pub fn new(client: Client, settings: &BackendSettings) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Api-Token {}", settings.api_token))
                .map_err(|_| UpstreamError::Decode("API token is not a valid header".into()))?,
        );
        let base = settings.url.trim_end_matches('/');
        Ok(Self {
            client,
            settings_url: format!("{base}{SETTINGS_PATH}"),
            ingest_url: format!("{base}{INGEST_PATH}"),
            headers,
        })
    }
}

/// A 2xx answer can still carry per-object failures.
fn check_settings_results(body: &str) -> Result<(), UpstreamError> {
    if body.trim().is_empty() {
        return Ok(());
    }
    let results: Vec<SettingsResult> = serde_json::from_str(body)?;
    match results.iter().find(|r| r.code.is_some_and(|code| code >= 400)) {
        Some(rejected) => Err(UpstreamError::Status {
            status: rejected.code.unwrap_or_default(),
            body: rejected
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl TelemetryBackend for DynatraceClient {
    async fn declare_metric_metadata(&self, metadata: &MetricMetadata) -> Result<(), UpstreamError> {
        let body = json!([{
            "schemaId": METADATA_SCHEMA,
            "scope": format!("metric-{}", metadata.key),
            "value": metadata,
        }]);
        let response = self
            .client
            .post(&self.settings_url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        check_settings_results(&response.text().await?)?;
        debug!("Settings object written for metric-{}", metadata.key);
        Ok(())
    }

    async fn ingest_line(&self, line: &str) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(&self.ingest_url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line.to_string())
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
