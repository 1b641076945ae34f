// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared HTTP helpers for the remote clients.

use core::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::UpstreamError;

/// Builds a reqwest client with optional proxy configuration and a per-request deadline.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, UpstreamError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Passes success responses through and turns anything else into [`UpstreamError::Status`],
/// keeping the body for the logs.
pub async fn check_status(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    debug!(status = %status, url = %url, body = %body, "unsuccessful response");
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Decodes a successful JSON body into `T`.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, UpstreamError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn is_precondition_failed(error: &UpstreamError) -> bool {
    error.status() == Some(StatusCode::PRECONDITION_FAILED.as_u16())
}
