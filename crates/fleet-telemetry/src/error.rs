// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by the pipeline and its remote collaborators.

use thiserror::Error;

/// Failure of a single remote call (catalog, resource manager or telemetry backend).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport-level issue (DNS, TLS, socket, deadline exceeded, etc.).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The remote answered with a non-success status code.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    /// The response body did not match the expected schema.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Transport(err) => err.status().map(|s| s.as_u16()),
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Decode(_) => None,
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error("tier {tier}: {key} must be a positive integer, got '{value}'")]
    InvalidMultiplier {
        tier: String,
        key: &'static str,
        value: String,
    },

    #[error("tier {tier}: capacity {unit} x {multiplier} overflows")]
    CapacityOverflow {
        tier: String,
        unit: u64,
        multiplier: u64,
    },
}

/// Errors surfaced by the pipeline.
///
/// Only [`FleetError::Enumeration`] aborts a run. Every other variant is recorded against a
/// single entity (or metric key) and the run continues.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("enumeration failed: {0}")]
    Enumeration(#[source] UpstreamError),

    #[error("concurrency token for {entity_id} is stale")]
    Conflict { entity_id: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("metadata declaration for {key} failed: {reason}")]
    MetadataDeclaration { key: String, reason: String },

    #[error("ingestion for {key} failed: {source}")]
    Ingestion {
        key: String,
        #[source]
        source: UpstreamError,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),

    #[error("run cancelled before {entity_id} was processed")]
    Cancelled { entity_id: String },

    #[error("processing of {entity_id} did not complete: {reason}")]
    Aborted { entity_id: String, reason: String },
}

impl FleetError {
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, FleetError::Enumeration(_))
    }
}
