// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric points, their metadata, and the line protocol used to ingest them.

use std::collections::BTreeMap;

use serde::Serialize;

/// Key under which device connectivity is published.
pub const CONNECTIVITY_METRIC_KEY: &str = "custom.device.connectivity";

/// Descriptive schema of a metric, declared once per key before any point is ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricMetadata {
    #[serde(skip)]
    pub key: String,
    pub display_name: String,
    pub unit: String,
    pub tags: Vec<String>,
}

impl MetricMetadata {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            unit: "None".to_string(),
            tags,
        }
    }
}

/// A single gauge sample. The backend timestamps it on receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub key: String,
    pub dimensions: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricPoint {
    pub fn gauge(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            dimensions: BTreeMap::new(),
            value,
        }
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    /// Renders `key,dim=value,... gauge,<value>`. Dimensions are written in key order.
    pub fn to_line(&self) -> String {
        let mut line = self.key.clone();
        for (key, value) in &self.dimensions {
            line.push(',');
            line.push_str(key);
            line.push('=');
            push_escaped(&mut line, value.trim());
        }
        line.push_str(" gauge,");
        line.push_str(&self.value.to_string());
        line
    }
}

/// Characters with meaning in the line protocol's dimension syntax.
fn is_reserved(c: char) -> bool {
    matches!(c, ',' | '=' | '"' | '\\') || c.is_whitespace()
}

/// Appends a dimension value, backslash-escaping anything that would end it early.
fn push_escaped(line: &mut String, value: &str) {
    for c in value.chars() {
        if c.is_control() {
            continue;
        }
        if is_reserved(c) {
            line.push('\\');
        }
        line.push(c);
    }
}

/// Strips hyphens and line protocol separators from an identifier so it can be
/// embedded in a dimension value as a single token.
pub fn sanitize_identifier(id: &str) -> String {
    id.chars().filter(|c| *c != '-' && !is_reserved(*c)).collect()
}

/// Reduces a name to lowercase ASCII alphanumerics so it can be used as a metric key segment.
pub fn sanitize_key_segment(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
