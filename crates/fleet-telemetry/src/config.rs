// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for the exporter.
//!
//! Values are read once at startup. Tier multipliers are kept as raw text here and only
//! parsed when a tier is actually encountered (see [`crate::capacity`]).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::ConfigError;

const ENV_DYNATRACE_URL: &str = "DYNATRACE_URL";
const ENV_DYNATRACE_TOKEN: &str = "DYNATRACE_TOKEN";
const ENV_IOT_HUB_HOST: &str = "IOT_HUB_HOST";
const ENV_IOT_HUB_SAS_TOKEN: &str = "IOT_HUB_SAS_TOKEN";
const ENV_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
const ENV_RESOURCE_GROUP: &str = "AZURE_RESOURCE_GROUP";
const ENV_MANAGEMENT_URL: &str = "AZURE_MANAGEMENT_URL";
pub const ENV_BASIC_TIER: &str = "IOT_BASIC_TIER";
pub const ENV_STANDARD_TIER: &str = "IOT_STD_TIER";
const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL_SECS";
const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT_SECS";
const ENV_MAX_IN_FLIGHT: &str = "MAX_IN_FLIGHT";
const ENV_LISTEN_PORT: &str = "LISTEN_PORT";
const ENV_HTTPS_PROXY: &str = "HTTPS_PROXY";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_IN_FLIGHT: usize = 8;
const DEFAULT_LISTEN_PORT: u16 = 7071;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Telemetry backend endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub url: String,
    pub api_token: String,
}

/// Device registry connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotHubSettings {
    /// Base URL of the hub, e.g. `https://my-hub.azure-devices.net`.
    pub base_url: String,
    pub sas_token: String,
}

/// Scope of the IoT hub resources whose capacity is exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    pub subscription_id: String,
    pub resource_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceManagerSettings {
    pub base_url: String,
    pub scope: ResourceScope,
}

/// Raw multiplier text per non-free tier, exactly as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierMultipliers {
    pub basic: Option<String>,
    pub standard: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub backend: BackendSettings,
    /// Enables the connectivity pipeline when present.
    pub iot_hub: Option<IotHubSettings>,
    /// Enables the capacity pipeline when present.
    pub resource_manager: Option<ResourceManagerSettings>,
    pub tier_multipliers: TierMultipliers,
    pub poll_interval: Duration,
    /// Deadline applied to every remote call.
    pub request_timeout: Duration,
    pub max_in_flight: usize,
    /// Port of the request trigger. 0 disables it.
    pub listen_port: u16,
    pub https_proxy: Option<String>,
    pub log_level: String,
}

impl FleetConfig {
    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| non_empty(value));

        let backend = BackendSettings {
            url: trim_trailing_slash(
                get(ENV_DYNATRACE_URL).ok_or(ConfigError::Missing(ENV_DYNATRACE_URL))?,
            ),
            api_token: get(ENV_DYNATRACE_TOKEN).ok_or(ConfigError::Missing(ENV_DYNATRACE_TOKEN))?,
        };

        let iot_hub = match get(ENV_IOT_HUB_HOST) {
            Some(host) => Some(IotHubSettings {
                base_url: normalize_host(&host),
                sas_token: get(ENV_IOT_HUB_SAS_TOKEN)
                    .ok_or(ConfigError::Missing(ENV_IOT_HUB_SAS_TOKEN))?,
            }),
            None => None,
        };

        let resource_manager = match get(ENV_SUBSCRIPTION_ID) {
            Some(subscription_id) => Some(ResourceManagerSettings {
                base_url: trim_trailing_slash(
                    get(ENV_MANAGEMENT_URL).unwrap_or_else(|| DEFAULT_MANAGEMENT_URL.to_string()),
                ),
                scope: ResourceScope {
                    subscription_id,
                    resource_group: get(ENV_RESOURCE_GROUP)
                        .ok_or(ConfigError::Missing(ENV_RESOURCE_GROUP))?,
                },
            }),
            None => None,
        };

        let tier_multipliers = TierMultipliers {
            basic: get(ENV_BASIC_TIER),
            standard: get(ENV_STANDARD_TIER),
        };

        let config = Self {
            backend,
            iot_hub,
            resource_manager,
            tier_multipliers,
            poll_interval: Duration::from_secs(parse_or(
                get(ENV_POLL_INTERVAL),
                ENV_POLL_INTERVAL,
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            request_timeout: Duration::from_secs(parse_or(
                get(ENV_REQUEST_TIMEOUT),
                ENV_REQUEST_TIMEOUT,
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            max_in_flight: parse_or(get(ENV_MAX_IN_FLIGHT), ENV_MAX_IN_FLIGHT, DEFAULT_MAX_IN_FLIGHT)?,
            listen_port: parse_or(get(ENV_LISTEN_PORT), ENV_LISTEN_PORT, DEFAULT_LISTEN_PORT)?,
            https_proxy: get(ENV_HTTPS_PROXY),
            log_level: get(ENV_LOG_LEVEL)
                .map(|level| level.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: ENV_DYNATRACE_URL,
                reason: format!("'{}' is not an http(s) URL", self.backend.url),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: ENV_POLL_INTERVAL,
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: ENV_REQUEST_TIMEOUT,
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_IN_FLIGHT,
                reason: "must be greater than 0".to_string(),
            });
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid {
                key: ENV_LOG_LEVEL,
                reason: format!(
                    "'{}' must be one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            });
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn trim_trailing_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Accepts either a bare host name or a full URL.
fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        trim_trailing_slash(host.to_string())
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("'{raw}': {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DYNATRACE_URL", "https://abc123.live.dynatrace.com/"),
            ("DYNATRACE_TOKEN", "dt0c01.secret"),
        ]
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FleetConfig::from_env_iter(base_env()).expect("valid config");
        assert_eq!(config.backend.url, "https://abc123.live.dynatrace.com");
        assert!(config.iot_hub.is_none());
        assert!(config.resource_manager.is_none());
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.listen_port, 7071);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.tier_multipliers, TierMultipliers::default());
    }

    #[test]
    fn test_missing_backend_token() {
        let err = FleetConfig::from_env_iter(vec![("DYNATRACE_URL", "https://x")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DYNATRACE_TOKEN"));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let err = FleetConfig::from_env_iter(vec![
            ("DYNATRACE_URL", "   "),
            ("DYNATRACE_TOKEN", "t"),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("DYNATRACE_URL"));
    }

    #[test]
    fn test_iot_hub_host_is_normalized() {
        let mut env = base_env();
        env.push(("IOT_HUB_HOST", "my-hub.azure-devices.net"));
        env.push(("IOT_HUB_SAS_TOKEN", "SharedAccessSignature sr=..."));
        let config = FleetConfig::from_env_iter(env).unwrap();
        let hub = config.iot_hub.unwrap();
        assert_eq!(hub.base_url, "https://my-hub.azure-devices.net");
        assert_eq!(hub.sas_token, "SharedAccessSignature sr=...");
    }

    #[test]
    fn test_iot_hub_requires_sas_token() {
        let mut env = base_env();
        env.push(("IOT_HUB_HOST", "my-hub.azure-devices.net"));
        let err = FleetConfig::from_env_iter(env).unwrap_err();
        assert_eq!(err, ConfigError::Missing("IOT_HUB_SAS_TOKEN"));
    }

    #[test]
    fn test_resource_scope() {
        let mut env = base_env();
        env.push(("AZURE_SUBSCRIPTION_ID", "sub-1"));
        assert_eq!(
            FleetConfig::from_env_iter(env.clone()).unwrap_err(),
            ConfigError::Missing("AZURE_RESOURCE_GROUP")
        );

        env.push(("AZURE_RESOURCE_GROUP", "rg-devices"));
        let config = FleetConfig::from_env_iter(env).unwrap();
        let arm = config.resource_manager.unwrap();
        assert_eq!(arm.base_url, "https://management.azure.com");
        assert_eq!(arm.scope.subscription_id, "sub-1");
        assert_eq!(arm.scope.resource_group, "rg-devices");
    }

    #[test]
    fn test_tier_multipliers_are_kept_raw() {
        let mut env = base_env();
        env.push(("IOT_BASIC_TIER", "not-a-number"));
        env.push(("IOT_STD_TIER", "400000"));
        let config = FleetConfig::from_env_iter(env).unwrap();
        assert_eq!(
            config.tier_multipliers.basic.as_deref(),
            Some("not-a-number")
        );
        assert_eq!(config.tier_multipliers.standard.as_deref(), Some("400000"));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut env = base_env();
        env.push(("MAX_IN_FLIGHT", "many"));
        assert!(matches!(
            FleetConfig::from_env_iter(env).unwrap_err(),
            ConfigError::Invalid {
                key: "MAX_IN_FLIGHT",
                ..
            }
        ));

        let mut env = base_env();
        env.push(("POLL_INTERVAL_SECS", "0"));
        assert!(FleetConfig::from_env_iter(env).is_err());
    }

    #[test]
    fn test_log_level_validation() {
        for level in VALID_LOG_LEVELS {
            let mut env = base_env();
            env.push(("LOG_LEVEL", level));
            assert!(
                FleetConfig::from_env_iter(env).is_ok(),
                "Log level '{}' should be valid",
                level
            );
        }

        let mut env = base_env();
        env.push(("LOG_LEVEL", "verbose"));
        assert!(FleetConfig::from_env_iter(env).is_err());

        let mut env = base_env();
        env.push(("LOG_LEVEL", "DEBUG"));
        assert_eq!(FleetConfig::from_env_iter(env).unwrap().log_level, "debug");
    }

    #[test]
    fn test_backend_url_must_be_http() {
        let err = FleetConfig::from_env_iter(vec![
            ("DYNATRACE_URL", "ftp://dynatrace"),
            ("DYNATRACE_TOKEN", "t"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "DYNATRACE_URL",
                ..
            }
        ));
    }
}
