// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daily message capacity derived from a hub's tier and provisioned units.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use tracing::{debug, error};

use crate::config::{TierMultipliers, ENV_BASIC_TIER, ENV_STANDARD_TIER};
use crate::error::ConfigError;

/// Fixed daily message limit of the free tier.
pub const FREE_TIER_CAPACITY: u64 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Free,
    Basic,
    Standard,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "Free",
            Tier::Basic => "Basic",
            Tier::Standard => "Standard",
        }
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Free" => Ok(Tier::Free),
            "Basic" => Ok(Tier::Basic),
            "Standard" => Ok(Tier::Standard),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierRule {
    Fixed(u64),
    PerUnit(u64),
}

/// Computes capacities, resolving each tier's multiplier at most once.
///
/// Resolution is lazy: only tiers that are actually encountered get their configuration
/// parsed, and failures are remembered just like successes so a broken setting is reported
/// with the same error for every entity of that tier.
#[derive(Debug)]
pub struct CapacityDeriver {
    multipliers: TierMultipliers,
    resolved: Mutex<HashMap<String, Result<TierRule, ConfigError>>>,
}

impl CapacityDeriver {
    pub fn new(multipliers: TierMultipliers) -> Self {
        Self {
            multipliers,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub fn derive(&self, tier_name: &str, capacity_unit: u64) -> Result<u64, ConfigError> {
        match self.rule_for(tier_name)? {
            TierRule::Fixed(capacity) => Ok(capacity),
            TierRule::PerUnit(multiplier) => {
                capacity_unit
                    .checked_mul(multiplier)
                    .ok_or_else(|| ConfigError::CapacityOverflow {
                        tier: tier_name.to_string(),
                        unit: capacity_unit,
                        multiplier,
                    })
            }
        }
    }

    /// Number of distinct tier names resolved so far.
    pub fn resolved_tiers(&self) -> usize {
        self.resolved.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn rule_for(&self, tier_name: &str) -> Result<TierRule, ConfigError> {
        let mut resolved = match self.resolved.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(rule) = resolved.get(tier_name) {
            return rule.clone();
        }

        let rule = self.resolve(tier_name);
        match &rule {
            Ok(rule) => debug!("Resolved tier {tier_name} to {rule:?}"),
            Err(e) => error!("Cannot derive capacity for tier {tier_name}: {e}"),
        }
        resolved.insert(tier_name.to_string(), rule.clone());
        rule
    }

    fn resolve(&self, tier_name: &str) -> Result<TierRule, ConfigError> {
        let tier = Tier::from_str(tier_name)?;
        let (raw, key) = match tier {
            Tier::Free => return Ok(TierRule::Fixed(FREE_TIER_CAPACITY)),
            Tier::Basic => (self.multipliers.basic.as_deref(), ENV_BASIC_TIER),
            Tier::Standard => (self.multipliers.standard.as_deref(), ENV_STANDARD_TIER),
        };
        let invalid = || ConfigError::InvalidMultiplier {
            tier: tier.to_string(),
            key,
            value: raw.unwrap_or_default().to_string(),
        };
        match raw.map(|value| value.trim().parse::<u64>()) {
            Some(Ok(multiplier)) if multiplier > 0 => Ok(TierRule::PerUnit(multiplier)),
            _ => Err(invalid()),
        }
    }
}
