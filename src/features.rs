//! Named feature switches.
//!
//! Defaults come from `[features]` in the config; a single override map
//! toggles them at runtime and [`FeatureFlags::reset`] drops every override.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Ask the agent to finish a truncated response.
    ContinuationRecovery,
    /// Skip the untracked clean when it would delete protected files.
    SafeClean,
    CommitOnSuccess,
    /// Run the configured validation command after apply.
    ExternalValidation,
    StaleDetection,
    /// Delete savepoints beyond the retention count after success.
    SavepointRetention,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::ContinuationRecovery,
        Feature::SafeClean,
        Feature::CommitOnSuccess,
        Feature::ExternalValidation,
        Feature::StaleDetection,
        Feature::SavepointRetention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ContinuationRecovery => "continuation_recovery",
            Feature::SafeClean => "safe_clean",
            Feature::CommitOnSuccess => "commit_on_success",
            Feature::ExternalValidation => "external_validation",
            Feature::StaleDetection => "stale_detection",
            Feature::SavepointRetention => "savepoint_retention",
        }
    }

    /// Built-in default when the config does not mention the feature.
    pub fn default_enabled(&self) -> bool {
        !matches!(self, Feature::ExternalValidation)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown feature '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlags {
    defaults: BTreeMap<Feature, bool>,
    overrides: BTreeMap<Feature, bool>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            defaults: Feature::ALL.into_iter().map(|f| (f, f.default_enabled())).collect(),
            overrides: BTreeMap::new(),
        }
    }
}

impl FeatureFlags {
    /// Build from the config's `[features]` table. Unknown names are ignored
    /// with a warning.
    pub fn from_config(table: &BTreeMap<String, bool>) -> Self {
        let mut flags = Self::default();
        for (name, enabled) in table {
            match name.parse::<Feature>() {
                Ok(feature) => {
                    flags.defaults.insert(feature, *enabled);
                }
                Err(_) => warn!(feature = %name, "ignoring unknown feature flag"),
            }
        }
        flags
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.overrides
            .get(&feature)
            .or_else(|| self.defaults.get(&feature))
            .copied()
            .unwrap_or_else(|| feature.default_enabled())
    }

    pub fn set_override(&mut self, feature: Feature, enabled: bool) {
        self.overrides.insert(feature, enabled);
    }

    pub fn clear_override(&mut self, feature: Feature) {
        self.overrides.remove(&feature);
    }

    /// Drop all runtime overrides.
    pub fn reset(&mut self) {
        self.overrides.clear();
    }
}
