//! Engine configuration types.
//!
//! `EngineConfig` represents `taskloom.toml`. All fields have defaults so an
//! empty or partial file is valid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dag::BRANCH_OPERATOR;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to synthesized tasks whose operator has no override.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Per-operator timeout overrides, keyed by operator name.
    #[serde(default = "default_operator_timeouts")]
    pub operator_timeouts: HashMap<String, u64>,

    /// How many times a loop re-runs the failed tasks of one iteration
    /// before the loop-control task is failed.
    #[serde(default = "default_max_iteration_retries")]
    pub max_iteration_retries: u32,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_max_iteration_retries() -> u32 {
    3
}

fn default_operator_timeouts() -> HashMap<String, u64> {
    HashMap::from([(BRANCH_OPERATOR.to_string(), 60)])
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            operator_timeouts: default_operator_timeouts(),
            max_iteration_retries: default_max_iteration_retries(),
        }
    }
}

impl EngineConfig {
    /// Timeout in seconds for tasks running `operator`.
    pub fn timeout_for(&self, operator: &str) -> u64 {
        self.operator_timeouts
            .get(operator)
            .copied()
            .unwrap_or(self.default_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout_secs, 3600);
        assert_eq!(config.timeout_for(BRANCH_OPERATOR), 60);
        assert_eq!(config.timeout_for("@internal/http/request"), 3600);
        assert_eq!(config.max_iteration_retries, 3);
    }

    #[test]
    fn test_engine_config_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
default_timeout_secs = 120
max_iteration_retries = 0

[operator_timeouts]
"@internal/http/request" = 30
"#,
        )
        .unwrap();
        assert_eq!(config.default_timeout_secs, 120);
        assert_eq!(config.timeout_for("@internal/http/request"), 30);
        // An explicit table replaces the default overrides.
        assert_eq!(config.timeout_for(BRANCH_OPERATOR), 120);
        assert_eq!(config.max_iteration_retries, 0);
    }
}
