//! Configuration types for the query engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EvalResult, EvaluationError};

/// Configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How far back an instant vector selector looks for the latest sample.
    #[serde(with = "humantime_serde", default = "default_lookback_delta")]
    pub lookback_delta: Duration,

    /// Step used by subqueries that do not specify one (`foo[1h:]`).
    #[serde(with = "humantime_serde", default = "default_subquery_step")]
    pub default_subquery_step: Duration,

    /// Limits applied to queries that do not override them.
    #[serde(default)]
    pub default_limits: QueryLimits,

    /// Number of samples processed between two cancellation checks.
    #[serde(default = "default_cancellation_check_interval")]
    pub cancellation_check_interval: u64,
}

fn default_lookback_delta() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_subquery_step() -> Duration {
    Duration::from_secs(60)
}

fn default_cancellation_check_interval() -> u64 {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookback_delta: default_lookback_delta(),
            default_subquery_step: default_subquery_step(),
            default_limits: QueryLimits::default(),
            cancellation_check_interval: default_cancellation_check_interval(),
        }
    }
}

impl EngineConfig {
    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml(contents: &str) -> EvalResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| EvaluationError::InvalidQuery(format!("invalid engine config: {}", e)))
    }
}

/// Per-query resource limits. Zero disables a limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLimits {
    /// Upper bound on the estimated bytes held by the query at any one time.
    #[serde(default)]
    pub max_estimated_memory_bytes: u64,

    /// Upper bound on the number of samples a query may process.
    #[serde(default = "default_max_samples")]
    pub max_samples: u64,

    /// Wall-clock budget for executing the query.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_max_samples() -> u64 {
    50_000_000
}

fn default_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_estimated_memory_bytes: 0,
            max_samples: default_max_samples(),
            timeout: default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_fill_defaults_for_missing_fields() {
        // given
        let yaml = "lookback_delta: 1m\n";

        // when
        let config = EngineConfig::from_yaml(yaml).unwrap();

        // then
        assert_eq!(config.lookback_delta, Duration::from_secs(60));
        assert_eq!(config.default_subquery_step, Duration::from_secs(60));
        assert_eq!(config.cancellation_check_interval, 1024);
        assert_eq!(config.default_limits, QueryLimits::default());
    }

    #[test]
    fn should_parse_limits() {
        let yaml = r#"
default_limits:
  max_estimated_memory_bytes: 1048576
  max_samples: 1000
  timeout: 30s
"#;

        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.default_limits.max_estimated_memory_bytes, 1_048_576);
        assert_eq!(config.default_limits.max_samples, 1000);
        assert_eq!(config.default_limits.timeout, Duration::from_secs(30));
        assert_eq!(config.lookback_delta, Duration::from_secs(300));
    }

    #[test]
    fn should_reject_malformed_config() {
        let result = EngineConfig::from_yaml("lookback_delta: soon\n");

        assert!(matches!(result, Err(EvaluationError::InvalidQuery(_))));
    }
}
