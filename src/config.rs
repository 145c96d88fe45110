//! Benchmark configuration (§6, `config.json`).

use crate::sql_parser::SqlDialect;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainPolicy {
    Cache,
    Analyze,
    Explain,
    Refresh,
    Auto,
    Collect,
}

impl Default for ExplainPolicy {
    fn default() -> Self {
        ExplainPolicy::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub engine: SqlDialect,
    pub db_path_or_dsn: String,
    #[serde(default = "default_workers_state_0")]
    pub workers_state_0: u32,
    #[serde(default)]
    pub workers_state_n: u32,
    #[serde(default = "default_promote_threshold")]
    pub promote_threshold: f64,
    #[serde(default)]
    pub explain_policy: ExplainPolicy,
    #[serde(default)]
    pub scale_factor: Option<String>,
    /// Lets a fresh benchmark directory (no history, no seed examples)
    /// bypass the Context Builder's intelligence gate (§4.6) for initial
    /// bring-up runs.
    #[serde(default)]
    pub bootstrap_override: bool,
}

fn default_workers_state_0() -> u32 {
    4
}

fn default_promote_threshold() -> f64 {
    1.05
}

impl BenchmarkConfig {
    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Fixed orchestrator constants not exposed via `config.json` — target
/// speedup and iteration budget default to these unless a caller wires
/// its own session parameters.
pub const DEFAULT_TARGET_SPEEDUP: f64 = 2.0;
pub const DEFAULT_MAX_ITERATIONS: u32 = 4;
pub const DEFAULT_FAN_OUT_WORKERS: usize = 4;
pub const RACE_MIN_RUNTIME_MS: u64 = 2000;
pub const MEASURED_RUN_TIMEOUT_MS: u64 = 300_000;
pub const EXPLAIN_TIMEOUT_MS: u64 = 30_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config_with_defaults() {
        let json = r#"{"engine": "duckdb", "db_path_or_dsn": "bench.db"}"#;
        let cfg = BenchmarkConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.workers_state_0, 4);
        assert!((cfg.promote_threshold - 1.05).abs() < 1e-9);
        assert_eq!(cfg.explain_policy, ExplainPolicy::Auto);
    }

    #[test]
    fn deserializes_full_config() {
        let json = r#"{
            "engine": "postgresql",
            "db_path_or_dsn": "postgres://localhost/bench",
            "workers_state_0": 6,
            "promote_threshold": 1.1,
            "explain_policy": "analyze",
            "scale_factor": "sf10"
        }"#;
        let cfg = BenchmarkConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.workers_state_0, 6);
        assert_eq!(cfg.scale_factor.as_deref(), Some("sf10"));
    }
}
