//! SQL executor capability (§6, External Interfaces).
//!
//! The core never opens a database connection itself — every measured
//! run, `EXPLAIN`, and rollback goes through this trait. PostgreSQL
//! implementations must support `SET LOCAL ... = 'value'` prefix
//! statements inside a transaction boundary that rolls back after each
//! measured run (§6); the trait doesn't assume that shape for DuckDB,
//! which has no transactional `SET LOCAL`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("query timed out after {0}ms")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost")]
    ConnectionLost,
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// A scalar cell value, engine-agnostic.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical string form used to build the row checksum (§4.7) — every
    /// variant renders deterministically regardless of engine-specific
    /// type representation.
    pub fn canonical_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => format!("{f:.10}"),
            Value::String(s) => s.clone(),
            Value::Binary(b) => hex_encode(b),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Deterministic single-row string used before sorting+hashing the
    /// whole result set (§4.7 checksum algorithm).
    pub fn canonical_string(&self) -> String {
        self.values
            .iter()
            .map(Value::canonical_string)
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// The abstract SQL-executor capability (§6).
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str, timeout_ms: u64) -> Result<RowSet>;

    /// Execute with a sequence of `SET LOCAL` (or engine-equivalent)
    /// commands applied first, inside a transaction that is rolled back
    /// by the implementation once the run completes.
    async fn execute_with_config(
        &self,
        set_local_commands: &[String],
        sql: &str,
        timeout_ms: u64,
    ) -> Result<RowSet>;

    /// Returns the raw plan JSON (engine-native shape); callers normalize
    /// via `plan_signals`.
    async fn explain(&self, sql: &str, analyze: bool, timeout_ms: u64) -> Result<serde_json::Value>;

    async fn rollback(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_canonical_string_is_deterministic() {
        let row = Row::new(vec![Value::Integer(1), Value::String("a".to_string()), Value::Null]);
        assert_eq!(row.canonical_string(), row.clone().canonical_string());
    }

    #[test]
    fn float_canonical_string_uses_fixed_precision() {
        let row = Row::new(vec![Value::Float(1.0 / 3.0)]);
        assert!(row.canonical_string().starts_with("0.3333333333"));
    }
}
