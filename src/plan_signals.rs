//! Plan-Signal Extractor (C3, structural half — Q-error lives in `qerror`).
//!
//! Normalizes DuckDB and PostgreSQL `EXPLAIN ANALYZE` JSON into a single
//! internal `PlanNode` tree (Design Notes §9), then walks it once to
//! produce operator timings, scan/join summaries, and cardinality
//! mis-estimates. PostgreSQL's inclusive per-loop timings are converted to
//! DuckDB-style exclusive timings at the normalization boundary so every
//! downstream consumer sees one shape regardless of engine.

use crate::sql_parser::SqlDialect;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanSignalError {
    #[error("plan JSON missing a root node for this engine")]
    MissingRoot,
    #[error("plan-signal extraction is only defined for DuckDB and PostgreSQL, found {0:?}")]
    UnsupportedEngine(SqlDialect),
}

pub type Result<T> = std::result::Result<T, PlanSignalError>;

/// Unified internal plan node (Design Notes §9): `{name, self_time_s,
/// rows, children[], extras}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanNode {
    pub name: String,
    pub self_time_s: f64,
    pub rows: u64,
    pub children: Vec<PlanNode>,
    pub extras: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    pub self_time_ms: f64,
    pub row_count: u64,
    pub cost_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub table: String,
    pub rows_scanned: u64,
    pub rows_out: u64,
    pub has_filter: bool,
    pub filter_expr: Option<String>,
    pub selectivity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    NestedLoop,
    Hash,
    Merge,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub left_table: Option<String>,
    pub right_table: Option<String>,
    pub left_rows: u64,
    pub right_rows: u64,
    pub output_rows: u64,
    /// One side < 1 000 rows and the other > 100 000 rows.
    pub is_late: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MisEstimate {
    pub operator: String,
    pub estimated: f64,
    pub actual: f64,
    /// `max(estimated, actual) / min(estimated, actual)`, always >= 5.0.
    pub ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSignals {
    pub operators: Vec<Operator>,
    pub scans: Vec<Scan>,
    pub joins: Vec<Join>,
    pub mis_estimates: Vec<MisEstimate>,
    pub qerror: Option<crate::qerror::QErrorAnalysis>,
}

/// `extract(plan_json, engine) -> PlanSignals`.
pub fn extract(plan_json: &Value, dialect: SqlDialect) -> Result<PlanSignals> {
    let root = match dialect {
        SqlDialect::DuckDb | SqlDialect::Generic => normalize_duckdb(plan_json),
        SqlDialect::PostgreSql => normalize_postgres(unwrap_postgres_root(plan_json)),
        other => return Err(PlanSignalError::UnsupportedEngine(other)),
    };

    let mut operators = Vec::new();
    walk_operators(&root, &mut operators);

    let total_ms: f64 = operators.iter().map(|o| o.self_time_ms).sum();
    if total_ms > 0.0 {
        for op in &mut operators {
            op.cost_pct = op.self_time_ms / total_ms * 100.0;
        }
    }
    operators.sort_by(|a, b| b.cost_pct.partial_cmp(&a.cost_pct).unwrap_or(std::cmp::Ordering::Equal));

    let mut scans = Vec::new();
    let mut joins = Vec::new();
    let mut mis_estimates = Vec::new();
    walk_structural(&root, &mut scans, &mut joins, &mut mis_estimates);

    let qerror = crate::qerror::analyze_plan_qerror(plan_json, Some(dialect)).ok();

    Ok(PlanSignals {
        operators,
        scans,
        joins,
        mis_estimates,
        qerror,
    })
}

pub(crate) fn unwrap_postgres_root(plan_json: &Value) -> &Value {
    let candidate = if let Some(arr) = plan_json.as_array() {
        arr.first().unwrap_or(plan_json)
    } else {
        plan_json
    };
    candidate.get("Plan").unwrap_or(candidate)
}

pub(crate) fn normalize_duckdb(value: &Value) -> PlanNode {
    let name = value
        .get("operator_name")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    let self_time_s = value
        .get("operator_timing")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let rows = value
        .get("operator_cardinality")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let children = value
        .get("children")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(normalize_duckdb).collect())
        .unwrap_or_default();

    let mut extras = HashMap::new();
    if let Some(est) = value.get("estimated_cardinality") {
        extras.insert("estimated_cardinality".to_string(), est.clone());
    }
    if let Some(extra_info) = value.get("extra_info") {
        extras.insert("extra_info".to_string(), extra_info.clone());
    }

    PlanNode {
        name,
        self_time_s,
        rows,
        children,
        extras,
    }
}

pub(crate) fn normalize_postgres(value: &Value) -> PlanNode {
    let name = value
        .get("Node Type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let loops = value.get("Actual Loops").and_then(Value::as_f64).unwrap_or(1.0);
    let inclusive_ms = value
        .get("Actual Total Time")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let child_values: Vec<Value> = value
        .get("Plans")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let children: Vec<PlanNode> = child_values.iter().map(normalize_postgres).collect();
    let children_inclusive_ms: f64 = child_values
        .iter()
        .map(|c| c.get("Actual Total Time").and_then(Value::as_f64).unwrap_or(0.0))
        .sum();

    let exclusive_ms = (inclusive_ms - children_inclusive_ms).max(0.0) * loops;
    let self_time_s = exclusive_ms / 1000.0;
    let rows = value.get("Actual Rows").and_then(Value::as_u64).unwrap_or(0);

    let mut extras = HashMap::new();
    if let Some(v) = value.get("Plan Rows") {
        extras.insert("plan_rows".to_string(), v.clone());
    }
    if let Some(v) = value.get("Relation Name") {
        extras.insert("relation_name".to_string(), v.clone());
    }
    if let Some(v) = value.get("Parent Relationship") {
        extras.insert("parent_relationship".to_string(), v.clone());
    }

    PlanNode {
        name,
        self_time_s,
        rows,
        children,
        extras,
    }
}

/// Recursive DFS over operators. Skips the synthetic `EXPLAIN_ANALYZE`
/// wrapper node DuckDB sometimes emits at the root.
fn walk_operators(node: &PlanNode, out: &mut Vec<Operator>) {
    if !node.name.eq_ignore_ascii_case("EXPLAIN_ANALYZE") {
        out.push(Operator {
            name: node.name.clone(),
            self_time_ms: node.self_time_s * 1000.0,
            row_count: node.rows,
            cost_pct: 0.0,
        });
    }
    for child in &node.children {
        walk_operators(child, out);
    }
}

fn walk_structural(node: &PlanNode, scans: &mut Vec<Scan>, joins: &mut Vec<Join>, mis_estimates: &mut Vec<MisEstimate>) {
    let upper = node.name.to_uppercase();

    if upper.contains("SCAN") {
        let table = node
            .extras
            .get("relation_name")
            .and_then(Value::as_str)
            .or_else(|| node.extras.get("extra_info").and_then(Value::as_str))
            .unwrap_or(&node.name)
            .to_string();
        let rows_scanned = estimated_value(node).map(|e| e as u64).unwrap_or(node.rows);
        let rows_out = node.rows;
        let has_filter = node.name.to_uppercase().contains("FILTER")
            || node.extras.contains_key("extra_info");
        let selectivity = if rows_scanned > 0 {
            rows_out as f64 / rows_scanned as f64
        } else {
            1.0
        };
        scans.push(Scan {
            table,
            rows_scanned: rows_scanned.max(rows_out),
            rows_out,
            has_filter,
            filter_expr: None,
            selectivity,
        });
    }

    if upper.contains("JOIN") || upper.contains("NESTED LOOP") {
        let kind = if upper.contains("HASH") {
            JoinKind::Hash
        } else if upper.contains("MERGE") {
            JoinKind::Merge
        } else if upper.contains("NESTED LOOP") || upper.contains("NESTLOOP") {
            JoinKind::NestedLoop
        } else {
            JoinKind::Other
        };
        let left_rows = node.children.first().map(|c| c.rows).unwrap_or(0);
        let right_rows = node.children.get(1).map(|c| c.rows).unwrap_or(0);
        let is_late = (left_rows < 1_000 && right_rows > 100_000) || (right_rows < 1_000 && left_rows > 100_000);
        joins.push(Join {
            kind,
            left_table: node.children.first().map(|c| c.name.clone()),
            right_table: node.children.get(1).map(|c| c.name.clone()),
            left_rows,
            right_rows,
            output_rows: node.rows,
            is_late,
        });
    }

    if let Some(estimated) = estimated_value(node) {
        let actual = node.rows as f64;
        if estimated > 0.0 && actual > 0.0 {
            let ratio = (estimated / actual).max(actual / estimated);
            let max_val = estimated.max(actual);
            if ratio >= 5.0 && max_val >= 1000.0 {
                mis_estimates.push(MisEstimate {
                    operator: node.name.clone(),
                    estimated,
                    actual,
                    ratio,
                });
            }
        }
    }

    for child in &node.children {
        walk_structural(child, scans, joins, mis_estimates);
    }
}

pub(crate) fn estimated_value(node: &PlanNode) -> Option<f64> {
    node.extras
        .get("estimated_cardinality")
        .or_else(|| node.extras.get("plan_rows"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim_start_matches('~').parse::<f64>().ok(),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_duckdb_scan_and_filter() {
        let plan = json!({
            "operator_name": "FILTER",
            "operator_timing": 0.002,
            "operator_cardinality": 50,
            "children": [
                {
                    "operator_name": "SEQ_SCAN",
                    "operator_timing": 0.01,
                    "operator_cardinality": 1000,
                    "estimated_cardinality": 200,
                    "children": []
                }
            ]
        });
        let signals = extract(&plan, SqlDialect::DuckDb).unwrap();
        assert_eq!(signals.operators.len(), 2);
        assert_eq!(signals.scans.len(), 1);
        assert_eq!(signals.scans[0].rows_out, 1000);
        let total: f64 = signals.operators.iter().map(|o| o.cost_pct).sum();
        assert!((total - 100.0).abs() < 1e-6);
    }

    #[test]
    fn postgres_exclusive_time_subtracts_children() {
        let plan = json!([{
            "Plan": {
                "Node Type": "Hash Join",
                "Actual Total Time": 50.0,
                "Actual Loops": 1,
                "Actual Rows": 10,
                "Plans": [
                    {"Node Type": "Seq Scan", "Actual Total Time": 20.0, "Actual Loops": 1, "Actual Rows": 1000},
                    {"Node Type": "Seq Scan", "Actual Total Time": 10.0, "Actual Loops": 1, "Actual Rows": 500}
                ]
            }
        }]);
        let signals = extract(&plan, SqlDialect::PostgreSql).unwrap();
        let join_op = signals.operators.iter().find(|o| o.name == "Hash Join").unwrap();
        assert!((join_op.self_time_ms - 20.0).abs() < 1e-6);
        assert_eq!(signals.joins.len(), 1);
    }

    #[test]
    fn detects_mis_estimate_above_threshold() {
        let plan = json!({
            "operator_name": "SEQ_SCAN",
            "operator_timing": 0.01,
            "operator_cardinality": 10000,
            "estimated_cardinality": 100,
            "children": []
        });
        let signals = extract(&plan, SqlDialect::DuckDb).unwrap();
        assert_eq!(signals.mis_estimates.len(), 1);
        assert!(signals.mis_estimates[0].ratio >= 5.0);
    }

    #[test]
    fn rejects_unsupported_engine() {
        let err = extract(&json!({}), SqlDialect::Snowflake).unwrap_err();
        assert!(matches!(err, PlanSignalError::UnsupportedEngine(_)));
    }
}
