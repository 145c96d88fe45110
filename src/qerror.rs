//! Q-error cardinality-estimation analysis (C3, the half of Plan-Signal
//! Extraction spec.md §4.3 devoted to pathology routing).
//!
//! `q_error = max(estimated/actual, actual/estimated)` is a symmetric
//! measure of how wrong the optimizer's row-count guess was at a plan
//! node. This module classifies the worst offenders by direction and
//! locus, routes them to a fixed set of pathology codes, and folds in a
//! handful of structural red flags (repeated scans, decorrelation
//! markers, …) that are visible from `EXPLAIN` alone, no `ANALYZE` run
//! required.

use crate::plan_signals::{estimated_value, normalize_duckdb, normalize_postgres, unwrap_postgres_root, PlanNode};
use crate::sql_parser::SqlDialect;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QErrorError {
    #[error("no dialect supplied; cannot normalize plan JSON")]
    UnknownFormat,
}

pub type Result<T> = std::result::Result<T, QErrorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locus {
    Scan,
    Join,
    Aggregate,
    Filter,
    Projection,
    Cte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    OverEst,
    UnderEst,
    ZeroEst,
    Accurate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Magnitude {
    Minor,
    OneOrder,
    TwoOrder,
    ThreeOrder,
    Extreme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Accurate,
    MinorDrift,
    ModerateGuess,
    MajorHallucination,
    CatastrophicBlindness,
}

/// A short label naming a class of optimization opportunity. The exact
/// mapping from code to remediation text is intentionally terse — these
/// are prompt routing keys, not user-facing prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathologyCode {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
    P8,
    P9,
}

impl fmt::Display for PathologyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PathologyCode::P0 => "P0: predicate pushdown",
            PathologyCode::P1 => "P1: repeated-scan consolidation",
            PathologyCode::P2 => "P2: decorrelation",
            PathologyCode::P3 => "P3: aggregation rewrite",
            PathologyCode::P4 => "P4: access-path hint",
            PathologyCode::P5 => "P5: LEFT JOIN to INNER JOIN conversion",
            PathologyCode::P6 => "P6: set-operator rewrite",
            PathologyCode::P7 => "P7: CTE materialization tuning",
            PathologyCode::P8 => "P8: join-order hint",
            PathologyCode::P9 => "P9: filter loosening",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructuralFlag {
    EstZero,
    EstOneNonLeaf,
    DelimScan,
    CorrelatedSubplan,
    RepeatedTable,
    LeftJoin,
    IntersectExcept,
}

impl StructuralFlag {
    fn secondary_pathology(self) -> Option<PathologyCode> {
        match self {
            StructuralFlag::EstZero => Some(PathologyCode::P0),
            StructuralFlag::DelimScan => Some(PathologyCode::P2),
            StructuralFlag::RepeatedTable => Some(PathologyCode::P1),
            StructuralFlag::LeftJoin => Some(PathologyCode::P5),
            StructuralFlag::IntersectExcept => Some(PathologyCode::P6),
            StructuralFlag::EstOneNonLeaf | StructuralFlag::CorrelatedSubplan => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            StructuralFlag::EstZero => "EST_ZERO",
            StructuralFlag::EstOneNonLeaf => "EST_ONE_NONLEAF",
            StructuralFlag::DelimScan => "DELIM_SCAN",
            StructuralFlag::CorrelatedSubplan => "CORRELATED_SUBPLAN",
            StructuralFlag::RepeatedTable => "REPEATED_TABLE",
            StructuralFlag::LeftJoin => "LEFT_JOIN",
            StructuralFlag::IntersectExcept => "INTERSECT_EXCEPT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QErrorSignal {
    pub node_type: String,
    pub estimated: f64,
    pub actual: f64,
    pub q_error: f64,
    pub direction: Direction,
    pub locus: Locus,
    pub timing_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QErrorAnalysis {
    pub signals: Vec<QErrorSignal>,
    pub max_q_error: f64,
    pub severity: Severity,
    pub direction: Direction,
    pub locus: Locus,
    pub magnitude: Magnitude,
    pub structural_flags: Vec<StructuralFlag>,
    pub pathology_candidates: Vec<PathologyCode>,
}

impl QErrorAnalysis {
    fn empty() -> Self {
        Self {
            signals: vec![],
            max_q_error: 1.0,
            severity: Severity::Accurate,
            direction: Direction::Accurate,
            locus: Locus::Projection,
            magnitude: Magnitude::Minor,
            structural_flags: vec![],
            pathology_candidates: vec![],
        }
    }

    /// Renders a terse prompt block. Deliberately omits severity and
    /// magnitude — empirically non-predictive for rewrite quality even
    /// though they're kept on the struct for programmatic use.
    pub fn format_for_prompt(&self) -> String {
        if self.signals.is_empty() {
            return "### Cardinality Estimation Routing (Q-Error)\nNo significant mis-estimates detected.".to_string();
        }
        let mut out = String::from("### Cardinality Estimation Routing (Q-Error)\n");
        out.push_str(&format!("Direction: {:?}, Locus: {:?}\n", self.direction, self.locus));
        out.push_str("Routing:\n");
        for code in &self.pathology_candidates {
            out.push_str(&format!("  - {code}\n"));
        }
        if !self.structural_flags.is_empty() {
            out.push_str("Structural signals:\n");
            for flag in &self.structural_flags {
                out.push_str(&format!("  - {}\n", flag.label()));
            }
        }
        out
    }
}

const LOCUS_TABLE: &[(&str, Locus)] = &[
    ("HASH_JOIN", Locus::Join),
    ("PIECEWISE_MERGE_JOIN", Locus::Join),
    ("NESTED_LOOP_JOIN", Locus::Join),
    ("BLOCKWISE_NL_JOIN", Locus::Join),
    ("CROSS_PRODUCT", Locus::Join),
    ("DELIM_JOIN", Locus::Join),
    ("TABLE_SCAN", Locus::Scan),
    ("SEQ_SCAN", Locus::Scan),
    ("INDEX_SCAN", Locus::Scan),
    ("DELIM_SCAN", Locus::Scan),
    ("CHUNK_SCAN", Locus::Scan),
    ("HASH_GROUP_BY", Locus::Aggregate),
    ("PERFECT_HASH_GROUP_BY", Locus::Aggregate),
    ("UNGROUPED_AGGREGATE", Locus::Aggregate),
    ("WINDOW", Locus::Aggregate),
    ("FILTER", Locus::Filter),
    ("RESULT", Locus::Filter),
    ("PROJECTION", Locus::Projection),
    ("ORDER_BY", Locus::Projection),
    ("TOP_N", Locus::Projection),
    ("UNION", Locus::Projection),
    ("CTE", Locus::Cte),
    ("CTE_SCAN", Locus::Cte),
    ("RECURSIVE_CTE", Locus::Cte),
    ("Hash Join", Locus::Join),
    ("Merge Join", Locus::Join),
    ("Nested Loop", Locus::Join),
    ("Seq Scan", Locus::Scan),
    ("Index Scan", Locus::Scan),
    ("Index Only Scan", Locus::Scan),
    ("Bitmap Heap Scan", Locus::Scan),
    ("Bitmap Index Scan", Locus::Scan),
    ("Aggregate", Locus::Aggregate),
    ("HashAggregate", Locus::Aggregate),
    ("WindowAgg", Locus::Aggregate),
    ("Result", Locus::Filter),
    ("Sort", Locus::Projection),
    ("Limit", Locus::Projection),
    ("Append", Locus::Projection),
    ("CTE Scan", Locus::Cte),
];

fn locus_for_node_type(name: &str) -> Locus {
    LOCUS_TABLE
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, l)| *l)
        .unwrap_or(Locus::Projection)
}

fn compute_q_error(estimated: f64, actual: f64) -> f64 {
    let e = estimated.max(1.0);
    let a = actual.max(1.0);
    (e / a).max(a / e)
}

fn classify_direction(estimated: f64, actual: f64) -> Direction {
    if estimated == 0.0 && actual == 0.0 {
        Direction::Accurate
    } else if estimated == 0.0 || actual == 0.0 {
        Direction::ZeroEst
    } else if estimated > actual * 1.5 {
        Direction::OverEst
    } else if actual > estimated * 1.5 {
        Direction::UnderEst
    } else {
        Direction::Accurate
    }
}

fn classify_magnitude(q_error: f64) -> Magnitude {
    if q_error > 1000.0 {
        Magnitude::Extreme
    } else if q_error > 100.0 {
        Magnitude::ThreeOrder
    } else if q_error > 10.0 {
        Magnitude::TwoOrder
    } else if q_error > 2.0 {
        Magnitude::OneOrder
    } else {
        Magnitude::Minor
    }
}

fn classify_severity(max_q_error: f64) -> Severity {
    if max_q_error > 10_000.0 {
        Severity::CatastrophicBlindness
    } else if max_q_error > 100.0 {
        Severity::MajorHallucination
    } else if max_q_error > 10.0 {
        Severity::ModerateGuess
    } else if max_q_error > 2.0 {
        Severity::MinorDrift
    } else {
        Severity::Accurate
    }
}

fn route_primary(locus: Locus, direction: Direction) -> Vec<PathologyCode> {
    use Direction::*;
    use Locus::*;
    use PathologyCode::*;
    match (locus, direction) {
        (Aggregate, OverEst) | (Aggregate, UnderEst) => vec![P3],
        (Cte, ZeroEst) => vec![P0, P7],
        (Cte, UnderEst) => vec![P2, P0],
        (Cte, OverEst) => vec![P7, P0],
        (Filter, OverEst) => vec![P9, P0],
        (Filter, UnderEst) => vec![P0],
        (Join, UnderEst) => vec![P2, P0],
        (Join, ZeroEst) => vec![P0, P2],
        (Join, OverEst) => vec![P5, P0],
        (Projection, OverEst) => vec![P7, P0, P4],
        (Projection, UnderEst) => vec![P6, P5, P0],
        (Projection, ZeroEst) => vec![P6, P0],
        (Scan, OverEst) => vec![P1, P4],
        (Scan, UnderEst) => vec![P0],
        (Scan, ZeroEst) => vec![P2],
        _ => vec![],
    }
}

/// `analyze_plan_qerror(plan_json, dialect)`, ported from the reference
/// implementation's routing table (spec.md §4.3).
pub fn analyze_plan_qerror(plan_json: &Value, dialect: Option<SqlDialect>) -> Result<QErrorAnalysis> {
    let dialect = dialect.ok_or(QErrorError::UnknownFormat)?;
    let root = match dialect {
        SqlDialect::PostgreSql => normalize_postgres(unwrap_postgres_root(plan_json)),
        _ => normalize_duckdb(plan_json),
    };

    let mut signals = Vec::new();
    collect_signals(&root, &mut signals, 2.0);

    if signals.is_empty() {
        return Ok(QErrorAnalysis::empty());
    }

    signals.sort_by(|a, b| b.q_error.partial_cmp(&a.q_error).unwrap_or(std::cmp::Ordering::Equal));

    let worst = &signals[0];
    let max_q_error = worst.q_error;
    let direction = worst.direction;
    let locus = worst.locus;
    let severity = classify_severity(max_q_error);
    let magnitude = classify_magnitude(max_q_error);

    let mut pathology_candidates = route_primary(locus, direction);
    for signal in signals.iter().skip(1).take(4) {
        if signal.q_error > 100.0 {
            for code in route_primary(signal.locus, signal.direction) {
                if !pathology_candidates.contains(&code) {
                    pathology_candidates.push(code);
                }
            }
        }
    }

    let structural_flags = extract_structural_flags(&root);
    for flag in &structural_flags {
        if let Some(code) = flag.secondary_pathology() {
            if !pathology_candidates.contains(&code) {
                pathology_candidates.push(code);
            }
        }
    }

    Ok(QErrorAnalysis {
        signals,
        max_q_error,
        severity,
        direction,
        locus,
        magnitude,
        structural_flags,
        pathology_candidates,
    })
}

fn collect_signals(node: &PlanNode, out: &mut Vec<QErrorSignal>, min_q_error: f64) {
    if let Some(estimated) = estimated_value(node) {
        let actual = node.rows as f64;
        let q_error = compute_q_error(estimated, actual);
        if q_error >= min_q_error {
            out.push(QErrorSignal {
                node_type: node.name.clone(),
                estimated,
                actual,
                q_error,
                direction: classify_direction(estimated, actual),
                locus: locus_for_node_type(&node.name),
                timing_ms: node.self_time_s * 1000.0,
            });
        }
    }
    for child in &node.children {
        collect_signals(child, out, min_q_error);
    }
}

/// Structural red flags detectable from `EXPLAIN` alone — no `ANALYZE`
/// run required, so these are available even when only a planner
/// estimate (not a measured execution) is cached.
fn extract_structural_flags(root: &PlanNode) -> Vec<StructuralFlag> {
    let mut flags = Vec::new();
    let mut tables_seen: HashMap<String, u32> = HashMap::new();
    walk_structural_flags(root, &mut tables_seen, &mut flags);
    flags
}

fn walk_structural_flags(node: &PlanNode, tables_seen: &mut HashMap<String, u32>, flags: &mut Vec<StructuralFlag>) {
    let upper = node.name.to_uppercase();

    if let Some(estimated) = estimated_value(node) {
        if estimated == 0.0 && node.rows > 0 && !flags.contains(&StructuralFlag::EstZero) {
            flags.push(StructuralFlag::EstZero);
        }
        if (estimated - 1.0).abs() < f64::EPSILON
            && !node.children.is_empty()
            && !flags.contains(&StructuralFlag::EstOneNonLeaf)
        {
            flags.push(StructuralFlag::EstOneNonLeaf);
        }
    }

    if (upper.contains("DELIM_SCAN") || upper.contains("DELIM_JOIN")) && !flags.contains(&StructuralFlag::DelimScan) {
        flags.push(StructuralFlag::DelimScan);
    }
    if upper.contains("LEFT") && upper.contains("JOIN") && !flags.contains(&StructuralFlag::LeftJoin) {
        flags.push(StructuralFlag::LeftJoin);
    }
    if (upper.contains("INTERSECT") || upper.contains("EXCEPT")) && !flags.contains(&StructuralFlag::IntersectExcept) {
        flags.push(StructuralFlag::IntersectExcept);
    }
    if node.extras.get("parent_relationship").and_then(Value::as_str) == Some("SubPlan")
        && !flags.contains(&StructuralFlag::CorrelatedSubplan)
    {
        flags.push(StructuralFlag::CorrelatedSubplan);
    }
    if upper.contains("SCAN") {
        let table = node
            .extras
            .get("relation_name")
            .and_then(Value::as_str)
            .unwrap_or(&node.name)
            .to_string();
        let count = tables_seen.entry(table).or_insert(0);
        *count += 1;
        if *count >= 2 && !flags.contains(&StructuralFlag::RepeatedTable) {
            flags.push(StructuralFlag::RepeatedTable);
        }
    }

    for child in &node.children {
        walk_structural_flags(child, tables_seen, flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn q_error_is_always_at_least_one() {
        assert!((compute_q_error(0.0, 0.0) - 1.0).abs() < 1e-9);
        assert!(compute_q_error(10.0, 10000.0) >= 1.0);
        assert!(compute_q_error(10000.0, 10.0) >= 1.0);
    }

    #[test]
    fn accurate_direction_implies_q_error_one() {
        let q = compute_q_error(100.0, 100.0);
        assert!((q - 1.0).abs() < 1e-9);
        assert_eq!(classify_direction(100.0, 100.0), Direction::Accurate);
    }

    #[test]
    fn under_estimate_routes_to_decorrelation_pathology() {
        let plan = json!({
            "operator_name": "HASH_JOIN",
            "operator_timing": 0.05,
            "operator_cardinality": 500000,
            "estimated_cardinality": 100,
            "children": []
        });
        let analysis = analyze_plan_qerror(&plan, Some(SqlDialect::DuckDb)).unwrap();
        assert_eq!(analysis.direction, Direction::UnderEst);
        assert_eq!(analysis.locus, Locus::Join);
        assert!(analysis.pathology_candidates.contains(&PathologyCode::P2));
    }

    #[test]
    fn repeated_table_flag_detected_across_two_scans() {
        let plan = json!({
            "operator_name": "HASH_JOIN",
            "operator_timing": 0.01,
            "operator_cardinality": 10,
            "children": [
                {"operator_name": "SEQ_SCAN", "operator_timing": 0.01, "operator_cardinality": 100, "extra_info": "orders"},
                {"operator_name": "SEQ_SCAN", "operator_timing": 0.01, "operator_cardinality": 100, "extra_info": "orders"}
            ]
        });
        let analysis = analyze_plan_qerror(&plan, Some(SqlDialect::DuckDb)).unwrap();
        assert!(analysis.structural_flags.contains(&StructuralFlag::RepeatedTable));
    }

    #[test]
    fn empty_when_estimates_are_accurate() {
        let plan = json!({
            "operator_name": "SEQ_SCAN",
            "operator_timing": 0.01,
            "operator_cardinality": 100,
            "estimated_cardinality": 100,
            "children": []
        });
        let analysis = analyze_plan_qerror(&plan, Some(SqlDialect::DuckDb)).unwrap();
        assert!(analysis.signals.is_empty());
        assert_eq!(analysis.severity, Severity::Accurate);
    }
}
