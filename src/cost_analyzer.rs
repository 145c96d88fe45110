//! Cost Analyzer (C2).
//!
//! Attaches a per-node cost estimate to every node of a `LogicalTree`,
//! merging real plan measurements when `PlanSignals` are available and
//! falling back to a structural heuristic otherwise. Always succeeds —
//! there is no failure mode for this component (spec.md §4.2).

use crate::logical_tree::{LogicalTree, NodeCost};
use crate::plan_signals::PlanSignals;
use std::collections::HashMap;

/// `analyze(tree, plan_signals?) -> map<node_id, cost>`.
pub fn analyze(tree: &LogicalTree, plan_signals: Option<&PlanSignals>) -> HashMap<String, NodeCost> {
    match plan_signals {
        Some(signals) => analyze_with_signals(tree, signals),
        None => analyze_heuristic(tree),
    }
}

/// Attribute each operator's `self_time_ms` to the node whose subtree most
/// directly contains its table/CTE reference, then normalize to
/// percentages summing to 100.
fn analyze_with_signals(tree: &LogicalTree, signals: &PlanSignals) -> HashMap<String, NodeCost> {
    let mut time_by_node: HashMap<String, f64> = tree.nodes.keys().map(|id| (id.clone(), 0.0)).collect();
    let mut rows_by_node: HashMap<String, u64> = HashMap::new();

    for op in &signals.operators {
        let owner = attribute_operator_owner(tree, &op.name);
        *time_by_node.entry(owner.clone()).or_insert(0.0) += op.self_time_ms;
        rows_by_node
            .entry(owner)
            .and_modify(|r| *r = (*r).max(op.row_count))
            .or_insert(op.row_count);
    }

    let total: f64 = time_by_node.values().sum();
    time_by_node
        .into_iter()
        .map(|(id, time_ms)| {
            let cost_pct = if total > 0.0 { time_ms / total * 100.0 } else { 0.0 };
            let row_estimate = rows_by_node.get(&id).copied().unwrap_or(0);
            (id, NodeCost { cost_pct, row_estimate })
        })
        .collect()
}

/// Best-effort match of an operator name (a scan/join label from EXPLAIN)
/// to the node whose base-table references it most plausibly belongs to.
/// An operator naming one of a node's own table refs, or naming the node
/// id itself (a CTE scan), attributes to that node; otherwise it falls
/// back to `main_query` — the common case for joins spanning multiple
/// base tables with no single clean owner.
fn attribute_operator_owner(tree: &LogicalTree, operator_name: &str) -> String {
    let lower = operator_name.to_lowercase();
    for (id, node) in &tree.nodes {
        if lower.contains(&id.to_lowercase()) {
            return id.clone();
        }
        for r in &node.refs {
            if lower.contains(&r.to_lowercase()) {
                return id.clone();
            }
        }
    }
    "main_query".to_string()
}

/// No plan signals: baseline each node to 1, scale by ref fan-in and
/// flags, then normalize to percentages summing to 100.
fn analyze_heuristic(tree: &LogicalTree) -> HashMap<String, NodeCost> {
    let mut weights: HashMap<String, f64> = HashMap::new();
    for (id, node) in &tree.nodes {
        let mut weight = 1.0;
        weight *= 1.0 + 0.5 * node.refs.len() as f64;
        if node.flags.has_aggregation {
            weight *= 2.0;
        }
        if node.flags.correlated {
            weight *= 3.0;
        }
        weights.insert(id.clone(), weight);
    }

    let total: f64 = weights.values().sum();
    weights
        .into_iter()
        .map(|(id, weight)| {
            let cost_pct = if total > 0.0 { weight / total * 100.0 } else { 0.0 };
            (id, NodeCost { cost_pct, row_estimate: 0 })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical_tree::build;
    use crate::plan_signals::Operator;
    use crate::sql_parser::{SqlDialect, SqlparserBackend};

    fn build_tree(sql: &str) -> LogicalTree {
        build(&SqlparserBackend, sql, SqlDialect::Generic).unwrap()
    }

    #[test]
    fn heuristic_costs_sum_to_one_hundred() {
        let tree = build_tree("WITH a AS (SELECT id FROM t1) SELECT * FROM a");
        let costs = analyze(&tree, None);
        let total: f64 = costs.values().map(|c| c.cost_pct).sum();
        assert!((total - 100.0).abs() < 1e-6);
    }

    #[test]
    fn aggregation_does_not_panic_on_single_node_tree() {
        let tree = build_tree("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id");
        let costs = analyze(&tree, None);
        assert_eq!(costs.len(), 1);
        assert!((costs["main_query"].cost_pct - 100.0).abs() < 1e-6);
    }

    #[test]
    fn plan_signals_normalize_to_one_hundred() {
        let tree = build_tree("SELECT id FROM users");
        let signals = PlanSignals {
            operators: vec![
                Operator {
                    name: "SEQ_SCAN".to_string(),
                    self_time_ms: 30.0,
                    row_count: 1000,
                    cost_pct: 0.0,
                },
                Operator {
                    name: "FILTER".to_string(),
                    self_time_ms: 10.0,
                    row_count: 500,
                    cost_pct: 0.0,
                },
            ],
            ..Default::default()
        };
        let costs = analyze(&tree, Some(&signals));
        let total: f64 = costs.values().map(|c| c.cost_pct).sum();
        assert!((total - 100.0).abs() < 1e-6);
    }
}
