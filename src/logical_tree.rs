//! Logical-Tree Builder (C1).
//!
//! Transforms parsed SQL into a DAG of CTE/subquery/main-query nodes with
//! column contracts and reference edges. Delegates all grammar work to a
//! `SqlParser` (`sql_parser`); this module only walks the flattened
//! `SelectShape` tree that parser hands back and assigns the stable string
//! identities the rest of the core keys everything off (`cte_name`,
//! `subquery_k`, `main_query`).

use crate::ast::ScalarExpr;
use crate::sql_parser::{ParseError, SelectShape, SetOperatorKind, SqlDialect, SqlParser};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Cte,
    Subquery,
    Main,
}

/// Closed set of structural markers a node can carry. The Python original
/// treats this as an open tag set; every tag it actually ever sets is
/// enumerated here, so flags is a struct of bools rather than a bag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    pub has_aggregation: bool,
    pub correlated: bool,
    pub has_distinct: bool,
    pub has_union: bool,
    pub recursive: bool,
}

/// Populated by the Cost Analyzer (C2); absent until then.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeCost {
    pub cost_pct: f64,
    pub row_estimate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalNode {
    pub id: String,
    pub kind: NodeKind,
    pub output_columns: Vec<String>,
    pub grain: Option<String>,
    pub required_predicates: Vec<ScalarExpr>,
    pub refs: BTreeSet<String>,
    pub flags: NodeFlags,
    pub cost: Option<NodeCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalTree {
    pub nodes: BTreeMap<String, LogicalNode>,
    pub edges: Vec<(String, String)>,
}

impl LogicalTree {
    pub fn main_node(&self) -> &LogicalNode {
        self.nodes
            .get("main_query")
            .expect("build() guarantees exactly one main node")
    }

    /// 1 + max depth of refs, 0 when refs is empty. Assumes acyclicity
    /// (checked at build time); unresolved refs are treated as leaves.
    pub fn depth(&self, id: &str) -> usize {
        let mut memo = HashMap::new();
        self.depth_memo(id, &mut memo)
    }

    fn depth_memo<'a>(&'a self, id: &'a str, memo: &mut HashMap<&'a str, usize>) -> usize {
        if let Some(d) = memo.get(id) {
            return *d;
        }
        let node = match self.nodes.get(id) {
            Some(n) => n,
            None => return 0,
        };
        let depth = if node.refs.is_empty() {
            0
        } else {
            1 + node
                .refs
                .iter()
                .map(|r| self.depth_memo(r.as_str(), memo))
                .max()
                .unwrap_or(0)
        };
        memo.insert(id, depth);
        depth
    }

    /// Every non-main node reachable from `main_query` by following refs
    /// transitively (§8 invariant).
    pub fn reachable_from_main(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec!["main_query".to_string()];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                for r in &node.refs {
                    if seen.insert(r.clone()) {
                        stack.push(r.clone());
                    }
                }
            }
        }
        seen
    }
}

struct NodeBuilder {
    id: String,
    kind: NodeKind,
    output_columns: Vec<String>,
    grain: Option<String>,
    required_predicates: Vec<ScalarExpr>,
    raw_table_names: BTreeSet<String>,
    nested_ids: BTreeSet<String>,
    flags: NodeFlags,
}

pub fn build(parser: &dyn SqlParser, sql: &str, dialect: SqlDialect) -> Result<LogicalTree> {
    let bodies = parser.parse_query_bodies(sql, dialect)?;
    if bodies.is_empty() {
        return Err(ParseError::InvalidQuery("no query body produced".to_string()));
    }

    let mut builders: Vec<NodeBuilder> = Vec::new();
    let mut counter = 0usize;

    let (ctes, main) = bodies.split_at(bodies.len() - 1);
    for cte in ctes {
        let id = cte
            .name
            .clone()
            .ok_or_else(|| ParseError::InvalidQuery("CTE body missing alias".to_string()))?;
        flatten_body(id, NodeKind::Cte, cte.recursive, cte.select.clone(), &mut counter, &mut builders);
    }
    flatten_body(
        "main_query".to_string(),
        NodeKind::Main,
        false,
        main[0].select.clone(),
        &mut counter,
        &mut builders,
    );

    let known_ids: BTreeSet<String> = builders.iter().map(|b| b.id.clone()).collect();

    let mut nodes = BTreeMap::new();
    let mut edges = Vec::new();
    for b in builders {
        let mut refs: BTreeSet<String> = b
            .raw_table_names
            .into_iter()
            .filter(|name| known_ids.contains(name) && *name != b.id)
            .collect();
        refs.extend(b.nested_ids.into_iter().filter(|id| *id != b.id));

        for r in &refs {
            edges.push((b.id.clone(), r.clone()));
        }

        nodes.insert(
            b.id.clone(),
            LogicalNode {
                id: b.id,
                kind: b.kind,
                output_columns: b.output_columns,
                grain: b.grain,
                required_predicates: b.required_predicates,
                refs,
                flags: b.flags,
                cost: None,
            },
        );
    }

    let main_count = nodes.values().filter(|n| n.kind == NodeKind::Main).count();
    if main_count != 1 {
        return Err(ParseError::InvalidQuery(format!(
            "expected exactly one main node, found {main_count}"
        )));
    }

    let tree = LogicalTree { nodes, edges };
    if has_cycle(&tree) {
        return Err(ParseError::InvalidQuery(
            "logical tree references form a cycle".to_string(),
        ));
    }

    Ok(tree)
}

fn flatten_body(
    id: String,
    kind: NodeKind,
    recursive: bool,
    mut shape: SelectShape,
    counter: &mut usize,
    out: &mut Vec<NodeBuilder>,
) {
    let subquery_ids: Vec<String> = (0..shape.nested_subqueries.len())
        .map(|_| {
            let sub_id = format!("subquery_{}", *counter);
            *counter += 1;
            sub_id
        })
        .collect();

    let mut raw_table_names: BTreeSet<String> = shape.table_refs.iter().map(|t| t.name.clone()).collect();
    for join in &shape.joins {
        if let Some(right) = &join.right_table {
            raw_table_names.insert(right.clone());
        }
    }

    let output_columns = if shape.projections.is_empty() {
        vec!["*".to_string()]
    } else {
        shape
            .projections
            .iter()
            .map(|p| {
                p.alias.clone().unwrap_or_else(|| match &p.expr {
                    ScalarExpr::Column(c) => c.name.clone(),
                    other => other.to_sql_fragment(),
                })
            })
            .collect()
    };

    let grain = Some(if shape.has_aggregation {
        "aggregated".to_string()
    } else if shape.set_operator.is_some() {
        "set-combined".to_string()
    } else {
        "row-per-source".to_string()
    });

    let flags = NodeFlags {
        has_aggregation: shape.has_aggregation,
        correlated: shape.is_correlated_subquery,
        has_distinct: shape.has_distinct,
        has_union: matches!(
            shape.set_operator,
            Some(SetOperatorKind::Union) | Some(SetOperatorKind::UnionAll)
        ),
        recursive,
    };

    out.push(NodeBuilder {
        id,
        kind,
        output_columns,
        grain,
        required_predicates: shape.where_predicates.clone(),
        raw_table_names,
        nested_ids: subquery_ids.iter().cloned().collect(),
        flags,
    });

    let nested = std::mem::take(&mut shape.nested_subqueries);
    for (sub_shape, sub_id) in nested.into_iter().zip(subquery_ids.into_iter()) {
        flatten_body(sub_id, NodeKind::Subquery, false, sub_shape, counter, out);
    }
}

fn has_cycle(tree: &LogicalTree) -> bool {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index_of = HashMap::new();
    for id in tree.nodes.keys() {
        let idx = graph.add_node(id.as_str());
        index_of.insert(id.as_str(), idx);
    }
    for (src, tgt) in &tree.edges {
        if let (Some(&s), Some(&t)) = (index_of.get(src.as_str()), index_of.get(tgt.as_str())) {
            graph.add_edge(s, t, ());
        }
    }
    is_cyclic_directed(&graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_parser::SqlparserBackend;

    fn build_tree(sql: &str) -> LogicalTree {
        build(&SqlparserBackend, sql, SqlDialect::Generic).unwrap()
    }

    #[test]
    fn simple_select_has_only_main_node() {
        let tree = build_tree("SELECT id FROM users WHERE id > 10");
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes.contains_key("main_query"));
        assert_eq!(tree.main_node().kind, NodeKind::Main);
        assert!(tree.main_node().refs.is_empty());
    }

    #[test]
    fn cte_is_a_node_referenced_by_main() {
        let tree = build_tree("WITH recent AS (SELECT id FROM orders) SELECT * FROM recent");
        assert_eq!(tree.nodes.len(), 2);
        assert!(tree.nodes.contains_key("recent"));
        assert!(tree.main_node().refs.contains("recent"));
        assert_eq!(tree.depth("main_query"), 1);
        assert_eq!(tree.depth("recent"), 0);
    }

    #[test]
    fn derived_subquery_becomes_referenced_node() {
        let tree = build_tree("SELECT * FROM (SELECT id FROM orders) sub");
        assert!(tree.nodes.contains_key("subquery_0"));
        assert!(tree.main_node().refs.contains("subquery_0"));
    }

    #[test]
    fn aggregation_flag_is_set() {
        let tree = build_tree("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id");
        assert!(tree.main_node().flags.has_aggregation);
    }

    #[test]
    fn correlated_subquery_flag_propagates() {
        let tree = build_tree(
            "SELECT id FROM users u WHERE EXISTS (SELECT 1 FROM orders o WHERE o.user_id = u.id)",
        );
        // EXISTS subquery references outer column u.id: it is the subquery
        // node, not main, that carries the correlation marker.
        let sub = tree.nodes.get("subquery_0").unwrap();
        assert!(sub.flags.correlated);
    }

    #[test]
    fn refs_relation_is_acyclic_and_main_reaches_everything() {
        let tree = build_tree(
            "WITH a AS (SELECT id FROM t1), b AS (SELECT id FROM a) \
             SELECT * FROM b",
        );
        assert!(!has_cycle(&tree));
        let reachable = tree.reachable_from_main();
        assert!(reachable.contains("a"));
        assert!(reachable.contains("b"));
    }

    #[test]
    fn rejects_unparseable_sql() {
        let err = build(&SqlparserBackend, "SELEKT * FORM t", SqlDialect::Generic).unwrap_err();
        assert!(matches!(err, ParseError::SqlParser(_)));
    }
}
