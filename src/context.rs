//! Context Builder (C6).
//!
//! Pure aggregation over C1-C5 outputs plus the knowledge catalog into
//! the payload the analyst-briefing prompt (`prompts`) renders from. No
//! side effects beyond the cache reads its collaborators already perform
//! — this component never calls the executor or the LLM itself.

use crate::cost_analyzer;
use crate::knowledge::{Constraint, EngineProfile, Example, KnowledgeRetriever, Regression};
use crate::logical_tree::{self, LogicalTree, NodeCost};
use crate::plan_scanner::{self, ScanResult};
use crate::plan_signals::PlanSignals;
use crate::sql_parser::{SqlDialect, SqlParser};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("parse error building logical tree: {0}")]
    Parse(#[from] crate::sql_parser::ParseError),
    #[error("knowledge retrieval error: {0}")]
    Knowledge(#[from] crate::knowledge::KnowledgeError),
    /// Gate failure (§4.6): missing examples, or (PostgreSQL) missing
    /// plan-scanner text / engine profile, and no `bootstrap_override`.
    #[error("intelligence gate failed: {0}")]
    IntelligenceGate(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownCeiling {
    pub speedup: f64,
    pub technique: String,
}

/// Everything the caller already knows or has cached before asking C6 to
/// assemble a `Context` — plan signals, EXPLAIN text, and the
/// PostgreSQL-only plan-scanner result all come from the explain/scan
/// caches, never from a fresh live call made by this component.
#[derive(Default)]
pub struct ContextInputs {
    pub plan_signals: Option<PlanSignals>,
    pub explain_text: Option<String>,
    pub plan_scanner_result: Option<ScanResult>,
    pub resource_envelope: Option<String>,
    pub strategy_leaderboard: Option<serde_json::Value>,
    pub known_ceiling: Option<KnownCeiling>,
    pub regression_warnings: Vec<String>,
    pub bootstrap_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub query_id: String,
    pub sql: String,
    pub dialect: SqlDialect,
    pub logical_tree: LogicalTree,
    pub cost_attribution: HashMap<String, NodeCost>,
    pub plan_signals: Option<PlanSignals>,
    pub explain_text: Option<String>,
    pub examples: Vec<Example>,
    pub regressions: Vec<Regression>,
    pub engine_profile: Option<EngineProfile>,
    pub constraints: Vec<Constraint>,
    pub plan_scanner_text: Option<String>,
    pub resource_envelope: Option<String>,
    pub strategy_leaderboard: Option<serde_json::Value>,
    pub known_ceiling: Option<KnownCeiling>,
    pub regression_warnings: Vec<String>,
}

pub struct ContextBuilder {
    parser: Arc<dyn SqlParser>,
    knowledge: Arc<KnowledgeRetriever>,
}

impl ContextBuilder {
    pub fn new(parser: Arc<dyn SqlParser>, knowledge: Arc<KnowledgeRetriever>) -> Self {
        Self { parser, knowledge }
    }

    pub fn gather(&self, query_id: &str, sql: &str, dialect: SqlDialect, inputs: ContextInputs) -> Result<Context> {
        let tree = logical_tree::build(self.parser.as_ref(), sql, dialect)?;
        let cost_attribution = cost_analyzer::analyze(&tree, inputs.plan_signals.as_ref());

        let examples = self.knowledge.find_examples(sql, dialect, 20)?;
        let regressions = self.knowledge.find_regressions(sql, dialect, 10)?;
        let engine_profile = self.knowledge.engine_profile(dialect);
        let constraints = self.knowledge.constraints(dialect);
        let plan_scanner_text = inputs.plan_scanner_result.as_ref().map(plan_scanner::render_for_prompt);

        let context = Context {
            query_id: query_id.to_string(),
            sql: sql.to_string(),
            dialect,
            logical_tree: tree,
            cost_attribution,
            plan_signals: inputs.plan_signals,
            explain_text: inputs.explain_text,
            examples,
            regressions,
            engine_profile,
            constraints,
            plan_scanner_text,
            resource_envelope: inputs.resource_envelope,
            strategy_leaderboard: inputs.strategy_leaderboard,
            known_ceiling: inputs.known_ceiling,
            regression_warnings: inputs.regression_warnings,
        };

        if !inputs.bootstrap_override {
            check_intelligence_gate(&context)?;
        }

        Ok(context)
    }
}

fn check_intelligence_gate(context: &Context) -> Result<()> {
    if context.examples.is_empty() {
        return Err(ContextError::IntelligenceGate(
            "no matched examples available for this query".to_string(),
        ));
    }
    if context.dialect.is_postgres() {
        if context.plan_scanner_text.is_none() {
            return Err(ContextError::IntelligenceGate(
                "PostgreSQL context requires plan-scanner text".to_string(),
            ));
        }
        if context.engine_profile.is_none() {
            return Err(ContextError::IntelligenceGate(
                "PostgreSQL context requires an engine-algorithm profile".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KnowledgeCache;
    use crate::knowledge::InMemoryKnowledgeSource;
    use crate::sql_parser::SqlparserBackend;

    fn builder_with_example() -> ContextBuilder {
        let source = Arc::new(InMemoryKnowledgeSource {
            examples: vec![Example {
                id: "e1".to_string(),
                dialect: SqlDialect::Generic,
                tags: vec!["orders".to_string()],
                transforms: vec![],
                original_sql: "SELECT 1".to_string(),
                optimized_sql: "SELECT 1".to_string(),
                verified_speedup: 1.2,
                principle: "test".to_string(),
                match_score: 0.0,
                is_fallback: false,
                is_seed: false,
            }],
            ..Default::default()
        });
        let knowledge = Arc::new(KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8))));
        ContextBuilder::new(Arc::new(SqlparserBackend), knowledge)
    }

    #[test]
    fn gathers_context_for_duckdb_without_plan_scanner() {
        let builder = builder_with_example();
        let ctx = builder
            .gather("q1", "SELECT id FROM orders", SqlDialect::DuckDb, ContextInputs::default())
            .unwrap();
        assert_eq!(ctx.query_id, "q1");
        assert!(!ctx.examples.is_empty());
    }

    #[test]
    fn postgres_gate_requires_plan_scanner_text() {
        let builder = builder_with_example();
        let err = builder
            .gather("q1", "SELECT id FROM orders", SqlDialect::PostgreSql, ContextInputs::default())
            .unwrap_err();
        assert!(matches!(err, ContextError::IntelligenceGate(_)));
    }

    #[test]
    fn bootstrap_override_bypasses_gate() {
        let source = Arc::new(InMemoryKnowledgeSource::default());
        let knowledge = Arc::new(KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8))));
        let builder = ContextBuilder::new(Arc::new(SqlparserBackend), knowledge);
        let inputs = ContextInputs {
            bootstrap_override: true,
            ..Default::default()
        };
        let ctx = builder.gather("q1", "SELECT id FROM orders", SqlDialect::PostgreSql, inputs).unwrap();
        assert!(ctx.examples.is_empty());
    }
}
