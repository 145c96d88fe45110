//! Knowledge Retriever (C4).
//!
//! Tag-overlap retrieval over an example/regression catalog plus a
//! per-dialect engine profile and constraint set. The catalog itself is
//! behind the `KnowledgeSource` trait so the retriever doesn't care
//! whether examples live on disk, in a database, or in a test double;
//! `FilesystemKnowledgeSource` is the on-disk implementation used in
//! production, loaded once at startup (Design Notes §9: "pure
//! aggregation, no side effects beyond cache reads").

use crate::cache::KnowledgeCache;
use crate::sql_parser::{ScalarExpr, SelectShape, SqlDialect, SqlParser};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("parse error tokenizing tags: {0}")]
    Parse(#[from] crate::sql_parser::ParseError),
    #[error("io error reading catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, KnowledgeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    pub dialect: SqlDialect,
    pub tags: Vec<String>,
    pub transforms: Vec<String>,
    pub original_sql: String,
    pub optimized_sql: String,
    pub verified_speedup: f64,
    pub principle: String,
    #[serde(default)]
    pub match_score: f64,
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default)]
    pub is_seed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Regression {
    pub id: String,
    pub dialect: SqlDialect,
    pub tags: Vec<String>,
    pub transforms: Vec<String>,
    pub original_sql: String,
    pub optimized_sql: String,
    pub verified_speedup: f64,
    pub principle: String,
    pub regression_mechanism: String,
    #[serde(default)]
    pub match_score: f64,
    #[serde(default)]
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConstraintSeverity {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub severity: ConstraintSeverity,
    pub text: String,
    #[serde(default)]
    pub engine: Option<SqlDialect>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineProfile {
    pub dialect: SqlDialect,
    /// Optimizer strengths — don't fight these.
    pub strengths: Vec<String>,
    /// Optimizer gaps — exploit these.
    pub gaps: Vec<String>,
}

/// Seed examples (`state_0/seed/`) are floored at this `_match_score`
/// (SPEC_FULL §4.4 expansion, Open Question 2): they never outrank a
/// strictly higher tag-overlap match but always outrank the zero-score
/// fallback path.
pub const SEED_MATCH_SCORE_FLOOR: f64 = 0.5;

pub trait KnowledgeSource: Send + Sync {
    fn examples_for(&self, dialect: SqlDialect) -> Vec<Example>;
    fn seed_examples_for(&self, dialect: SqlDialect) -> Vec<Example>;
    fn regressions_for(&self, dialect: SqlDialect) -> Vec<Regression>;
    fn engine_profile(&self, dialect: SqlDialect) -> Option<EngineProfile>;
    fn constraints(&self, dialect: SqlDialect) -> Vec<Constraint>;
}

fn dialect_filename(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Generic => "generic",
        SqlDialect::DuckDb => "duckdb",
        SqlDialect::PostgreSql => "postgresql",
        SqlDialect::MySql => "mysql",
        SqlDialect::Sqlite => "sqlite",
        SqlDialect::Snowflake => "snowflake",
    }
}

/// Loads `<root>/examples/<dialect>.json`, `<root>/regressions/<dialect>.json`,
/// `<root>/profiles/<dialect>.json`, `<root>/constraints/<dialect>.json`, and
/// (optionally) `<seed_root>/<dialect>.json` once at construction time.
pub struct FilesystemKnowledgeSource {
    examples: Vec<Example>,
    seed_examples: Vec<Example>,
    regressions: Vec<Regression>,
    profiles: Vec<EngineProfile>,
    constraints: Vec<Constraint>,
}

impl FilesystemKnowledgeSource {
    pub fn load(catalog_root: &Path, seed_root: Option<&Path>) -> Result<Self> {
        let mut examples = Vec::new();
        let mut seed_examples = Vec::new();
        let mut regressions = Vec::new();
        let mut profiles = Vec::new();
        let mut constraints = Vec::new();

        for dialect in [
            SqlDialect::Generic,
            SqlDialect::DuckDb,
            SqlDialect::PostgreSql,
            SqlDialect::MySql,
            SqlDialect::Sqlite,
            SqlDialect::Snowflake,
        ] {
            let name = dialect_filename(dialect);

            if let Some(mut v) = read_json_array::<Example>(&catalog_root.join("examples").join(format!("{name}.json")))? {
                examples.append(&mut v);
            }
            if let Some(mut v) =
                read_json_array::<Regression>(&catalog_root.join("regressions").join(format!("{name}.json")))?
            {
                regressions.append(&mut v);
            }
            if let Some(mut v) = read_json_array::<Constraint>(&catalog_root.join("constraints").join(format!("{name}.json")))? {
                constraints.append(&mut v);
            }
            if let Some(profile) = read_json_one::<EngineProfile>(&catalog_root.join("profiles").join(format!("{name}.json")))? {
                profiles.push(profile);
            }
            if let Some(root) = seed_root {
                if let Some(mut v) = read_json_array::<Example>(&root.join(format!("{name}.json")))? {
                    seed_examples.append(&mut v);
                }
            }
        }

        Ok(Self {
            examples,
            seed_examples,
            regressions,
            profiles,
            constraints,
        })
    }
}

fn read_json_array<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<Vec<T>>> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| KnowledgeError::Json {
                path: path.display().to_string(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KnowledgeError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn read_json_one<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| KnowledgeError::Json {
                path: path.display().to_string(),
                source,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KnowledgeError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

impl KnowledgeSource for FilesystemKnowledgeSource {
    fn examples_for(&self, dialect: SqlDialect) -> Vec<Example> {
        self.examples
            .iter()
            .filter(|e| e.dialect == dialect || e.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn seed_examples_for(&self, dialect: SqlDialect) -> Vec<Example> {
        self.seed_examples
            .iter()
            .filter(|e| e.dialect == dialect || e.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn regressions_for(&self, dialect: SqlDialect) -> Vec<Regression> {
        self.regressions
            .iter()
            .filter(|r| r.dialect == dialect || r.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn engine_profile(&self, dialect: SqlDialect) -> Option<EngineProfile> {
        self.profiles.iter().find(|p| p.dialect == dialect).cloned()
    }

    fn constraints(&self, dialect: SqlDialect) -> Vec<Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.engine.map(|e| e == dialect).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// In-memory source for tests and bootstrap runs.
#[derive(Default)]
pub struct InMemoryKnowledgeSource {
    pub examples: Vec<Example>,
    pub seed_examples: Vec<Example>,
    pub regressions: Vec<Regression>,
    pub profiles: Vec<EngineProfile>,
    pub constraints: Vec<Constraint>,
}

impl KnowledgeSource for InMemoryKnowledgeSource {
    fn examples_for(&self, dialect: SqlDialect) -> Vec<Example> {
        self.examples
            .iter()
            .filter(|e| e.dialect == dialect || e.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn seed_examples_for(&self, dialect: SqlDialect) -> Vec<Example> {
        self.seed_examples
            .iter()
            .filter(|e| e.dialect == dialect || e.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn regressions_for(&self, dialect: SqlDialect) -> Vec<Regression> {
        self.regressions
            .iter()
            .filter(|r| r.dialect == dialect || r.dialect == SqlDialect::Generic)
            .cloned()
            .collect()
    }

    fn engine_profile(&self, dialect: SqlDialect) -> Option<EngineProfile> {
        self.profiles.iter().find(|p| p.dialect == dialect).cloned()
    }

    fn constraints(&self, dialect: SqlDialect) -> Vec<Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.engine.map(|e| e == dialect).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Tokenizes a query into the tag set used for similarity retrieval:
/// table names, join/aggregation/window/set-operator structural markers.
pub fn tokenize_tags(sql: &str, dialect: SqlDialect, parser: &dyn SqlParser) -> Result<HashSet<String>> {
    let bodies = parser.parse_query_bodies(sql, dialect)?;
    let mut tags = HashSet::new();
    for body in &bodies {
        collect_shape_tags(&body.select, &mut tags);
    }
    Ok(tags)
}

fn collect_shape_tags(shape: &SelectShape, tags: &mut HashSet<String>) {
    for table_ref in &shape.table_refs {
        tags.insert(table_ref.name.to_lowercase());
    }
    if !shape.joins.is_empty() {
        tags.insert("has_join".to_string());
    }
    if shape.has_aggregation {
        tags.insert("has_agg".to_string());
    }
    if shape.has_distinct {
        tags.insert("has_distinct".to_string());
    }
    if shape.has_window_function {
        tags.insert("has_window".to_string());
    }
    if shape.set_operator.is_some() {
        tags.insert("has_union".to_string());
    }
    if shape.is_correlated_subquery {
        tags.insert("has_correlated".to_string());
    }
    if !shape.nested_subqueries.is_empty() {
        tags.insert("has_subquery".to_string());
    }
    for predicate in &shape.where_predicates {
        collect_expr_function_tags(predicate, tags);
    }
    for nested in &shape.nested_subqueries {
        collect_shape_tags(nested, tags);
    }
}

fn collect_expr_function_tags(expr: &ScalarExpr, tags: &mut HashSet<String>) {
    match expr {
        ScalarExpr::Function { name, args } => {
            tags.insert(format!("fn:{}", name.to_lowercase()));
            for arg in args {
                collect_expr_function_tags(arg, tags);
            }
        }
        ScalarExpr::BinaryOp { left, right, .. } => {
            collect_expr_function_tags(left, tags);
            collect_expr_function_tags(right, tags);
        }
        ScalarExpr::UnaryOp { expr, .. } => collect_expr_function_tags(expr, tags),
        ScalarExpr::In { expr, list, .. } => {
            collect_expr_function_tags(expr, tags);
            for item in list {
                collect_expr_function_tags(item, tags);
            }
        }
        ScalarExpr::Between { expr, low, high, .. } => {
            collect_expr_function_tags(expr, tags);
            collect_expr_function_tags(low, tags);
            collect_expr_function_tags(high, tags);
        }
        ScalarExpr::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            if let Some(o) = operand {
                collect_expr_function_tags(o, tags);
            }
            for (cond, result) in when_clauses {
                collect_expr_function_tags(cond, tags);
                collect_expr_function_tags(result, tags);
            }
            if let Some(e) = else_clause {
                collect_expr_function_tags(e, tags);
            }
        }
        ScalarExpr::Column(_) | ScalarExpr::Literal(_) | ScalarExpr::Raw(_) => {}
    }
}

fn tag_overlap(query_tags: &HashSet<String>, example_tags: &[String]) -> usize {
    example_tags.iter().filter(|t| query_tags.contains(t.as_str())).count()
}

fn sorted_tag_key(tags: &HashSet<String>) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(",")
}

pub struct KnowledgeRetriever {
    source: Arc<dyn KnowledgeSource>,
    parser: Arc<dyn SqlParser>,
    cache: Arc<KnowledgeCache>,
}

impl KnowledgeRetriever {
    pub fn new(source: Arc<dyn KnowledgeSource>, parser: Arc<dyn SqlParser>, cache: Arc<KnowledgeCache>) -> Self {
        Self { source, parser, cache }
    }

    pub fn find_examples(&self, sql: &str, dialect: SqlDialect, k: usize) -> Result<Vec<Example>> {
        let tags = tokenize_tags(sql, dialect, self.parser.as_ref())?;
        let cache_key = format!("examples:{:?}:{}:{}", dialect, sorted_tag_key(&tags), k);
        if let Some(cached) = self.cache.get(&cache_key).and_then(|v| serde_json::from_value(v).ok()) {
            return Ok(cached);
        }

        let mut scored: Vec<Example> = self
            .source
            .examples_for(dialect)
            .into_iter()
            .map(|mut ex| {
                ex.match_score = tag_overlap(&tags, &ex.tags) as f64;
                ex
            })
            .collect();

        for mut seed in self.source.seed_examples_for(dialect) {
            seed.is_seed = true;
            seed.match_score = (tag_overlap(&tags, &seed.tags) as f64).max(SEED_MATCH_SCORE_FLOOR);
            scored.push(seed);
        }

        let any_real_match = scored.iter().any(|e| e.match_score > 0.0);

        let top = if any_real_match {
            scored.retain(|e| e.match_score > 0.0);
            sort_by_score_then_speedup(&mut scored, dialect);
            scored.into_iter().take(k).collect::<Vec<_>>()
        } else {
            let mut fallback = self.source.examples_for(dialect);
            for ex in &mut fallback {
                ex.match_score = 0.0;
                ex.is_fallback = true;
            }
            fallback.into_iter().take(k).collect::<Vec<_>>()
        };

        if let Ok(value) = serde_json::to_value(&top) {
            self.cache.put(cache_key, value);
        }
        Ok(top)
    }

    pub fn find_regressions(&self, sql: &str, dialect: SqlDialect, k: usize) -> Result<Vec<Regression>> {
        let tags = tokenize_tags(sql, dialect, self.parser.as_ref())?;
        let cache_key = format!("regressions:{:?}:{}:{}", dialect, sorted_tag_key(&tags), k);
        if let Some(cached) = self.cache.get(&cache_key).and_then(|v| serde_json::from_value(v).ok()) {
            return Ok(cached);
        }

        let mut scored: Vec<Regression> = self
            .source
            .regressions_for(dialect)
            .into_iter()
            .map(|mut r| {
                r.match_score = tag_overlap(&tags, &r.tags) as f64;
                r
            })
            .collect();

        let top = if scored.iter().any(|r| r.match_score > 0.0) {
            scored.retain(|r| r.match_score > 0.0);
            scored.sort_by(|a, b| {
                b.match_score
                    .partial_cmp(&a.match_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.verified_speedup.partial_cmp(&a.verified_speedup).unwrap_or(std::cmp::Ordering::Equal))
            });
            scored.into_iter().take(k).collect()
        } else {
            let mut fallback = self.source.regressions_for(dialect);
            for r in &mut fallback {
                r.match_score = 0.0;
                r.is_fallback = true;
            }
            fallback.into_iter().take(k).collect()
        };

        if let Ok(value) = serde_json::to_value(&top) {
            self.cache.put(cache_key, value);
        }
        Ok(top)
    }

    pub fn engine_profile(&self, dialect: SqlDialect) -> Option<EngineProfile> {
        self.source.engine_profile(dialect)
    }

    pub fn constraints(&self, dialect: SqlDialect) -> Vec<Constraint> {
        self.source.constraints(dialect)
    }
}

fn sort_by_score_then_speedup(examples: &mut [Example], dialect: SqlDialect) {
    examples.sort_by(|a, b| {
        b.match_score
            .partial_cmp(&a.match_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (b.dialect == dialect).cmp(&(a.dialect == dialect)))
            .then_with(|| b.verified_speedup.partial_cmp(&a.verified_speedup).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Renders constraints for prompt embedding: CRITICAL items duplicated
/// at top and bottom, HIGH/MEDIUM sandwiched in the middle (§4.4).
pub fn render_constraints_for_prompt(constraints: &[Constraint]) -> String {
    let critical: Vec<&Constraint> = constraints.iter().filter(|c| c.severity == ConstraintSeverity::Critical).collect();
    let rest: Vec<&Constraint> = constraints
        .iter()
        .filter(|c| c.severity != ConstraintSeverity::Critical)
        .collect();

    let mut lines = Vec::new();
    for c in &critical {
        lines.push(format!("[CRITICAL] {}", c.text));
    }
    for c in &rest {
        lines.push(format!("[{:?}] {}", c.severity, c.text).to_uppercase());
    }
    for c in &critical {
        lines.push(format!("[CRITICAL] {}", c.text));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_parser::SqlparserBackend;

    fn example(id: &str, tags: &[&str], speedup: f64) -> Example {
        Example {
            id: id.to_string(),
            dialect: SqlDialect::DuckDb,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            transforms: vec![],
            original_sql: "SELECT 1".to_string(),
            optimized_sql: "SELECT 1".to_string(),
            verified_speedup: speedup,
            principle: "test".to_string(),
            match_score: 0.0,
            is_fallback: false,
            is_seed: false,
        }
    }

    #[test]
    fn tokenizes_table_names_and_aggregation_marker() {
        let parser = SqlparserBackend;
        let tags = tokenize_tags(
            "SELECT user_id, COUNT(*) FROM orders GROUP BY user_id",
            SqlDialect::Generic,
            &parser,
        )
        .unwrap();
        assert!(tags.contains("orders"));
        assert!(tags.contains("has_agg"));
    }

    #[test]
    fn find_examples_ranks_by_tag_overlap_then_speedup() {
        let source = Arc::new(InMemoryKnowledgeSource {
            examples: vec![
                example("low", &["orders"], 1.2),
                example("high", &["orders", "has_agg"], 1.5),
                example("unrelated", &["products"], 3.0),
            ],
            ..Default::default()
        });
        let retriever = KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8)));
        let results = retriever
            .find_examples("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id", SqlDialect::DuckDb, 2)
            .unwrap();
        assert_eq!(results[0].id, "high");
        assert!(!results.iter().any(|e| e.id == "unrelated"));
    }

    #[test]
    fn falls_back_to_directory_order_when_no_tag_matches() {
        let source = Arc::new(InMemoryKnowledgeSource {
            examples: vec![example("a", &["products"], 1.0), example("b", &["reviews"], 1.0)],
            ..Default::default()
        });
        let retriever = KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8)));
        let results = retriever.find_examples("SELECT 1 FROM nothing_matching", SqlDialect::DuckDb, 5).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|e| e.is_fallback));
    }

    #[test]
    fn seed_examples_floor_below_real_matches_but_above_zero() {
        let mut seed = example("seed", &["unrelated_tag"], 1.0);
        seed.is_seed = false;
        let source = Arc::new(InMemoryKnowledgeSource {
            examples: vec![example("matched", &["orders", "has_agg"], 1.1)],
            seed_examples: vec![seed],
            ..Default::default()
        });
        let retriever = KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8)));
        let results = retriever
            .find_examples("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id", SqlDialect::DuckDb, 5)
            .unwrap();
        assert_eq!(results[0].id, "matched");
        assert_eq!(results[1].id, "seed");
        assert!(results[1].is_seed);
    }

    #[test]
    fn critical_constraints_are_duplicated_top_and_bottom() {
        let constraints = vec![
            Constraint {
                severity: ConstraintSeverity::Critical,
                text: "never drop rows".to_string(),
                engine: None,
            },
            Constraint {
                severity: ConstraintSeverity::Medium,
                text: "prefer hash joins".to_string(),
                engine: None,
            },
        ];
        let rendered = render_constraints_for_prompt(&constraints);
        let occurrences = rendered.matches("never drop rows").count();
        assert_eq!(occurrences, 2);
        assert!(rendered.starts_with("[CRITICAL]"));
        assert!(rendered.ends_with("never drop rows"));
    }
}
