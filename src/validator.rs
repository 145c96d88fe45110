//! Candidate Validator (C7).
//!
//! Benchmarks the original query once, then validates each candidate
//! against that baseline: syntax-check, timed execution, row-count and
//! checksum equivalence, speedup bucketing. Also owns racing (parallel
//! timed lanes with a minimum-runtime gate) and DuckDB's cost-rank
//! pre-screen.

use crate::llm::LlmError;
use crate::sql_executor::{ExecutionError, Row, SqlExecutor};
use crate::sql_parser::{SqlDialect, SqlParser};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Syntax,
    Semantic,
    Timeout,
    Execution,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictStatus {
    Win,
    Improved,
    Neutral,
    Regression,
    Error,
    Fail,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Win => "WIN",
            VerdictStatus::Improved => "IMPROVED",
            VerdictStatus::Neutral => "NEUTRAL",
            VerdictStatus::Regression => "REGRESSION",
            VerdictStatus::Error => "ERROR",
            VerdictStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub time_ms: f64,
    pub row_count: usize,
    pub checksum: Option<String>,
    #[serde(skip)]
    pub rows: Option<Vec<Row>>,
    pub explain_text: Option<String>,
}

impl Baseline {
    fn is_timeout_baseline(&self) -> bool {
        self.rows.is_none() && self.checksum.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub speedup: f64,
    pub errors: Vec<String>,
    pub error_category: Option<ErrorCategory>,
    pub explain_plan: Option<serde_json::Value>,
}

impl Verdict {
    fn error(category: ErrorCategory, errors: Vec<String>) -> Self {
        Self {
            status: VerdictStatus::Error,
            speedup: 0.0,
            errors,
            error_category: Some(category),
            explain_plan: None,
        }
    }

    fn fail(category: ErrorCategory, errors: Vec<String>) -> Self {
        Self {
            status: VerdictStatus::Fail,
            speedup: 0.0,
            errors,
            error_category: Some(category),
            explain_plan: None,
        }
    }
}

/// Substring rules on lowercased error text, checked in priority order
/// (§4.7).
pub fn categorize_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if ["syntax", "parse", "invalid sql", "unexpected"]
        .iter()
        .any(|s| lower.contains(s))
    {
        ErrorCategory::Syntax
    } else if ["mismatch", "count differ", "value mismatch", "not equal"]
        .iter()
        .any(|s| lower.contains(s))
    {
        ErrorCategory::Semantic
    } else if ["timeout", "timed out", "cancelled"].iter().any(|s| lower.contains(s)) {
        ErrorCategory::Timeout
    } else if ["execution", "failed", "error", "exception"]
        .iter()
        .any(|s| lower.contains(s))
    {
        ErrorCategory::Execution
    } else {
        ErrorCategory::Unknown
    }
}

fn bucket_speedup(speedup: f64) -> VerdictStatus {
    if speedup >= 1.10 {
        VerdictStatus::Win
    } else if speedup >= 1.05 {
        VerdictStatus::Improved
    } else if speedup >= 0.95 {
        VerdictStatus::Neutral
    } else {
        VerdictStatus::Regression
    }
}

/// MD5 over MD5-normalized sorted string-repr of rows (§4.7) — sorting
/// first makes the checksum invariant under row-order permutation.
pub fn compute_checksum(rows: &[Row]) -> String {
    let mut rendered: Vec<String> = rows.iter().map(Row::canonical_string).collect();
    rendered.sort();
    let mut hasher = Md5::new();
    for line in &rendered {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub struct RaceResult {
    /// Lanes in insertion order (§5 ordering guarantee): `(candidate_id,
    /// time_ms)`, original first.
    pub lane_timings: Vec<(String, f64)>,
    pub has_clear_winner: bool,
}

pub struct Validator {
    executor: Arc<dyn SqlExecutor>,
    parser: Arc<dyn SqlParser>,
    dialect: SqlDialect,
}

impl Validator {
    pub fn new(executor: Arc<dyn SqlExecutor>, parser: Arc<dyn SqlParser>, dialect: SqlDialect) -> Self {
        Self {
            executor,
            parser,
            dialect,
        }
    }

    async fn timed_execute(&self, sql: &str, timeout_ms: u64) -> std::result::Result<(f64, Vec<Row>), ExecutionError> {
        let start = Instant::now();
        let rowset = self.executor.execute(sql, timeout_ms).await?;
        Ok((start.elapsed().as_secs_f64() * 1000.0, rowset.rows))
    }

    /// `runs == 3`: warmup + 2 measured, averaged. `runs >= 5`: N
    /// measured, drop min/max, average the middle (trimmed mean).
    async fn timed_runs(&self, sql: &str, runs: u32, timeout_ms: u64) -> std::result::Result<(Vec<f64>, Vec<Row>), ExecutionError> {
        let mut timings = Vec::new();
        let mut last_rows = Vec::new();

        if runs >= 5 {
            for _ in 0..runs {
                let (elapsed, rows) = self.timed_execute(sql, timeout_ms).await?;
                timings.push(elapsed);
                last_rows = rows;
            }
        } else {
            let (_, rows) = self.timed_execute(sql, timeout_ms).await?; // warmup
            last_rows = rows;
            let measured = runs.saturating_sub(1).max(1);
            for _ in 0..measured {
                let (elapsed, rows) = self.timed_execute(sql, timeout_ms).await?;
                timings.push(elapsed);
                last_rows = rows;
            }
        }

        Ok((timings, last_rows))
    }

    fn trimmed_mean(timings: &[f64], runs: u32) -> f64 {
        if runs >= 5 && timings.len() >= 3 {
            let mut sorted = timings.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let middle = &sorted[1..sorted.len() - 1];
            middle.iter().sum::<f64>() / middle.len() as f64
        } else if timings.is_empty() {
            0.0
        } else {
            timings.iter().sum::<f64>() / timings.len() as f64
        }
    }

    pub async fn benchmark_baseline(&self, sql: &str, runs: u32, timeout_ms: u64) -> Baseline {
        match self.timed_runs(sql, runs, timeout_ms).await {
            Ok((timings, rows)) => {
                let time_ms = Self::trimmed_mean(&timings, runs);
                let checksum = Some(compute_checksum(&rows));
                Baseline {
                    time_ms,
                    row_count: rows.len(),
                    checksum,
                    rows: Some(rows),
                    explain_text: None,
                }
            }
            Err(ExecutionError::Timeout(timeout_ms)) => Baseline {
                time_ms: timeout_ms as f64,
                row_count: 0,
                checksum: None,
                rows: None,
                explain_text: None,
            },
            Err(_) => Baseline {
                time_ms: 0.0,
                row_count: 0,
                checksum: None,
                rows: None,
                explain_text: None,
            },
        }
    }

    pub async fn validate_against_baseline(
        &self,
        baseline: &Baseline,
        candidate_sql: &str,
        runs: u32,
        timeout_ms: u64,
    ) -> Verdict {
        if let Err(e) = self.parser.syntax_check(candidate_sql, self.dialect) {
            return Verdict::error(ErrorCategory::Syntax, vec![e.to_string()]);
        }

        match self.timed_runs(candidate_sql, runs, timeout_ms).await {
            Ok((timings, rows)) => {
                let time_ms = Self::trimmed_mean(&timings, runs);
                let row_count = rows.len();
                let mut errors = Vec::new();

                if !baseline.is_timeout_baseline() {
                    if row_count != baseline.row_count {
                        return Verdict::fail(
                            ErrorCategory::Semantic,
                            vec!["Row count mismatch".to_string()],
                        );
                    }
                    if let Some(expected) = &baseline.checksum {
                        let actual = compute_checksum(&rows);
                        if &actual != expected {
                            return Verdict::fail(
                                ErrorCategory::Semantic,
                                vec!["Checksum mismatch".to_string()],
                            );
                        }
                    }
                } else {
                    errors.push("accepted without row comparison".to_string());
                }

                if time_ms <= 0.0 {
                    return Verdict {
                        status: VerdictStatus::Error,
                        speedup: 0.0,
                        errors: vec!["non-positive measured time".to_string()],
                        error_category: Some(ErrorCategory::Execution),
                        explain_plan: None,
                    };
                }

                let speedup = baseline.time_ms / time_ms;
                Verdict {
                    status: bucket_speedup(speedup),
                    speedup,
                    errors,
                    error_category: None,
                    explain_plan: None,
                }
            }
            Err(e) => {
                let category = categorize_error(&e.to_string());
                Verdict::error(category, vec![e.to_string()])
            }
        }
    }

    /// Validates a candidate whose speedup was already measured elsewhere
    /// (e.g. a racing lane) — still syntax-checks and re-executes once to
    /// confirm row-count/checksum equivalence, but buckets on the
    /// supplied `speedup` rather than timing its own runs.
    pub async fn validate_with_known_speedup(&self, baseline: &Baseline, candidate_sql: &str, speedup: f64, timeout_ms: u64) -> Verdict {
        if let Err(e) = self.parser.syntax_check(candidate_sql, self.dialect) {
            return Verdict::error(ErrorCategory::Syntax, vec![e.to_string()]);
        }
        match self.timed_execute(candidate_sql, timeout_ms).await {
            Ok((_, rows)) => self.rows_verdict(baseline, rows, speedup),
            Err(e) => {
                let category = categorize_error(&e.to_string());
                Verdict::error(category, vec![e.to_string()])
            }
        }
    }

    /// Executes a candidate with a set of `SET LOCAL` commands applied
    /// first, timing the run itself (the config may change the plan
    /// enough that a plain `timed_execute` comparison is meaningless) and
    /// bucketing against `baseline` (§4.8 step 7, PostgreSQL only).
    pub async fn validate_with_config(&self, baseline: &Baseline, candidate_sql: &str, set_local_commands: &[String], timeout_ms: u64) -> Verdict {
        if let Err(e) = self.parser.syntax_check(candidate_sql, self.dialect) {
            return Verdict::error(ErrorCategory::Syntax, vec![e.to_string()]);
        }
        let start = Instant::now();
        match self.executor.execute_with_config(set_local_commands, candidate_sql, timeout_ms).await {
            Ok(rowset) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                let speedup = if elapsed_ms > 0.0 { baseline.time_ms / elapsed_ms } else { 0.0 };
                self.rows_verdict(baseline, rowset.rows, speedup)
            }
            Err(e) => {
                let category = categorize_error(&e.to_string());
                Verdict::error(category, vec![e.to_string()])
            }
        }
    }

    fn rows_verdict(&self, baseline: &Baseline, rows: Vec<Row>, speedup: f64) -> Verdict {
        let row_count = rows.len();
        let mut errors = Vec::new();

        if !baseline.is_timeout_baseline() {
            if row_count != baseline.row_count {
                return Verdict::fail(ErrorCategory::Semantic, vec!["Row count mismatch".to_string()]);
            }
            if let Some(expected) = &baseline.checksum {
                let actual = compute_checksum(&rows);
                if &actual != expected {
                    return Verdict::fail(ErrorCategory::Semantic, vec!["Checksum mismatch".to_string()]);
                }
            }
        } else {
            errors.push("accepted without row comparison".to_string());
        }

        if speedup <= 0.0 {
            return Verdict {
                status: VerdictStatus::Error,
                speedup: 0.0,
                errors: vec!["non-positive measured time".to_string()],
                error_category: Some(ErrorCategory::Execution),
                explain_plan: None,
            };
        }

        Verdict {
            status: bucket_speedup(speedup),
            speedup,
            errors,
            error_category: None,
            explain_plan: None,
        }
    }

    /// Parallel timed execution of original + candidates, bounded by
    /// `min_runtime_ms`. Returns `None` when the baseline lane's measured
    /// time falls below the gate (races of sub-2s queries are dominated
    /// by connection noise, per §4.7).
    pub async fn race(
        &self,
        original_sql: &str,
        candidates: &[(String, String)],
        min_runtime_ms: u64,
        soft_timeout_ms: u64,
    ) -> Option<RaceResult> {
        let mut lanes: Vec<(String, String)> = vec![("__original__".to_string(), original_sql.to_string())];
        lanes.extend(candidates.iter().cloned());

        let mut set = JoinSet::new();
        for (id, sql) in lanes.iter().cloned() {
            let executor = Arc::clone(&self.executor);
            set.spawn(async move {
                let start = Instant::now();
                let result = tokio::time::timeout(Duration::from_millis(soft_timeout_ms), executor.execute(&sql, soft_timeout_ms)).await;
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                (id, result.ok().and_then(|r| r.ok()).map(|_| elapsed))
            });
        }

        let mut collected: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((id, Some(elapsed))) = joined {
                collected.insert(id, elapsed);
            }
        }

        let baseline_time = *collected.get("__original__")?;
        if baseline_time < min_runtime_ms as f64 {
            return None;
        }

        let lane_timings: Vec<(String, f64)> = lanes
            .iter()
            .filter_map(|(id, _)| collected.get(id).map(|t| (id.clone(), *t)))
            .collect();

        let has_clear_winner = lane_timings
            .iter()
            .filter(|(id, _)| id != "__original__")
            .any(|(_, t)| baseline_time / t >= 1.05);

        Some(RaceResult {
            lane_timings,
            has_clear_winner,
        })
    }

    /// DuckDB-only `EXPLAIN` (not `ANALYZE`) cost pre-screen: keep the
    /// `top_k` lowest-cost candidates for full timed validation.
    pub async fn cost_rank(&self, candidates: &[(String, String)], top_k: usize) -> Vec<usize> {
        let mut costs = Vec::with_capacity(candidates.len());
        for (idx, (_, sql)) in candidates.iter().enumerate() {
            let cost = match self.executor.explain(sql, false, crate::config::EXPLAIN_TIMEOUT_MS).await {
                Ok(plan_json) => estimate_explain_cost(&plan_json),
                Err(_) => f64::MAX,
            };
            costs.push((idx, cost));
        }
        costs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        costs.into_iter().take(top_k).map(|(idx, _)| idx).collect()
    }
}

fn estimate_explain_cost(plan_json: &serde_json::Value) -> f64 {
    let node = crate::plan_signals::normalize_duckdb(plan_json);
    sum_rows(&node)
}

fn sum_rows(node: &crate::plan_signals::PlanNode) -> f64 {
    node.rows as f64 + node.children.iter().map(sum_rows).sum::<f64>()
}

impl From<LlmError> for ErrorCategory {
    fn from(_: LlmError) -> Self {
        ErrorCategory::Execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_invariant_under_row_permutation() {
        let a = vec![
            Row::new(vec![crate::sql_executor::Value::Integer(1)]),
            Row::new(vec![crate::sql_executor::Value::Integer(2)]),
        ];
        let b = vec![
            Row::new(vec![crate::sql_executor::Value::Integer(2)]),
            Row::new(vec![crate::sql_executor::Value::Integer(1)]),
        ];
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn checksum_differs_on_value_change() {
        let a = vec![Row::new(vec![crate::sql_executor::Value::Integer(1)])];
        let b = vec![Row::new(vec![crate::sql_executor::Value::Integer(2)])];
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn bucket_boundaries_match_spec() {
        assert_eq!(bucket_speedup(1.10), VerdictStatus::Win);
        assert_eq!(bucket_speedup(1.05), VerdictStatus::Improved);
        assert_eq!(bucket_speedup(0.95), VerdictStatus::Neutral);
        assert_eq!(bucket_speedup(0.94), VerdictStatus::Regression);
    }

    #[test]
    fn error_categorization_follows_priority_order() {
        assert_eq!(categorize_error("Syntax error near SELECT"), ErrorCategory::Syntax);
        assert_eq!(categorize_error("row count mismatch"), ErrorCategory::Semantic);
        assert_eq!(categorize_error("query timed out"), ErrorCategory::Timeout);
        assert_eq!(categorize_error("execution failed"), ErrorCategory::Execution);
        assert_eq!(categorize_error("bizarre thing happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn trimmed_mean_drops_exactly_min_and_max() {
        let timings = vec![10.0, 100.0, 20.0, 30.0, 40.0];
        let mean = Validator::trimmed_mean(&timings, 5);
        // sorted: 10,20,30,40,100 -> middle 20,30,40 -> mean 30
        assert!((mean - 30.0).abs() < 1e-9);
    }

    // §8 scenario 4 (semantic mismatch) and scenario 6 (timeout baseline),
    // exercised end-to-end against a stub `SqlExecutor` rather than as
    // pure-function assertions.
    mod stub_executor_scenarios {
        use super::*;
        use crate::sql_executor::{RowSet, Value};
        use crate::sql_parser::SqlparserBackend;
        use async_trait::async_trait;

        struct ScriptedExecutor {
            /// sql text -> (rows, optional injected failure)
            behavior: fn(&str) -> std::result::Result<Vec<i64>, ExecutionError>,
        }

        #[async_trait]
        impl SqlExecutor for ScriptedExecutor {
            async fn execute(&self, sql: &str, _timeout_ms: u64) -> crate::sql_executor::Result<RowSet> {
                // A few microseconds of real delay keeps measured time_ms
                // strictly positive without depending on a coarse clock.
                tokio::time::sleep(Duration::from_millis(5)).await;
                let values = (self.behavior)(sql)?;
                Ok(RowSet {
                    rows: values.into_iter().map(|v| Row::new(vec![Value::Integer(v)])).collect(),
                })
            }

            async fn execute_with_config(&self, _set_local_commands: &[String], sql: &str, timeout_ms: u64) -> crate::sql_executor::Result<RowSet> {
                self.execute(sql, timeout_ms).await
            }

            async fn explain(&self, _sql: &str, _analyze: bool, _timeout_ms: u64) -> crate::sql_executor::Result<serde_json::Value> {
                Ok(serde_json::json!({"operator_name": "SEQ_SCAN", "operator_timing": 0.0, "children": []}))
            }

            async fn rollback(&self) -> crate::sql_executor::Result<()> {
                Ok(())
            }

            async fn close(&self) -> crate::sql_executor::Result<()> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn semantic_mismatch_yields_fail_with_checksum_note() {
            let executor = Arc::new(ScriptedExecutor {
                behavior: |sql| {
                    if sql.contains("CANDIDATE") {
                        Ok(vec![99])
                    } else {
                        Ok(vec![42])
                    }
                },
            });
            let validator = Validator::new(executor, Arc::new(SqlparserBackend), SqlDialect::DuckDb);
            let baseline = validator.benchmark_baseline("SELECT 1 AS ORIGINAL", 3, 5_000).await;
            assert_eq!(baseline.row_count, 1);

            let verdict = validator.validate_against_baseline(&baseline, "SELECT 1 AS CANDIDATE", 3, 5_000).await;
            assert_eq!(verdict.status, VerdictStatus::Fail);
            assert_eq!(verdict.error_category, Some(ErrorCategory::Semantic));
            assert_eq!(verdict.speedup, 0.0);
            assert!(verdict.errors.iter().any(|e| e.contains("Checksum mismatch")));
        }

        #[tokio::test]
        async fn timeout_baseline_accepts_fast_candidate_without_row_comparison() {
            let executor = Arc::new(ScriptedExecutor {
                behavior: |sql| {
                    if sql.contains("SLOW") {
                        Err(ExecutionError::Timeout(300_000))
                    } else {
                        Ok(vec![1; 50])
                    }
                },
            });
            let validator = Validator::new(executor, Arc::new(SqlparserBackend), SqlDialect::DuckDb);
            let baseline = validator.benchmark_baseline("SELECT * FROM SLOW", 3, 300_000).await;
            assert_eq!(baseline.time_ms, 300_000.0);
            assert_eq!(baseline.row_count, 0);
            assert!(baseline.checksum.is_none());

            let verdict = validator.validate_against_baseline(&baseline, "SELECT * FROM FAST", 3, 300_000).await;
            assert_ne!(verdict.status, VerdictStatus::Fail);
            assert_ne!(verdict.status, VerdictStatus::Error);
            assert!(verdict.speedup > 1.0);
            assert!(verdict.errors.iter().any(|e| e.contains("accepted without row comparison")));
        }

        #[tokio::test]
        async fn timeout_baseline_candidate_still_errors_on_failure() {
            let executor = Arc::new(ScriptedExecutor {
                behavior: |sql| {
                    if sql.contains("SLOW") {
                        Err(ExecutionError::Timeout(300_000))
                    } else {
                        Err(ExecutionError::Failed("downstream engine rejected the rewrite".to_string()))
                    }
                },
            });
            let validator = Validator::new(executor, Arc::new(SqlparserBackend), SqlDialect::DuckDb);
            let baseline = validator.benchmark_baseline("SELECT * FROM SLOW", 3, 300_000).await;

            let verdict = validator.validate_against_baseline(&baseline, "SELECT * FROM BROKEN", 3, 300_000).await;
            assert_eq!(verdict.status, VerdictStatus::Error);
            assert_eq!(verdict.speedup, 0.0);
        }
    }
}
