//! Plan-Space Scanner (C5, PostgreSQL only).
//!
//! Probes the planner's sensitivity to `SET LOCAL` configuration by
//! running a fixed catalog of 22 named combos (SPEC_FULL §4.5 expansion)
//! against the query under three modes: `wall_clock` (real timing),
//! `explain_only` (cost-estimate proxy, validated against a wall-clock
//! sample via Pearson correlation), and `explore` (structural
//! fingerprinting + vulnerability classification).

use crate::plan_signals::{self, PlanNode};
use crate::sql_executor::{ExecutionError, SqlExecutor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("executor error: {0}")]
    Executor(#[from] ExecutionError),
    #[error("scan produced no usable EXPLAIN output")]
    NoPlanData,
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    WallClock,
    ExplainOnly,
    Explore,
}

pub struct Combo {
    pub name: &'static str,
    pub set_local: &'static [&'static str],
}

/// The 22-entry combo catalog (SPEC_FULL §4.5 expansion — the original
/// `PLAN_SPACE_COMBOS` table; spec.md's "~17" is an approximation, the
/// original's count is the authority).
pub const COMBOS: &[Combo] = &[
    Combo { name: "no_nestloop", set_local: &["SET LOCAL enable_nestloop = off"] },
    Combo { name: "no_hashjoin", set_local: &["SET LOCAL enable_hashjoin = off"] },
    Combo { name: "no_mergejoin", set_local: &["SET LOCAL enable_mergejoin = off"] },
    Combo { name: "no_seqscan", set_local: &["SET LOCAL enable_seqscan = off"] },
    Combo { name: "force_hash", set_local: &["SET LOCAL enable_nestloop = off", "SET LOCAL enable_mergejoin = off"] },
    Combo { name: "force_merge", set_local: &["SET LOCAL enable_nestloop = off", "SET LOCAL enable_hashjoin = off"] },
    Combo { name: "force_nestloop", set_local: &["SET LOCAL enable_hashjoin = off", "SET LOCAL enable_mergejoin = off"] },
    Combo { name: "work_mem_256mb", set_local: &["SET LOCAL work_mem = '256MB'"] },
    Combo { name: "work_mem_1gb", set_local: &["SET LOCAL work_mem = '1GB'"] },
    Combo { name: "work_mem_2gb", set_local: &["SET LOCAL work_mem = '2GB'"] },
    Combo { name: "no_jit", set_local: &["SET LOCAL jit = off"] },
    Combo { name: "no_parallel", set_local: &["SET LOCAL max_parallel_workers_per_gather = 0"] },
    Combo { name: "max_parallel", set_local: &["SET LOCAL max_parallel_workers_per_gather = 8"] },
    Combo { name: "no_reorder", set_local: &["SET LOCAL join_collapse_limit = 1"] },
    Combo { name: "max_reorder", set_local: &["SET LOCAL join_collapse_limit = 20"] },
    Combo { name: "ssd_costs", set_local: &["SET LOCAL random_page_cost = 1.1", "SET LOCAL effective_io_concurrency = 200"] },
    Combo {
        name: "ssd_plus_mem",
        set_local: &["SET LOCAL random_page_cost = 1.1", "SET LOCAL effective_io_concurrency = 200", "SET LOCAL work_mem = '1GB'"],
    },
    Combo { name: "jit_off_mem_256mb", set_local: &["SET LOCAL jit = off", "SET LOCAL work_mem = '256MB'"] },
    Combo {
        name: "jit_off_no_parallel",
        set_local: &["SET LOCAL jit = off", "SET LOCAL max_parallel_workers_per_gather = 0"],
    },
    Combo {
        name: "mem_256mb_max_par",
        set_local: &["SET LOCAL work_mem = '256MB'", "SET LOCAL max_parallel_workers_per_gather = 8"],
    },
    Combo {
        name: "no_reorder_mem_256mb",
        set_local: &["SET LOCAL join_collapse_limit = 1", "SET LOCAL work_mem = '256MB'"],
    },
    Combo {
        name: "ssd_no_jit",
        set_local: &["SET LOCAL random_page_cost = 1.1", "SET LOCAL effective_io_concurrency = 200", "SET LOCAL jit = off"],
    },
];

fn set_local_vec(combo: &Combo) -> Vec<String> {
    combo.set_local.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboResult {
    pub name: String,
    pub plan_root_node_type: Option<String>,
    pub speedup: Option<f64>,
    pub proxy_speedup: Option<f64>,
    pub row_count_parity: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VulnerabilityKind {
    JoinTypeTrap,
    JoinOrderTrap,
    ScanTypeTrap,
    ParallelismGap,
    MemorySensitivity,
    CostModelOnly,
    PlanLocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub kind: VulnerabilityKind,
    pub combos: Vec<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub baseline_ms: f64,
    pub ceiling_speedup: f64,
    pub ceiling_combo: Option<String>,
    pub combos: Vec<ComboResult>,
    pub vulnerabilities: Vec<Vulnerability>,
    pub bottleneck_joins: Vec<String>,
    pub scan_counts: HashMap<String, u64>,
    pub predicate_placement: Vec<String>,
    /// Set only in `explain_only` mode when a wall-clock reference sample
    /// was supplied: whether the cost-estimate proxy correlated with real
    /// timings at Pearson r >= 0.80.
    pub proxy_validated: Option<bool>,
}

pub struct PlanScanner {
    executor: Arc<dyn SqlExecutor>,
}

impl PlanScanner {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    async fn timed_execute(&self, sql: &str, timeout_ms: u64) -> Result<(f64, usize)> {
        let start = Instant::now();
        let rowset = self.executor.execute(sql, timeout_ms).await?;
        Ok((start.elapsed().as_secs_f64() * 1000.0, rowset.row_count()))
    }

    async fn timed_execute_with_config(&self, combo: &Combo, sql: &str, timeout_ms: u64) -> Result<(f64, usize)> {
        let start = Instant::now();
        let rowset = self
            .executor
            .execute_with_config(&set_local_vec(combo), sql, timeout_ms)
            .await?;
        Ok((start.elapsed().as_secs_f64() * 1000.0, rowset.row_count()))
    }

    async fn explain_plan(&self, sql: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        self.executor.explain(sql, false, timeout_ms).await.map_err(ScanError::from)
    }

    async fn explain_plan_with_config(&self, combo: &Combo, sql: &str, timeout_ms: u64) -> Result<serde_json::Value> {
        let explain_sql = format!("EXPLAIN (FORMAT JSON, COSTS) {sql}");
        let rowset = self
            .executor
            .execute_with_config(&set_local_vec(combo), &explain_sql, timeout_ms)
            .await?;
        let first = rowset
            .rows
            .first()
            .and_then(|row| row.values.first())
            .ok_or(ScanError::NoPlanData)?;
        match first {
            crate::sql_executor::Value::String(text) => {
                serde_json::from_str(text).map_err(|_| ScanError::NoPlanData)
            }
            _ => Err(ScanError::NoPlanData),
        }
    }

    pub async fn scan_query(
        &self,
        sql: &str,
        mode: ScanMode,
        timeout_ms: u64,
        wall_clock_reference: Option<&[(String, f64)]>,
    ) -> Result<ScanResult> {
        match mode {
            ScanMode::WallClock => self.scan_wall_clock(sql, timeout_ms).await,
            ScanMode::ExplainOnly => self.scan_explain_only(sql, timeout_ms, wall_clock_reference).await,
            ScanMode::Explore => self.scan_explore(sql, timeout_ms).await,
        }
    }

    async fn scan_wall_clock(&self, sql: &str, timeout_ms: u64) -> Result<ScanResult> {
        let mut combos = Vec::with_capacity(COMBOS.len());
        let mut baseline_samples = Vec::new();

        for combo in COMBOS {
            let plan_root = self
                .explain_plan_with_config(combo, sql, timeout_ms)
                .await
                .ok()
                .map(|json| plan_signals::normalize_postgres(plan_signals::unwrap_postgres_root(&json)).name);

            let result = async {
                let (_warm_orig_ms, _) = self.timed_execute(sql, timeout_ms).await?;
                let (_warm_cfg_ms, _) = self.timed_execute_with_config(combo, sql, timeout_ms).await?;
                let (meas_orig_ms, orig_rows) = self.timed_execute(sql, timeout_ms).await?;
                let (meas_cfg_ms, cfg_rows) = self.timed_execute_with_config(combo, sql, timeout_ms).await?;
                Result::Ok((meas_orig_ms, meas_cfg_ms, orig_rows == cfg_rows))
            }
            .await;

            match result {
                Ok((orig_ms, cfg_ms, parity)) => {
                    baseline_samples.push(orig_ms);
                    let speedup = if cfg_ms > 0.0 { Some(orig_ms / cfg_ms) } else { None };
                    combos.push(ComboResult {
                        name: combo.name.to_string(),
                        plan_root_node_type: plan_root,
                        speedup,
                        proxy_speedup: None,
                        row_count_parity: Some(parity),
                        error: None,
                    });
                }
                Err(e) => {
                    let _ = self.executor.rollback().await;
                    combos.push(ComboResult {
                        name: combo.name.to_string(),
                        plan_root_node_type: plan_root,
                        speedup: None,
                        proxy_speedup: None,
                        row_count_parity: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let baseline_ms = if baseline_samples.is_empty() {
            0.0
        } else {
            baseline_samples.iter().sum::<f64>() / baseline_samples.len() as f64
        };

        Ok(self.finish_scan_result(baseline_ms, combos, sql, timeout_ms).await)
    }

    async fn scan_explain_only(
        &self,
        sql: &str,
        timeout_ms: u64,
        wall_clock_reference: Option<&[(String, f64)]>,
    ) -> Result<ScanResult> {
        let baseline_plan = self.explain_plan(sql, timeout_ms).await?;
        let baseline_cost = estimate_total_cost(&baseline_plan);

        let mut combos = Vec::with_capacity(COMBOS.len());
        for combo in COMBOS {
            let plan = self.explain_plan_with_config(combo, sql, timeout_ms).await;
            match plan {
                Ok(plan_json) => {
                    let cost = estimate_total_cost(&plan_json);
                    let proxy_speedup = if cost > 0.0 { Some(baseline_cost / cost) } else { None };
                    let plan_root = plan_signals::normalize_postgres(plan_signals::unwrap_postgres_root(&plan_json)).name;
                    combos.push(ComboResult {
                        name: combo.name.to_string(),
                        plan_root_node_type: Some(plan_root),
                        speedup: None,
                        proxy_speedup,
                        row_count_parity: None,
                        error: None,
                    });
                }
                Err(e) => combos.push(ComboResult {
                    name: combo.name.to_string(),
                    plan_root_node_type: None,
                    speedup: None,
                    proxy_speedup: None,
                    row_count_parity: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let proxy_validated = wall_clock_reference.map(|reference| {
            let paired: Vec<(f64, f64)> = reference
                .iter()
                .filter_map(|(name, wall_ms)| {
                    combos
                        .iter()
                        .find(|c| &c.name == name)
                        .and_then(|c| c.proxy_speedup)
                        .map(|proxy| (*wall_ms, proxy))
                })
                .collect();
            if paired.len() < 2 {
                false
            } else {
                let xs: Vec<f64> = paired.iter().map(|(a, _)| *a).collect();
                let ys: Vec<f64> = paired.iter().map(|(_, b)| *b).collect();
                pearson_correlation(&xs, &ys) >= 0.80
            }
        });

        let mut result = self.finish_scan_result(baseline_cost, combos, sql, timeout_ms).await;
        result.proxy_validated = proxy_validated;
        Ok(result)
    }

    async fn scan_explore(&self, sql: &str, timeout_ms: u64) -> Result<ScanResult> {
        let baseline_plan = self.explain_plan(sql, timeout_ms).await?;
        let baseline_node = plan_signals::normalize_postgres(plan_signals::unwrap_postgres_root(&baseline_plan));
        let baseline_fingerprint = fingerprint(&baseline_node);

        let mut fingerprints: HashMap<String, String> = HashMap::new();
        let mut combos = Vec::with_capacity(COMBOS.len());

        for combo in COMBOS {
            match self.explain_plan_with_config(combo, sql, timeout_ms).await {
                Ok(plan_json) => {
                    let node = plan_signals::normalize_postgres(plan_signals::unwrap_postgres_root(&plan_json));
                    let fp = fingerprint(&node);
                    fingerprints.insert(combo.name.to_string(), fp);
                    combos.push(ComboResult {
                        name: combo.name.to_string(),
                        plan_root_node_type: Some(node.name),
                        speedup: None,
                        proxy_speedup: None,
                        row_count_parity: None,
                        error: None,
                    });
                }
                Err(e) => combos.push(ComboResult {
                    name: combo.name.to_string(),
                    plan_root_node_type: None,
                    speedup: None,
                    proxy_speedup: None,
                    row_count_parity: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let vulnerabilities = classify_vulnerabilities(&baseline_fingerprint, &fingerprints);
        let mut result = self.finish_scan_result(0.0, combos, sql, timeout_ms).await;
        result.vulnerabilities = vulnerabilities;
        Ok(result)
    }

    async fn finish_scan_result(&self, baseline_ms: f64, combos: Vec<ComboResult>, _sql: &str, _timeout_ms: u64) -> ScanResult {
        let (ceiling_combo, ceiling_speedup) = combos
            .iter()
            .filter_map(|c| c.speedup.or(c.proxy_speedup).map(|s| (c.name.clone(), s)))
            .fold((None, 1.0_f64), |(best_name, best), (name, speedup)| {
                if speedup > best {
                    (Some(name), speedup)
                } else {
                    (best_name, best)
                }
            });

        ScanResult {
            baseline_ms,
            ceiling_speedup,
            ceiling_combo,
            combos,
            vulnerabilities: Vec::new(),
            bottleneck_joins: Vec::new(),
            scan_counts: HashMap::new(),
            predicate_placement: Vec::new(),
            proxy_validated: None,
        }
    }
}

fn estimate_total_cost(plan_json: &serde_json::Value) -> f64 {
    let root = plan_signals::unwrap_postgres_root(plan_json);
    root.get("Total Cost").and_then(serde_json::Value::as_f64).unwrap_or(0.0)
}

fn fingerprint(node: &PlanNode) -> String {
    let table = node
        .extras
        .get("relation_name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let children: Vec<String> = node.children.iter().map(fingerprint).collect();
    format!("{}[{}]({})", node.name, table, children.join(","))
}

fn pearson_correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

const JOIN_TYPE_COMBOS: &[&str] = &["no_nestloop", "no_hashjoin", "no_mergejoin", "force_hash", "force_merge", "force_nestloop"];
const JOIN_ORDER_COMBOS: &[&str] = &["no_reorder", "max_reorder", "no_reorder_mem_256mb"];
const SCAN_TYPE_COMBOS: &[&str] = &["no_seqscan"];
const PARALLELISM_COMBOS: &[&str] = &["no_parallel", "max_parallel", "jit_off_no_parallel", "mem_256mb_max_par"];
const MEMORY_COMBOS: &[&str] = &["work_mem_256mb", "work_mem_1gb", "work_mem_2gb", "jit_off_mem_256mb", "no_reorder_mem_256mb"];
const COST_MODEL_COMBOS: &[&str] = &["ssd_costs", "ssd_plus_mem", "ssd_no_jit"];

fn classify_vulnerabilities(baseline_fingerprint: &str, fingerprints: &HashMap<String, String>) -> Vec<Vulnerability> {
    let mut out = Vec::new();
    let changed = |names: &[&str]| -> Vec<String> {
        names
            .iter()
            .filter(|n| fingerprints.get(**n).map(|fp| fp != baseline_fingerprint).unwrap_or(false))
            .map(|s| s.to_string())
            .collect()
    };

    let join_type_changed = changed(JOIN_TYPE_COMBOS);
    if !join_type_changed.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::JoinTypeTrap,
            combos: join_type_changed,
            detail: "join-type hints change the chosen plan".to_string(),
        });
    }

    let join_order_changed = changed(JOIN_ORDER_COMBOS);
    if !join_order_changed.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::JoinOrderTrap,
            combos: join_order_changed,
            detail: "join_collapse_limit changes join ordering".to_string(),
        });
    }

    let scan_type_changed = changed(SCAN_TYPE_COMBOS);
    if !scan_type_changed.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::ScanTypeTrap,
            combos: scan_type_changed,
            detail: "disabling seqscan changes the chosen access path".to_string(),
        });
    }

    let parallelism_changed = changed(PARALLELISM_COMBOS);
    if !parallelism_changed.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::ParallelismGap,
            combos: parallelism_changed,
            detail: "parallel worker settings change the plan shape".to_string(),
        });
    }

    let memory_changed = changed(MEMORY_COMBOS);
    if !memory_changed.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::MemorySensitivity,
            combos: memory_changed,
            detail: "work_mem changes the chosen plan (spill risk)".to_string(),
        });
    }

    let cost_model_changed = changed(COST_MODEL_COMBOS);
    let cost_model_unchanged: Vec<String> = COST_MODEL_COMBOS
        .iter()
        .filter(|n| !cost_model_changed.contains(&n.to_string()))
        .map(|s| s.to_string())
        .collect();
    if !cost_model_unchanged.is_empty() {
        out.push(Vulnerability {
            kind: VulnerabilityKind::CostModelOnly,
            combos: cost_model_unchanged,
            detail: "storage-cost hints affect estimates only, no plan change".to_string(),
        });
    }

    if fingerprints.values().all(|fp| fp == baseline_fingerprint) {
        out.push(Vulnerability {
            kind: VulnerabilityKind::PlanLocked,
            combos: fingerprints.keys().cloned().collect(),
            detail: "planner selects the same plan regardless of hints".to_string(),
        });
    }

    out
}

fn combo_speedup(result: &ScanResult, name: &str) -> Option<f64> {
    result.combos.iter().find(|c| c.name == name).and_then(|c| c.speedup)
}

/// Expands a combo's `SET LOCAL key = value` statements into the terse
/// `key=value, key=value` form the analyst prompt expects (§4.5 Output).
fn config_str_for_combo(name: &str) -> String {
    COMBOS
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.set_local.iter().map(|s| parse_set_local_stmt(s)).collect::<Vec<_>>().join(", "))
        .unwrap_or_default()
}

fn parse_set_local_stmt(stmt: &str) -> String {
    let rest = stmt.trim_start_matches("SET LOCAL ").trim();
    let mut parts = rest.splitn(2, '=');
    let key = parts.next().unwrap_or("").trim();
    let value = parts.next().unwrap_or("").trim().trim_matches('\'');
    format!("{key}={value}")
}

fn ceiling_tag(ceiling_speedup: f64) -> &'static str {
    if ceiling_speedup >= 1.50 {
        "HIGH"
    } else if ceiling_speedup >= 1.10 {
        "LOW"
    } else {
        "NONE"
    }
}

/// Classifies join-method sensitivity from the combo sweep (mirrors
/// `plan_scanner.py`'s `_analyze_joins`), returning the `JOINS:` line text
/// and the companion strategy recommendation.
fn analyze_joins(result: &ScanResult) -> (String, String) {
    let force_hash = combo_speedup(result, "force_hash");
    let force_merge = combo_speedup(result, "force_merge");
    let force_nl = combo_speedup(result, "force_nestloop");
    let no_nl = combo_speedup(result, "no_nestloop");
    let no_hj = combo_speedup(result, "no_hashjoin");
    let no_mj = combo_speedup(result, "no_mergejoin");

    let catastrophic = |s: Option<f64>| s.map(|v| v < 0.10).unwrap_or(false);
    let nl_critical = catastrophic(no_nl) || catastrophic(force_hash);
    let hj_critical = catastrophic(no_hj) || catastrophic(force_nl);

    let best_join = [force_hash, force_merge, force_nl, no_nl, no_hj, no_mj]
        .into_iter()
        .flatten()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))));
    let join_win = best_join.map(|b| b >= 1.10).unwrap_or(false);

    if nl_critical && !join_win {
        ("LOCKED on nested loops".to_string(), "reduce nested-loop inner side".to_string())
    } else if hj_critical && !join_win {
        ("LOCKED on hash joins".to_string(), "reduce hash-build side cardinality".to_string())
    } else if join_win {
        (
            format!("SENSITIVE — join method change gives {:.2}x", best_join.unwrap_or(1.0)),
            "rewrite SQL toward the faster join strategy".to_string(),
        )
    } else {
        ("stable".to_string(), "no join-method lever available".to_string())
    }
}

/// Classifies memory sensitivity from the combo sweep (mirrors
/// `plan_scanner.py`'s `_analyze_memory`).
fn analyze_memory(result: &ScanResult) -> String {
    let mem256 = combo_speedup(result, "work_mem_256mb");
    let mem1g = combo_speedup(result, "work_mem_1gb");
    let mem2g = combo_speedup(result, "work_mem_2gb");
    let ssd_mem = combo_speedup(result, "ssd_plus_mem");

    let best = [mem256, mem1g, mem2g, ssd_mem]
        .into_iter()
        .flatten()
        .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))));

    match best {
        None => "no data".to_string(),
        Some(b) if b >= 1.50 => format!("HIGH impact — {b:.2}x, likely spilling to disk"),
        Some(b) if b >= 1.10 => format!("MODERATE — {b:.2}x, some spill benefit"),
        Some(b) => format!("minor ({b:.2}x), no significant spill"),
    }
}

/// Terse multi-line prompt rendering (§4.5 Output, §8 scenario 5).
pub fn render_for_prompt(result: &ScanResult) -> String {
    let mut lines = Vec::new();

    match &result.ceiling_combo {
        Some(combo_name) => {
            let config_str = config_str_for_combo(combo_name);
            let tag = ceiling_tag(result.ceiling_speedup);
            if config_str.is_empty() {
                lines.push(format!("CONFIG_CEILING: {:.2}x — {tag}", result.ceiling_speedup));
            } else {
                lines.push(format!("CONFIG_CEILING: {:.2}x ({config_str}) — {tag}", result.ceiling_speedup));
            }
        }
        None => lines.push("CONFIG_CEILING: none found".to_string()),
    }

    let (joins_text, joins_strategy) = analyze_joins(result);
    lines.push(format!("JOINS: {joins_text}"));
    lines.push(format!("MEMORY: {}", analyze_memory(result)));

    let strategy = if joins_text.starts_with("LOCKED") || joins_text.starts_with("SENSITIVE") {
        joins_strategy
    } else if let Some(combo) = &result.ceiling_combo {
        format!("apply the {combo} configuration before measuring further rewrites")
    } else {
        "no clear lever identified".to_string()
    };
    lines.push(format!("STRATEGY: {strategy}"));

    if let Some(combo_name) = &result.ceiling_combo {
        if let Some(combo) = COMBOS.iter().find(|c| c.name == combo_name) {
            lines.push(format!("SET LOCAL: {}", combo.set_local.join("; ")));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combo_catalog_has_exactly_twenty_two_entries() {
        assert_eq!(COMBOS.len(), 22);
    }

    #[test]
    fn combo_names_are_unique() {
        let mut names: Vec<&str> = COMBOS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COMBOS.len());
    }

    #[test]
    fn pearson_correlation_is_one_for_identical_sequences() {
        let xs = vec![1.0, 2.0, 3.0, 4.0];
        let ys = vec![2.0, 4.0, 6.0, 8.0];
        assert!((pearson_correlation(&xs, &ys) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pearson_correlation_is_zero_for_constant_series() {
        let xs = vec![1.0, 1.0, 1.0];
        let ys = vec![2.0, 4.0, 6.0];
        assert_eq!(pearson_correlation(&xs, &ys), 0.0);
    }

    #[test]
    fn plan_locked_when_every_combo_matches_baseline() {
        let mut fingerprints = HashMap::new();
        for combo in COMBOS {
            fingerprints.insert(combo.name.to_string(), "SeqScan[orders]()".to_string());
        }
        let vulns = classify_vulnerabilities("SeqScan[orders]()", &fingerprints);
        assert!(vulns.iter().any(|v| v.kind == VulnerabilityKind::PlanLocked));
    }

    #[test]
    fn join_type_trap_detected_when_join_combo_changes_fingerprint() {
        let mut fingerprints = HashMap::new();
        for combo in COMBOS {
            fingerprints.insert(combo.name.to_string(), "HashJoin[](SeqScan[a](),SeqScan[b]())".to_string());
        }
        fingerprints.insert("no_hashjoin".to_string(), "NestedLoop[](SeqScan[a](),SeqScan[b]())".to_string());
        let vulns = classify_vulnerabilities("HashJoin[](SeqScan[a](),SeqScan[b]())", &fingerprints);
        let join_trap = vulns.iter().find(|v| v.kind == VulnerabilityKind::JoinTypeTrap).unwrap();
        assert!(join_trap.combos.contains(&"no_hashjoin".to_string()));
    }

    /// §8 scenario 5: a `force_hash` ceiling combo plus a catastrophic
    /// `no_nestloop` regression must render the exact headline strings the
    /// snipe/analyst prompts are built from.
    #[test]
    fn render_for_prompt_matches_scenario_five_headline() {
        let result = ScanResult {
            baseline_ms: 100.0,
            ceiling_speedup: 3.0,
            ceiling_combo: Some("force_hash".to_string()),
            combos: vec![
                ComboResult {
                    name: "force_hash".to_string(),
                    plan_root_node_type: Some("HASH_JOIN".to_string()),
                    speedup: Some(3.0),
                    proxy_speedup: None,
                    row_count_parity: Some(true),
                    error: None,
                },
                ComboResult {
                    name: "no_nestloop".to_string(),
                    plan_root_node_type: Some("HASH_JOIN".to_string()),
                    speedup: Some(0.05),
                    proxy_speedup: None,
                    row_count_parity: Some(true),
                    error: None,
                },
            ],
            vulnerabilities: vec![],
            bottleneck_joins: vec![],
            scan_counts: HashMap::new(),
            predicate_placement: vec![],
            proxy_validated: None,
        };
        let rendered = render_for_prompt(&result);
        assert!(rendered.contains("CONFIG_CEILING: 3.00x (enable_nestloop=off, enable_mergejoin=off) — HIGH"));
        assert!(rendered.contains("JOINS: LOCKED on nested loops"));
        assert!(rendered.contains("MEMORY:"));
        assert!(rendered.contains("STRATEGY: reduce nested-loop inner side"));
    }
}
