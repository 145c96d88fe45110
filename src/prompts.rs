//! Prompt construction and response parsing for the Beam Orchestrator
//! (C8). Every string the core sends to the LLM invoker, and every
//! structural parse of what comes back, lives here — `orchestrator`
//! never builds prompt text inline.
//!
//! The analyst response is requested as a single fenced ```json block
//! containing `{shared: {...}, workers: [...]}`; worker/sniper responses
//! are requested as a fenced ```sql block optionally preceded by a
//! `TRANSFORMS: a, b, c` line. This mirrors the original's "ask for a
//! structured block, parse defensively, never fabricate" approach
//! (`prompter.py`) while giving the parser a single format to target
//! instead of several bespoke regexes per field.

use crate::context::Context;
use crate::knowledge::{render_constraints_for_prompt, Example};
use crate::logical_tree::LogicalTree;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BriefingError {
    #[error("analyst response contained no ```json block")]
    NoJsonBlock,
    #[error("analyst response JSON was malformed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BriefingError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedBriefing {
    pub semantic_contract: String,
    pub bottleneck_diagnosis: String,
    pub active_constraints: String,
    pub regression_warnings: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBriefing {
    pub worker_id: u32,
    pub strategy: String,
    pub examples: Vec<String>,
    pub hazard_flags: Vec<String>,
    pub example_reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedBriefing {
    pub shared: SharedBriefing,
    pub workers: Vec<WorkerBriefing>,
}

/// Structural validation (§4.8 step 4): shared section non-empty, every
/// worker has a non-empty strategy and a non-empty example list. Returns
/// the list of issues found rather than stopping at the first one, so
/// the orchestrator can log all of them before aborting the iteration.
pub fn validate_parsed_briefing(briefing: &ParsedBriefing) -> Vec<String> {
    let mut issues = Vec::new();
    if briefing.shared.semantic_contract.trim().is_empty() {
        issues.push("shared.semantic_contract is empty".to_string());
    }
    if briefing.shared.bottleneck_diagnosis.trim().is_empty() {
        issues.push("shared.bottleneck_diagnosis is empty".to_string());
    }
    if briefing.workers.is_empty() {
        issues.push("no worker briefings present".to_string());
    }
    for w in &briefing.workers {
        if w.strategy.trim().is_empty() {
            issues.push(format!("worker {} has empty strategy", w.worker_id));
        }
        if w.examples.is_empty() {
            issues.push(format!("worker {} has no examples", w.worker_id));
        }
    }
    issues
}

fn extract_fenced_block<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let fence = format!("```{lang}");
    let start = text.find(&fence)? + fence.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Falls back to the first bare fenced block if the response omits the
/// `sql`/`json` language tag — analysts are inconsistent about this in
/// practice.
fn extract_fenced_block_lenient<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    extract_fenced_block(text, lang).or_else(|| {
        let start = text.find("```")? + 3;
        let rest = &text[start..];
        let rest = rest.trim_start_matches(|c: char| c.is_alphanumeric());
        let end = rest.find("```")?;
        Some(rest[..end].trim())
    })
}

pub fn parse_briefing_response(response: &str) -> Result<ParsedBriefing> {
    let block = extract_fenced_block_lenient(response, "json").ok_or(BriefingError::NoJsonBlock)?;
    Ok(serde_json::from_str(block)?)
}

#[derive(Debug, Clone, Default)]
pub struct ParsedCandidate {
    pub optimized_sql: String,
    pub transforms: Vec<String>,
    pub set_local_commands: Vec<String>,
}

/// Extracts the rewritten SQL and any `TRANSFORMS:`/`SET LOCAL` lines
/// from a worker or sniper response. Falls back to the raw response text
/// (trimmed) when no fenced block is present — the caller still runs it
/// through a syntax check and falls back further to the original SQL on
/// failure (§4.8 step 5).
pub fn parse_candidate_response(response: &str) -> ParsedCandidate {
    let optimized_sql = extract_fenced_block_lenient(response, "sql")
        .map(str::to_string)
        .unwrap_or_else(|| response.trim().to_string());

    let mut transforms = Vec::new();
    let mut set_local_commands = Vec::new();
    for line in response.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("TRANSFORMS:") {
            transforms.extend(rest.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
        } else if trimmed.to_uppercase().starts_with("SET LOCAL") {
            set_local_commands.push(trimmed.trim_end_matches(';').to_string());
        }
    }

    ParsedCandidate {
        optimized_sql,
        transforms,
        set_local_commands,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnipeAnalysis {
    /// Begins with "low"/"high" per spec.md §4.8 ("If `retry_worthiness`
    /// begins with 'low', skip sniper deployment").
    pub retry_worthiness: String,
    pub strategy_guidance: String,
    pub failure_synthesis: String,
    pub examples: Vec<String>,
}

pub fn parse_snipe_analysis(response: &str) -> Result<SnipeAnalysis> {
    let block = extract_fenced_block_lenient(response, "json").ok_or(BriefingError::NoJsonBlock)?;
    Ok(serde_json::from_str(block)?)
}

pub fn is_low_retry_worthiness(analysis: &SnipeAnalysis) -> bool {
    analysis.retry_worthiness.trim().to_lowercase().starts_with("low")
}

fn render_examples(examples: &[Example]) -> String {
    if examples.is_empty() {
        return "(no matched examples)".to_string();
    }
    let mut out = String::new();
    for ex in examples {
        out.push_str(&format!(
            "--- Example {} (dialect={:?}, verified_speedup={:.2}x{}{}) ---\nBEFORE:\n{}\nAFTER:\n{}\nPrinciple: {}\n\n",
            ex.id,
            ex.dialect,
            ex.verified_speedup,
            if ex.is_fallback { ", fallback" } else { "" },
            if ex.is_seed { ", seed" } else { "" },
            ex.original_sql,
            ex.optimized_sql,
            ex.principle,
        ));
    }
    out
}

fn render_dag_summary(tree: &LogicalTree) -> String {
    let mut lines = Vec::new();
    for (id, node) in &tree.nodes {
        lines.push(format!(
            "  {id} [{:?}] depth={} refs={:?} flags={{agg={},corr={},distinct={},union={},recursive={}}}{}",
            node.kind,
            tree.depth(id),
            node.refs,
            node.flags.has_aggregation,
            node.flags.correlated,
            node.flags.has_distinct,
            node.flags.has_union,
            node.flags.recursive,
            node.cost
                .map(|c| format!(" cost={:.1}% rows~{}", c.cost_pct, c.row_estimate))
                .unwrap_or_default(),
        ));
    }
    lines.join("\n")
}

/// Builds the analyst-briefing prompt (§4.8 step 2). Section ordering
/// follows the teacher corpus's attention-optimized layout (primacy:
/// role + query + DAG topology; early-mid: plan signals; middle:
/// examples + regressions; late-mid: constraints with CRITICAL items
/// duplicated top and bottom; recency: output-format instruction).
#[allow(clippy::too_many_arguments)]
pub fn build_analyst_briefing_prompt(ctx: &Context, worker_count: u32, query_archetype: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("You are the lead query-optimization analyst. Produce a shared briefing and\n");
    out.push_str(&format!(
        "exactly {worker_count} worker briefings, each assigned a distinct rewrite strategy and a\n\
         disjoint slice of the matched examples below. Output a single ```json fenced block\n\
         shaped as {{\"shared\": {{\"semantic_contract\", \"bottleneck_diagnosis\", \"active_constraints\",\n\
         \"regression_warnings\"}}, \"workers\": [{{\"worker_id\", \"strategy\", \"examples\", \"hazard_flags\",\n\
         \"example_reasoning\"}}, ...]}}. Do not fabricate fields; leave a string empty rather than guess.\n\n"
    ));

    out.push_str(&format!("### Query ({})\n```sql\n{}\n```\n\n", ctx.query_id, ctx.sql));

    if let Some(archetype) = query_archetype {
        out.push_str(&format!("Archetype: {archetype}\n\n"));
    }

    out.push_str("### Logical Tree Topology\n");
    out.push_str(&render_dag_summary(&ctx.logical_tree));
    out.push('\n');
    out.push('\n');

    if let Some(text) = &ctx.explain_text {
        out.push_str("### EXPLAIN ANALYZE\n");
        out.push_str(text);
        out.push_str("\n\n");
    }

    if let Some(signals) = &ctx.plan_signals {
        if let Some(qerror) = &signals.qerror {
            out.push_str(&qerror.format_for_prompt());
            out.push_str("\n\n");
        }
    }

    if let Some(text) = &ctx.plan_scanner_text {
        out.push_str("### Plan-Space Scan\n");
        out.push_str(text);
        out.push_str("\n\n");
    }

    if let Some(profile) = &ctx.engine_profile {
        out.push_str("### Engine Profile\n");
        out.push_str(&format!("Strengths (don't fight): {}\n", profile.strengths.join(", ")));
        out.push_str(&format!("Gaps (exploit): {}\n\n", profile.gaps.join(", ")));
    }

    if let Some(envelope) = &ctx.resource_envelope {
        out.push_str(&format!("### Resource Envelope\n{envelope}\n\n"));
    }

    if let Some(leaderboard) = &ctx.strategy_leaderboard {
        out.push_str("### Strategy Leaderboard (by archetype)\n");
        out.push_str(&leaderboard.to_string());
        out.push_str("\n\n");
    }

    if let Some(ceiling) = &ctx.known_ceiling {
        out.push_str(&format!(
            "### Known Ceiling\nA prior run reached {:.2}x via: {}\n\n",
            ceiling.speedup, ceiling.technique
        ));
    }

    out.push_str("### Matched Examples (top ~20)\n");
    out.push_str(&render_examples(&ctx.examples));

    if !ctx.regressions.is_empty() {
        out.push_str("### Regression Warnings\n");
        for r in &ctx.regressions {
            out.push_str(&format!("- [{}] {} (mechanism: {})\n", r.id, r.principle, r.regression_mechanism));
        }
        out.push('\n');
    }

    out.push_str(&render_constraints_for_prompt(&ctx.constraints));
    out.push_str("\n\nReturn only the ```json block described above.\n");
    out
}

/// Builds one worker's generation prompt (§4.8 step 5).
#[allow(clippy::too_many_arguments)]
pub fn build_worker_prompt(
    worker: &WorkerBriefing,
    shared: &SharedBriefing,
    examples: &[Example],
    original_sql: &str,
    output_columns: &[String],
    dialect_hint: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are worker {} on a query-rewrite team. Strategy assigned: {}.\n\n",
        worker.worker_id, worker.strategy
    ));
    out.push_str(&format!("Semantic contract: {}\n", shared.semantic_contract));
    out.push_str(&format!("Bottleneck diagnosis: {}\n", shared.bottleneck_diagnosis));
    out.push_str(&format!("Active constraints: {}\n", shared.active_constraints));
    if !shared.regression_warnings.is_empty() {
        out.push_str(&format!("Regression warnings: {}\n", shared.regression_warnings));
    }
    if !worker.hazard_flags.is_empty() {
        out.push_str(&format!("Hazard flags: {}\n", worker.hazard_flags.join(", ")));
    }
    out.push_str(&format!("\n### Original Query ({dialect_hint})\n```sql\n{original_sql}\n```\n\n"));
    out.push_str(&format!("Output columns (must be preserved exactly, same order): {}\n\n", output_columns.join(", ")));
    out.push_str("### Assigned Examples\n");
    out.push_str(&render_examples(examples));
    out.push_str(
        "Rewrite the query to be semantically equivalent and faster, applying your assigned\n\
         strategy. Return a `TRANSFORMS: label_one, label_two` line followed by a ```sql fenced\n\
         block with the complete rewritten query. If the target engine supports session-local\n\
         planner hints for this rewrite, you may also emit `SET LOCAL ... = 'value';` lines.\n",
    );
    out
}

/// Builds the first snipe-analyst prompt (§4.8 Snipe phase, variant 1):
/// synthesizes every fan-out worker verdict into a retry plan.
pub fn build_snipe_analyst_prompt(
    original_sql: &str,
    worker_summaries: &[(u32, String, String, f64, Vec<String>)],
    examples: &[Example],
    constraints_text: &str,
    original_explain: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(
        "Every fan-out worker failed to reach the target speedup. Synthesize their failures and\n\
         decide whether a refined retry is worth attempting. Output a single ```json fenced block\n\
         shaped as {\"retry_worthiness\", \"strategy_guidance\", \"failure_synthesis\", \"examples\"}.\n\
         `retry_worthiness` must begin with \"low\" or \"high\".\n\n",
    );
    out.push_str(&format!("### Original Query\n```sql\n{original_sql}\n```\n\n"));
    if let Some(explain) = original_explain {
        out.push_str(&format!("### Original EXPLAIN\n{explain}\n\n"));
    }
    out.push_str("### Fan-out Results\n");
    for (worker_id, strategy, first_error_line, speedup, transforms) in worker_summaries {
        out.push_str(&format!(
            "- W{worker_id} ({strategy}): speedup={speedup:.2}x transforms=[{}] first_error=\"{first_error_line}\"\n",
            transforms.join(", ")
        ));
    }
    out.push('\n');
    out.push_str("### Available Examples\n");
    out.push_str(&render_examples(examples));
    out.push_str(&format!("### Constraints\n{constraints_text}\n\n"));
    out.push_str("Return only the ```json block described above.\n");
    out
}

/// Builds the sniper candidate-generation prompt (first snipe) or the
/// retry-sniper prompt (subsequent snipes, §4.8 variant 2) — the caller
/// passes the best SQL seen so far plus whichever `SnipeAnalysis` is
/// live (cached across retries).
pub fn build_sniper_prompt(
    analysis: &SnipeAnalysis,
    best_sql_so_far: &str,
    examples: &[Example],
    constraints_text: &str,
    original_explain: Option<&str>,
    candidate_explains: &[(u32, String)],
    retry_history: &[(u32, f64, String)],
) -> String {
    let mut out = String::new();
    out.push_str("You are the sniper: produce one refined rewrite candidate.\n\n");
    out.push_str(&format!("Strategy guidance: {}\n", analysis.strategy_guidance));
    out.push_str(&format!("Failure synthesis: {}\n\n", analysis.failure_synthesis));
    out.push_str(&format!("### Best Candidate So Far\n```sql\n{best_sql_so_far}\n```\n\n"));
    if let Some(explain) = original_explain {
        out.push_str(&format!("### Original EXPLAIN\n{explain}\n\n"));
    }
    for (worker_id, explain) in candidate_explains {
        out.push_str(&format!("### Candidate W{worker_id} EXPLAIN\n{explain}\n\n"));
    }
    if !retry_history.is_empty() {
        out.push_str("### Prior Snipe Attempts\n");
        for (snipe_num, speedup, summary) in retry_history {
            out.push_str(&format!("- snipe {snipe_num}: speedup={speedup:.2}x — {summary}\n"));
        }
        out.push('\n');
    }
    out.push_str("### Examples\n");
    out.push_str(&render_examples(examples));
    out.push_str(&format!("### Constraints\n{constraints_text}\n\n"));
    out.push_str(
        "Return a `TRANSFORMS: ...` line followed by a ```sql fenced block with the complete\n\
         rewritten query.\n",
    );
    out
}
