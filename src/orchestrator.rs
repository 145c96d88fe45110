//! Beam Orchestrator (C8, §4.8).
//!
//! Drives one query's full optimization session: a single fan-out
//! iteration (N parallel workers against an analyst briefing), then up
//! to `max_iterations - 1` snipe iterations, terminating early once the
//! target speedup is hit. Every collaborator (`ContextBuilder`,
//! `Validator`, `PlanScanner`, `KnowledgeRetriever`, `Session`,
//! `LeaderboardStore`) is injected through `Pipeline` rather than
//! constructed here — this module wires them together, it doesn't own
//! their state.
//!
//! Grounded on `swarm_session.py`'s `SwarmSession.run`/`_fan_out_iteration`/
//! `_snipe_iteration`: fan-out happens exactly once, the baseline is
//! benchmarked once and cached for every later snipe, and a low
//! `retry_worthiness` from the snipe analyst permanently retires sniper
//! deployment for the rest of the session (every later iteration records
//! zero LLM calls rather than re-asking).

use crate::artifact::ArtifactStore;
use crate::cache::ExplainCache;
use crate::config::{self, BenchmarkConfig, ExplainPolicy};
use crate::context::{Context, ContextBuilder, ContextError, ContextInputs};
use crate::knowledge::{render_constraints_for_prompt, Example, KnowledgeRetriever};
use crate::leaderboard::{LeaderboardStore, NewVerdict};
use crate::llm::{invoke_with_retry, LlmError, LlmInvoker};
use crate::plan_scanner::{PlanScanner, ScanMode};
use crate::plan_signals;
use crate::prompts::{self, BriefingError, ParsedBriefing, SnipeAnalysis};
use crate::session::{Iteration, IterationKind, Session, SessionError, SessionState, SessionStatus, WorkerRecord};
use crate::sql_executor::SqlExecutor;
use crate::sql_parser::{SqlDialect, SqlParser};
use crate::validator::{Validator, Verdict, VerdictStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("context assembly failed: {0}")]
    Context(#[from] ContextError),
    #[error("session persistence failed: {0}")]
    Session(#[from] SessionError),
    #[error("leaderboard update failed: {0}")]
    Leaderboard(#[from] crate::leaderboard::LeaderboardError),
    #[error("analyst briefing could not be parsed: {0}")]
    Briefing(#[from] BriefingError),
    #[error("analyst briefing failed validation: {0}")]
    BriefingInvalid(String),
    #[error("LLM transport error: {0}")]
    Llm(#[from] LlmError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Every collaborator C8 drives, wired by the caller (§6 External
/// Interfaces). One `Pipeline` is built per benchmark run and shared
/// across every query's `BeamOrchestrator::run_session` call.
pub struct Pipeline {
    pub parser: Arc<dyn SqlParser>,
    pub llm: Arc<dyn LlmInvoker>,
    pub executor: Arc<dyn SqlExecutor>,
    pub knowledge: Arc<KnowledgeRetriever>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub explain_cache: Arc<ExplainCache>,
    pub config: BenchmarkConfig,
}

pub struct BeamOrchestrator {
    pipeline: Pipeline,
    context_builder: ContextBuilder,
    validator: Validator,
    plan_scanner: Option<PlanScanner>,
}

impl BeamOrchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        let context_builder = ContextBuilder::new(Arc::clone(&pipeline.parser), Arc::clone(&pipeline.knowledge));
        let validator = Validator::new(Arc::clone(&pipeline.executor), Arc::clone(&pipeline.parser), pipeline.config.engine);
        let plan_scanner = if pipeline.config.engine.is_postgres() {
            Some(PlanScanner::new(Arc::clone(&pipeline.executor)))
        } else {
            None
        };
        Self {
            pipeline,
            context_builder,
            validator,
            plan_scanner,
        }
    }

    /// Runs (or resumes) one query's full session to completion: fan-out,
    /// then snipes, until the target speedup is reached or the iteration
    /// budget is exhausted. Resumption is at iteration granularity — a
    /// session that already completed its fan-out picks up at the next
    /// unrun snipe rather than mid-iteration (§4.8 Persistence).
    pub async fn run_session(&self, query_id: &str, sql: &str, benchmark_root: &Path) -> Result<SessionState> {
        let session_dir = benchmark_root.join("swarm_sessions").join(query_id);
        let mut session = match Session::load(Arc::clone(&self.pipeline.artifacts), session_dir.clone()).await? {
            Some(existing) => existing,
            None => Session::new(
                Arc::clone(&self.pipeline.artifacts),
                session_dir,
                SessionState::new(query_id, self.pipeline.config.engine, sql),
            ),
        };

        if session.state.status == SessionStatus::Done {
            return Ok(session.state);
        }

        let target_speedup = config::DEFAULT_TARGET_SPEEDUP;
        let max_iterations = config::DEFAULT_MAX_ITERATIONS;

        let ctx = match self.gather_context(query_id, sql, self.pipeline.config.engine).await {
            Ok(ctx) => ctx,
            Err(e) => {
                session.state.mark_error();
                session.persist_iteration().await.ok();
                return Err(e.into());
            }
        };

        if session.state.iterations.is_empty() {
            if let Err(e) = self.fan_out_iteration(&mut session, &ctx).await {
                session.state.mark_error();
                session.persist_iteration().await.ok();
                return Err(e);
            }
        }

        if self.target_met(&session.state, target_speedup) {
            return self.finish(session, benchmark_root).await;
        }

        let baseline = self.validator.benchmark_baseline(sql, 3, config::MEASURED_RUN_TIMEOUT_MS).await;

        let mut snipe_analysis: Option<SnipeAnalysis> = None;
        let mut retired = false;
        let mut retry_history: Vec<(u32, f64, String)> = Vec::new();
        let mut candidate_explains: Vec<(u32, String)> = Vec::new();

        let start_snipe = session.state.iterations.len() as u32;
        for snipe_num in start_snipe..max_iterations {
            if retired {
                session.state.push_iteration(Iteration {
                    index: snipe_num,
                    kind: IterationKind::SnipeRetry,
                    analyst_prompt: String::new(),
                    analyst_response: String::new(),
                    workers: vec![],
                });
                session.persist_iteration().await?;
                continue;
            }

            if snipe_analysis.is_none() {
                let (analysis, prompt, response) = match self.run_snipe_analyst(&session.state, &ctx).await {
                    Ok(triple) => triple,
                    Err(e) => {
                        warn!(error = %e, "snipe analyst call failed, skipping remaining snipes");
                        retired = true;
                        session.state.push_iteration(Iteration {
                            index: snipe_num,
                            kind: IterationKind::Snipe,
                            analyst_prompt: String::new(),
                            analyst_response: String::new(),
                            workers: vec![],
                        });
                        session.persist_iteration().await?;
                        continue;
                    }
                };

                if prompts::is_low_retry_worthiness(&analysis) {
                    info!(query_id, snipe_num, "snipe analyst reports low retry worthiness, retiring sniper");
                    retired = true;
                    session.state.push_iteration(Iteration {
                        index: snipe_num,
                        kind: IterationKind::Snipe,
                        analyst_prompt: prompt,
                        analyst_response: response,
                        workers: vec![],
                    });
                    session.persist_iteration().await?;
                    snipe_analysis = Some(analysis);
                    continue;
                }

                let iteration_kind = IterationKind::Snipe;
                let worker = self
                    .run_sniper(&ctx, &analysis, &session.state, &retry_history, &candidate_explains)
                    .await;
                self.record_snipe_iteration(
                    &mut session,
                    &baseline,
                    snipe_num,
                    iteration_kind,
                    prompt,
                    response,
                    worker,
                    &mut retry_history,
                    &mut candidate_explains,
                )
                .await?;
                snipe_analysis = Some(analysis);
            } else {
                let analysis = snipe_analysis.as_ref().unwrap();
                let worker = self
                    .run_sniper(&ctx, analysis, &session.state, &retry_history, &candidate_explains)
                    .await;
                self.record_snipe_iteration(
                    &mut session,
                    &baseline,
                    snipe_num,
                    IterationKind::SnipeRetry,
                    String::new(),
                    String::new(),
                    worker,
                    &mut retry_history,
                    &mut candidate_explains,
                )
                .await?;
            }

            if self.target_met(&session.state, target_speedup) {
                break;
            }
        }

        self.finish(session, benchmark_root).await
    }

    fn target_met(&self, state: &SessionState, target: f64) -> bool {
        state.best.as_ref().map(|b| b.speedup >= target).unwrap_or(false)
    }

    async fn finish(&self, mut session: Session, benchmark_root: &Path) -> Result<SessionState> {
        session.state.mark_done();
        session.persist_iteration().await?;
        self.update_leaderboard(&session.state, benchmark_root).await?;
        Ok(session.state)
    }

    /// Assembles the `Context` for this query: reuses the cached EXPLAIN
    /// document when the active `ExplainPolicy` allows it, otherwise runs
    /// a fresh `EXPLAIN ANALYZE` and re-caches it; reuses a cached
    /// plan-scanner result for PostgreSQL or runs one `explain_only` pass
    /// when none is cached yet (§4.5, §4.6).
    async fn gather_context(&self, query_id: &str, sql: &str, dialect: SqlDialect) -> Result<Context> {
        let policy = self.pipeline.config.explain_policy;
        let cached = self.pipeline.explain_cache.load(query_id).await;
        let reuse = cached.as_ref().map(|c| ExplainCache::should_reuse(c, policy)).unwrap_or(false);

        let plan_json = if reuse {
            cached.map(|c| c.plan_json)
        } else if matches!(policy, ExplainPolicy::Cache | ExplainPolicy::Explain) {
            cached.map(|c| c.plan_json)
        } else {
            match self.pipeline.executor.explain(sql, true, config::MEASURED_RUN_TIMEOUT_MS).await {
                Ok(json) => {
                    self.pipeline.explain_cache.store(query_id, json.clone(), true, Utc::now().timestamp()).await;
                    Some(json)
                }
                Err(e) => {
                    warn!(query_id, error = %e, "fresh EXPLAIN failed, falling back to cached plan if any");
                    None
                }
            }
        };

        let plan_signals = plan_json.as_ref().and_then(|json| plan_signals::extract(json, dialect).ok());
        let explain_text = plan_json.as_ref().map(|j| serde_json::to_string_pretty(j).unwrap_or_default());

        let plan_scanner_result = if dialect.is_postgres() {
            self.load_or_run_plan_scan(query_id, sql).await
        } else {
            None
        };

        let inputs = ContextInputs {
            plan_signals,
            explain_text,
            plan_scanner_result,
            resource_envelope: None,
            strategy_leaderboard: None,
            known_ceiling: None,
            regression_warnings: vec![],
            bootstrap_override: self.pipeline.config.bootstrap_override,
        };

        Ok(self.context_builder.gather(query_id, sql, dialect, inputs)?)
    }

    async fn load_or_run_plan_scan(&self, query_id: &str, sql: &str) -> Option<crate::plan_scanner::ScanResult> {
        let scanner = self.plan_scanner.as_ref()?;
        let path = PathBuf::from("plan_scanner").join(format!("{query_id}.json"));
        if let Ok(Some(bytes)) = self.pipeline.artifacts.load(&path).await {
            if let Ok(result) = serde_json::from_slice(&bytes) {
                return Some(result);
            }
        }
        match scanner.scan_query(sql, ScanMode::ExplainOnly, config::EXPLAIN_TIMEOUT_MS, None).await {
            Ok(result) => {
                if let Ok(bytes) = serde_json::to_vec_pretty(&result) {
                    let _ = self.pipeline.artifacts.save(&path, &bytes).await;
                }
                Some(result)
            }
            Err(e) => {
                warn!(query_id, error = %e, "plan-space scan failed, proceeding without it");
                None
            }
        }
    }

    /// Fan-out (§4.8 steps 1-7, iteration 0): analyst briefing, parallel
    /// worker generation, validation (racing when baseline runtime
    /// supports it, sequential with DuckDB cost-rank pre-screen
    /// otherwise), PostgreSQL `SET LOCAL` re-validation, persistence.
    async fn fan_out_iteration(&self, session: &mut Session, ctx: &Context) -> Result<()> {
        let worker_count = self.pipeline.config.workers_state_0.max(1);
        let analyst_prompt = prompts::build_analyst_briefing_prompt(ctx, worker_count, None);
        let analyst_response = invoke_with_retry(self.pipeline.llm.as_ref(), &analyst_prompt, Some(4096)).await?;

        let briefing = match prompts::parse_briefing_response(&analyst_response) {
            Ok(b) => b,
            Err(e) => {
                session.state.push_iteration(Iteration {
                    index: 0,
                    kind: IterationKind::FanOut,
                    analyst_prompt,
                    analyst_response,
                    workers: vec![],
                });
                session.persist_iteration().await?;
                return Err(e.into());
            }
        };

        let issues = prompts::validate_parsed_briefing(&briefing);
        if !issues.is_empty() {
            session.state.push_iteration(Iteration {
                index: 0,
                kind: IterationKind::FanOut,
                analyst_prompt,
                analyst_response,
                workers: vec![],
            });
            session.persist_iteration().await?;
            return Err(OrchestratorError::BriefingInvalid(issues.join("; ")));
        }

        let generated = self.generate_workers(ctx, &briefing).await;
        let max_worker_id = generated.iter().map(|g| g.worker_id).max().unwrap_or(0);

        let candidates: Vec<(String, String)> = generated
            .iter()
            .map(|g| (format!("worker_{}", g.worker_id), g.optimized_sql.clone()))
            .collect();

        let baseline = self.validator.benchmark_baseline(&ctx.sql, 3, config::MEASURED_RUN_TIMEOUT_MS).await;
        let mut verdicts = self.validate_candidates(&ctx.sql, &candidates, &baseline, ctx.dialect).await;

        if ctx.dialect.is_postgres() {
            self.apply_set_local_revalidation(&baseline, &generated, &mut verdicts).await;
        }

        let workers: Vec<WorkerRecord> = generated
            .into_iter()
            .map(|g| {
                let verdict = verdicts.remove(&g.worker_id);
                self.emit_learning_record(&ctx.query_id, 0, g.worker_id, &g, verdict.as_ref());
                WorkerRecord {
                    worker_id: g.worker_id,
                    strategy: g.strategy,
                    prompt: g.prompt,
                    response: g.response,
                    optimized_sql: g.optimized_sql,
                    transforms: g.transforms,
                    verdict,
                    exploratory: g.worker_id == max_worker_id && max_worker_id > 0,
                }
            })
            .collect();

        session.state.push_iteration(Iteration {
            index: 0,
            kind: IterationKind::FanOut,
            analyst_prompt,
            analyst_response,
            workers,
        });
        session.persist_iteration().await?;
        Ok(())
    }

    async fn generate_workers(&self, ctx: &Context, briefing: &ParsedBriefing) -> Vec<GeneratedCandidate> {
        let output_columns = ctx.logical_tree.main_node().output_columns.clone();
        let dialect_hint = format!("{:?}", ctx.dialect);

        let mut join_set = JoinSet::new();
        for worker in briefing.workers.clone() {
            let examples = select_examples(&ctx.examples, &worker.examples);
            let shared = briefing.shared.clone();
            let sql = ctx.sql.clone();
            let cols = output_columns.clone();
            let hint = dialect_hint.clone();
            let llm = Arc::clone(&self.pipeline.llm);
            let parser = Arc::clone(&self.pipeline.parser);
            let dialect = ctx.dialect;
            join_set.spawn(async move {
                let prompt = prompts::build_worker_prompt(&worker, &shared, &examples, &sql, &cols, &hint);
                match invoke_with_retry(llm.as_ref(), &prompt, None).await {
                    Ok(response) => {
                        let parsed = prompts::parse_candidate_response(&response);
                        let optimized_sql = if parser.syntax_check(&parsed.optimized_sql, dialect).is_ok() {
                            parsed.optimized_sql
                        } else {
                            sql.clone()
                        };
                        GeneratedCandidate {
                            worker_id: worker.worker_id,
                            strategy: worker.strategy,
                            prompt,
                            response,
                            optimized_sql,
                            transforms: parsed.transforms,
                            set_local_commands: parsed.set_local_commands,
                        }
                    }
                    Err(e) => GeneratedCandidate {
                        worker_id: worker.worker_id,
                        strategy: worker.strategy,
                        prompt,
                        response: e.to_string(),
                        optimized_sql: sql.clone(),
                        transforms: vec![],
                        set_local_commands: vec![],
                    },
                }
            });
        }

        let mut generated = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(candidate) = joined {
                generated.push(candidate);
            }
        }
        generated.sort_by_key(|g| g.worker_id);
        generated
    }

    /// Races all candidates first; falls back to sequential validation
    /// (with a DuckDB `EXPLAIN`-cost pre-screen ahead of timed runs) when
    /// the baseline lane doesn't clear the minimum-runtime gate (§4.7).
    async fn validate_candidates(
        &self,
        original_sql: &str,
        candidates: &[(String, String)],
        baseline: &crate::validator::Baseline,
        dialect: SqlDialect,
    ) -> HashMap<u32, Verdict> {
        let mut verdicts = HashMap::new();

        let race = self
            .validator
            .race(original_sql, candidates, config::RACE_MIN_RUNTIME_MS, config::MEASURED_RUN_TIMEOUT_MS)
            .await;

        if let Some(race_result) = race {
            let baseline_time = race_result
                .lane_timings
                .iter()
                .find(|(id, _)| id == "__original__")
                .map(|(_, t)| *t);
            for (lane_id, candidate_sql) in candidates {
                let worker_id = worker_id_from_lane(lane_id);
                let candidate_time = race_result.lane_timings.iter().find(|(id, _)| id == lane_id).map(|(_, t)| *t);
                let verdict = match (baseline_time, candidate_time) {
                    (Some(bt), Some(ct)) if ct > 0.0 => {
                        self.validator.validate_with_known_speedup(baseline, candidate_sql, bt / ct, config::MEASURED_RUN_TIMEOUT_MS).await
                    }
                    _ => self.validator.validate_against_baseline(baseline, candidate_sql, 3, config::MEASURED_RUN_TIMEOUT_MS).await,
                };
                verdicts.insert(worker_id, verdict);
            }
            return verdicts;
        }

        let indices_to_validate: Vec<usize> = if matches!(dialect, SqlDialect::DuckDb) && candidates.len() > 2 {
            self.validator.cost_rank(candidates, 2).await
        } else {
            (0..candidates.len()).collect()
        };

        for (idx, (lane_id, candidate_sql)) in candidates.iter().enumerate() {
            let worker_id = worker_id_from_lane(lane_id);
            if indices_to_validate.contains(&idx) {
                let verdict = self
                    .validator
                    .validate_against_baseline(baseline, candidate_sql, 3, config::MEASURED_RUN_TIMEOUT_MS)
                    .await;
                verdicts.insert(worker_id, verdict);
            } else {
                verdicts.insert(
                    worker_id,
                    Verdict {
                        status: VerdictStatus::Neutral,
                        speedup: 1.0,
                        errors: vec!["skipped by cost-rank pre-screen".to_string()],
                        error_category: None,
                        explain_plan: None,
                    },
                );
            }
        }
        verdicts
    }

    /// Re-validates every passing worker that emitted `SET LOCAL`
    /// commands with those commands applied, adopting the faster of
    /// rewrite-only vs. rewrite+config (§4.8 step 7, PostgreSQL only).
    async fn apply_set_local_revalidation(
        &self,
        baseline: &crate::validator::Baseline,
        generated: &[GeneratedCandidate],
        verdicts: &mut HashMap<u32, Verdict>,
    ) {
        for candidate in generated {
            if candidate.set_local_commands.is_empty() {
                continue;
            }
            let Some(current) = verdicts.get(&candidate.worker_id) else { continue };
            if matches!(current.status, VerdictStatus::Error | VerdictStatus::Fail) {
                continue;
            }

            let with_config = self
                .validator
                .validate_with_config(baseline, &candidate.optimized_sql, &candidate.set_local_commands, config::MEASURED_RUN_TIMEOUT_MS)
                .await;

            if !matches!(with_config.status, VerdictStatus::Error | VerdictStatus::Fail) && with_config.speedup > current.speedup {
                verdicts.insert(candidate.worker_id, with_config);
            }
        }
    }

    fn emit_learning_record(&self, query_id: &str, iteration_index: u32, worker_id: u32, candidate: &GeneratedCandidate, verdict: Option<&Verdict>) {
        let record = serde_json::json!({
            "query_id": query_id,
            "iteration": iteration_index,
            "worker_id": worker_id,
            "strategy": candidate.strategy,
            "transforms": candidate.transforms,
            "status": verdict.map(|v| v.status.as_str()),
            "speedup": verdict.map(|v| v.speedup),
            "error_category": verdict.and_then(|v| v.error_category),
        });
        let path = PathBuf::from("learning").join(query_id).join(format!("attempt_{iteration_index:02}_w{worker_id}.json"));
        let store = Arc::clone(&self.pipeline.artifacts);
        if let Ok(bytes) = serde_json::to_vec_pretty(&record) {
            tokio::spawn(async move {
                let _ = store.save(&path, &bytes).await;
            });
        }
    }

    /// Builds and sends the snipe-analyst prompt (§4.8 Snipe phase,
    /// variant 1) from the fan-out iteration's worker verdicts.
    async fn run_snipe_analyst(&self, state: &SessionState, ctx: &Context) -> std::result::Result<(SnipeAnalysis, String, String), OrchestratorError> {
        let fan_out = state
            .iterations
            .iter()
            .find(|it| it.kind == IterationKind::FanOut)
            .expect("snipe phase only runs after a fan-out iteration");

        let summaries: Vec<(u32, String, String, f64, Vec<String>)> = fan_out
            .workers
            .iter()
            .map(|w| {
                let speedup = w.verdict.as_ref().map(|v| v.speedup).unwrap_or(0.0);
                let first_error = w
                    .verdict
                    .as_ref()
                    .and_then(|v| v.errors.first())
                    .cloned()
                    .unwrap_or_default();
                (w.worker_id, w.strategy.clone(), first_error, speedup, w.transforms.clone())
            })
            .collect();

        let constraints_text = render_constraints_for_prompt(&ctx.constraints);
        let prompt = prompts::build_snipe_analyst_prompt(&ctx.sql, &summaries, &ctx.examples, &constraints_text, ctx.explain_text.as_deref());
        let response = invoke_with_retry(self.pipeline.llm.as_ref(), &prompt, Some(4096)).await?;
        let analysis = prompts::parse_snipe_analysis(&response)?;
        Ok((analysis, prompt, response))
    }

    /// Builds and sends the sniper candidate prompt, then validates the
    /// single returned candidate against the cached baseline (§4.8 step 5
    /// variant of the snipe phase, no racing — one candidate per snipe).
    async fn run_sniper(
        &self,
        ctx: &Context,
        analysis: &SnipeAnalysis,
        state: &SessionState,
        retry_history: &[(u32, f64, String)],
        candidate_explains: &[(u32, String)],
    ) -> SniperOutcome {
        let best_sql = state
            .best
            .as_ref()
            .map(|b| b.optimized_sql.clone())
            .unwrap_or_else(|| ctx.sql.clone());
        let examples = select_examples(&ctx.examples, &analysis.examples);
        let constraints_text = render_constraints_for_prompt(&ctx.constraints);
        let prompt = prompts::build_sniper_prompt(
            analysis,
            &best_sql,
            &examples,
            &constraints_text,
            ctx.explain_text.as_deref(),
            candidate_explains,
            retry_history,
        );

        let response = match invoke_with_retry(self.pipeline.llm.as_ref(), &prompt, None).await {
            Ok(r) => r,
            Err(e) => {
                return SniperOutcome {
                    prompt,
                    response: e.to_string(),
                    optimized_sql: ctx.sql.clone(),
                    transforms: vec![],
                }
            }
        };

        let parsed = prompts::parse_candidate_response(&response);
        let optimized_sql = if self.pipeline.parser.syntax_check(&parsed.optimized_sql, ctx.dialect).is_ok() {
            parsed.optimized_sql
        } else {
            ctx.sql.clone()
        };

        SniperOutcome {
            prompt,
            response,
            optimized_sql,
            transforms: parsed.transforms,
        }
    }

    async fn record_snipe_iteration(
        &self,
        session: &mut Session,
        baseline: &crate::validator::Baseline,
        snipe_num: u32,
        kind: IterationKind,
        analyst_prompt: String,
        analyst_response: String,
        outcome: SniperOutcome,
        retry_history: &mut Vec<(u32, f64, String)>,
        candidate_explains: &mut Vec<(u32, String)>,
    ) -> Result<()> {
        let verdict = self
            .validator
            .validate_against_baseline(baseline, &outcome.optimized_sql, 3, config::MEASURED_RUN_TIMEOUT_MS)
            .await;

        let summary = verdict.errors.first().cloned().unwrap_or_else(|| verdict.status.as_str().to_string());
        retry_history.push((snipe_num, verdict.speedup, summary));

        if let Ok(plan) = self.pipeline.executor.explain(&outcome.optimized_sql, false, config::EXPLAIN_TIMEOUT_MS).await {
            candidate_explains.push((snipe_num, plan.to_string()));
        }

        let worker = WorkerRecord {
            worker_id: 0,
            strategy: "sniper".to_string(),
            prompt: outcome.prompt,
            response: outcome.response,
            optimized_sql: outcome.optimized_sql,
            transforms: outcome.transforms,
            verdict: Some(verdict),
            exploratory: false,
        };

        session.state.push_iteration(Iteration {
            index: snipe_num,
            kind,
            analyst_prompt,
            analyst_response,
            workers: vec![worker],
        });
        session.persist_iteration().await?;
        Ok(())
    }

    async fn update_leaderboard(&self, state: &SessionState, benchmark_root: &Path) -> Result<()> {
        let leaderboard_store = LeaderboardStore::new(Arc::clone(&self.pipeline.artifacts), benchmark_root.to_path_buf());
        let engine = format!("{:?}", self.pipeline.config.engine).to_lowercase();
        let scale_factor = self.pipeline.config.scale_factor.clone().unwrap_or_default();

        let (status, speedup, transforms, optimized_sql, source) = match &state.best {
            Some(best) => (
                verdict_status_from_str(&best.status),
                best.speedup,
                best.transforms.clone(),
                best.optimized_sql.clone(),
                format!("swarm_iter_{}", best.iteration_index),
            ),
            None => (VerdictStatus::Error, 0.0, vec![], state.original_sql.clone(), "swarm_iter_0".to_string()),
        };

        leaderboard_store
            .record(
                NewVerdict {
                    query_id: state.query_id.clone(),
                    status,
                    speedup,
                    transforms,
                    source,
                    original_sql: state.original_sql.clone(),
                    optimized_sql,
                    state: state.iterations.len() as u32,
                },
                Utc::now().to_rfc3339(),
                || crate::leaderboard::Leaderboard::empty("benchmark", engine.clone(), scale_factor.clone()),
            )
            .await?;
        Ok(())
    }
}

struct GeneratedCandidate {
    worker_id: u32,
    strategy: String,
    prompt: String,
    response: String,
    optimized_sql: String,
    transforms: Vec<String>,
    set_local_commands: Vec<String>,
}

struct SniperOutcome {
    prompt: String,
    response: String,
    optimized_sql: String,
    transforms: Vec<String>,
}

fn worker_id_from_lane(lane_id: &str) -> u32 {
    lane_id.strip_prefix("worker_").and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn verdict_status_from_str(s: &str) -> VerdictStatus {
    match s {
        "WIN" => VerdictStatus::Win,
        "IMPROVED" => VerdictStatus::Improved,
        "NEUTRAL" => VerdictStatus::Neutral,
        "REGRESSION" => VerdictStatus::Regression,
        "FAIL" => VerdictStatus::Fail,
        _ => VerdictStatus::Error,
    }
}

fn select_examples(all: &[Example], ids: &[String]) -> Vec<Example> {
    let mut out: Vec<Example> = ids.iter().filter_map(|id| all.iter().find(|e| &e.id == id).cloned()).collect();
    if out.is_empty() {
        out = all.iter().take(3).cloned().collect();
    }
    out
}

/// End-to-end session scenarios (§8) driven against stubbed `LlmInvoker`
/// and `SqlExecutor` collaborators — no real transport or database, per
/// the testability requirement that a harness be able to reproduce each
/// scenario by stubbing exactly those two capabilities.
#[cfg(test)]
mod e2e_tests {
    use super::*;
    use crate::artifact::InMemoryArtifactStore;
    use crate::cache::KnowledgeCache;
    use crate::config::ExplainPolicy;
    use crate::knowledge::{Example, InMemoryKnowledgeSource};
    use crate::session::SessionStatus;
    use crate::sql_executor::{Row, RowSet, SqlExecutor, Value};
    use crate::sql_parser::SqlparserBackend;
    use async_trait::async_trait;
    use std::time::Duration;

    const ORIGINAL_SQL: &str = "SELECT SUM(amt) FROM t WHERE d = 2001";
    /// Contains `fast_marker` so the stub executor/explain treat it as the
    /// cheap, fast-running rewrite.
    const FAST_REWRITE_SQL: &str = "SELECT SUM(amt) FROM (SELECT amt FROM t WHERE d = 2001) fast_marker";

    /// Times out each lane by a literal string marker rather than real
    /// query cost, and reports a correspondingly cheap/expensive EXPLAIN
    /// cost for the DuckDB cost-rank pre-screen — deterministic and fast
    /// (milliseconds, not seconds) while still exercising the real racing
    /// gate (the fixed delays stay well under `RACE_MIN_RUNTIME_MS`, so
    /// every candidate set below falls through to sequential validation,
    /// same as a real sub-2s benchmark query would).
    struct MarkerExecutor;

    #[async_trait]
    impl SqlExecutor for MarkerExecutor {
        async fn execute(&self, sql: &str, _timeout_ms: u64) -> crate::sql_executor::Result<RowSet> {
            let delay = if sql.contains("fast_marker") {
                Duration::from_millis(8)
            } else {
                Duration::from_millis(60)
            };
            tokio::time::sleep(delay).await;
            Ok(RowSet {
                rows: vec![Row::new(vec![Value::Integer(42)])],
            })
        }

        async fn execute_with_config(&self, _set_local_commands: &[String], sql: &str, timeout_ms: u64) -> crate::sql_executor::Result<RowSet> {
            self.execute(sql, timeout_ms).await
        }

        async fn explain(&self, sql: &str, _analyze: bool, _timeout_ms: u64) -> crate::sql_executor::Result<serde_json::Value> {
            let cardinality = if sql.contains("fast_marker") { 1 } else { 1000 };
            Ok(serde_json::json!({
                "operator_name": "SEQ_SCAN",
                "operator_timing": 0.001,
                "operator_cardinality": cardinality,
                "children": []
            }))
        }

        async fn rollback(&self) -> crate::sql_executor::Result<()> {
            Ok(())
        }

        async fn close(&self) -> crate::sql_executor::Result<()> {
            Ok(())
        }
    }

    /// Dispatches on which prompt it was handed (analyst briefing, worker,
    /// snipe-analyst, or sniper) by the fixed section headers `prompts`
    /// always emits, the same way a real harness's recorded-response stub
    /// would key off request shape.
    struct ScenarioLlm {
        worker_count: u32,
        fast_worker_id: Option<u32>,
        snipe_retry_worthiness: &'static str,
        sniper_fast: bool,
    }

    fn worker_id_in_prompt(prompt: &str) -> u32 {
        const MARKER: &str = "You are worker ";
        let start = prompt.find(MARKER).map(|i| i + MARKER.len()).unwrap_or(0);
        prompt[start..].chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().unwrap_or(0)
    }

    #[async_trait]
    impl LlmInvoker for ScenarioLlm {
        async fn analyze(&self, prompt: &str, _max_tokens: Option<u32>) -> crate::llm::Result<String> {
            if prompt.contains("lead query-optimization analyst") {
                let workers: Vec<String> = (0..self.worker_count)
                    .map(|id| {
                        format!(
                            r#"{{"worker_id": {id}, "strategy": "strategy_{id}", "examples": ["e1"], "hazard_flags": [], "example_reasoning": "matches"}}"#
                        )
                    })
                    .collect();
                Ok(format!(
                    "```json\n{{\"shared\": {{\"semantic_contract\": \"preserve grain\", \"bottleneck_diagnosis\": \"seq scan\", \
                     \"active_constraints\": \"none\", \"regression_warnings\": \"\"}}, \"workers\": [{}]}}\n```",
                    workers.join(",")
                ))
            } else if prompt.contains("You are the sniper:") {
                let sql = if self.sniper_fast { FAST_REWRITE_SQL } else { ORIGINAL_SQL };
                Ok(format!("TRANSFORMS: sniper_rewrite\n```sql\n{sql}\n```"))
            } else if prompt.contains("Every fan-out worker failed") {
                Ok(format!(
                    "```json\n{{\"retry_worthiness\": \"{}\", \"strategy_guidance\": \"decorrelate\", \
                     \"failure_synthesis\": \"all fan-out workers regressed\", \"examples\": [\"e1\"]}}\n```",
                    self.snipe_retry_worthiness
                ))
            } else {
                let worker_id = worker_id_in_prompt(prompt);
                let sql = if Some(worker_id) == self.fast_worker_id { FAST_REWRITE_SQL } else { ORIGINAL_SQL };
                Ok(format!("TRANSFORMS: rewrite\n```sql\n{sql}\n```"))
            }
        }
    }

    fn build_pipeline(llm: ScenarioLlm, worker_count: u32) -> Pipeline {
        let source = Arc::new(InMemoryKnowledgeSource {
            examples: vec![Example {
                id: "e1".to_string(),
                dialect: SqlDialect::DuckDb,
                tags: vec!["t".to_string()],
                transforms: vec![],
                original_sql: ORIGINAL_SQL.to_string(),
                optimized_sql: FAST_REWRITE_SQL.to_string(),
                verified_speedup: 2.0,
                principle: "pushdown the filter ahead of the aggregate".to_string(),
                match_score: 0.0,
                is_fallback: false,
                is_seed: false,
            }],
            ..Default::default()
        });
        let knowledge = Arc::new(KnowledgeRetriever::new(source, Arc::new(SqlparserBackend), Arc::new(KnowledgeCache::new(8))));
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let config = BenchmarkConfig {
            engine: SqlDialect::DuckDb,
            db_path_or_dsn: "test.db".to_string(),
            workers_state_0: worker_count,
            workers_state_n: 0,
            promote_threshold: 1.05,
            explain_policy: ExplainPolicy::Auto,
            scale_factor: None,
            bootstrap_override: false,
        };
        Pipeline {
            parser: Arc::new(SqlparserBackend),
            llm: Arc::new(llm),
            executor: Arc::new(MarkerExecutor),
            knowledge,
            artifacts: Arc::clone(&artifacts),
            explain_cache: Arc::new(ExplainCache::new(artifacts)),
            config,
        }
    }

    /// §8 scenario 1: a clear fan-out win terminates the session without
    /// running any snipe iteration, and the winning worker becomes best.
    #[tokio::test]
    async fn clear_win_on_fan_out_terminates_without_snipe() {
        let llm = ScenarioLlm {
            worker_count: 4,
            fast_worker_id: Some(0),
            snipe_retry_worthiness: "high",
            sniper_fast: false,
        };
        let orchestrator = BeamOrchestrator::new(build_pipeline(llm, 4));
        let dir = tempfile::tempdir().unwrap();

        let state = orchestrator.run_session("q_win", ORIGINAL_SQL, dir.path()).await.unwrap();

        assert_eq!(state.status, SessionStatus::Done);
        assert_eq!(state.iterations.len(), 1, "a clear win must not trigger any snipe iteration");
        assert_eq!(state.iterations[0].kind, IterationKind::FanOut);
        let best = state.best.expect("fan-out produced a winning candidate");
        assert_eq!(best.worker_id, Some(0));
        assert!(best.speedup >= config::DEFAULT_TARGET_SPEEDUP, "expected a clear win, got {}", best.speedup);
    }

    /// §8 scenario 2: every fan-out worker misses the target, the snipe
    /// analyst judges the failure worth a retry, and the sniper's
    /// candidate wins — terminating after exactly one snipe.
    #[tokio::test]
    async fn snipe_recovers_after_fan_out_misses_target() {
        let llm = ScenarioLlm {
            worker_count: 4,
            fast_worker_id: None,
            snipe_retry_worthiness: "high",
            sniper_fast: true,
        };
        let orchestrator = BeamOrchestrator::new(build_pipeline(llm, 4));
        let dir = tempfile::tempdir().unwrap();

        let state = orchestrator.run_session("q_snipe", ORIGINAL_SQL, dir.path()).await.unwrap();

        assert_eq!(state.status, SessionStatus::Done);
        assert_eq!(state.iterations.len(), 2, "expected fan-out plus exactly one recovering snipe");
        assert_eq!(state.iterations[1].kind, IterationKind::Snipe);
        assert_eq!(state.iterations[1].workers.len(), 1);
        assert_eq!(state.iterations[1].workers[0].strategy, "sniper");

        let best = state.best.expect("sniper produced a winning candidate");
        assert_eq!(best.iteration_index, 1);
        assert!(best.speedup >= config::DEFAULT_TARGET_SPEEDUP, "expected the sniper to win, got {}", best.speedup);
    }

    /// §8 scenario 3: a "low" retry-worthiness verdict permanently retires
    /// sniper deployment — every remaining iteration is a
    /// zero-API-call, zero-candidate `SnipeRetry` placeholder.
    #[tokio::test]
    async fn low_retry_worthiness_retires_sniper_for_remaining_iterations() {
        let llm = ScenarioLlm {
            worker_count: 4,
            fast_worker_id: None,
            snipe_retry_worthiness: "low (no tractable path)",
            sniper_fast: true,
        };
        let orchestrator = BeamOrchestrator::new(build_pipeline(llm, 4));
        let dir = tempfile::tempdir().unwrap();

        let state = orchestrator.run_session("q_retired", ORIGINAL_SQL, dir.path()).await.unwrap();

        assert_eq!(state.status, SessionStatus::Done);
        assert_eq!(state.iterations.len(), config::DEFAULT_MAX_ITERATIONS as usize);
        assert_eq!(state.iterations[1].kind, IterationKind::Snipe);
        assert!(state.iterations[1].workers.is_empty(), "the analyst call itself deploys no worker");
        for retired_iter in &state.iterations[2..] {
            assert_eq!(retired_iter.kind, IterationKind::SnipeRetry);
            assert!(retired_iter.workers.is_empty(), "retired iterations must record zero candidates");
            assert!(retired_iter.analyst_prompt.is_empty(), "retired iterations make no further LLM calls");
        }
    }

    /// §4.8 step 4 / §7: a structurally invalid analyst response aborts
    /// the fan-out iteration with a controlled error rather than
    /// fabricating worker briefings, and the partial iteration is still
    /// persisted for audit.
    #[tokio::test]
    async fn malformed_analyst_response_aborts_iteration_without_fabricating() {
        struct BrokenAnalystLlm;
        #[async_trait]
        impl LlmInvoker for BrokenAnalystLlm {
            async fn analyze(&self, _prompt: &str, _max_tokens: Option<u32>) -> crate::llm::Result<String> {
                Ok("I couldn't produce a structured briefing this time.".to_string())
            }
        }

        let pipeline = build_pipeline(
            ScenarioLlm {
                worker_count: 4,
                fast_worker_id: None,
                snipe_retry_worthiness: "high",
                sniper_fast: false,
            },
            4,
        );
        let pipeline = Pipeline {
            llm: Arc::new(BrokenAnalystLlm),
            ..pipeline
        };
        let orchestrator = BeamOrchestrator::new(pipeline);
        let dir = tempfile::tempdir().unwrap();

        let err = orchestrator.run_session("q_broken", ORIGINAL_SQL, dir.path()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Briefing(_)));
    }
}
