//! Session State (§3 Glossary, §4.8 persistence).
//!
//! Per-query ordered iterations (fan-out then snipes), each holding its
//! analyst prompt/response, every worker's prompt/response/verdict.
//! Persisted atomically per-iteration through `ArtifactStore` so a crash
//! mid-session never leaves a corrupt `session.json`, and resumable from
//! whatever was last durably written.

use crate::sql_parser::SqlDialect;
use crate::validator::Verdict;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("artifact store error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),
    #[error("malformed session.json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationKind {
    FanOut,
    Snipe,
    SnipeRetry,
}

impl IterationKind {
    fn dir_suffix(self) -> &'static str {
        match self {
            IterationKind::FanOut => "fan_out",
            IterationKind::Snipe => "snipe",
            IterationKind::SnipeRetry => "snipe_retry",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: u32,
    pub strategy: String,
    pub prompt: String,
    pub response: String,
    pub optimized_sql: String,
    pub transforms: Vec<String>,
    pub verdict: Option<Verdict>,
    /// The fourth (exploratory) fan-out worker never promotes to best,
    /// per §4.8 step 5 — its verdict is retained for analysis only.
    pub exploratory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub kind: IterationKind,
    pub analyst_prompt: String,
    pub analyst_response: String,
    pub workers: Vec<WorkerRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestResult {
    pub iteration_index: u32,
    pub worker_id: Option<u32>,
    pub status: String,
    pub speedup: f64,
    pub optimized_sql: String,
    pub transforms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub query_id: String,
    pub dialect: SqlDialect,
    pub original_sql: String,
    pub iterations: Vec<Iteration>,
    pub best: Option<BestResult>,
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(query_id: impl Into<String>, dialect: SqlDialect, original_sql: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            dialect,
            original_sql: original_sql.into(),
            iterations: Vec::new(),
            best: None,
            status: SessionStatus::Running,
        }
    }

    /// Appends an iteration and recomputes `best` across every non-exploratory,
    /// non-ERROR verdict seen so far — max-by-speedup (§4.8 Termination).
    pub fn push_iteration(&mut self, iteration: Iteration) {
        let index = iteration.index;
        for worker in &iteration.workers {
            if worker.exploratory {
                continue;
            }
            let Some(verdict) = &worker.verdict else { continue };
            if verdict.status == crate::validator::VerdictStatus::Error {
                continue;
            }
            let beats_current = self.best.as_ref().map(|b| verdict.speedup > b.speedup).unwrap_or(true);
            if beats_current {
                self.best = Some(BestResult {
                    iteration_index: index,
                    worker_id: Some(worker.worker_id),
                    status: verdict.status.as_str().to_string(),
                    speedup: verdict.speedup,
                    optimized_sql: worker.optimized_sql.clone(),
                    transforms: worker.transforms.clone(),
                });
            }
        }
        self.iterations.push(iteration);
    }

    pub fn mark_done(&mut self) {
        self.status = SessionStatus::Done;
    }

    pub fn mark_error(&mut self) {
        self.status = SessionStatus::Error;
    }
}

pub struct Session {
    store: Arc<dyn crate::artifact::ArtifactStore>,
    session_dir: PathBuf,
    pub state: SessionState,
}

impl Session {
    pub fn new(store: Arc<dyn crate::artifact::ArtifactStore>, session_dir: PathBuf, state: SessionState) -> Self {
        Self { store, session_dir, state }
    }

    pub async fn load(store: Arc<dyn crate::artifact::ArtifactStore>, session_dir: PathBuf) -> Result<Option<Self>> {
        let bytes = store.load(&session_dir.join("session.json")).await?;
        match bytes {
            Some(b) => Ok(Some(Self {
                store,
                session_dir,
                state: serde_json::from_slice(&b)?,
            })),
            None => Ok(None),
        }
    }

    /// Atomically persists the whole session (meta + best + iteration
    /// history) as `session.json`, then flattens the most recently
    /// appended iteration into the per-iteration audit layout (§4.8
    /// Persistence, §6 directory layout).
    pub async fn persist_iteration(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        self.store.save(&self.session_dir.join("session.json"), &json).await?;

        if let Some(iteration) = self.state.iterations.last() {
            self.write_iteration_artifacts(iteration).await?;
        }
        Ok(())
    }

    async fn write_iteration_artifacts(&self, iteration: &Iteration) -> Result<()> {
        let dir = self
            .session_dir
            .join(format!("iteration_{:02}_{}", iteration.index, iteration.kind.dir_suffix()));

        self.store
            .save(&dir.join("analyst_prompt.txt"), iteration.analyst_prompt.as_bytes())
            .await?;
        self.store
            .save(&dir.join("analyst_response.txt"), iteration.analyst_response.as_bytes())
            .await?;

        for worker in &iteration.workers {
            let prefix = format!("worker_{}", worker.worker_id);
            self.store.save(&dir.join(format!("{prefix}_prompt.txt")), worker.prompt.as_bytes()).await?;
            self.store
                .save(&dir.join(format!("{prefix}_response.txt")), worker.response.as_bytes())
                .await?;
            self.store
                .save(&dir.join(format!("{prefix}_optimized.sql")), worker.optimized_sql.as_bytes())
                .await?;
            let result_json = serde_json::to_vec_pretty(&worker.verdict)?;
            self.store.save(&dir.join(format!("{prefix}_result.json")), &result_json).await?;
        }
        Ok(())
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::InMemoryArtifactStore;
    use crate::validator::{ErrorCategory, VerdictStatus};

    fn sample_verdict(status: VerdictStatus, speedup: f64) -> Verdict {
        Verdict {
            status,
            speedup,
            errors: vec![],
            error_category: None,
            explain_plan: None,
        }
    }

    #[test]
    fn best_tracks_max_speedup_across_iterations() {
        let mut state = SessionState::new("q1", SqlDialect::DuckDb, "SELECT 1");
        state.push_iteration(Iteration {
            index: 1,
            kind: IterationKind::FanOut,
            analyst_prompt: String::new(),
            analyst_response: String::new(),
            workers: vec![WorkerRecord {
                worker_id: 0,
                strategy: "pushdown".to_string(),
                prompt: String::new(),
                response: String::new(),
                optimized_sql: "SELECT 1".to_string(),
                transforms: vec![],
                verdict: Some(sample_verdict(VerdictStatus::Improved, 1.2)),
                exploratory: false,
            }],
        });
        assert_eq!(state.best.as_ref().unwrap().speedup, 1.2);

        state.push_iteration(Iteration {
            index: 2,
            kind: IterationKind::Snipe,
            analyst_prompt: String::new(),
            analyst_response: String::new(),
            workers: vec![WorkerRecord {
                worker_id: 0,
                strategy: "sniper".to_string(),
                prompt: String::new(),
                response: String::new(),
                optimized_sql: "SELECT 1".to_string(),
                transforms: vec![],
                verdict: Some(sample_verdict(VerdictStatus::Win, 2.5)),
                exploratory: false,
            }],
        });
        assert_eq!(state.best.as_ref().unwrap().speedup, 2.5);
    }

    #[test]
    fn error_verdicts_never_win_best() {
        let mut state = SessionState::new("q1", SqlDialect::DuckDb, "SELECT 1");
        state.push_iteration(Iteration {
            index: 1,
            kind: IterationKind::FanOut,
            analyst_prompt: String::new(),
            analyst_response: String::new(),
            workers: vec![WorkerRecord {
                worker_id: 0,
                strategy: "x".to_string(),
                prompt: String::new(),
                response: String::new(),
                optimized_sql: "SELECT 1".to_string(),
                transforms: vec![],
                verdict: Some(Verdict {
                    status: VerdictStatus::Error,
                    speedup: 0.0,
                    errors: vec!["boom".to_string()],
                    error_category: Some(ErrorCategory::Execution),
                    explain_plan: None,
                }),
                exploratory: false,
            }],
        });
        assert!(state.best.is_none());
    }

    #[test]
    fn exploratory_worker_never_wins_best() {
        let mut state = SessionState::new("q1", SqlDialect::DuckDb, "SELECT 1");
        state.push_iteration(Iteration {
            index: 1,
            kind: IterationKind::FanOut,
            analyst_prompt: String::new(),
            analyst_response: String::new(),
            workers: vec![WorkerRecord {
                worker_id: 3,
                strategy: "exploratory".to_string(),
                prompt: String::new(),
                response: String::new(),
                optimized_sql: "SELECT 1".to_string(),
                transforms: vec![],
                verdict: Some(sample_verdict(VerdictStatus::Win, 5.0)),
                exploratory: true,
            }],
        });
        assert!(state.best.is_none());
    }

    #[tokio::test]
    async fn session_round_trips_through_persist_and_load() {
        let store: Arc<dyn crate::artifact::ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
        let dir = PathBuf::from("swarm_sessions/q1");
        let mut state = SessionState::new("q1", SqlDialect::DuckDb, "SELECT 1");
        state.push_iteration(Iteration {
            index: 1,
            kind: IterationKind::FanOut,
            analyst_prompt: "analyze this".to_string(),
            analyst_response: "briefing".to_string(),
            workers: vec![WorkerRecord {
                worker_id: 0,
                strategy: "pushdown".to_string(),
                prompt: "worker prompt".to_string(),
                response: "worker response".to_string(),
                optimized_sql: "SELECT 1".to_string(),
                transforms: vec!["predicate_pushdown".to_string()],
                verdict: Some(sample_verdict(VerdictStatus::Win, 1.5)),
                exploratory: false,
            }],
        });

        let session = Session::new(Arc::clone(&store), dir.clone(), state);
        session.persist_iteration().await.unwrap();

        let reloaded = Session::load(store, dir).await.unwrap().unwrap();
        assert_eq!(reloaded.state.best.unwrap().speedup, 1.5);
        assert_eq!(reloaded.state.iterations.len(), 1);
    }
}
