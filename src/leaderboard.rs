//! Benchmark-wide leaderboard (§6 `leaderboard.json`, §4.8 leaderboard
//! update, §5 "single writer across benchmark, mutual exclusion via file
//! lock").
//!
//! `LeaderboardStore::record` is the only write path: it takes an
//! OS-level exclusive lock via `fs2` (so sibling *processes* serialize,
//! not just sibling tasks in this process), read-modify-writes
//! `leaderboard.json` through the injected `ArtifactStore`, and
//! re-renders `leaderboard.md` before releasing the lock.

use crate::artifact::ArtifactStore;
use crate::validator::VerdictStatus;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact store error: {0}")]
    Artifact(#[from] crate::artifact::ArtifactError),
    #[error("malformed leaderboard.json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LeaderboardError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub state: u32,
    pub status: String,
    pub speedup: f64,
    pub transforms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub query_id: String,
    pub best_status: String,
    pub best_speedup: f64,
    pub transforms: Vec<String>,
    pub source: String,
    pub original_sql: String,
    pub optimized_sql: String,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderboardSummary {
    pub total: u32,
    pub wins: u32,
    pub improved: u32,
    pub neutral: u32,
    pub regression: u32,
    pub errors: u32,
    pub avg_speedup: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub benchmark: String,
    pub engine: String,
    pub scale_factor: String,
    pub updated_at: String,
    pub summary: LeaderboardSummary,
    pub queries: Vec<LeaderboardEntry>,
}

impl Leaderboard {
    pub fn empty(benchmark: impl Into<String>, engine: impl Into<String>, scale_factor: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            engine: engine.into(),
            scale_factor: scale_factor.into(),
            updated_at: String::new(),
            summary: LeaderboardSummary::default(),
            queries: Vec::new(),
        }
    }

    fn recompute_summary(&mut self) {
        let mut summary = LeaderboardSummary::default();
        let mut speedup_sum = 0.0;
        for q in &self.queries {
            summary.total += 1;
            speedup_sum += q.best_speedup;
            match q.best_status.as_str() {
                "WIN" => summary.wins += 1,
                "IMPROVED" => summary.improved += 1,
                "NEUTRAL" => summary.neutral += 1,
                "REGRESSION" => summary.regression += 1,
                "ERROR" | "FAIL" => summary.errors += 1,
                _ => {}
            }
        }
        summary.avg_speedup = if summary.total > 0 { speedup_sum / summary.total as f64 } else { 0.0 };
        self.summary = summary;
    }
}

pub struct NewVerdict {
    pub query_id: String,
    pub status: VerdictStatus,
    pub speedup: f64,
    pub transforms: Vec<String>,
    pub source: String,
    pub original_sql: String,
    pub optimized_sql: String,
    pub state: u32,
}

/// Merges one verdict into the leaderboard: replaces the head entry when
/// `speedup` beats the stored best, otherwise only appends to `attempts`.
/// `best_speedup` is monotonic non-decreasing across calls for the same
/// `query_id` (§8 invariant).
pub fn merge_verdict(leaderboard: &mut Leaderboard, verdict: NewVerdict, updated_at: String) {
    let attempt = AttemptRecord {
        state: verdict.state,
        status: verdict.status.as_str().to_string(),
        speedup: verdict.speedup,
        transforms: verdict.transforms.clone(),
    };

    match leaderboard.queries.iter_mut().find(|q| q.query_id == verdict.query_id) {
        Some(entry) => {
            if verdict.speedup > entry.best_speedup {
                entry.best_status = verdict.status.as_str().to_string();
                entry.best_speedup = verdict.speedup;
                entry.transforms = verdict.transforms;
                entry.source = verdict.source;
                entry.optimized_sql = verdict.optimized_sql;
            }
            entry.attempts.push(attempt);
        }
        None => {
            leaderboard.queries.push(LeaderboardEntry {
                query_id: verdict.query_id,
                best_status: verdict.status.as_str().to_string(),
                best_speedup: verdict.speedup,
                transforms: verdict.transforms,
                source: verdict.source,
                original_sql: verdict.original_sql,
                optimized_sql: verdict.optimized_sql,
                attempts: vec![attempt],
            });
        }
    }

    leaderboard.updated_at = updated_at;
    leaderboard.recompute_summary();
}

fn render_markdown(leaderboard: &Leaderboard) -> String {
    let mut lines = vec![
        format!("# {} ({}, {})", leaderboard.benchmark, leaderboard.engine, leaderboard.scale_factor),
        format!("_updated {}_", leaderboard.updated_at),
        String::new(),
        format!(
            "Total: {} · Wins: {} · Improved: {} · Neutral: {} · Regression: {} · Errors: {} · Avg speedup: {:.2}x",
            leaderboard.summary.total,
            leaderboard.summary.wins,
            leaderboard.summary.improved,
            leaderboard.summary.neutral,
            leaderboard.summary.regression,
            leaderboard.summary.errors,
            leaderboard.summary.avg_speedup
        ),
        String::new(),
        "| Query | Status | Speedup | Transforms | Source |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for q in &leaderboard.queries {
        lines.push(format!(
            "| {} | {} | {:.2}x | {} | {} |",
            q.query_id,
            q.best_status,
            q.best_speedup,
            q.transforms.join(", "),
            q.source
        ));
    }
    lines.join("\n")
}

pub struct LeaderboardStore {
    store: Arc<dyn ArtifactStore>,
    lock_path: PathBuf,
}

impl LeaderboardStore {
    pub fn new(store: Arc<dyn ArtifactStore>, benchmark_root: PathBuf) -> Self {
        Self {
            store,
            lock_path: benchmark_root.join(".leaderboard.lock"),
        }
    }

    /// Acquires the cross-process exclusive lock, read-modify-writes
    /// `leaderboard.json`/`leaderboard.md`, and releases the lock.
    pub async fn record(&self, verdict: NewVerdict, updated_at: String, default_benchmark: impl Fn() -> Leaderboard) -> Result<Leaderboard> {
        let lock_path = self.lock_path.clone();
        let lock_file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .expect("lock-acquire task panicked")?;

        let result = self.record_locked(verdict, updated_at, default_benchmark).await;

        let _ = tokio::task::spawn_blocking(move || FileExt::unlock(&lock_file)).await;

        result
    }

    async fn record_locked(&self, verdict: NewVerdict, updated_at: String, default_benchmark: impl Fn() -> Leaderboard) -> Result<Leaderboard> {
        let existing = self.store.load(Path::new("leaderboard.json")).await?;
        let mut leaderboard = match existing {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => default_benchmark(),
        };

        merge_verdict(&mut leaderboard, verdict, updated_at);

        let json_bytes = serde_json::to_vec_pretty(&leaderboard)?;
        self.store.save(Path::new("leaderboard.json"), &json_bytes).await?;
        self.store.save(Path::new("leaderboard.md"), render_markdown(&leaderboard).as_bytes()).await?;

        Ok(leaderboard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(query_id: &str, speedup: f64, status: VerdictStatus) -> NewVerdict {
        NewVerdict {
            query_id: query_id.to_string(),
            status,
            speedup,
            transforms: vec!["predicate_pushdown".to_string()],
            source: "swarm_iter_1".to_string(),
            original_sql: "SELECT 1".to_string(),
            optimized_sql: "SELECT 1".to_string(),
            state: 1,
        }
    }

    #[test]
    fn best_speedup_is_monotonic_non_decreasing() {
        let mut board = Leaderboard::empty("tpch", "duckdb", "sf1");
        merge_verdict(&mut board, verdict("q1", 1.5, VerdictStatus::Improved), "t1".to_string());
        assert_eq!(board.queries[0].best_speedup, 1.5);

        merge_verdict(&mut board, verdict("q1", 1.2, VerdictStatus::Improved), "t2".to_string());
        assert_eq!(board.queries[0].best_speedup, 1.5);
        assert_eq!(board.queries[0].attempts.len(), 2);

        merge_verdict(&mut board, verdict("q1", 2.0, VerdictStatus::Win), "t3".to_string());
        assert_eq!(board.queries[0].best_speedup, 2.0);
        assert_eq!(board.queries[0].best_status, "WIN");
    }

    #[test]
    fn summary_counts_match_query_statuses() {
        let mut board = Leaderboard::empty("tpch", "duckdb", "sf1");
        merge_verdict(&mut board, verdict("q1", 2.0, VerdictStatus::Win), "t".to_string());
        merge_verdict(&mut board, verdict("q2", 1.0, VerdictStatus::Neutral), "t".to_string());
        assert_eq!(board.summary.total, 2);
        assert_eq!(board.summary.wins, 1);
        assert_eq!(board.summary.neutral, 1);
    }

    #[tokio::test]
    async fn leaderboard_store_round_trips_through_artifact_store() {
        let store = Arc::new(crate::artifact::InMemoryArtifactStore::new());
        let leaderboard_store = LeaderboardStore::new(Arc::clone(&store) as Arc<dyn ArtifactStore>, PathBuf::from("/tmp/nonexistent-bench"));
        let board = leaderboard_store
            .record(verdict("q1", 1.3, VerdictStatus::Improved), "t1".to_string(), || {
                Leaderboard::empty("tpch", "duckdb", "sf1")
            })
            .await
            .unwrap();
        assert_eq!(board.queries.len(), 1);

        let loaded = store.load(Path::new("leaderboard.json")).await.unwrap();
        assert!(loaded.is_some());
    }
}
