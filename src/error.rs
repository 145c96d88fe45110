//! Top-level error taxonomy (§7, Error Handling Design).
//!
//! Most errors recover into a `Verdict` with status `ERROR`/`FAIL` and
//! never reach this type — this enum is for the handful of failure modes
//! that are fatal at the session or query level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing LLM provider/model, missing intelligence inputs, bad
    /// `config.json` — fatal at session start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// SQL rejected by the parser — fatal for the affected query.
    #[error("parse error: {0}")]
    Parse(#[from] crate::sql_parser::ParseError),

    /// LLM call network error after exhausting retries.
    #[error("transport error: {0}")]
    Transport(#[from] crate::llm::LlmError),

    /// Analyst response failed structural validation — no fabrication.
    #[error("briefing parse error: {0}")]
    BriefingParse(String),

    /// Executor failure that could not be recovered into a verdict
    /// (e.g. connection loss surviving one reconnect attempt).
    #[error("executor error: {0}")]
    Executor(#[from] crate::sql_executor::ExecutionError),

    /// Write failures are logged and do not halt the session by
    /// themselves; this variant exists for callers that want to
    /// propagate a terminal filesystem failure (disk full, permissions).
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
