//! LLM invoker capability (§6, External Interfaces).
//!
//! `analyze(prompt, max_tokens?) -> text` is the entire surface: transport,
//! retry, and token accounting live in the invoker implementation. The
//! core (§4.8 retry-on-transport policy) wraps calls through this trait
//! with its own bounded backoff rather than trusting the invoker to retry
//! — a misbehaving invoker should not be able to hang a session.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("LLM provider/model not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn analyze(&self, prompt: &str, max_tokens: Option<u32>) -> Result<String>;
}

/// 3 attempts, exponential backoff base 500ms factor 2 capped at 4s
/// (SPEC_FULL §4.8 expansion).
pub async fn invoke_with_retry(invoker: &dyn LlmInvoker, prompt: &str, max_tokens: Option<u32>) -> Result<String> {
    const MAX_ATTEMPTS: u32 = 3;
    const BASE: Duration = Duration::from_millis(500);
    const CAP: Duration = Duration::from_secs(4);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match invoker.analyze(prompt, max_tokens).await {
            Ok(text) => return Ok(text),
            Err(err) if attempt < MAX_ATTEMPTS => {
                let backoff = std::cmp::min(BASE * 2u32.pow(attempt - 1), CAP);
                warn!(attempt, ?backoff, error = %err, "LLM transport error, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyInvoker {
        fail_until: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmInvoker for FlakyInvoker {
        async fn analyze(&self, _prompt: &str, _max_tokens: Option<u32>) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.fail_until {
                Err(LlmError::Transport("connection reset".to_string()))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let invoker = FlakyInvoker {
            fail_until: 2,
            calls: AtomicU32::new(0),
        };
        let result = invoke_with_retry(&invoker, "prompt", None).await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn surfaces_error_after_exhausting_attempts() {
        let invoker = FlakyInvoker {
            fail_until: 100,
            calls: AtomicU32::new(0),
        };
        let result = invoke_with_retry(&invoker, "prompt", None).await;
        assert!(result.is_err());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }
}
