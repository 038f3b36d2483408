use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::errors::ToolError;

/// Attempt budget and backoff base for one tool. Backoff grows with the
/// attempt number (base, 2×base, 3×base…).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
        }
    }

    pub const fn once() -> Self {
        Self::new(1, Duration::from_millis(0))
    }
}

/// Run `op` under the policy. Only failures the error itself marks as
/// retryable are attempted again; everything else returns immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(tool = label, attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                let backoff = policy.base_backoff * attempt;
                warn!(
                    tool = label,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "attempt failed; backing off"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
