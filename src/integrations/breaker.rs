use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::errors::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Three-state guard around a failure-prone downstream. Consecutive
/// failures open the breaker; after the cool-down one trial request is
/// allowed through and its outcome decides the next state.
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState {
                phase: Phase::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Route one operation through the breaker.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn try_acquire(&self) -> Result<(), ToolError> {
        let mut s = self.lock();
        match s.phase {
            Phase::Closed | Phase::HalfOpen => Ok(()),
            Phase::Open => {
                let cooled = s
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(adapter = self.name, "circuit breaker half-open, allowing a trial");
                    s.phase = Phase::HalfOpen;
                    Ok(())
                } else {
                    Err(ToolError::CircuitOpen(self.name))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut s = self.lock();
        s.phase = Phase::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
    }

    fn record_failure(&self) {
        let mut s = self.lock();
        s.consecutive_failures += 1;
        if s.phase == Phase::HalfOpen || s.consecutive_failures >= self.threshold {
            if s.phase != Phase::Open {
                warn!(
                    adapter = self.name,
                    failures = s.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            s.phase = Phase::Open;
            s.opened_at = Some(Instant::now());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
