//! Token-bucket admission gate.
//!
//! Refills fractional tokens at a fixed rate up to a burst capacity. Callers
//! that find the bucket empty wait for the deficit to refill; waiters are
//! serialized FIFO through an async gate so nobody starves. Waiting respects
//! cancellation and a canceled wait consumes no tokens.

use crate::error::BuildError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate limit settings. Absent from `ExecOptions` means no rate limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained refill rate.
    pub tokens_per_second: f64,
    /// Maximum tokens the bucket can hold.
    pub burst_capacity: f64,
    /// Tokens consumed per admitted operation.
    pub tokens_per_op: f64,
}

impl RateLimitConfig {
    /// `rate` operations per second with a burst of the same size.
    pub fn per_second(rate: f64) -> Self {
        Self { tokens_per_second: rate, burst_capacity: rate, tokens_per_op: 1.0 }
    }

    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst_capacity = burst;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.tokens_per_op = cost;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if !(self.tokens_per_second.is_finite() && self.tokens_per_second > 0.0) {
            return Err(BuildError::InvalidRate(self.tokens_per_second));
        }
        if !(self.tokens_per_op.is_finite() && self.tokens_per_op > 0.0) {
            return Err(BuildError::InvalidCost(self.tokens_per_op));
        }
        if self.burst_capacity < self.tokens_per_op {
            return Err(BuildError::BurstBelowCost {
                burst: self.burst_capacity,
                cost: self.tokens_per_op,
            });
        }
        Ok(())
    }
}

/// Result of a bucket acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Acquire {
    Granted,
    /// Cancellation fired while waiting. No tokens were consumed.
    Canceled,
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket with cooperative waiting.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    cost: f64,
    // FIFO gate: tokio's mutex queues waiters in arrival order, so the
    // oldest waiter refills first.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("cost", &self.cost)
            .finish()
    }
}

impl TokenBucket {
    /// Build a bucket that starts full.
    pub fn new(config: &RateLimitConfig) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(Self {
            rate: config.tokens_per_second,
            capacity: config.burst_capacity,
            cost: config.tokens_per_op,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState {
                tokens: config.burst_capacity,
                last_refill: Instant::now(),
            }),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Take `tokens_per_op` tokens, waiting for refill if necessary.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Acquire {
        let _gate = tokio::select! {
            guard = self.gate.lock() => guard,
            _ = cancel.cancelled() => return Acquire::Canceled,
        };
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= self.cost {
                    state.tokens -= self.cost;
                    return Acquire::Granted;
                }
                Duration::from_secs_f64((self.cost - state.tokens) / self.rate)
            };
            tokio::select! {
                _ = self.sleeper.sleep(wait) => {}
                _ = cancel.cancelled() => return Acquire::Canceled,
            }
        }
    }

    /// Tokens currently available, after refilling. Diagnostic only.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}
