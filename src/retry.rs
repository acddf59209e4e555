//! Per-item retry engine.
//!
//! Runs one work item through up to `max_retries + 1` attempts. Each attempt
//! gets a fresh child cancellation token and, when configured, a per-attempt
//! deadline. Attempts are strictly sequential; a panic inside the user
//! function is caught and becomes a permanent error for the item. A timed-out
//! attempt's future is dropped, so cancellation-unsafe user work may leave
//! partial state behind; timeouts are counted so that leakage is observable.

use crate::backoff::Backoff;
use crate::context::TaskContext;
use crate::error::{WorkError, MAX_ATTEMPT_FAILURES};
use crate::options::{ExecOptions, RetryHook, TransientPredicate};
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of running one item through the engine.
#[derive(Debug)]
pub struct ItemRun<U, E> {
    /// Retries performed (attempts made minus one).
    pub retries: u32,
    /// Attempts that hit the per-attempt deadline, including retried ones.
    pub timeouts: u32,
    pub result: Result<U, WorkError<E>>,
}

pub struct RetryPolicy<E> {
    max_retries: usize,
    backoff: Backoff,
    transient: TransientPredicate<E>,
    attempt_timeout: Option<Duration>,
    retry_timeouts: bool,
    sleeper: Arc<dyn Sleeper>,
    on_retry: Option<RetryHook<E>>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry_timeouts", &self.retry_timeouts)
            .finish()
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff.clone(),
            transient: self.transient.clone(),
            attempt_timeout: self.attempt_timeout,
            retry_timeouts: self.retry_timeouts,
            sleeper: self.sleeper.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

enum Attempt<U, E> {
    Ok(U),
    Failed(E),
    TimedOut { elapsed: Duration, timeout: Duration },
    Panicked(String),
    Canceled,
}

impl<E> RetryPolicy<E> {
    pub fn new(max_retries: usize, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            transient: Arc::new(|_| false),
            attempt_timeout: None,
            retry_timeouts: true,
            sleeper: Arc::new(TokioSleeper),
            on_retry: None,
        }
    }

    pub(crate) fn from_options(options: &ExecOptions<E>) -> Self {
        Self {
            max_retries: options.max_retries,
            backoff: options.backoff.clone(),
            transient: options.transient.clone(),
            attempt_timeout: options.per_item_timeout,
            retry_timeouts: options.retry_timeouts,
            sleeper: Arc::new(TokioSleeper),
            on_retry: options.on_retry.clone(),
        }
    }

    pub fn transient<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.transient = Arc::new(predicate);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn retry_timeouts(mut self, retry: bool) -> Self {
        self.retry_timeouts = retry;
        self
    }

    /// Override the sleeper (deterministic tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64, u32, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Run `f` for `item` until success, a permanent outcome, or cancellation.
    pub async fn run<T, U, F, Fut>(
        &self,
        index: u64,
        item: T,
        cancel: &CancellationToken,
        f: &F,
    ) -> ItemRun<U, E>
    where
        T: Clone,
        F: Fn(T, TaskContext) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        let attempts_allowed = self.max_retries + 1;
        let mut failures: Vec<E> = Vec::new();
        let mut timeouts = 0u32;

        for attempt in 1..=attempts_allowed {
            let retries = attempt as u32 - 1;
            if cancel.is_cancelled() {
                return ItemRun { retries, timeouts, result: Err(WorkError::Canceled) };
            }

            let ctx = TaskContext::new(index, attempt as u32, cancel.child_token());
            let outcome = self.attempt_once(f(item.clone(), ctx), cancel).await;

            match outcome {
                Attempt::Ok(value) => {
                    return ItemRun { retries, timeouts, result: Ok(value) };
                }
                Attempt::Canceled => {
                    return ItemRun { retries, timeouts, result: Err(WorkError::Canceled) };
                }
                Attempt::Panicked(detail) => {
                    return ItemRun {
                        retries,
                        timeouts,
                        result: Err(WorkError::Panicked { detail }),
                    };
                }
                Attempt::TimedOut { elapsed, timeout } => {
                    timeouts += 1;
                    if self.retry_timeouts && attempt < attempts_allowed {
                        tracing::debug!(index, attempt, "attempt timed out, retrying");
                        if !self.pause(attempt, cancel).await {
                            return ItemRun {
                                retries: attempt as u32,
                                timeouts,
                                result: Err(WorkError::Canceled),
                            };
                        }
                        continue;
                    }
                    return ItemRun {
                        retries,
                        timeouts,
                        result: Err(WorkError::Timeout { elapsed, timeout }),
                    };
                }
                Attempt::Failed(error) => {
                    if !(self.transient)(&error) {
                        return ItemRun { retries, timeouts, result: Err(WorkError::App(error)) };
                    }
                    push_capped(&mut failures, error);
                    if attempt == attempts_allowed {
                        return ItemRun {
                            retries,
                            timeouts,
                            result: Err(WorkError::Exhausted { attempts: attempt, failures }),
                        };
                    }
                    if let Some(hook) = &self.on_retry {
                        let last = failures.last().expect("failure just recorded");
                        hook(index, attempt as u32, last);
                    }
                    tracing::debug!(index, attempt, "transient failure, retrying");
                    if !self.pause(attempt, cancel).await {
                        return ItemRun {
                            retries: attempt as u32,
                            timeouts,
                            result: Err(WorkError::Canceled),
                        };
                    }
                }
            }
        }

        unreachable!("retry loop returns from its last attempt")
    }

    async fn attempt_once<U, Fut>(
        &self,
        fut: Fut,
        cancel: &CancellationToken,
    ) -> Attempt<U, E>
    where
        Fut: Future<Output = Result<U, E>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let started = Instant::now();
        match self.attempt_timeout {
            Some(limit) => {
                tokio::select! {
                    _ = cancel.cancelled() => Attempt::Canceled,
                    finished = tokio::time::timeout(limit, guarded) => match finished {
                        Ok(Ok(Ok(value))) => Attempt::Ok(value),
                        Ok(Ok(Err(error))) => Attempt::Failed(error),
                        Ok(Err(panic)) => Attempt::Panicked(panic_detail(panic)),
                        Err(_) => Attempt::TimedOut { elapsed: started.elapsed(), timeout: limit },
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Attempt::Canceled,
                    finished = guarded => match finished {
                        Ok(Ok(value)) => Attempt::Ok(value),
                        Ok(Err(error)) => Attempt::Failed(error),
                        Err(panic) => Attempt::Panicked(panic_detail(panic)),
                    },
                }
            }
        }
    }

    /// Sleep out the backoff. Returns false when canceled mid-sleep.
    async fn pause(&self, attempt: usize, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.delay(attempt);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.sleeper.sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

fn push_capped<E>(failures: &mut Vec<E>, error: E) {
    failures.push(error);
    if failures.len() > MAX_ATTEMPT_FAILURES {
        let excess = failures.len() - MAX_ATTEMPT_FAILURES;
        failures.drain(0..excess);
    }
}

fn panic_detail(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
