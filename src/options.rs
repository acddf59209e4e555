//! Execution configuration.
//!
//! `ExecOptions` is immutable once built and cheap to clone; user callbacks
//! and predicates are `Arc`'d. Every optional sub-config (`rate_limit`,
//! `breaker`, `adaptive`, `progress`, `metrics`) disables its feature when
//! absent. Validation happens once, in [`ExecOptionsBuilder::build`].

use crate::adaptive::AdaptiveConfig;
use crate::backoff::Backoff;
use crate::breaker::BreakerConfig;
use crate::error::{BuildError, WorkError};
use crate::observe::{MetricsConfig, ProgressConfig};
use crate::rate_limit::RateLimitConfig;
use std::sync::Arc;
use std::time::Duration;

/// How permanent item errors affect the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// First permanent error cancels the execution and becomes its terminal
    /// error. Pending input is not read.
    #[default]
    FailFast,
    /// Failed items are emitted and the run continues; the execution fails
    /// at the end with an aggregate if anything failed.
    CollectAndContinue,
    /// Failed items are emitted but the execution itself never fails.
    BestEffort,
}

/// Decides whether an application error is worth retrying.
pub type TransientPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Invoked as `(index, attempt, error)` before each retry sleep.
pub type RetryHook<E> = Arc<dyn Fn(u64, u32, &E) + Send + Sync>;

/// Invoked as `(index, retries, error)` after each item settles;
/// `error` is `None` on success.
pub type ItemHook<E> = Arc<dyn Fn(u64, u32, Option<&WorkError<E>>) + Send + Sync>;

pub struct ExecOptions<E> {
    pub(crate) max_concurrency: usize,
    pub(crate) channel_capacity: usize,
    pub(crate) max_retries: usize,
    pub(crate) backoff: Backoff,
    pub(crate) transient: TransientPredicate<E>,
    pub(crate) per_item_timeout: Option<Duration>,
    pub(crate) retry_timeouts: bool,
    pub(crate) ordered: bool,
    pub(crate) error_mode: ErrorMode,
    pub(crate) rate_limit: Option<RateLimitConfig>,
    pub(crate) breaker: Option<BreakerConfig>,
    pub(crate) adaptive: Option<AdaptiveConfig>,
    pub(crate) progress: Option<ProgressConfig>,
    pub(crate) metrics: Option<MetricsConfig>,
    pub(crate) on_retry: Option<RetryHook<E>>,
    pub(crate) on_complete_item: Option<ItemHook<E>>,
}

impl<E> Clone for ExecOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_concurrency: self.max_concurrency,
            channel_capacity: self.channel_capacity,
            max_retries: self.max_retries,
            backoff: self.backoff.clone(),
            transient: self.transient.clone(),
            per_item_timeout: self.per_item_timeout,
            retry_timeouts: self.retry_timeouts,
            ordered: self.ordered,
            error_mode: self.error_mode,
            rate_limit: self.rate_limit.clone(),
            breaker: self.breaker.clone(),
            adaptive: self.adaptive.clone(),
            progress: self.progress.clone(),
            metrics: self.metrics.clone(),
            on_retry: self.on_retry.clone(),
            on_complete_item: self.on_complete_item.clone(),
        }
    }
}

impl<E> std::fmt::Debug for ExecOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("channel_capacity", &self.channel_capacity)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("per_item_timeout", &self.per_item_timeout)
            .field("ordered", &self.ordered)
            .field("error_mode", &self.error_mode)
            .field("rate_limit", &self.rate_limit)
            .field("breaker", &self.breaker)
            .field("adaptive", &self.adaptive)
            .finish()
    }
}

impl<E> Default for ExecOptions<E> {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            channel_capacity: 32,
            max_retries: 0,
            backoff: Backoff::None,
            transient: Arc::new(|_| false),
            per_item_timeout: None,
            retry_timeouts: true,
            ordered: false,
            error_mode: ErrorMode::default(),
            rate_limit: None,
            breaker: None,
            adaptive: None,
            progress: None,
            metrics: None,
            on_retry: None,
            on_complete_item: None,
        }
    }
}

impl<E> ExecOptions<E> {
    pub fn builder() -> ExecOptionsBuilder<E> {
        ExecOptionsBuilder::new()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    /// Upper bound on worker tasks: the adaptive maximum when tuning is on.
    pub(crate) fn worker_ceiling(&self) -> usize {
        self.adaptive.as_ref().map(|a| a.max).unwrap_or(self.max_concurrency)
    }
}

pub struct ExecOptionsBuilder<E> {
    options: ExecOptions<E>,
}

impl<E> Default for ExecOptionsBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ExecOptionsBuilder<E> {
    pub fn new() -> Self {
        Self { options: ExecOptions::default() }
    }

    /// Upper bound on simultaneously running user calls. Overridden at run
    /// time when an adaptive config is present.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.options.max_concurrency = n;
        self
    }

    /// Capacity of the internal input and output channels.
    pub fn channel_capacity(mut self, n: usize) -> Self {
        self.options.channel_capacity = n;
        self
    }

    /// Additional attempts after the first failure.
    pub fn max_retries(mut self, n: usize) -> Self {
        self.options.max_retries = n;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.options.backoff = backoff;
        self
    }

    /// Classify retryable errors. Default: nothing is transient.
    pub fn transient<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.options.transient = Arc::new(predicate);
        self
    }

    /// Deadline for a single attempt. The attempt's future is dropped on
    /// expiry; the execution itself is unaffected.
    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.options.per_item_timeout = Some(timeout);
        self
    }

    /// Whether a timed-out attempt counts as transient. Default true.
    pub fn retry_timeouts(mut self, retry: bool) -> Self {
        self.options.retry_timeouts = retry;
        self
    }

    /// Emit outcomes in input-index order instead of completion order.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.options.ordered = ordered;
        self
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.options.error_mode = mode;
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.options.rate_limit = Some(config);
        self
    }

    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.options.breaker = Some(config);
        self
    }

    pub fn adaptive(mut self, config: AdaptiveConfig) -> Self {
        self.options.adaptive = Some(config);
        self
    }

    pub fn progress(mut self, config: ProgressConfig) -> Self {
        self.options.progress = Some(config);
        self
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.options.metrics = Some(config);
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64, u32, &E) + Send + Sync + 'static,
    {
        self.options.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn on_complete_item<F>(mut self, hook: F) -> Self
    where
        F: Fn(u64, u32, Option<&WorkError<E>>) + Send + Sync + 'static,
    {
        self.options.on_complete_item = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<ExecOptions<E>, BuildError> {
        let options = self.options;
        if options.max_concurrency == 0 {
            return Err(BuildError::ZeroConcurrency);
        }
        if options.channel_capacity == 0 {
            return Err(BuildError::ZeroCapacity);
        }
        if let Some(rate) = &options.rate_limit {
            rate.validate()?;
        }
        if let Some(breaker) = &options.breaker {
            breaker.validate()?;
        }
        if let Some(adaptive) = &options.adaptive {
            adaptive.validate()?;
        }
        Ok(options)
    }
}
