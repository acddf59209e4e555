#![forbid(unsafe_code)]

//! # Weir
//!
//! Bounded parallel execution for async Rust: run a user-supplied async
//! function over a (possibly lazy, possibly unbounded) input sequence while
//! enforcing a concurrency bound, per-item retries with backoff, circuit
//! breaking, token-bucket rate limiting, adaptive concurrency tuning,
//! optional input-order output, and pluggable error policies. A staged
//! pipeline composer chains several executors through bounded queues with
//! backpressure end to end.
//!
//! ## Features
//!
//! - **Parallel executor** with a live concurrency bound and bounded
//!   channels everywhere
//! - **Retry engine** with fixed, linear, exponential, and jittered backoff
//!   plus a transient-error predicate
//! - **Circuit breaker** over a rolling outcome window with half-open probes
//! - **Token-bucket rate limiting** with FIFO waiters
//! - **Adaptive concurrency** steered by observed latency and success rate
//! - **Ordered or completion-order output**, fail-fast /
//!   collect-and-continue / best-effort error modes
//! - **Pipelines**: transform, filter, tap, batch, batch-transform,
//!   flat-map, buffer, throttle, and custom stages
//! - **Progress and metrics sampling**, cooperative cancellation throughout
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use weir::{Backoff, ErrorMode, ExecOptions, ParallelExecutor};
//!
//! #[derive(Debug, Clone)]
//! struct FetchError;
//!
//! impl std::fmt::Display for FetchError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "fetch failed")
//!     }
//! }
//!
//! impl std::error::Error for FetchError {}
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ExecOptions::<FetchError>::builder()
//!         .max_concurrency(4)
//!         .max_retries(2)
//!         .backoff(Backoff::exponential(Duration::from_millis(50)))
//!         .transient(|_| true)
//!         .ordered(true)
//!         .error_mode(ErrorMode::CollectAndContinue)
//!         .build()
//!         .expect("valid options");
//!
//!     let executor = ParallelExecutor::new(options);
//!     let squares = executor
//!         .collect_iter(1u64..=10, |x, _ctx| async move { Ok::<_, FetchError>(x * x) })
//!         .await
//!         .expect("all items succeed");
//!     assert_eq!(squares, vec![1, 4, 9, 16, 25, 36, 49, 64, 81, 100]);
//! }
//! ```
//!
//! Pipelines compose the same engine into stages:
//!
//! ```rust
//! use weir::{ExecOptions, Pipeline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ExecOptions::<std::convert::Infallible>::builder()
//!         .max_concurrency(2)
//!         .build()
//!         .unwrap();
//!
//!     let output = Pipeline::from_iter(1u64..=4)
//!         .flat_map("expand", options.clone(), |x, _ctx| async move {
//!             Ok((1..=x).collect::<Vec<u64>>())
//!         })
//!         .batch(3, None)
//!         .batch_transform("sum", 1, None, options, |chunks, _ctx| async move {
//!             Ok(chunks.into_iter().flatten().sum::<u64>())
//!         })
//!         .run_collect()
//!         .await
//!         .expect("pipeline succeeds");
//!
//!     assert_eq!(output.items.iter().sum::<u64>(), 20);
//! }
//! ```

mod adaptive;
mod backoff;
mod breaker;
mod context;
mod error;
mod executor;
mod observe;
mod options;
mod pipeline;
mod rate_limit;
mod retry;
mod sleeper;

// Re-exports
pub use adaptive::{AdaptiveConcurrency, AdaptiveConfig};
pub use backoff::{Backoff, MAX_BACKOFF};
pub use breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker, Clock, MonotonicClock};
pub use context::TaskContext;
pub use error::{BoxError, BuildError, ExecError, WorkError, MAX_ATTEMPT_FAILURES};
pub use executor::{ExecSummary, ItemOutcome, OutcomeStream, ParallelExecutor};
pub use observe::{MetricsConfig, MetricsSnapshot, ProgressConfig, ProgressSnapshot};
pub use options::{
    ErrorMode, ExecOptions, ExecOptionsBuilder, ItemHook, RetryHook, TransientPredicate,
};
pub use pipeline::{
    Pipeline, PipelineError, PipelineOutput, PipelineResult, PipelineStage, StageContext,
    StageMetrics, StageSummary,
};
pub use rate_limit::{Acquire, RateLimitConfig, TokenBucket};
pub use retry::{ItemRun, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
