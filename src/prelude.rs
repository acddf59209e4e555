//! Convenience re-exports of the common surface.

pub use crate::{
    Backoff, BreakerConfig, ErrorMode, ExecError, ExecOptions, ItemOutcome, ParallelExecutor,
    Pipeline, PipelineResult, RateLimitConfig, TaskContext, WorkError,
};
pub use tokio_util::sync::CancellationToken;
