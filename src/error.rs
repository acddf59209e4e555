//! Error types for parallel executions.

use std::fmt;
use std::time::Duration;

/// Boxed error used for source failures and pipeline stage failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cap the number of attempt failures retained per item to avoid unbounded growth.
pub const MAX_ATTEMPT_FAILURES: usize = 10;

/// Terminal disposition of a single work item.
///
/// Produced by the retry engine after the last attempt for an item, or
/// synthesized at an admission gate (circuit breaker, cancellation).
#[derive(Debug)]
pub enum WorkError<E> {
    /// The execution was canceled while this item was pending or running.
    Canceled,
    /// The final attempt exceeded the per-attempt deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// Admission was rejected because the circuit breaker is open.
    BreakerOpen { window_failures: usize },
    /// The user function failed with an error classified as permanent.
    App(E),
    /// Every retry attempt failed with a transient error.
    Exhausted { attempts: usize, failures: Vec<E> },
    /// The user function panicked. Permanent for this item.
    Panicked { detail: String },
}

impl<E: Clone> Clone for WorkError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Canceled => Self::Canceled,
            Self::Timeout { elapsed, timeout } => {
                Self::Timeout { elapsed: *elapsed, timeout: *timeout }
            }
            Self::BreakerOpen { window_failures } => {
                Self::BreakerOpen { window_failures: *window_failures }
            }
            Self::App(e) => Self::App(e.clone()),
            Self::Exhausted { attempts, failures } => {
                Self::Exhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Panicked { detail } => Self::Panicked { detail: detail.clone() },
        }
    }
}

impl<E: fmt::Display> fmt::Display for WorkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "execution canceled"),
            Self::Timeout { elapsed, timeout } => {
                write!(f, "attempt timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::BreakerOpen { window_failures } => {
                write!(f, "circuit breaker open ({} failures in window)", window_failures)
            }
            Self::App(e) => write!(f, "{}", e),
            Self::Exhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retries exhausted after {} attempts, last error: {}",
                    attempts, last
                )
            }
            Self::Panicked { detail } => write!(f, "worker panicked: {}", detail),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for WorkError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::App(e) => Some(e),
            Self::Exhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> WorkError<E> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }

    /// Borrow the application error if this is an `App` variant.
    pub fn as_app(&self) -> Option<&E> {
        match self {
            Self::App(e) => Some(e),
            _ => None,
        }
    }

    /// Extract the application error if this is an `App` variant.
    pub fn into_app(self) -> Option<E> {
        match self {
            Self::App(e) => Some(e),
            _ => None,
        }
    }

    /// Access the recorded attempt failures for `Exhausted`, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::Exhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}

/// Terminal outcome of a whole execution.
///
/// `Canceled` and `Source` are terminal regardless of the configured error
/// mode. `Item` is produced by fail-fast, `Aggregate` by collect-and-continue.
#[derive(Debug)]
pub enum ExecError<E> {
    /// External cancellation ended the execution.
    Canceled,
    /// The input sequence itself failed. Always fatal.
    Source(BoxError),
    /// Fail-fast terminated the execution on this item's error.
    Item { index: u64, error: WorkError<E> },
    /// One entry per failed item, in completion order.
    Aggregate { errors: Vec<(u64, WorkError<E>)> },
}

impl<E: fmt::Display> fmt::Display for ExecError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "execution canceled"),
            Self::Source(e) => write!(f, "input sequence failed: {}", e),
            Self::Item { index, error } => {
                write!(f, "item {} failed: {}", index, error)
            }
            Self::Aggregate { errors } => {
                write!(f, "{} items failed", errors.len())?;
                if let Some((index, error)) = errors.first() {
                    write!(f, ", first at index {}: {}", index, error)?;
                }
                Ok(())
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ExecError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(e) => Some(e.as_ref()),
            Self::Item { error, .. } => Some(error),
            Self::Aggregate { errors } => {
                errors.first().map(|(_, e)| e as &dyn std::error::Error)
            }
            Self::Canceled => None,
        }
    }
}

impl<E> ExecError<E> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Per-item errors collected under collect-and-continue, if any.
    pub fn item_errors(&self) -> Option<&[(u64, WorkError<E>)]> {
        match self {
            Self::Aggregate { errors } => Some(errors.as_slice()),
            _ => None,
        }
    }
}

/// Configuration rejected at build time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("max_concurrency must be >= 1")]
    ZeroConcurrency,
    #[error("channel_capacity must be >= 1")]
    ZeroCapacity,
    #[error("batch size must be >= 1")]
    ZeroBatch,
    #[error("tokens_per_second must be positive and finite (got {0})")]
    InvalidRate(f64),
    #[error("tokens_per_op must be positive and finite (got {0})")]
    InvalidCost(f64),
    #[error("burst_capacity {burst} cannot cover tokens_per_op {cost}")]
    BurstBelowCost { burst: f64, cost: f64 },
    #[error("error_threshold must be within (0, 1] (got {0})")]
    InvalidThreshold(f64),
    #[error("breaker window_size must be >= 1")]
    ZeroWindow,
    #[error("half_open_probes must be >= 1")]
    ZeroProbes,
    #[error("adaptive bounds must satisfy 1 <= min <= initial <= max (got min={min}, initial={initial}, max={max})")]
    InvalidAdaptiveBounds { min: usize, initial: usize, max: usize },
    #[error("min_success_rate must be within [0, 1] (got {0})")]
    InvalidSuccessRate(f64),
}
