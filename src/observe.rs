//! Progress and metrics observation.
//!
//! Both samplers are periodic and callback-driven. The executor owns a
//! [`Counters`] block of atomics that workers update; snapshot construction
//! reads it without coordination beyond the atomics themselves.

use crate::breaker::BreakerState;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Periodic progress view handed to `on_progress`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Total input size, when the source knows it. Infinite or opaque
    /// sources report `None`.
    pub total_items: Option<u64>,
    pub items_completed: u64,
    pub items_failed: u64,
    /// In `[0, 100]`. `None` whenever `total_items` is unknown.
    pub percent_complete: Option<f64>,
    pub elapsed: Duration,
    pub items_per_second: f64,
}

/// Periodic engine-level view handed to `on_sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub items_in_flight: usize,
    pub items_completed: u64,
    pub total_failures: u64,
    pub total_retries: u64,
    pub total_timeouts: u64,
    pub current_concurrency: usize,
    /// `None` when no breaker is configured.
    pub breaker_state: Option<BreakerState>,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct ProgressConfig {
    pub report_interval: Duration,
    pub on_progress: Arc<dyn Fn(ProgressSnapshot) + Send + Sync>,
}

impl ProgressConfig {
    pub fn new<F>(report_interval: Duration, on_progress: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        Self { report_interval, on_progress: Arc::new(on_progress) }
    }
}

impl std::fmt::Debug for ProgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressConfig")
            .field("report_interval", &self.report_interval)
            .finish()
    }
}

#[derive(Clone)]
pub struct MetricsConfig {
    pub sample_interval: Duration,
    pub on_sample: Arc<dyn Fn(MetricsSnapshot) + Send + Sync>,
}

impl MetricsConfig {
    pub fn new<F>(sample_interval: Duration, on_sample: F) -> Self
    where
        F: Fn(MetricsSnapshot) + Send + Sync + 'static,
    {
        Self { sample_interval, on_sample: Arc::new(on_sample) }
    }
}

impl std::fmt::Debug for MetricsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsConfig")
            .field("sample_interval", &self.sample_interval)
            .finish()
    }
}

/// Shared execution counters. Workers increment, samplers read.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) pulled: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) breaker_rejections: AtomicU64,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
}

impl Counters {
    pub(crate) fn item_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn item_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    pub(crate) fn progress(&self, total: Option<u64>, elapsed: Duration) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let percent = total.map(|t| {
            if t == 0 {
                100.0
            } else {
                (completed + failed) as f64 / t as f64 * 100.0
            }
        });
        let secs = elapsed.as_secs_f64();
        ProgressSnapshot {
            total_items: total,
            items_completed: completed,
            items_failed: failed,
            percent_complete: percent,
            elapsed,
            items_per_second: if secs > 0.0 { completed as f64 / secs } else { 0.0 },
        }
    }

    pub(crate) fn metrics(
        &self,
        current_concurrency: usize,
        breaker_state: Option<BreakerState>,
        elapsed: Duration,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            items_in_flight: self.in_flight(),
            items_completed: self.completed.load(Ordering::Acquire),
            total_failures: self.failed.load(Ordering::Acquire),
            total_retries: self.retries.load(Ordering::Acquire),
            total_timeouts: self.timeouts.load(Ordering::Acquire),
            current_concurrency,
            breaker_state,
            elapsed,
        }
    }
}
