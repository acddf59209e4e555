//! Adaptive tuning of the concurrency bound.
//!
//! Workers feed `(latency, success)` samples in as items complete. At most
//! once per `sample_interval` the controller compares the window's median
//! latency and success rate against the configured targets and steps the
//! limit by one, staying inside `[min, max]`. The live limit is published
//! through a watch channel; workers pick it up at their next admission
//! decision and in-flight work is never preempted.

use crate::error::BuildError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Increase only when median latency sits comfortably under the target.
const INCREASE_HEADROOM: f64 = 0.8;

/// Adaptive controller settings. Absent from `ExecOptions` means a fixed
/// concurrency bound.
#[derive(Clone)]
pub struct AdaptiveConfig {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
    /// Median latency above this steps the limit down.
    pub target_latency: Duration,
    /// Success rate below this steps the limit down.
    pub min_success_rate: f64,
    /// Minimum time between adjustments. Zero adjusts on every sample.
    pub sample_interval: Duration,
    /// Number of most-recent samples considered.
    pub sample_window: usize,
    /// Invoked as `(old, new)` after every limit change.
    pub on_change: Option<Arc<dyn Fn(usize, usize) + Send + Sync>>,
}

impl std::fmt::Debug for AdaptiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveConfig")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("initial", &self.initial)
            .field("target_latency", &self.target_latency)
            .field("min_success_rate", &self.min_success_rate)
            .field("sample_interval", &self.sample_interval)
            .field("sample_window", &self.sample_window)
            .finish()
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 16,
            initial: 4,
            target_latency: Duration::from_millis(500),
            min_success_rate: 0.9,
            sample_interval: Duration::from_secs(1),
            sample_window: 64,
            on_change: None,
        }
    }
}

impl AdaptiveConfig {
    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.min == 0 || self.min > self.initial || self.initial > self.max {
            return Err(BuildError::InvalidAdaptiveBounds {
                min: self.min,
                initial: self.initial,
                max: self.max,
            });
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(BuildError::InvalidSuccessRate(self.min_success_rate));
        }
        Ok(())
    }
}

struct Tuning {
    samples: VecDeque<(Duration, bool)>,
    last_adjust: Instant,
}

pub struct AdaptiveConcurrency {
    config: AdaptiveConfig,
    limit: watch::Sender<usize>,
    tuning: Mutex<Tuning>,
}

impl std::fmt::Debug for AdaptiveConcurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveConcurrency")
            .field("current", &self.current())
            .field("config", &self.config)
            .finish()
    }
}

impl AdaptiveConcurrency {
    pub fn new(config: AdaptiveConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let (limit, _) = watch::channel(config.initial);
        Ok(Self {
            limit,
            tuning: Mutex::new(Tuning {
                samples: VecDeque::with_capacity(config.sample_window),
                last_adjust: Instant::now(),
            }),
            config,
        })
    }

    /// Watch the live limit. Receivers wake on every change.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.limit.subscribe()
    }

    pub fn current(&self) -> usize {
        *self.limit.borrow()
    }

    /// Feed one completed item's latency and success flag.
    pub fn record(&self, latency: Duration, success: bool) {
        let mut tuning = self.tuning.lock().unwrap_or_else(|p| p.into_inner());
        if tuning.samples.len() == self.config.sample_window {
            tuning.samples.pop_front();
        }
        tuning.samples.push_back((latency, success));

        if tuning.last_adjust.elapsed() >= self.config.sample_interval {
            self.adjust(&tuning.samples);
            tuning.last_adjust = Instant::now();
        }
    }

    fn adjust(&self, samples: &VecDeque<(Duration, bool)>) {
        if samples.is_empty() {
            return;
        }
        let mut latencies: Vec<Duration> = samples.iter().map(|s| s.0).collect();
        latencies.sort_unstable();
        let median = latencies[latencies.len() / 2];
        let successes = samples.iter().filter(|s| s.1).count();
        let success_rate = successes as f64 / samples.len() as f64;

        let old = self.current();
        let new = if median > self.config.target_latency
            || success_rate < self.config.min_success_rate
        {
            old.saturating_sub(1).max(self.config.min)
        } else if median < self.config.target_latency.mul_f64(INCREASE_HEADROOM)
            && success_rate >= self.config.min_success_rate
        {
            (old + 1).min(self.config.max)
        } else {
            old
        };

        if new != old {
            self.limit.send_replace(new);
            tracing::info!(
                old,
                new,
                median_ms = median.as_millis() as u64,
                success_rate,
                "adaptive concurrency adjusted"
            );
            if let Some(on_change) = &self.config.on_change {
                on_change(old, new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn eager(min: usize, initial: usize, max: usize) -> AdaptiveConfig {
        AdaptiveConfig {
            min,
            max,
            initial,
            target_latency: Duration::from_millis(100),
            min_success_rate: 0.9,
            sample_interval: Duration::ZERO,
            sample_window: 8,
            on_change: None,
        }
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let bad = AdaptiveConfig { min: 4, initial: 2, max: 8, ..AdaptiveConfig::default() };
        assert!(matches!(bad.validate(), Err(BuildError::InvalidAdaptiveBounds { .. })));
        let bad = AdaptiveConfig { min_success_rate: 1.5, ..AdaptiveConfig::default() };
        assert!(matches!(bad.validate(), Err(BuildError::InvalidSuccessRate(_))));
    }

    #[test]
    fn slow_latency_steps_down_to_min() {
        let controller = AdaptiveConcurrency::new(eager(1, 3, 8)).unwrap();
        for _ in 0..10 {
            controller.record(Duration::from_millis(500), true);
        }
        assert_eq!(controller.current(), 1);
    }

    #[test]
    fn fast_and_healthy_steps_up_to_max() {
        let controller = AdaptiveConcurrency::new(eager(1, 3, 5)).unwrap();
        for _ in 0..10 {
            controller.record(Duration::from_millis(10), true);
        }
        assert_eq!(controller.current(), 5);
    }

    #[test]
    fn low_success_rate_steps_down_despite_fast_latency() {
        let controller = AdaptiveConcurrency::new(eager(1, 4, 8)).unwrap();
        for _ in 0..8 {
            controller.record(Duration::from_millis(10), false);
        }
        assert_eq!(controller.current(), 1);
    }

    #[test]
    fn comfortable_band_holds_steady() {
        let controller = AdaptiveConcurrency::new(eager(1, 4, 8)).unwrap();
        // Median at 90ms: under target, above the 80ms increase line.
        for _ in 0..8 {
            controller.record(Duration::from_millis(90), true);
        }
        assert_eq!(controller.current(), 4);
    }

    #[test]
    fn change_callback_and_watch_fire() {
        let changes = Arc::new(AtomicUsize::new(0));
        let seen = changes.clone();
        let config = AdaptiveConfig {
            on_change: Some(Arc::new(move |old, new| {
                assert!(new > old);
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            ..eager(1, 2, 4)
        };
        let controller = AdaptiveConcurrency::new(config).unwrap();
        let rx = controller.subscribe();
        controller.record(Duration::from_millis(5), true);
        controller.record(Duration::from_millis(5), true);
        assert!(changes.load(Ordering::SeqCst) >= 1);
        assert!(*rx.borrow() >= 3);
    }

    #[test]
    fn limit_never_leaves_bounds() {
        let controller = AdaptiveConcurrency::new(eager(2, 2, 3)).unwrap();
        for i in 0..50 {
            let latency = if i % 2 == 0 { Duration::from_millis(1) } else { Duration::from_secs(1) };
            controller.record(latency, i % 3 != 0);
            let n = controller.current();
            assert!((2..=3).contains(&n), "limit {} out of bounds", n);
        }
    }
}
