//! Circuit breaker over a rolling outcome window.
//!
//! Three states. Closed admits everything and records final item outcomes in
//! a rolling window of the last `window_size` results; once the window holds
//! at least `min_observations` outcomes and the failure ratio reaches
//! `error_threshold`, the breaker opens. Open rejects admission until
//! `open_duration` has elapsed, then half-open lets through up to
//! `half_open_probes` concurrent probes. All probes succeeding closes the
//! breaker and resets the window; any probe failure reopens it and restarts
//! the timer.
//!
//! State transitions are CAS-atomic. The window itself sits behind a short
//! critical section.

use crate::error::BuildError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for the breaker's open-interval bookkeeping. Swappable so
/// tests can drive state transitions without sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed on this clock's own monotonic timeline.
    fn now_millis(&self) -> u64;
}

/// Production clock anchored at its creation instant.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker settings. Absent from `ExecOptions` means no breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure ratio within the window that trips the breaker, in (0, 1].
    pub error_threshold: f64,
    /// Minimum outcomes observed before the ratio is meaningful.
    pub min_observations: usize,
    /// Number of most-recent outcomes retained.
    pub window_size: usize,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
    /// Concurrent probe admissions allowed in half-open.
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 0.5,
            min_observations: 10,
            window_size: 32,
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

impl BreakerConfig {
    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
            return Err(BuildError::InvalidThreshold(self.error_threshold));
        }
        if self.window_size == 0 {
            return Err(BuildError::ZeroWindow);
        }
        if self.half_open_probes == 0 {
            return Err(BuildError::ZeroProbes);
        }
        Ok(())
    }
}

/// Admission decision for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Admission {
    /// Proceed. `probe` marks a half-open test slot and must be passed back
    /// to [`CircuitBreaker::record`] or [`CircuitBreaker::release`].
    Allowed { probe: bool },
    /// Breaker is open; synthesize a breaker-open error for the item.
    Rejected { window_failures: usize },
}

struct Window {
    ring: VecDeque<bool>,
    failures: usize,
}

impl Window {
    fn push(&mut self, failed: bool, cap: usize) {
        if self.ring.len() == cap {
            if let Some(evicted) = self.ring.pop_front() {
                if evicted {
                    self.failures -= 1;
                }
            }
        }
        self.ring.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn should_trip(&self, threshold: f64, min_observations: usize) -> bool {
        self.ring.len() >= min_observations
            && self.failures as f64 / self.ring.len() as f64 >= threshold
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    window: Mutex<Window>,
    opened_at_millis: AtomicU64,
    probes_in_flight: AtomicUsize,
    probe_successes: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(Self {
            window: Mutex::new(Window {
                ring: VecDeque::with_capacity(config.window_size),
                failures: 0,
            }),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_millis: AtomicU64::new(0),
            probes_in_flight: AtomicUsize::new(0),
            probe_successes: AtomicUsize::new(0),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Decide whether one item may run now.
    pub fn admit(&self) -> Admission {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Admission::Allowed { probe: false },
                STATE_OPEN => {
                    let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.open_duration.as_millis() as u64 {
                        return Admission::Rejected { window_failures: self.window_failures() };
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the race and take the first probe slot.
                            self.probes_in_flight.store(1, Ordering::Release);
                            self.probe_successes.store(0, Ordering::Release);
                            tracing::info!("circuit breaker half-open");
                            return Admission::Allowed { probe: true };
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.probes_in_flight.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_probes {
                        self.probes_in_flight.fetch_sub(1, Ordering::Release);
                        return Admission::Rejected { window_failures: self.window_failures() };
                    }
                    return Admission::Allowed { probe: true };
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    /// Record the final outcome of an admitted item.
    pub fn record(&self, probe: bool, success: bool) {
        if probe {
            self.probes_in_flight.fetch_sub(1, Ordering::AcqRel);
            if success {
                let done = self.probe_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if done >= self.config.half_open_probes
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
                    window.ring.clear();
                    window.failures = 0;
                    tracing::info!("circuit breaker closed");
                }
            } else if self
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!("circuit breaker probe failed, reopening");
            }
            return;
        }

        let (trip, failures) = {
            let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
            window.push(!success, self.config.window_size);
            (
                window.should_trip(self.config.error_threshold, self.config.min_observations),
                window.failures,
            )
        };
        if trip
            && self
                .state
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            tracing::warn!(
                failures,
                threshold = self.config.error_threshold,
                "circuit breaker opened"
            );
        }
    }

    /// Give back an admission without recording an outcome (canceled items).
    pub fn release(&self, probe: bool) {
        if probe {
            self.probes_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn window_failures(&self) -> usize {
        self.window.lock().unwrap_or_else(|p| p.into_inner()).failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestAtomicU64;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<TestAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(TestAtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            error_threshold: 0.5,
            min_observations: 4,
            window_size: 8,
            open_duration: Duration::from_millis(100),
            half_open_probes: 1,
        }
    }

    fn fail_until_open(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            match breaker.admit() {
                Admission::Allowed { probe } => breaker.record(probe, false),
                Admission::Rejected { .. } => {}
            }
        }
    }

    #[test]
    fn config_validation() {
        assert!(BreakerConfig::default().validate().is_ok());
        let bad = BreakerConfig { error_threshold: 0.0, ..BreakerConfig::default() };
        assert_eq!(bad.validate(), Err(BuildError::InvalidThreshold(0.0)));
        let bad = BreakerConfig { window_size: 0, ..BreakerConfig::default() };
        assert_eq!(bad.validate(), Err(BuildError::ZeroWindow));
        let bad = BreakerConfig { half_open_probes: 0, ..BreakerConfig::default() };
        assert_eq!(bad.validate(), Err(BuildError::ZeroProbes));
    }

    #[test]
    fn stays_closed_below_min_observations() {
        let breaker = CircuitBreaker::new(quick_config()).unwrap();
        for _ in 0..3 {
            let Admission::Allowed { probe } = breaker.admit() else { panic!("rejected") };
            breaker.record(probe, false);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let breaker = CircuitBreaker::new(quick_config()).unwrap();
        fail_until_open(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));
    }

    #[test]
    fn stays_closed_while_ratio_below_threshold() {
        let breaker = CircuitBreaker::new(quick_config()).unwrap();
        // Every prefix of this sequence keeps the failure ratio under 0.5.
        for success in [true, true, false, true, false, true, false, true] {
            let Admission::Allowed { probe } = breaker.admit() else { panic!("rejected") };
            breaker.record(probe, success);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_open_duration_then_close_on_probe_success() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(quick_config()).unwrap().with_clock(clock.clone());
        fail_until_open(&breaker, 4);
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));

        clock.advance(150);
        let Admission::Allowed { probe } = breaker.admit() else { panic!("expected probe") };
        assert!(probe);
        breaker.record(probe, true);
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Window was reset; a single failure does not trip it again.
        let Admission::Allowed { probe } = breaker.admit() else { panic!("rejected") };
        breaker.record(probe, false);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens_and_restarts_timer() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(quick_config()).unwrap().with_clock(clock.clone());
        fail_until_open(&breaker, 4);

        clock.advance(150);
        let Admission::Allowed { probe } = breaker.admit() else { panic!("expected probe") };
        breaker.record(probe, false);
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timer restarted: 50ms later still open, 150ms later probing again.
        clock.advance(50);
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));
        clock.advance(100);
        assert!(matches!(breaker.admit(), Admission::Allowed { probe: true }));
    }

    #[test]
    fn half_open_caps_concurrent_probes() {
        let clock = ManualClock::new();
        let config = BreakerConfig { half_open_probes: 2, ..quick_config() };
        let breaker = CircuitBreaker::new(config).unwrap().with_clock(clock.clone());
        fail_until_open(&breaker, 4);
        clock.advance(150);

        let first = breaker.admit();
        let second = breaker.admit();
        let third = breaker.admit();
        assert!(matches!(first, Admission::Allowed { probe: true }));
        assert!(matches!(second, Admission::Allowed { probe: true }));
        assert!(matches!(third, Admission::Rejected { .. }));

        // Both probes must succeed before the breaker closes.
        breaker.record(true, true);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(true, true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn release_frees_probe_slot_without_outcome() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(quick_config()).unwrap().with_clock(clock.clone());
        fail_until_open(&breaker, 4);
        clock.advance(150);

        let Admission::Allowed { probe } = breaker.admit() else { panic!("expected probe") };
        assert!(matches!(breaker.admit(), Admission::Rejected { .. }));
        breaker.release(probe);
        // Slot freed, still half-open, next admit probes again.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(matches!(breaker.admit(), Admission::Allowed { probe: true }));
    }

    #[test]
    fn window_evicts_oldest_outcome() {
        let mut window = Window { ring: VecDeque::new(), failures: 0 };
        window.push(true, 3);
        window.push(true, 3);
        window.push(false, 3);
        assert_eq!(window.failures, 2);

        // Fourth push evicts the oldest failure.
        window.push(false, 3);
        assert_eq!(window.failures, 1);
        assert_eq!(window.ring.len(), 3);
        assert!(!window.should_trip(0.5, 3));
    }
}
