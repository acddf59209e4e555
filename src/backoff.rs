//! Backoff strategies for the retry engine.

use rand::Rng;
use std::time::Duration;

/// Default cap applied to the exponential strategies.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Fixed delay between attempts.
    Fixed { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// Delay doubles each attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Uniform random delay in `[0, base * 2^(n-1)]`, capped at `max`.
    ExponentialJitter { base: Duration, max: Duration },
}

impl Backoff {
    pub fn none() -> Self {
        Backoff::None
    }

    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: MAX_BACKOFF }
    }

    pub fn exponential_jitter(base: Duration) -> Self {
        Backoff::ExponentialJitter { base, max: MAX_BACKOFF }
    }

    /// Override the cap on the exponential strategies. No effect on the others.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match self {
            Backoff::Exponential { ref mut max, .. }
            | Backoff::ExponentialJitter { ref mut max, .. } => *max = cap,
            _ => {}
        }
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Same as [`Backoff::delay`] with an injected RNG for deterministic tests.
    pub fn delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            Backoff::Exponential { base, max } => exponential_delay(*base, attempt).min(*max),
            Backoff::ExponentialJitter { base, max } => {
                let ceiling = exponential_delay(*base, attempt).min(*max);
                let millis = ceiling.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
        }
    }
}

fn exponential_delay(base: Duration, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
    let multiplier = 2u32.saturating_pow(exponent);
    base.checked_mul(multiplier).unwrap_or(Duration::from_secs(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_zero() {
        let backoff = Backoff::none();
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(9), Duration::ZERO);
    }

    #[test]
    fn fixed_is_constant() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(50), Duration::from_millis(250));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(5), Duration::from_millis(500));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(30), Duration::from_secs(1));
    }

    #[test]
    fn exponential_survives_large_attempts() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(u64::MAX),
        };
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }

    #[test]
    fn jitter_stays_below_exponential_ceiling() {
        let backoff = Backoff::exponential_jitter(Duration::from_millis(100));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=6 {
            let ceiling = Backoff::exponential(Duration::from_millis(100)).delay(attempt);
            let sampled = backoff.delay_with_rng(attempt, &mut rng);
            assert!(sampled <= ceiling, "attempt {}: {:?} > {:?}", attempt, sampled, ceiling);
        }
    }

    #[test]
    fn jitter_handles_zero_base() {
        let backoff = Backoff::exponential_jitter(Duration::ZERO);
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }

    #[test]
    fn with_max_ignores_non_exponential() {
        let fixed = Backoff::fixed(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(fixed.delay(1), Duration::from_secs(5));
        let linear = Backoff::linear(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(linear.delay(2), Duration::from_secs(10));
    }
}
