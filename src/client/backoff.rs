//! Reconnect backoff schedule.

use std::time::Duration;

/// Exponential reconnect delay.
///
/// [`Backoff::next_delay`] hands out the current interval and then grows it
/// by `factor`, capped at `max`. [`Backoff::reset`] returns to `min` after a
/// successful connection. There is no jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    /// Schedule starting at `min`. `min` is clamped to `max` and a factor
    /// below 1 (or not finite) is treated as 1.
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let min = min.min(max);
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        Self {
            min,
            max,
            factor,
            current: min,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .max(delay)
            .min(self.max);
        delay
    }

    /// Back to the minimum interval.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Interval the next failure will wait.
    pub fn current(&self) -> Duration {
        self.current
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Delays never decrease, never exceed the max, and reset to the min.
        #[test]
        fn delays_are_monotonic_and_capped(
            min_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            factor in 1.0f64..4.0,
            failures in 1usize..40,
        ) {
            let mut backoff = Backoff::new(
                Duration::from_millis(min_ms),
                Duration::from_millis(max_ms),
                factor,
            );
            let mut previous = Duration::ZERO;
            for _ in 0..failures {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max_ms));
                previous = delay;
            }
            backoff.reset();
            prop_assert_eq!(backoff.next_delay(), Duration::from_millis(min_ms.min(max_ms)));
        }
    }
}
