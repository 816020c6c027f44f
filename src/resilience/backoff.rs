//! Delay schedule for retrying rate-limited calls.
//!
//! Delays double from `base` up to `max`. A retry hint from the server may
//! lengthen a delay but never past `max`, and the schedule never shrinks:
//! a short hint after a long one keeps the longer delay.

use std::time::Duration;

/// Doubling delay schedule with a ceiling.
///
/// ```
/// use toolgate::resilience::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
///
/// // The server asked for a second; that fits under the ceiling.
/// assert_eq!(
///     backoff.next_delay_with_hint(Some(Duration::from_secs(1))),
///     Duration::from_secs(1)
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Delays handed out since the last reset.
    attempt: u32,
    /// Lower bound for the next delay.
    floor: Duration,
}

impl Backoff {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(3);

    /// Schedule starting at 100ms and capped at 3s.
    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }

    /// Schedule with a custom first delay and ceiling.
    ///
    /// A `base` above `max` is clamped to `max`.
    pub fn with_config(base: Duration, max: Duration) -> Self {
        Self {
            base: base.min(max),
            max,
            attempt: 0,
            floor: Duration::ZERO,
        }
    }

    /// Delay before the next retry, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_hint(None)
    }

    /// Advance the schedule, honouring a server retry hint.
    pub fn next_delay_with_hint(&mut self, hint: Option<Duration>) -> Duration {
        let mut delay = self.current_delay().max(self.floor);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(self.max));
        }
        self.floor = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from `base`, forgetting any hint.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.floor = Duration::ZERO;
    }

    /// Number of delays handed out since creation or the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Ceiling on any single delay.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Scheduled delay for the current attempt, ignoring hints.
    pub fn current_delay(&self) -> Duration {
        // Past 2^31 the product saturates anyway.
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn schedule(backoff: &mut Backoff, n: usize) -> Vec<Duration> {
        (0..n).map(|_| backoff.next_delay()).collect()
    }

    #[rstest]
    #[case(Backoff::new(), vec![ms(100), ms(200), ms(400), ms(800), ms(1600), ms(3000), ms(3000)])]
    #[case(Backoff::with_config(ms(100), ms(500)), vec![ms(100), ms(200), ms(400), ms(500), ms(500)])]
    #[case(Backoff::with_config(ms(50), ms(50)), vec![ms(50), ms(50), ms(50)])]
    fn test_schedule(#[case] mut backoff: Backoff, #[case] expected: Vec<Duration>) {
        assert_eq!(schedule(&mut backoff, expected.len()), expected);
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let mut backoff = Backoff::with_config(ms(900), ms(300));
        assert_eq!(backoff.next_delay(), ms(300));
    }

    #[test]
    fn test_hint_capped_and_sticky() {
        let mut backoff = Backoff::with_config(ms(100), ms(500));
        assert_eq!(backoff.next_delay_with_hint(Some(Duration::from_secs(60))), ms(500));

        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay_with_hint(Some(ms(900))), ms(900));
        assert_eq!(backoff.next_delay_with_hint(Some(ms(10))), ms(900));
        assert!(backoff.next_delay() >= ms(900));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new();
        schedule(&mut backoff, 4);
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), ms(100));
        assert_eq!(backoff.next_delay(), ms(100));
    }

    #[test]
    fn test_long_runs_stay_capped() {
        let mut backoff = Backoff::new();
        assert!(schedule(&mut backoff, 200).iter().all(|d| *d <= Backoff::DEFAULT_MAX));
    }
}
