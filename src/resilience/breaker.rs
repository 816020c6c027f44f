//! Per (server, tool) circuit breaker.
//!
//! States are kept in a sharded [`DashMap`]; every read-modify-write happens
//! under the entry's shard lock, so concurrent failures never increment a
//! stale count.
//!
//! Recovery is time-based: once `cooldown` has elapsed an open breaker lets
//! exactly one probe call through. A successful probe closes it, a failed
//! one re-opens it for another cooldown. [`CircuitBreaker::reset`] is the
//! manual override.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::mcp::ServerId;

/// Identity of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub server_id: ServerId,
    pub tool: String,
}

impl BreakerKey {
    pub fn new(server_id: &ServerId, tool: &str) -> Self {
        Self {
            server_id: server_id.clone(),
            tool: tool.to_string(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.tool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Cooldown elapsed; the next caller is admitted as a probe.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// Time before an open breaker admits a probe. `None` means manual
    /// reset only.
    pub cooldown: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Some(Duration::from_secs(30)),
        }
    }
}

impl BreakerConfig {
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    open: bool,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Outcome of asking a breaker for permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed; call normally.
    Allowed,
    /// Open but cooled down; this caller is the single probe.
    Probe,
    /// Open; do not contact the server.
    Rejected { failures: u32 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Transition caused by recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still closed (or already open).
    Counted { failures: u32 },
    /// This failure opened the breaker.
    Opened { failures: u32 },
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    states: DashMap<BreakerKey, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask to call through `key`.
    pub fn admit(&self, key: &BreakerKey) -> Admission {
        let Some(mut state) = self.states.get_mut(key) else {
            return Admission::Allowed;
        };
        if !state.open {
            return Admission::Allowed;
        }
        let cooled = match (self.config.cooldown, state.opened_at) {
            (Some(cooldown), Some(opened_at)) => opened_at.elapsed() >= cooldown,
            _ => false,
        };
        if cooled && !state.probe_in_flight {
            state.probe_in_flight = true;
            return Admission::Probe;
        }
        Admission::Rejected {
            failures: state.failure_count,
        }
    }

    /// False while open. Claims the probe slot when one is due.
    pub fn allow(&self, key: &BreakerKey) -> bool {
        self.admit(key).is_allowed()
    }

    /// Reset the failure count. Returns true if this closed an open breaker.
    pub fn on_success(&self, key: &BreakerKey) -> bool {
        match self.states.get_mut(key) {
            Some(mut state) => {
                let was_open = state.open;
                *state = BreakerState::default();
                was_open
            }
            None => false,
        }
    }

    /// Increment the stored failure count.
    ///
    /// For callers admitted while closed. A half-open breaker's probe slot
    /// is left alone; only [`CircuitBreaker::on_probe_failure`] settles it.
    pub fn on_failure(&self, key: &BreakerKey) -> FailureOutcome {
        let mut state = self.states.entry(key.clone()).or_default();
        Self::count_failure(&mut state, self.config.threshold)
    }

    /// Record the failure of a call admitted as [`Admission::Probe`].
    ///
    /// Keeps the breaker open for another cooldown and frees the slot.
    pub fn on_probe_failure(&self, key: &BreakerKey) -> FailureOutcome {
        let mut state = self.states.entry(key.clone()).or_default();
        if !state.open {
            // Closed by a concurrent success while the probe was out.
            return Self::count_failure(&mut state, self.config.threshold);
        }
        state.failure_count = state.failure_count.saturating_add(1);
        state.probe_in_flight = false;
        state.opened_at = Some(Instant::now());
        FailureOutcome::Counted {
            failures: state.failure_count,
        }
    }

    fn count_failure(state: &mut BreakerState, threshold: u32) -> FailureOutcome {
        state.failure_count = state.failure_count.saturating_add(1);
        let failures = state.failure_count;
        if !state.open && failures >= threshold {
            state.open = true;
            state.opened_at = Some(Instant::now());
            return FailureOutcome::Opened { failures };
        }
        FailureOutcome::Counted { failures }
    }

    /// Give back a probe slot whose call ended without an outcome.
    pub fn abandon(&self, key: &BreakerKey) {
        if let Some(mut state) = self.states.get_mut(key) {
            state.probe_in_flight = false;
        }
    }

    /// Close the breaker by hand.
    pub fn reset(&self, key: &BreakerKey) {
        self.states.remove(key);
    }

    pub fn state(&self, key: &BreakerKey) -> CircuitState {
        match self.states.get(key) {
            Some(state) if state.open => {
                let cooled = match (self.config.cooldown, state.opened_at) {
                    (Some(cooldown), Some(opened_at)) => opened_at.elapsed() >= cooldown,
                    _ => false,
                };
                if cooled {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self, key: &BreakerKey) -> u32 {
        self.states.get(key).map(|s| s.failure_count).unwrap_or(0)
    }

    /// Keys currently open, for diagnostics.
    pub fn open_keys(&self) -> Vec<BreakerKey> {
        self.states
            .iter()
            .filter(|entry| entry.open)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(tool: &str) -> BreakerKey {
        BreakerKey::new(&ServerId::from("srv"), tool)
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default().with_threshold(threshold))
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let breaker = breaker(3);
        let k = key("x");
        assert_eq!(breaker.on_failure(&k), FailureOutcome::Counted { failures: 1 });
        assert!(breaker.allow(&k));
        assert_eq!(breaker.on_failure(&k), FailureOutcome::Counted { failures: 2 });
        assert!(breaker.allow(&k));
        assert_eq!(breaker.on_failure(&k), FailureOutcome::Opened { failures: 3 });
        assert!(!breaker.allow(&k));
        assert_eq!(breaker.admit(&k), Admission::Rejected { failures: 3 });
        assert_eq!(breaker.state(&k), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_before_threshold() {
        let breaker = breaker(3);
        let k = key("x");
        breaker.on_failure(&k);
        breaker.on_failure(&k);
        assert!(!breaker.on_success(&k));
        assert_eq!(breaker.failure_count(&k), 0);
        breaker.on_failure(&k);
        breaker.on_failure(&k);
        assert!(breaker.allow(&k));
    }

    #[test]
    fn test_keys_are_isolated() {
        let breaker = breaker(1);
        breaker.on_failure(&key("x"));
        assert!(!breaker.allow(&key("x")));
        assert!(breaker.allow(&key("y")));
        assert!(breaker.allow(&BreakerKey::new(&ServerId::from("other"), "x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_probe() {
        let breaker = CircuitBreaker::new(
            BreakerConfig::default()
                .with_threshold(1)
                .with_cooldown(Some(Duration::from_secs(30))),
        );
        let k = key("x");
        breaker.on_failure(&k);
        assert!(!breaker.allow(&k));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(&k), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(&k), Admission::Probe);
        // Only one probe at a time.
        assert!(!breaker.allow(&k));

        assert!(breaker.on_success(&k));
        assert_eq!(breaker.state(&k), CircuitState::Closed);
        assert!(breaker.allow(&k));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(
            BreakerConfig::default()
                .with_threshold(2)
                .with_cooldown(Some(Duration::from_secs(10))),
        );
        let k = key("x");
        breaker.on_failure(&k);
        breaker.on_failure(&k);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(&k), Admission::Probe);
        assert_eq!(breaker.on_probe_failure(&k), FailureOutcome::Counted { failures: 3 });
        assert_eq!(breaker.state(&k), CircuitState::Open);
        assert!(!breaker.allow(&k));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(&k), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_keeps_probe_slot() {
        let breaker = CircuitBreaker::new(
            BreakerConfig::default()
                .with_threshold(1)
                .with_cooldown(Some(Duration::from_secs(10))),
        );
        let k = key("x");
        breaker.on_failure(&k);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(&k), Admission::Probe);

        // A call admitted before the breaker opened fails while the probe
        // is still out.
        assert_eq!(breaker.on_failure(&k), FailureOutcome::Counted { failures: 2 });
        assert_eq!(breaker.admit(&k), Admission::Rejected { failures: 2 });
        assert_eq!(breaker.state(&k), CircuitState::HalfOpen);

        assert_eq!(breaker.on_probe_failure(&k), FailureOutcome::Counted { failures: 3 });
        assert_eq!(breaker.state(&k), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit(&k), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let breaker = CircuitBreaker::new(
            BreakerConfig::default()
                .with_threshold(1)
                .with_cooldown(Some(Duration::from_secs(1))),
        );
        let k = key("x");
        breaker.on_failure(&k);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.admit(&k), Admission::Probe);
        breaker.abandon(&k);
        assert_eq!(breaker.admit(&k), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_only_stays_open() {
        let breaker = CircuitBreaker::new(
            BreakerConfig::default()
                .with_threshold(1)
                .with_cooldown(None),
        );
        let k = key("x");
        breaker.on_failure(&k);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!breaker.allow(&k));
        breaker.reset(&k);
        assert!(breaker.allow(&k));
        assert_eq!(breaker.failure_count(&k), 0);
    }

    #[test]
    fn test_concurrent_failures_are_not_lost() {
        let breaker = Arc::new(breaker(1_000_000));
        let k = key("x");
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                let k = k.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        breaker.on_failure(&k);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(breaker.failure_count(&k), 4000);
    }

    #[test]
    fn test_concurrent_open_reported_once() {
        let breaker = Arc::new(breaker(50));
        let k = key("x");
        let threads: Vec<_> = (0..10)
            .map(|_| {
                let breaker = breaker.clone();
                let k = k.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| matches!(breaker.on_failure(&k), FailureOutcome::Opened { .. }))
                        .count()
                })
            })
            .collect();
        let opened: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(opened, 1);
        assert_eq!(breaker.open_keys(), vec![k]);
    }
}
