//! Failure classification and per-invocation retry planning.

use std::time::Duration;

use super::backoff::Backoff;
use crate::error::{TimeoutStage, ToolError};

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Broken or unopenable session: retry once on a fresh connection.
    TransientConnection,
    /// Throttled: back off, then retry.
    RateLimited,
    /// The tool ran and failed, or the call was malformed: surface now.
    ToolExecution,
    /// Nothing a retry can fix.
    Fatal,
}

pub fn classify(error: &ToolError) -> FailureClass {
    match error {
        ToolError::Connection { .. } | ToolError::Auth { .. } => FailureClass::TransientConnection,
        ToolError::Timeout { stage, .. } => match stage {
            TimeoutStage::Connect | TimeoutStage::Call => FailureClass::TransientConnection,
            TimeoutStage::Invocation => FailureClass::Fatal,
        },
        ToolError::RateLimited { .. } => FailureClass::RateLimited,
        ToolError::ToolExecution { .. }
        | ToolError::SchemaValidation { .. }
        | ToolError::UnknownTool { .. } => FailureClass::ToolExecution,
        ToolError::CircuitOpen { .. }
        | ToolError::Cancelled { .. }
        | ToolError::UnknownServer(_)
        | ToolError::DuplicateServer(_)
        | ToolError::InvalidConfig(_) => FailureClass::Fatal,
    }
}

/// Bounds on retrying a single invocation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub rate_limit_base: Duration,
    /// Cap on any single backoff delay.
    pub rate_limit_max_wait: Duration,
    /// Rate-limit retries allowed per invocation.
    pub rate_limit_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            rate_limit_base: Backoff::DEFAULT_BASE,
            rate_limit_max_wait: Backoff::DEFAULT_MAX,
            rate_limit_max_retries: 2,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// Replace the session before the next attempt.
        reconnect: bool,
    },
    GiveUp,
}

/// Retry bookkeeping for one invocation.
#[derive(Debug)]
pub struct RetryPlan {
    max_attempts: u32,
    max_rate_limit_retries: u32,
    attempts: u32,
    rate_limit_retries: u32,
    reconnected: bool,
    backoff: Backoff,
}

impl RetryPlan {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts.max(1),
            max_rate_limit_retries: policy.rate_limit_max_retries,
            attempts: 0,
            rate_limit_retries: 0,
            reconnected: false,
            backoff: Backoff::with_config(policy.rate_limit_base, policy.rate_limit_max_wait),
        }
    }

    /// Record the start of an attempt; returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_failure(&mut self, error: &ToolError) -> RetryDecision {
        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match classify(error) {
            FailureClass::TransientConnection if !self.reconnected => {
                self.reconnected = true;
                RetryDecision::Retry {
                    delay: Duration::ZERO,
                    reconnect: true,
                }
            }
            FailureClass::RateLimited if self.rate_limit_retries < self.max_rate_limit_retries => {
                self.rate_limit_retries += 1;
                let hint = match error {
                    ToolError::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                RetryDecision::Retry {
                    delay: self.backoff.next_delay_with_hint(hint),
                    reconnect: false,
                }
            }
            _ => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::ServerId;
    use rstest::rstest;

    fn id() -> ServerId {
        ServerId::from("s")
    }

    fn rate_limited(retry_after: Option<Duration>) -> ToolError {
        ToolError::RateLimited {
            server_id: id(),
            tool: "t".into(),
            retry_after,
            message: "429".into(),
        }
    }

    fn timeout(stage: TimeoutStage) -> ToolError {
        ToolError::Timeout {
            server_id: id(),
            tool: Some("t".into()),
            stage,
            after: Duration::from_secs(1),
        }
    }

    #[rstest]
    #[case(ToolError::Connection { server_id: id(), message: "reset".into() }, FailureClass::TransientConnection)]
    #[case(ToolError::Auth { server_id: id(), message: "401".into() }, FailureClass::TransientConnection)]
    #[case(timeout(TimeoutStage::Call), FailureClass::TransientConnection)]
    #[case(timeout(TimeoutStage::Invocation), FailureClass::Fatal)]
    #[case(rate_limited(None), FailureClass::RateLimited)]
    #[case(ToolError::tool_execution(&id(), "t", "boom"), FailureClass::ToolExecution)]
    #[case(ToolError::SchemaValidation { server_id: id(), tool: "t".into(), reason: "missing".into() }, FailureClass::ToolExecution)]
    #[case(ToolError::CircuitOpen { server_id: id(), tool: "t".into(), failures: 3 }, FailureClass::Fatal)]
    #[case(ToolError::Cancelled { server_id: id(), tool: "t".into() }, FailureClass::Fatal)]
    #[case(ToolError::InvalidConfig("bad".into()), FailureClass::Fatal)]
    fn test_classify(#[case] error: ToolError, #[case] expected: FailureClass) {
        assert_eq!(classify(&error), expected);
    }

    #[test]
    fn test_transient_retries_once_with_reconnect() {
        let mut plan = RetryPlan::new(&RetryPolicy {
            max_attempts: 5,
            ..Default::default()
        });
        let err = ToolError::Connection {
            server_id: id(),
            message: "reset".into(),
        };
        plan.begin_attempt();
        assert_eq!(
            plan.on_failure(&err),
            RetryDecision::Retry {
                delay: Duration::ZERO,
                reconnect: true
            }
        );
        plan.begin_attempt();
        assert_eq!(plan.on_failure(&err), RetryDecision::GiveUp);
    }

    #[test]
    fn test_tool_execution_never_retried() {
        let mut plan = RetryPlan::new(&RetryPolicy::default());
        plan.begin_attempt();
        assert_eq!(
            plan.on_failure(&ToolError::tool_execution(&id(), "t", "boom")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_attempt_cap() {
        let mut plan = RetryPlan::new(&RetryPolicy::default());
        plan.begin_attempt();
        assert!(matches!(plan.on_failure(&rate_limited(None)), RetryDecision::Retry { .. }));
        plan.begin_attempt();
        assert_eq!(plan.on_failure(&rate_limited(None)), RetryDecision::GiveUp);
        assert_eq!(plan.attempts(), 2);
    }

    #[test]
    fn test_rate_limit_delays_non_decreasing_and_bounded() {
        let policy = RetryPolicy {
            max_attempts: 100,
            rate_limit_base: Duration::from_millis(100),
            rate_limit_max_wait: Duration::from_millis(700),
            rate_limit_max_retries: 6,
        };
        let mut plan = RetryPlan::new(&policy);
        let hints = [None, Some(Duration::from_secs(5)), None, Some(Duration::from_millis(1)), None, None, None, None];

        let mut delays = Vec::new();
        for hint in hints {
            plan.begin_attempt();
            match plan.on_failure(&rate_limited(hint)) {
                RetryDecision::Retry { delay, reconnect } => {
                    assert!(!reconnect);
                    delays.push(delay);
                }
                RetryDecision::GiveUp => break,
            }
        }

        assert_eq!(delays.len(), 6);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(700)));
    }
}
