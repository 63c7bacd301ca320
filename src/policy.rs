// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Policies
//!
//! A reconnect policy is consulted by the connection's reconnect loop each time
//! the transport is lost or an attempt to replace it fails. It only decides; the
//! loop does the waiting, so policies are plain synchronous values.

use crate::transport::CloseReason;
use std::time::Duration;

/// Reply code sent when the virtual host does not exist.
pub const REPLY_INVALID_PATH: u16 = 402;
/// Reply code sent when the credentials are refused.
pub const REPLY_ACCESS_REFUSED: u16 = 403;

/// Close codes that cannot heal by retrying.
pub const DEFAULT_FATAL_CODES: &[u16] = &[REPLY_INVALID_PATH, REPLY_ACCESS_REFUSED];

/// Outcome of a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAfter(Duration),
    GiveUp,
}

/// Decides whether, and after what delay, the transport should be re-opened.
///
/// `attempt` starts at 1 for the first attempt of a reconnect cycle.
#[cfg_attr(test, mockall::automock)]
pub trait ReconnectPolicy: Send + Sync {
    fn decide(&self, reason: &CloseReason, attempt: u32) -> Decision;
}

fn is_fatal(reason: &CloseReason, fatal_codes: &[u16]) -> bool {
    match reason {
        CloseReason::Closed { code, .. } => fatal_codes.contains(code),
        CloseReason::Transport(_) => false,
    }
}

fn exhausted(attempt: u32, max_attempts: Option<u32>) -> bool {
    max_attempts.is_some_and(|max| attempt > max)
}

/// Retries after the same delay every time.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
    max_attempts: Option<u32>,
    fatal_codes: Vec<u16>,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> FixedInterval {
        FixedInterval {
            interval,
            max_attempts: None,
            fatal_codes: DEFAULT_FATAL_CODES.to_vec(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn fatal_codes(mut self, codes: &[u16]) -> Self {
        self.fatal_codes = codes.to_vec();
        self
    }
}

impl ReconnectPolicy for FixedInterval {
    fn decide(&self, reason: &CloseReason, attempt: u32) -> Decision {
        if is_fatal(reason, &self.fatal_codes) || exhausted(attempt, self.max_attempts) {
            return Decision::GiveUp;
        }

        Decision::RetryAfter(self.interval)
    }
}

/// Doubles (by default) the delay after every failed attempt, up to a cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    max_attempts: Option<u32>,
    fatal_codes: Vec<u16>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            initial,
            max,
            multiplier: 2,
            max_attempts: None,
            fatal_codes: DEFAULT_FATAL_CODES.to_vec(),
        }
    }

    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn fatal_codes(mut self, codes: &[u16]) -> Self {
        self.fatal_codes = codes.to_vec();
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn decide(&self, reason: &CloseReason, attempt: u32) -> Decision {
        if is_fatal(reason, &self.fatal_codes) || exhausted(attempt, self.max_attempts) {
            return Decision::GiveUp;
        }

        Decision::RetryAfter(self.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forced() -> CloseReason {
        CloseReason::Closed {
            code: 320,
            reason: "CONNECTION_FORCED".to_owned(),
        }
    }

    #[test]
    fn fixed_interval_always_retries_transport_losses() {
        let policy = FixedInterval::new(Duration::from_secs(1));

        for attempt in 1..50 {
            assert_eq!(
                policy.decide(&CloseReason::Transport("reset".to_owned()), attempt),
                Decision::RetryAfter(Duration::from_secs(1))
            );
        }
        assert_eq!(
            policy.decide(&forced(), 1),
            Decision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn should_give_up_on_fatal_codes() {
        let policy = FixedInterval::new(Duration::from_secs(1));
        let refused = CloseReason::Closed {
            code: REPLY_ACCESS_REFUSED,
            reason: "ACCESS_REFUSED".to_owned(),
        };

        assert_eq!(policy.decide(&refused, 1), Decision::GiveUp);

        let lenient = policy.fatal_codes(&[]);
        assert_eq!(
            lenient.decide(&refused, 1),
            Decision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn should_give_up_after_max_attempts() {
        let policy = FixedInterval::new(Duration::from_millis(10)).max_attempts(3);

        assert!(matches!(policy.decide(&forced(), 3), Decision::RetryAfter(_)));
        assert_eq!(policy.decide(&forced(), 4), Decision::GiveUp);
    }

    #[test]
    fn backoff_grows_until_the_cap() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (1..=6)
            .map(|attempt| match policy.decide(&forced(), attempt) {
                Decision::RetryAfter(delay) => delay.as_millis(),
                Decision::GiveUp => 0,
            })
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn backoff_does_not_overflow() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30))
            .multiplier(10);

        assert_eq!(
            policy.decide(&forced(), u32::MAX),
            Decision::RetryAfter(Duration::from_secs(30))
        );
    }
}
