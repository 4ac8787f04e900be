// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Reconnection supervision
//!
//! When a stream breaks, the [`Supervisor`] decides whether and when to
//! negotiate a new one:
//!
//! ```text
//! Idle -> BackingOff -> Negotiating -> Idle
//!             ^              |
//!             +--------------+ (attempt failed)
//! ```
//!
//! The supervisor gives up (`Abandoned`) after `max_attempts` consecutive
//! failures, on errors which are pointless to retry (such as rejected
//! credentials or a `conflict` stream error), or when the session is closed
//! locally.

use core::time::Duration;

use rand::Rng;

use crate::error::Error;

/// How long to wait between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// Never reconnect.
    Disabled,

    /// Always wait the same time.
    Fixed(Duration),

    /// A random base delay between 2 and 15 seconds, picked once. The
    /// first seven attempts wait the base delay, the next six six times
    /// that, and any later attempt thirty times that.
    RandomIncreasing,

    /// Double the delay after each failed attempt.
    Exponential {
        /// Delay before the first attempt.
        initial: Duration,
        /// Upper bound for the delay.
        max: Duration,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        ReconnectStrategy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Reconnection policy of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectPolicy {
    /// Delay between attempts.
    pub strategy: ReconnectStrategy,

    /// Give up after this many consecutive failed attempts. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Policy with the given strategy and no attempt limit.
    pub fn new(strategy: ReconnectStrategy) -> Self {
        Self {
            strategy,
            max_attempts: None,
        }
    }

    /// Never reconnect.
    pub fn disabled() -> Self {
        Self::new(ReconnectStrategy::Disabled)
    }

    /// Limit the number of consecutive failed attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Where the supervisor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// Connected, or not yet started.
    #[default]
    Idle,

    /// Waiting before the next attempt.
    BackingOff {
        /// Number of the upcoming attempt, starting at 1.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },

    /// A new stream is being negotiated.
    Negotiating {
        /// Number of this attempt, starting at 1. 0 is the initial
        /// connection.
        attempt: u32,
    },

    /// No further attempts will be made.
    Abandoned,
}

/// Outcome of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { attempt: u32, delay: Duration },
    Abandon,
}

fn strategy_delay(strategy: ReconnectStrategy, attempt: u32, random_base: Duration) -> Option<Duration> {
    match strategy {
        ReconnectStrategy::Disabled => None,
        ReconnectStrategy::Fixed(delay) => Some(delay),
        ReconnectStrategy::RandomIncreasing => Some(match attempt {
            0..=7 => random_base,
            8..=13 => random_base * 6,
            _ => random_base * 30,
        }),
        ReconnectStrategy::Exponential { initial, max } => {
            let factor = 1u32
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u32::MAX);
            Some(initial.saturating_mul(factor).min(max))
        }
    }
}

/// Backoff state machine. Pure: sleeping is up to the caller.
#[derive(Debug)]
pub(crate) struct Supervisor {
    policy: ReconnectPolicy,
    random_base: Duration,
    failures: u32,
    state: SupervisorState,
}

impl Supervisor {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            random_base: Duration::from_secs(rand::thread_rng().gen_range(2..=15)),
            failures: 0,
            state: SupervisorState::Idle,
        }
    }

    pub(crate) fn state(&self) -> SupervisorState {
        self.state
    }

    /// A connection or negotiation attempt is starting.
    pub(crate) fn on_attempt(&mut self) {
        self.state = SupervisorState::Negotiating {
            attempt: self.failures,
        };
    }

    /// The stream is established.
    pub(crate) fn on_established(&mut self) {
        self.failures = 0;
        self.state = SupervisorState::Idle;
    }

    /// The stream broke or could not be established.
    pub(crate) fn on_failure(&mut self, error: &Error) -> Decision {
        if self.state == SupervisorState::Abandoned {
            return Decision::Abandon;
        }
        if !error.is_retryable() {
            log::debug!("Not reconnecting after {}.", error);
            return self.abandon();
        }
        let attempt = self.failures + 1;
        if self.policy.max_attempts.is_some_and(|max| attempt > max) {
            log::debug!("Giving up after {} attempts.", self.failures);
            return self.abandon();
        }
        let Some(delay) = strategy_delay(self.policy.strategy, attempt, self.random_base) else {
            return self.abandon();
        };
        self.failures = attempt;
        self.state = SupervisorState::BackingOff { attempt, delay };
        Decision::Retry { attempt, delay }
    }

    /// Stop for good.
    pub(crate) fn abandon(&mut self) -> Decision {
        self.state = SupervisorState::Abandoned;
        Decision::Abandon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable() -> Error {
        Error::Disconnected
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let mut supervisor = Supervisor::new(ReconnectPolicy::default());
        let delays: Vec<u64> = (0..7)
            .map(|_| match supervisor.on_failure(&retryable()) {
                Decision::Retry { delay, .. } => delay.as_secs(),
                Decision::Abandon => panic!("abandoned"),
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        supervisor.on_established();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(
            supervisor.on_failure(&retryable()),
            Decision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn exponential_does_not_overflow() {
        let strategy = ReconnectStrategy::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(
            strategy_delay(strategy, 200, Duration::ZERO),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn random_increasing_steps() {
        let base = Duration::from_secs(3);
        let strategy = ReconnectStrategy::RandomIncreasing;
        assert_eq!(strategy_delay(strategy, 1, base), Some(base));
        assert_eq!(strategy_delay(strategy, 7, base), Some(base));
        assert_eq!(strategy_delay(strategy, 8, base), Some(base * 6));
        assert_eq!(strategy_delay(strategy, 13, base), Some(base * 6));
        assert_eq!(strategy_delay(strategy, 14, base), Some(base * 30));

        let supervisor = Supervisor::new(ReconnectPolicy::new(strategy));
        assert!((2..=15).contains(&supervisor.random_base.as_secs()));
    }

    #[test]
    fn max_attempts() {
        let policy =
            ReconnectPolicy::new(ReconnectStrategy::Fixed(Duration::from_secs(15))).with_max_attempts(2);
        let mut supervisor = Supervisor::new(policy);
        assert!(matches!(
            supervisor.on_failure(&retryable()),
            Decision::Retry { attempt: 1, .. }
        ));
        supervisor.on_attempt();
        assert_eq!(
            supervisor.state(),
            SupervisorState::Negotiating { attempt: 1 }
        );
        assert!(matches!(
            supervisor.on_failure(&retryable()),
            Decision::Retry { attempt: 2, .. }
        ));
        assert_eq!(supervisor.on_failure(&retryable()), Decision::Abandon);
        assert_eq!(supervisor.state(), SupervisorState::Abandoned);
        // abandoned stays abandoned
        assert_eq!(supervisor.on_failure(&retryable()), Decision::Abandon);
    }

    #[test]
    fn disabled_and_fatal_errors() {
        let mut supervisor = Supervisor::new(ReconnectPolicy::disabled());
        assert_eq!(supervisor.on_failure(&retryable()), Decision::Abandon);

        let mut supervisor = Supervisor::new(ReconnectPolicy::default());
        let conflict = Error::Stream(crate::error::StreamErrorInfo {
            condition: String::from("conflict"),
            text: None,
        });
        assert_eq!(supervisor.on_failure(&conflict), Decision::Abandon);
    }
}
