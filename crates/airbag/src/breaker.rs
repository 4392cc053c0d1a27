// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rolling-window circuit breaker.
//!
//! The breaker is a three-state machine. Closed, it records each classified outcome
//! into a rolling window of the most recent `request-volume-threshold` calls and
//! opens when the window is full and its failure ratio reaches `failure-ratio`.
//! Open, it rejects every call until `delay` has elapsed, then admits trial calls
//! one at a time. Half-open, `success-threshold` consecutive trial successes close
//! it again and a single trial failure reopens it.
//!
//! All thresholds are read through live [`Property`] handles on every decision, so
//! configuration reloads take effect without rebuilding the breaker or losing its
//! window.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{OverrideTable, Property};

/// Decision for one call arriving at the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The call may proceed. `trial` marks half-open probes, whose outcome drives
    /// the close/reopen decision.
    Admitted { trial: bool },
    /// The breaker is open (or a trial is already in flight); fail fast.
    Rejected,
}

/// How a completed call is scored against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    /// A deadline expiry, or a failure whose kind matches the breaker's `fail-on` set.
    Failure,
    /// A failure outside `fail-on`: releases any trial slot but leaves the window
    /// untouched.
    Ignored,
}

/// State-machine transition surfaced to the caller for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

enum State {
    Closed { window: VecDeque<bool>, failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32, trial_in_flight: bool },
}

pub(crate) struct CircuitBreaker {
    state: Mutex<State>,
    delay: Property<Duration>,
    volume: Property<u32>,
    failure_ratio: Property<f64>,
    success_threshold: Property<u32>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen { .. } => "half-open",
        };
        f.debug_struct("CircuitBreaker").field("state", &state).finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(
        delay: Property<Duration>,
        volume: Property<u32>,
        failure_ratio: Property<f64>,
        success_threshold: Property<u32>,
    ) -> Self {
        Self {
            state: Mutex::new(State::Closed {
                window: VecDeque::new(),
                failures: 0,
            }),
            delay,
            volume,
            failure_ratio,
            success_threshold,
        }
    }

    /// Decides whether a call may proceed right now.
    pub fn try_enter(&self, overrides: &OverrideTable) -> (Verdict, Option<Transition>) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { .. } => (Verdict::Admitted { trial: false }, None),
            State::Open { since } => {
                if since.elapsed() >= self.delay.current(overrides) {
                    *state = State::HalfOpen {
                        successes: 0,
                        trial_in_flight: true,
                    };
                    (Verdict::Admitted { trial: true }, Some(Transition::HalfOpened))
                } else {
                    (Verdict::Rejected, None)
                }
            }
            State::HalfOpen { trial_in_flight, .. } => {
                if *trial_in_flight {
                    (Verdict::Rejected, None)
                } else {
                    *trial_in_flight = true;
                    (Verdict::Admitted { trial: true }, None)
                }
            }
        }
    }

    /// Releases the half-open trial slot when the trial call was cancelled before
    /// completing, so the next probe is not locked out.
    pub fn release_trial(&self) {
        if let State::HalfOpen { trial_in_flight, .. } = &mut *self.state.lock() {
            *trial_in_flight = false;
        }
    }

    /// Scores a completed call that was admitted with the given `trial` flag.
    ///
    /// Outcomes that arrive after the breaker has moved on (a closed-era call
    /// completing once the breaker is already open) are dropped rather than
    /// misattributed to the new state.
    pub fn record(&self, overrides: &OverrideTable, trial: bool, outcome: Outcome) -> Option<Transition> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { window, failures } => {
                if trial || outcome == Outcome::Ignored {
                    return None;
                }

                let volume = (self.volume.current(overrides).max(1)) as usize;
                window.push_back(outcome == Outcome::Failure);
                if outcome == Outcome::Failure {
                    *failures += 1;
                }
                while window.len() > volume {
                    if window.pop_front() == Some(true) {
                        *failures -= 1;
                    }
                }

                let ratio = f64::from(*failures) / window.len() as f64;
                if window.len() >= volume && ratio >= self.failure_ratio.current(overrides) {
                    *state = State::Open { since: Instant::now() };
                    return Some(Transition::Opened);
                }
                None
            }
            State::Open { .. } => None,
            State::HalfOpen { successes, trial_in_flight } => {
                if !trial {
                    return None;
                }
                *trial_in_flight = false;
                match outcome {
                    Outcome::Ignored => None,
                    Outcome::Success => {
                        *successes += 1;
                        if *successes >= self.success_threshold.current(overrides) {
                            *state = State::Closed {
                                window: VecDeque::new(),
                                failures: 0,
                            };
                            Some(Transition::Closed)
                        } else {
                            None
                        }
                    }
                    Outcome::Failure => {
                        *state = State::Open { since: Instant::now() };
                        Some(Transition::Opened)
                    }
                }
            }
        }
    }
}
