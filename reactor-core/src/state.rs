//! Per-document processing state machine.
//!
//! This module provides a pure, side-effect-free state machine for the life
//! of one job on one `(drive, document)` key. It takes events as input and
//! produces a new state plus a list of directives to execute.
//!
//! The actual I/O (reading state, appending operations, sleeping) is
//! performed by the job processor, not by this module.

use std::time::Duration;

use crate::backoff::Backoff;

/// Limits applied while a job is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the job fails.
    pub max_retries: u32,
    /// Index conflicts tolerated before the job fails.
    pub max_conflict_retries: u32,
    /// Delay schedule for transient failures.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_conflict_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Processing state of one key - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyState {
    /// Nothing running for this key.
    #[default]
    Idle,
    /// A job is executing.
    Processing {
        /// Conflicts seen so far for this job.
        conflicts: u32,
        /// Transient failures seen so far for this job.
        attempt: u32,
    },
    /// Waiting for a backoff timer after a transient failure.
    Retrying {
        /// Conflicts seen so far for this job.
        conflicts: u32,
        /// Transient failures seen so far for this job.
        attempt: u32,
    },
}

impl KeyState {
    /// Process an event and return the new state plus directives to execute.
    pub fn on_event(self, event: Event, policy: &RetryPolicy) -> (Self, Vec<Directive>) {
        match (self, event) {
            (Self::Idle, Event::Dequeued) => (
                Self::Processing {
                    conflicts: 0,
                    attempt: 0,
                },
                vec![Directive::Execute],
            ),

            (Self::Processing { .. }, Event::Committed) => (Self::Idle, vec![Directive::Complete]),

            // Re-run immediately: the conflicting write already landed, so
            // fresh state is available without waiting.
            (Self::Processing { conflicts, attempt }, Event::Conflict) => {
                let conflicts = conflicts.saturating_add(1);
                if conflicts > policy.max_conflict_retries {
                    (
                        Self::Idle,
                        vec![Directive::Fail(FailReason::ConflictsExhausted { conflicts })],
                    )
                } else {
                    (
                        Self::Processing { conflicts, attempt },
                        vec![Directive::Execute],
                    )
                }
            }

            (Self::Processing { conflicts, attempt }, Event::TransientFailure) => {
                let attempt = attempt.saturating_add(1);
                if attempt > policy.max_retries {
                    (
                        Self::Idle,
                        vec![Directive::Fail(FailReason::RetriesExhausted { attempts: attempt })],
                    )
                } else {
                    (
                        Self::Retrying { conflicts, attempt },
                        vec![Directive::ScheduleRetry {
                            delay: policy.backoff.delay(attempt),
                        }],
                    )
                }
            }

            (Self::Processing { .. }, Event::FatalFailure) => {
                (Self::Idle, vec![Directive::Fail(FailReason::Fatal)])
            }

            (Self::Retrying { conflicts, attempt }, Event::RetryTimer) => (
                Self::Processing { conflicts, attempt },
                vec![Directive::Execute],
            ),

            (Self::Retrying { .. }, Event::Aborted) | (Self::Processing { .. }, Event::Aborted) => {
                (Self::Idle, vec![Directive::Fail(FailReason::Aborted)])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a job is running or waiting to retry.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Events in the life of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The job was taken off the queue.
    Dequeued,
    /// All operations were appended.
    Committed,
    /// The log advanced under the job (index conflict).
    Conflict,
    /// Storage failed in a way that may succeed later.
    TransientFailure,
    /// The job can never succeed.
    FatalFailure,
    /// The backoff timer fired.
    RetryTimer,
    /// The processor is shutting down.
    Aborted,
}

/// Instructions for the job processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Read fresh state and execute the job.
    Execute,
    /// Sleep, then deliver [`Event::RetryTimer`].
    ScheduleRetry {
        /// How long to wait.
        delay: Duration,
    },
    /// Report success to the caller.
    Complete,
    /// Report failure to the caller.
    Fail(FailReason),
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// Too many index conflicts.
    ConflictsExhausted {
        /// Conflicts seen.
        conflicts: u32,
    },
    /// Too many transient failures.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// A non-retryable error.
    Fatal,
    /// Cancelled by shutdown.
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            max_conflict_retries: 1,
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    #[test]
    fn starts_idle() {
        assert_eq!(KeyState::default(), KeyState::Idle);
        assert!(!KeyState::Idle.is_busy());
    }

    #[test]
    fn dequeue_executes() {
        let (state, directives) = KeyState::Idle.on_event(Event::Dequeued, &policy());
        assert!(state.is_busy());
        assert_eq!(directives, vec![Directive::Execute]);
    }

    #[test]
    fn commit_returns_to_idle() {
        let (state, _) = KeyState::Idle.on_event(Event::Dequeued, &policy());
        let (state, directives) = state.on_event(Event::Committed, &policy());
        assert_eq!(state, KeyState::Idle);
        assert_eq!(directives, vec![Directive::Complete]);
    }

    #[test]
    fn conflict_reexecutes_then_fails() {
        let (state, _) = KeyState::Idle.on_event(Event::Dequeued, &policy());
        let (state, directives) = state.on_event(Event::Conflict, &policy());
        assert_eq!(directives, vec![Directive::Execute]);

        let (state, directives) = state.on_event(Event::Conflict, &policy());
        assert_eq!(state, KeyState::Idle);
        assert_eq!(
            directives,
            vec![Directive::Fail(FailReason::ConflictsExhausted { conflicts: 2 })]
        );
    }

    #[test]
    fn transient_failure_backs_off() {
        let (state, _) = KeyState::Idle.on_event(Event::Dequeued, &policy());
        let (state, directives) = state.on_event(Event::TransientFailure, &policy());
        assert!(matches!(state, KeyState::Retrying { attempt: 1, .. }));
        assert_eq!(
            directives,
            vec![Directive::ScheduleRetry {
                delay: Duration::from_millis(10)
            }]
        );

        let (state, directives) = state.on_event(Event::RetryTimer, &policy());
        assert!(matches!(state, KeyState::Processing { attempt: 1, .. }));
        assert_eq!(directives, vec![Directive::Execute]);

        let (state, directives) = state.on_event(Event::TransientFailure, &policy());
        assert_eq!(
            directives,
            vec![Directive::ScheduleRetry {
                delay: Duration::from_millis(20)
            }]
        );
        let (state, _) = state.on_event(Event::RetryTimer, &policy());
        let (state, directives) = state.on_event(Event::TransientFailure, &policy());
        assert_eq!(state, KeyState::Idle);
        assert_eq!(
            directives,
            vec![Directive::Fail(FailReason::RetriesExhausted { attempts: 3 })]
        );
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let (state, _) = KeyState::Idle.on_event(Event::Dequeued, &policy());
        let (state, directives) = state.on_event(Event::FatalFailure, &policy());
        assert_eq!(state, KeyState::Idle);
        assert_eq!(directives, vec![Directive::Fail(FailReason::Fatal)]);
    }

    #[test]
    fn abort_while_retrying() {
        let state = KeyState::Retrying {
            conflicts: 0,
            attempt: 1,
        };
        let (state, directives) = state.on_event(Event::Aborted, &policy());
        assert_eq!(state, KeyState::Idle);
        assert_eq!(directives, vec![Directive::Fail(FailReason::Aborted)]);
    }

    #[test]
    fn invalid_transition_is_ignored() {
        let (state, directives) = KeyState::Idle.on_event(Event::Committed, &policy());
        assert_eq!(state, KeyState::Idle);
        assert!(directives.is_empty());
    }
}
