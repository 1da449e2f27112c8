//! Polling assertions for waiting on, or verifying, cluster state.
//!
//! Two primitives:
//!
//! - [`eventually_until`] - poll until the predicate returns true, or fail
//!   with [`PollError::Timeout`] once the deadline passes
//! - [`consistently_holds`] - poll across a whole window, failing with
//!   [`PollError::Interrupted`] on the first false result
//!
//! Predicates are async and usually perform a bounded network call. The
//! primitives never cancel a running predicate; the predicate's own timeout
//! bounds how far past a deadline a poll can run.
//!
//! # Timing
//!
//! | primitive            | first invocation | later invocations             |
//! |----------------------|------------------|-------------------------------|
//! | `eventually_until`   | immediately      | every interval, last at deadline |
//! | `consistently_holds` | after 1 interval | every interval, last at deadline |

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// Default interval between predicate invocations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll intervals below this are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by the polling primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// The predicate never returned true before the deadline.
    #[error("condition not reached within {waited:?} ({attempts} attempts)")]
    Timeout {
        /// Configured timeout.
        waited: Duration,
        /// Predicate invocations made.
        attempts: u32,
    },

    /// The predicate returned false inside the observation window.
    #[error("condition stopped holding after {elapsed:?} ({attempts} attempts)")]
    Interrupted {
        /// Time from start to the failing invocation.
        elapsed: Duration,
        /// Predicate invocations made, including the failing one.
        attempts: u32,
    },
}

/// Summary of a successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Predicate invocations made.
    pub attempts: u32,
    /// Time from start to the deciding invocation.
    pub elapsed: Duration,
}

/// Polls `predicate` until it returns true.
///
/// The predicate runs immediately, then no faster than `poll_interval`.
/// The final invocation happens at the deadline.
///
/// # Errors
///
/// Returns [`PollError::Timeout`] when `timeout` elapses with no true result.
pub async fn eventually_until<F, Fut>(
    mut predicate: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<PollReport, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let interval = poll_interval.max(MIN_POLL_INTERVAL);
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;

    loop {
        let poll_started = Instant::now();
        attempts += 1;
        if predicate().await {
            return Ok(PollReport {
                attempts,
                elapsed: started.elapsed(),
            });
        }
        trace!(attempts, "condition not reached yet");

        if Instant::now() >= deadline {
            return Err(PollError::Timeout {
                waited: timeout,
                attempts,
            });
        }
        sleep_until((poll_started + interval).min(deadline)).await;
    }
}

/// Verifies `predicate` stays true for the whole of `duration`.
///
/// The first invocation happens one `poll_interval` after the call, the last
/// one at the end of the window. A false result fails immediately.
///
/// # Errors
///
/// Returns [`PollError::Interrupted`] on the first false result.
pub async fn consistently_holds<F, Fut>(
    mut predicate: F,
    duration: Duration,
    poll_interval: Duration,
) -> Result<PollReport, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let interval = poll_interval.max(MIN_POLL_INTERVAL);
    let started = Instant::now();
    let deadline = started + duration;
    let mut attempts = 0u32;
    let mut next = (started + interval).min(deadline);

    loop {
        sleep_until(next).await;
        attempts += 1;
        if !predicate().await {
            return Err(PollError::Interrupted {
                elapsed: started.elapsed(),
                attempts,
            });
        }
        trace!(attempts, "condition still holds");

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollReport {
                attempts,
                elapsed: started.elapsed(),
            });
        }
        next = (next + interval).max(now).min(deadline);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn true_from(call: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<bool>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let predicate = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(n >= call)
        };
        (calls, predicate)
    }

    fn true_until(call: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<bool>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let predicate = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(n < call)
        };
        (calls, predicate)
    }

    fn assert_near(actual: Duration, expected: Duration) {
        let slack = Duration::from_millis(10);
        assert!(
            actual >= expected && actual <= expected + slack,
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    // ==================== eventually_until Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_eventually_succeeds_on_third_invocation() {
        let (calls, predicate) = true_from(3);
        let report = eventually_until(predicate, Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_near(report.elapsed, Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_times_out_after_deadline() {
        let started = Instant::now();
        let (_, predicate) = true_from(u32::MAX);
        let error = eventually_until(predicate, Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(
            error,
            PollError::Timeout {
                waited: Duration::from_secs(5),
                attempts: 6,
            }
        );
        assert_near(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_immediate_success_does_not_sleep() {
        let started = Instant::now();
        let report = eventually_until(
            || async { true },
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(report.attempts, 1);
        assert_near(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_last_poll_lands_on_deadline() {
        let started = Instant::now();
        let (_, predicate) = true_from(u32::MAX);
        let error = eventually_until(predicate, Duration::from_millis(2500), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, PollError::Timeout { attempts: 4, .. }));
        assert_near(started.elapsed(), Duration::from_millis(2500));
    }

    // ==================== consistently_holds Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_consistently_fails_fast_on_second_invocation() {
        let (calls, predicate) = true_until(2);
        let error = consistently_holds(predicate, Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap_err();

        let PollError::Interrupted { elapsed, attempts } = error else {
            panic!("expected Interrupted, got {error:?}");
        };
        assert_eq!(attempts, 2);
        assert_near(elapsed, Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistently_holds_for_full_window() {
        let (calls, predicate) = true_until(u32::MAX);
        let report = consistently_holds(predicate, Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_near(report.elapsed, Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistently_zero_window_polls_once() {
        let report = consistently_holds(|| async { true }, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_interval_is_clamped() {
        let (_, predicate) = true_until(u32::MAX);
        let report = consistently_holds(predicate, Duration::from_millis(100), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(report.attempts, 10);
    }

    #[test]
    fn test_poll_error_display() {
        let msg = PollError::Timeout {
            waited: Duration::from_secs(30),
            attempts: 31,
        }
        .to_string();
        assert!(msg.contains("30s"), "Expected timeout in: {msg}");
        assert!(msg.contains("31 attempts"), "Expected attempts in: {msg}");
    }
}
