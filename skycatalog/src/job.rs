//! Waiting on asynchronous service jobs.
//!
//! Services such as TAP run long queries as jobs that move through the UWS
//! phases `PENDING → QUEUED → EXECUTING → COMPLETED`. [`wait_for_completion`]
//! polls the phase with exponential backoff until the job finishes, the
//! caller's timeout elapses or the [`CancelToken`] fires.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest single sleep, so cancellation is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Queued,
    Executing,
    Completed,
    Error,
    Aborted,
    Held,
    Suspended,
    Unknown(String),
}

impl JobPhase {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "PENDING" => JobPhase::Pending,
            "QUEUED" => JobPhase::Queued,
            "EXECUTING" => JobPhase::Executing,
            "COMPLETED" => JobPhase::Completed,
            "ERROR" => JobPhase::Error,
            "ABORTED" => JobPhase::Aborted,
            "HELD" => JobPhase::Held,
            "SUSPENDED" => JobPhase::Suspended,
            other => JobPhase::Unknown(other.to_string()),
        }
    }

    /// True once the job can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Error | JobPhase::Aborted
        )
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobPhase::Pending => "PENDING",
            JobPhase::Queued => "QUEUED",
            JobPhase::Executing => "EXECUTING",
            JobPhase::Completed => "COMPLETED",
            JobPhase::Error => "ERROR",
            JobPhase::Aborted => "ABORTED",
            JobPhase::Held => "HELD",
            JobPhase::Suspended => "SUSPENDED",
            JobPhase::Unknown(s) => s,
        };
        write!(f, "{name}")
    }
}

/// How to wait for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    /// Delay before the second poll
    pub poll_interval: Duration,
    /// Growth factor applied to the delay after every poll (1.0 = fixed rate)
    pub backoff: f64,
    /// Upper bound on the delay between polls
    pub max_interval: Duration,
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            backoff: 1.5,
            max_interval: Duration::from_secs(2),
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl WaitPolicy {
    /// Delay to use after `delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.mul_f64(self.backoff.max(1.0));
        grown.min(self.max_interval.max(self.poll_interval))
    }
}

/// Shared flag used to abandon a wait from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a wait ended without a terminal phase.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("job did not finish within {0:?}")]
    Timeout(Duration),

    #[error("wait cancelled")]
    Cancelled,
}

/// Poll `phase` until it reports a terminal phase.
///
/// Returns the terminal phase (`COMPLETED`, `ERROR` or `ABORTED`); the
/// caller decides how to treat failures. Errors from `phase` are returned
/// immediately, timeouts and cancellation through `E: From<WaitError>`.
pub fn wait_for_completion<F, E>(
    mut phase: F,
    policy: &WaitPolicy,
    cancel: &CancelToken,
) -> Result<JobPhase, E>
where
    F: FnMut() -> Result<JobPhase, E>,
    E: From<WaitError>,
{
    let start = Instant::now();
    let mut delay = policy.poll_interval;
    let mut polls = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled.into());
        }

        let current = phase()?;
        polls += 1;
        if current.is_terminal() {
            debug!(
                "job reached {} after {} polls in {:?}",
                current,
                polls,
                start.elapsed()
            );
            return Ok(current);
        }

        let mut sleep_for = delay;
        if let Some(timeout) = policy.timeout {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(WaitError::Timeout(timeout).into());
            }
            sleep_for = sleep_for.min(timeout - elapsed);
        }
        debug!("job phase {}, next poll in {:?}", current, sleep_for);

        let wake = Instant::now() + sleep_for;
        while let Some(remaining) = wake.checked_duration_since(Instant::now()) {
            if remaining.is_zero() || cancel.is_cancelled() {
                break;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }

        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;

    fn fast_policy() -> WaitPolicy {
        WaitPolicy {
            poll_interval: Duration::from_millis(1),
            backoff: 2.0,
            max_interval: Duration::from_millis(4),
            timeout: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_phase_parsing() {
        assert_eq!(JobPhase::parse(" completed\n"), JobPhase::Completed);
        assert_eq!(JobPhase::parse("EXECUTING"), JobPhase::Executing);
        assert_eq!(
            JobPhase::parse("WEIRD"),
            JobPhase::Unknown("WEIRD".to_string())
        );
        assert!(JobPhase::Aborted.is_terminal());
        assert!(!JobPhase::Queued.is_terminal());
    }

    #[test]
    fn test_waits_until_completed() {
        let mut phases = vec![
            JobPhase::Pending,
            JobPhase::Queued,
            JobPhase::Executing,
            JobPhase::Completed,
        ]
        .into_iter();
        let mut calls = 0;
        let result: Result<_, CatalogError> = wait_for_completion(
            || {
                calls += 1;
                Ok(phases.next().unwrap_or(JobPhase::Completed))
            },
            &fast_policy(),
            &CancelToken::new(),
        );
        assert_eq!(result, Ok(JobPhase::Completed));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_error_phase_is_returned() {
        let result: Result<_, CatalogError> = wait_for_completion(
            || Ok(JobPhase::Error),
            &fast_policy(),
            &CancelToken::new(),
        );
        assert_eq!(result, Ok(JobPhase::Error));
    }

    #[test]
    fn test_timeout() {
        let policy = WaitPolicy {
            timeout: Some(Duration::from_millis(20)),
            ..fast_policy()
        };
        let result: Result<_, CatalogError> = wait_for_completion(
            || Ok(JobPhase::Executing),
            &policy,
            &CancelToken::new(),
        );
        assert_eq!(result, Err(CatalogError::Timeout(Duration::from_millis(20))));
    }

    #[test]
    fn test_cancel_from_poll() {
        let cancel = CancelToken::new();
        let handle = cancel.clone();
        let mut calls = 0;
        let result: Result<_, CatalogError> = wait_for_completion(
            || {
                calls += 1;
                if calls == 3 {
                    handle.cancel();
                }
                Ok(JobPhase::Executing)
            },
            &fast_policy(),
            &cancel,
        );
        assert_eq!(result, Err(CatalogError::Cancelled));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_poll_errors_propagate() {
        let result: Result<JobPhase, _> = wait_for_completion(
            || Err(CatalogError::Transport("connection reset".into())),
            &fast_policy(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(CatalogError::Transport(_))));
    }

    #[test]
    fn test_wait_errors_convert() {
        assert_eq!(
            CatalogError::from(WaitError::Timeout(Duration::from_secs(3))),
            CatalogError::Timeout(Duration::from_secs(3))
        );
        assert_eq!(CatalogError::from(WaitError::Cancelled), CatalogError::Cancelled);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = fast_policy();
        let mut delay = policy.poll_interval;
        for _ in 0..10 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_millis(4));
    }
}
