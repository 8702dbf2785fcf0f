//! Retry policy for failed invocation attempts.

use std::fmt;
use std::time::Duration;

use crate::config::InvocationOptions;
use crate::error::Error;
use crate::transport::TransportError;

/// Why one attempt failed.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    /// The per-attempt timeout elapsed.
    Timeout(Duration),
    Transport(TransportError),
}

impl Failure {
    /// Raised by the invoked code itself.
    pub(crate) fn is_callee(&self) -> bool {
        matches!(self, Failure::Transport(e) if e.is_callee())
    }

    /// Final error once no retries remain.
    pub(crate) fn into_error(self) -> Error {
        match self {
            Failure::Timeout(limit) => Error::Invocation {
                message: format!(
                    "the worker did not respond within {} ms. Increase `invocation.timeout_ms` \
                     if the invoked function is slow, or `invocation.num_retries` / \
                     `invocation.num_process_retries` if the worker is unreliable",
                    limit.as_millis()
                ),
                stack: None,
            },
            Failure::Transport(TransportError::Io(message)) => Error::Invocation {
                message: format!(
                    "transport failure: {}. Increase `invocation.num_process_retries` to \
                     recover from crashed workers",
                    message
                ),
                stack: None,
            },
            Failure::Transport(other) => other.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Timeout(limit) => write!(f, "timed out after {} ms", limit.as_millis()),
            Failure::Transport(e) => write!(f, "{}", e),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Give up and return the failure.
    Surface,
    /// Retry against the current worker.
    SameProcess,
    /// Replace the worker, then retry.
    NewProcess,
}

/// Remaining retries for one invocation.
///
/// The last same-process retry is traded for a process retry when one is
/// available, so a run of failures costs `1 + R + R * P` attempts and `P`
/// worker replacements.
#[derive(Debug, Clone)]
pub(crate) struct RetryBudget {
    num_retries: u32,
    retries_left: u32,
    process_retries_left: u32,
    process_retries_for_script_errors: bool,
}

impl RetryBudget {
    pub(crate) fn new(options: &InvocationOptions) -> Self {
        Self {
            num_retries: options.num_retries,
            retries_left: options.num_retries,
            process_retries_left: options.num_process_retries,
            process_retries_for_script_errors: options.process_retries_for_script_errors,
        }
    }

    pub(crate) fn next(&mut self, failure: &Failure) -> RetryDecision {
        if self.retries_left == 0 {
            return RetryDecision::Surface;
        }

        let process_retry_allowed = !failure.is_callee() || self.process_retries_for_script_errors;
        if self.retries_left == 1 && self.process_retries_left > 0 && process_retry_allowed {
            self.process_retries_left -= 1;
            self.retries_left = self.num_retries;
            RetryDecision::NewProcess
        } else {
            self.retries_left -= 1;
            RetryDecision::SameProcess
        }
    }
}
