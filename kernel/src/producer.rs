// Command Producer
//
// The append path. Appends commands to the log, retrying with exponential
// backoff while the durable store is unavailable.
//
//   attempt 1: immediate
//   attempt 2: wait initial_backoff
//   attempt 3: wait initial_backoff * multiplier
//   ...        capped at max_backoff, at most max_retries retries
//
// Only `LogError::Unavailable` is retried. Every other log error is
// permanent and returned to the caller immediately.

use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::log::{Command, CommandId, CommandLog, CommandLogStore, LogError, SequenceNumber};
use crate::state::CommandStatus;

/// Retry policy configuration for exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: usize,

    /// Backoff before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    pub max_backoff: Duration,

    /// Growth factor between consecutive backoffs
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-indexed).
    ///
    /// `min(initial_backoff * multiplier^attempt, max_backoff)`
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("command log unavailable after {attempts} attempts: {reason}")]
    LogUnavailable { attempts: usize, reason: String },

    #[error(transparent)]
    Log(LogError),
}

/// Acknowledgement returned to the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub command_id: CommandId,
    pub sequence: SequenceNumber,
    pub status: CommandStatus,
}

pub struct CommandProducer<S> {
    log: CommandLog<S>,
    policy: RetryPolicy,
}

impl<S: CommandLogStore> CommandProducer<S> {
    pub fn new(log: CommandLog<S>, policy: RetryPolicy) -> Self {
        Self { log, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append `command`, retrying transient store failures.
    pub fn submit(&self, command: &Command) -> Result<Submission, ProducerError> {
        let mut attempt = 0;

        loop {
            match self.log.append(command) {
                Ok(sequence) => {
                    debug!(
                        command_id = %command.id,
                        target = %command.target_id,
                        sequence,
                        "command appended"
                    );
                    return Ok(Submission {
                        command_id: command.id,
                        sequence,
                        status: CommandStatus::queued(command.id, sequence),
                    });
                }
                Err(LogError::Unavailable(reason)) if attempt < self.policy.max_retries => {
                    let backoff = self.policy.backoff(attempt);
                    warn!(
                        command_id = %command.id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "command log unavailable, retrying"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(LogError::Unavailable(reason)) => {
                    error!(
                        command_id = %command.id,
                        attempts = attempt + 1,
                        %reason,
                        "command log unavailable, giving up"
                    );
                    return Err(ProducerError::LogUnavailable {
                        attempts: attempt + 1,
                        reason,
                    });
                }
                Err(other) => return Err(ProducerError::Log(other)),
            }
        }
    }
}
