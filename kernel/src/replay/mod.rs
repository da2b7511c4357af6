// Deterministic Replay
//
// Applies every retained log entry into a fresh metadata store on the
// calling thread, using the same executor as the live applier. Two
// replays of the same log produce the same store.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::applier::CommandExecutor;
use crate::lifecycle::EngineContext;
use crate::log::{CommandLog, CommandLogStore, LogError, SequenceNumber};
use crate::rules::RuleEngine;
use crate::state::{MetadataStore, MetadataView};

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("corrupt log entry at sequence {sequence}: {reason}")]
    Corrupt {
        sequence: SequenceNumber,
        reason: String,
    },

    #[error("log error: {0}")]
    Log(LogError),
}

impl From<LogError> for ReplayError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Corrupt { sequence, reason } => Self::Corrupt { sequence, reason },
            other => Self::Log(other),
        }
    }
}

#[derive(Debug)]
pub struct ReplayReport {
    pub store: MetadataStore,
    pub last_applied: SequenceNumber,
}

/// Replay the log as it stands and derive the final metadata store.
///
/// Computations started along the way are stopped before returning.
pub fn replay_log<S: CommandLogStore>(
    log: &CommandLog<S>,
    context: EngineContext,
    shutdown_timeout: Duration,
) -> Result<ReplayReport, ReplayError> {
    let view = MetadataView::default();
    let mut executor =
        CommandExecutor::new(view.clone(), RuleEngine::standard(), context, shutdown_timeout);

    let earliest = log.earliest_sequence()?;
    let target = log.latest_sequence()?;
    let mut last_applied = earliest.saturating_sub(1);

    if target > last_applied {
        let stop = Arc::new(AtomicBool::new(false));
        for item in log.tail_from(earliest, stop) {
            let entry = item?;
            executor.apply(&entry);
            last_applied = entry.sequence;
            if last_applied >= target {
                break;
            }
        }
    }

    executor.shutdown();
    info!(last_applied, "replay complete");

    Ok(ReplayReport {
        store: view.snapshot(),
        last_applied,
    })
}
