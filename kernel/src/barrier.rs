// Consistency Barrier
//
// Tracks the last sequence number the local applier has applied and lets
// request threads block until a given sequence is visible. This is what
// gives a session read-your-writes on the node it talks to; it says
// nothing about other nodes.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::log::SequenceNumber;

/// Lifecycle phase of a node's applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplierPhase {
    /// Replaying retained entries; barrier waits do not succeed yet.
    Initializing,
    /// Caught up with the log as of startup; applying new entries.
    Live,
    ShuttingDown,
    /// Halted on a fatal log condition; needs operator intervention.
    Failed(String),
}

impl fmt::Display for ApplierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("INITIALIZING"),
            Self::Live => f.write_str("LIVE"),
            Self::ShuttingDown => f.write_str("SHUTTING_DOWN"),
            Self::Failed(reason) => write!(f, "FAILED ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    #[error(
        "timed out after {}ms waiting for sequence {requested} (applied: {applied})",
        .waited.as_millis()
    )]
    TimedOut {
        requested: SequenceNumber,
        applied: SequenceNumber,
        waited: Duration,
    },

    #[error("applier is {0}")]
    Unavailable(ApplierPhase),
}

#[derive(Debug)]
struct BarrierState {
    applied: SequenceNumber,
    phase: ApplierPhase,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

#[derive(Debug, Clone)]
pub struct ConsistencyBarrier {
    inner: Arc<Inner>,
}

impl Default for ConsistencyBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistencyBarrier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BarrierState {
                    applied: 0,
                    phase: ApplierPhase::Initializing,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn applied(&self) -> SequenceNumber {
        self.inner.state.lock().applied
    }

    pub fn phase(&self) -> ApplierPhase {
        self.inner.state.lock().phase.clone()
    }

    /// Block until `sequence` has been applied locally or `timeout` elapses.
    ///
    /// Returns the applied sequence observed on success.
    pub fn wait_until_applied(
        &self,
        sequence: SequenceNumber,
        timeout: Duration,
    ) -> Result<SequenceNumber, BarrierError> {
        let started = Instant::now();
        // A timeout past the clock's range waits without a deadline.
        let deadline = started.checked_add(timeout);
        let mut state = self.inner.state.lock();

        loop {
            if let Some(result) = settle(&state, sequence) {
                return result;
            }
            let Some(deadline) = deadline else {
                self.inner.changed.wait(&mut state);
                continue;
            };
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return settle(&state, sequence).unwrap_or(Err(BarrierError::TimedOut {
                    requested: sequence,
                    applied: state.applied,
                    waited: started.elapsed(),
                }));
            }
        }
    }

    pub(crate) fn advance(&self, sequence: SequenceNumber) {
        let mut state = self.inner.state.lock();
        state.applied = state.applied.max(sequence);
        drop(state);
        self.inner.changed.notify_all();
    }

    pub(crate) fn set_phase(&self, phase: ApplierPhase) {
        self.inner.state.lock().phase = phase;
        self.inner.changed.notify_all();
    }
}

/// Decide a wait from the current state, or `None` to keep waiting.
fn settle(
    state: &BarrierState,
    sequence: SequenceNumber,
) -> Option<Result<SequenceNumber, BarrierError>> {
    match &state.phase {
        ApplierPhase::Live | ApplierPhase::ShuttingDown if state.applied >= sequence => {
            Some(Ok(state.applied))
        }
        ApplierPhase::Failed(_) | ApplierPhase::ShuttingDown => {
            Some(Err(BarrierError::Unavailable(state.phase.clone())))
        }
        ApplierPhase::Initializing | ApplierPhase::Live => None,
    }
}
