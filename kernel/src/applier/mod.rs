// Applier
//
// One dedicated thread per node tails the command log and applies every
// entry, strictly in order, through the command executor. It is the only
// writer of the metadata store and the only source of query ids.
//
// INITIALIZING -> LIVE -> SHUTTING_DOWN, or FAILED on a fatal log condition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::barrier::{ApplierPhase, ConsistencyBarrier};
use crate::log::{CommandLog, CommandLogStore, LogError, SequenceNumber};

pub mod executor;

pub use executor::{CommandExecutor, DELETE_TOPIC_PROPERTY};

/// Conditions that stop the applier. All of them need an operator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApplierError {
    #[error("recovery corruption at sequence {sequence}: {reason}")]
    RecoveryCorruption {
        sequence: SequenceNumber,
        reason: String,
    },

    #[error("log delivered sequence {actual}, expected {expected}")]
    OutOfOrder {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    #[error(transparent)]
    Log(LogError),
}

impl From<LogError> for ApplierError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Corrupt { sequence, reason } => Self::RecoveryCorruption { sequence, reason },
            other => Self::Log(other),
        }
    }
}

pub struct Applier<S> {
    log: CommandLog<S>,
    executor: CommandExecutor,
    barrier: ConsistencyBarrier,
    stop: Arc<AtomicBool>,
}

impl<S: CommandLogStore + 'static> Applier<S> {
    pub fn new(
        log: CommandLog<S>,
        executor: CommandExecutor,
        barrier: ConsistencyBarrier,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            log,
            executor,
            barrier,
            stop,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("command-applier".to_string())
            .spawn(move || self.run())
    }

    /// Apply entries until stopped or a fatal condition is hit.
    ///
    /// Always replays from the earliest retained sequence.
    pub fn run(mut self) {
        match self.apply_log() {
            Ok(()) => {
                info!(applied = self.barrier.applied(), "applier stopping");
                self.barrier.set_phase(ApplierPhase::ShuttingDown);
            }
            Err(err) => {
                error!(error = %err, applied = self.barrier.applied(), "applier halted");
                self.barrier.set_phase(ApplierPhase::Failed(err.to_string()));
            }
        }
        self.executor.shutdown();
    }

    fn apply_log(&mut self) -> Result<(), ApplierError> {
        let earliest = self.log.earliest_sequence()?;
        let target = self.log.latest_sequence()?;
        let mut last_applied = earliest.saturating_sub(1);
        self.barrier.advance(last_applied);

        info!(from = earliest, target, "replaying command log");
        let mut live = false;
        if target <= last_applied {
            self.go_live(last_applied);
            live = true;
        }

        for item in self.log.tail_from(earliest, Arc::clone(&self.stop)) {
            let entry = item?;

            let expected = last_applied + 1;
            if entry.sequence != expected {
                return Err(ApplierError::OutOfOrder {
                    expected,
                    actual: entry.sequence,
                });
            }

            self.executor.apply(&entry);
            last_applied = entry.sequence;
            self.barrier.advance(last_applied);

            if !live && last_applied >= target {
                self.go_live(last_applied);
                live = true;
            }
        }

        if self.stop.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ApplierError::Log(LogError::Unavailable(
                "command log tail ended".into(),
            )))
        }
    }

    fn go_live(&mut self, applied: SequenceNumber) {
        self.executor.finish_replay();
        self.barrier.set_phase(ApplierPhase::Live);
        info!(applied, "replay complete, applier is live");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::lifecycle::EngineContext;
    use crate::log::{codec, Command, CommandKind, InMemoryLogStore, RawRecord};
    use crate::rules::RuleEngine;
    use crate::state::MetadataView;

    fn start(log: &CommandLog<InMemoryLogStore>) -> (MetadataView, ConsistencyBarrier, Arc<AtomicBool>, JoinHandle<()>) {
        let view = MetadataView::default();
        let barrier = ConsistencyBarrier::new();
        let stop = Arc::new(AtomicBool::new(false));
        let executor = CommandExecutor::new(
            view.clone(),
            RuleEngine::standard(),
            EngineContext::dry_run(),
            Duration::from_millis(100),
        );
        let handle = Applier::new(log.clone(), executor, barrier.clone(), Arc::clone(&stop))
            .spawn()
            .unwrap();
        (view, barrier, stop, handle)
    }

    fn stream(name: &str) -> Command {
        Command::new(CommandKind::CreateStream, name, format!("CREATE STREAM {name};"))
    }

    #[test]
    fn empty_log_goes_live_immediately() {
        let log = CommandLog::new(InMemoryLogStore::default());
        let (_, barrier, stop, handle) = start(&log);

        assert_eq!(barrier.wait_until_applied(0, Duration::from_secs(5)), Ok(0));

        stop.store(true, Ordering::Release);
        log.wake_tails();
        handle.join().unwrap();
        assert_eq!(barrier.phase(), ApplierPhase::ShuttingDown);
    }

    #[test]
    fn replays_then_applies_new_entries() {
        let log = CommandLog::new(InMemoryLogStore::default());
        log.append(&stream("A")).unwrap();
        log.append(&stream("B")).unwrap();

        let (view, barrier, stop, handle) = start(&log);
        barrier.wait_until_applied(2, Duration::from_secs(5)).unwrap();
        assert_eq!(barrier.phase(), ApplierPhase::Live);

        let sequence = log.append(&stream("C")).unwrap();
        barrier
            .wait_until_applied(sequence, Duration::from_secs(5))
            .unwrap();
        assert_eq!(view.read(|store| store.sources().count()), 3);

        stop.store(true, Ordering::Release);
        log.wake_tails();
        handle.join().unwrap();
    }

    #[test]
    fn corrupt_entry_refuses_live() {
        let log = CommandLog::new(InMemoryLogStore::default());
        log.append(&stream("A")).unwrap();
        log.with_store(|store| store.append_raw(RawRecord::new(2, "B", vec![0xde, 0xad])))
            .unwrap();
        log.append(&stream("C")).unwrap();

        let (view, barrier, _stop, handle) = start(&log);
        handle.join().unwrap();

        assert!(matches!(barrier.phase(), ApplierPhase::Failed(_)));
        assert_eq!(barrier.applied(), 1);
        assert!(view.read(|store| store.source("C").is_none()));
        assert!(barrier
            .wait_until_applied(1, Duration::from_millis(10))
            .is_err());
    }

    /// Store that hands back whatever sequences it was seeded with.
    struct GappedStore {
        records: Vec<RawRecord>,
    }

    impl GappedStore {
        fn with_sequences(sequences: &[SequenceNumber]) -> Self {
            let records = sequences
                .iter()
                .map(|&sequence| {
                    let (key, value) = codec::encode(&stream(&format!("S{sequence}"))).unwrap();
                    RawRecord::new(sequence, key, value)
                })
                .collect();
            Self { records }
        }
    }

    impl CommandLogStore for GappedStore {
        fn append(&mut self, _key: &str, _value: &[u8]) -> Result<SequenceNumber, LogError> {
            Err(LogError::Unavailable("read-only".into()))
        }

        fn read_from(&self, sequence: SequenceNumber, max: usize) -> Result<Vec<RawRecord>, LogError> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.sequence >= sequence)
                .take(max)
                .cloned()
                .collect())
        }

        fn latest_sequence(&self) -> Result<SequenceNumber, LogError> {
            Ok(self.records.last().map_or(0, |r| r.sequence))
        }
    }

    #[test]
    fn sequence_gap_halts_the_applier() {
        let log = CommandLog::new(GappedStore::with_sequences(&[1, 3]));
        let view = MetadataView::default();
        let barrier = ConsistencyBarrier::new();
        let executor = CommandExecutor::new(
            view.clone(),
            RuleEngine::standard(),
            EngineContext::dry_run(),
            Duration::from_millis(100),
        );

        Applier::new(log, executor, barrier.clone(), Arc::new(AtomicBool::new(false))).run();

        assert_eq!(barrier.applied(), 1);
        let ApplierPhase::Failed(reason) = barrier.phase() else {
            panic!("expected a failed applier, got {}", barrier.phase());
        };
        assert!(reason.contains("sequence 3, expected 2"));
        assert!(view.read(|store| store.source("S3").is_none()));
    }

    #[test]
    fn corrupt_log_error_maps_to_recovery_corruption() {
        let err: ApplierError = LogError::Corrupt {
            sequence: 9,
            reason: "checksum mismatch".into(),
        }
        .into();

        assert_eq!(
            err,
            ApplierError::RecoveryCorruption {
                sequence: 9,
                reason: "checksum mismatch".into()
            }
        );
    }
}
