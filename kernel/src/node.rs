// Node
//
// Wiring and the interfaces served to the request layer. A node owns one
// applier thread, one producer and the read side of the metadata store.
// Request threads submit commands, inspect statuses and queries, and may
// pass a previously returned sequence number so the node waits until it
// has applied that sequence before serving them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::applier::{Applier, CommandExecutor};
use crate::barrier::{ApplierPhase, BarrierError, ConsistencyBarrier};
use crate::config::{ConfigError, NodeConfig};
use crate::lifecycle::EngineContext;
use crate::log::{Command, CommandId, CommandLog, CommandLogStore, LogError, SequenceNumber};
use crate::producer::{CommandProducer, ProducerError, Submission};
use crate::rules::RuleEngine;
use crate::state::{
    CommandStatus, DataSource, MetadataStore, MetadataView, PersistentQuery, QueryId,
};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("timed out after {}ms waiting for sequence {requested} (applied: {applied})", .waited.as_millis())]
    ConsistencyTimeout {
        requested: SequenceNumber,
        applied: SequenceNumber,
        waited: Duration,
    },

    #[error("node is not serving: applier is {0}")]
    Unavailable(ApplierPhase),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn applier thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("applier thread panicked")]
    ApplierPanicked,
}

impl From<BarrierError> for NodeError {
    fn from(err: BarrierError) -> Self {
        match err {
            BarrierError::TimedOut {
                requested,
                applied,
                waited,
            } => Self::ConsistencyTimeout {
                requested,
                applied,
                waited,
            },
            BarrierError::Unavailable(phase) => Self::Unavailable(phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub phase: String,
    pub applied: SequenceNumber,
    /// Latest appended sequence; `None` when the log could not be read.
    pub latest: Option<SequenceNumber>,
    pub log_error: Option<String>,
}

pub struct Node<S: CommandLogStore + 'static> {
    config: NodeConfig,
    log: CommandLog<S>,
    producer: CommandProducer<S>,
    view: MetadataView,
    barrier: ConsistencyBarrier,
    /// Commands appended through this node and not yet applied, by sequence.
    pending: Mutex<BTreeMap<SequenceNumber, CommandId>>,
    stop: Arc<AtomicBool>,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CommandLogStore + 'static> Node<S> {
    /// Start the applier and begin replaying `log`.
    pub fn start(
        config: NodeConfig,
        log: CommandLog<S>,
        context: EngineContext,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let view = MetadataView::default();
        let barrier = ConsistencyBarrier::new();
        let stop = Arc::new(AtomicBool::new(false));

        let executor = CommandExecutor::new(
            view.clone(),
            RuleEngine::standard(),
            context,
            config.query_shutdown_timeout(),
        );
        let handle = Applier::new(log.clone(), executor, barrier.clone(), Arc::clone(&stop))
            .spawn()
            .map_err(NodeError::Spawn)?;

        let producer = CommandProducer::new(log.clone(), config.retry.policy());
        info!(node_id = %config.node_id, "node started");

        Ok(Self {
            config,
            log,
            producer,
            view,
            barrier,
            pending: Mutex::new(BTreeMap::new()),
            stop,
            applier: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Append a command. The returned status is always QUEUED.
    pub fn submit(&self, command: Command) -> Result<Submission, NodeError> {
        let submission = self.producer.submit(&command)?;
        let mut pending = self.pending.lock();
        self.prune_applied(&mut pending);
        if submission.sequence > self.barrier.applied() {
            pending.insert(submission.sequence, submission.command_id);
        }
        Ok(submission)
    }

    /// Forget submissions the applier has already recorded a status for.
    fn prune_applied(&self, pending: &mut BTreeMap<SequenceNumber, CommandId>) {
        let applied = self.barrier.applied();
        *pending = pending.split_off(&applied.saturating_add(1));
    }

    /// Append a command that depends on the effects of `after`.
    pub fn submit_after(
        &self,
        after: Option<SequenceNumber>,
        command: Command,
    ) -> Result<Submission, NodeError> {
        self.await_token(after)?;
        self.submit(command)
    }

    pub fn wait_until_applied(
        &self,
        sequence: SequenceNumber,
        timeout: Duration,
    ) -> Result<SequenceNumber, NodeError> {
        Ok(self.barrier.wait_until_applied(sequence, timeout)?)
    }

    /// Read the store once `after` (if given) has been applied locally.
    pub fn read<R>(
        &self,
        after: Option<SequenceNumber>,
        f: impl FnOnce(&MetadataStore) -> R,
    ) -> Result<R, NodeError> {
        self.await_token(after)?;
        Ok(self.view.read(f))
    }

    fn await_token(&self, after: Option<SequenceNumber>) -> Result<(), NodeError> {
        if let Some(sequence) = after {
            self.barrier
                .wait_until_applied(sequence, self.config.barrier_timeout())?;
        }
        Ok(())
    }

    /// Status of a command; QUEUED if it was submitted here but not yet applied.
    pub fn command_status(&self, id: CommandId) -> Option<CommandStatus> {
        let mut pending = self.pending.lock();
        self.prune_applied(&mut pending);
        if let Some(status) = self.view.read(|store| store.status(id).cloned()) {
            return Some(status);
        }
        pending
            .iter()
            .find(|(_, queued)| **queued == id)
            .map(|(sequence, id)| CommandStatus::queued(*id, *sequence))
    }

    /// Every known status in log order, including locally queued commands.
    pub fn command_statuses(&self) -> Vec<CommandStatus> {
        let mut pending = self.pending.lock();
        self.prune_applied(&mut pending);

        let mut statuses: Vec<CommandStatus> = self
            .view
            .read(|store| store.statuses().into_iter().cloned().collect());
        let queued: Vec<CommandStatus> = pending
            .iter()
            .filter(|(_, id)| !statuses.iter().any(|s| s.command_id == **id))
            .map(|(sequence, id)| CommandStatus::queued(*id, *sequence))
            .collect();
        statuses.extend(queued);
        statuses.sort_by_key(|s| s.sequence);
        statuses
    }

    pub fn query(&self, id: QueryId) -> Option<PersistentQuery> {
        self.view.read(|store| store.query(id).cloned())
    }

    pub fn queries(&self) -> Vec<PersistentQuery> {
        self.view.read(|store| store.queries().cloned().collect())
    }

    pub fn source(&self, name: &str) -> Option<DataSource> {
        self.view.read(|store| store.source(name).cloned())
    }

    pub fn sources(&self) -> Vec<DataSource> {
        self.view.read(|store| store.sources().cloned().collect())
    }

    pub fn snapshot(&self) -> MetadataStore {
        self.view.snapshot()
    }

    pub fn health(&self) -> NodeHealth {
        let (latest, log_error) = match self.log.latest_sequence() {
            Ok(latest) => (Some(latest), None),
            Err(err) => {
                warn!(node_id = %self.config.node_id, error = %err, "health check could not read the log");
                (None, Some(err.to_string()))
            }
        };
        NodeHealth {
            node_id: self.config.node_id.clone(),
            phase: self.barrier.phase().to_string(),
            applied: self.barrier.applied(),
            latest,
            log_error,
        }
    }

    pub fn phase(&self) -> ApplierPhase {
        self.barrier.phase()
    }

    /// Stop the applier and wait for it to release its computations.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        self.stop.store(true, Ordering::Release);
        self.log.wake_tails();

        let handle = self.applier.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| NodeError::ApplierPanicked)?;
            info!(node_id = %self.config.node_id, "node stopped");
        }
        Ok(())
    }
}

impl<S: CommandLogStore + 'static> Drop for Node<S> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{CommandKind, InMemoryLogStore, RawRecord};
    use crate::state::CommandState;

    fn node() -> Node<InMemoryLogStore> {
        Node::start(
            NodeConfig::default(),
            CommandLog::new(InMemoryLogStore::default()),
            EngineContext::dry_run(),
        )
        .unwrap()
    }

    #[test]
    fn submit_then_read_your_write() {
        let node = node();
        let command = Command::new(CommandKind::CreateStream, "A", "CREATE STREAM A;");
        let id = command.id;

        let submission = node.submit(command).unwrap();
        assert_eq!(submission.status.state, CommandState::Queued);

        let found = node
            .read(Some(submission.sequence), |store| store.source("A").is_some())
            .unwrap();
        assert!(found);
        assert_eq!(node.command_status(id).unwrap().state, CommandState::Success);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = NodeConfig {
            barrier_timeout_ms: 0,
            ..NodeConfig::default()
        };
        let result = Node::start(
            config,
            CommandLog::new(InMemoryLogStore::default()),
            EngineContext::dry_run(),
        );
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[test]
    fn consistency_timeout_is_distinguishable() {
        let config = NodeConfig {
            barrier_timeout_ms: 50,
            ..NodeConfig::default()
        };
        let node = Node::start(
            config,
            CommandLog::new(InMemoryLogStore::default()),
            EngineContext::dry_run(),
        )
        .unwrap();

        let err = node.read(Some(10), |_| ()).unwrap_err();
        assert!(matches!(
            err,
            NodeError::ConsistencyTimeout { requested: 10, .. }
        ));
    }

    #[test]
    fn applied_submissions_are_not_retained() {
        let node = node();

        let mut last = 0;
        for i in 0..200 {
            let name = format!("S{i}");
            last = node
                .submit(Command::new(CommandKind::CreateStream, name.as_str(), format!("CREATE STREAM {name};")))
                .unwrap()
                .sequence;
        }
        node.wait_until_applied(last, Duration::from_secs(5)).unwrap();

        let extra = node
            .submit(Command::new(CommandKind::CreateStream, "T", "CREATE STREAM T;"))
            .unwrap();
        assert!(node.pending.lock().len() <= 1);

        node.wait_until_applied(extra.sequence, Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            node.command_status(extra.command_id).unwrap().state,
            CommandState::Success
        );
        assert!(node.pending.lock().is_empty());
    }

    struct BreakableStore {
        inner: InMemoryLogStore,
        broken: bool,
    }

    impl CommandLogStore for BreakableStore {
        fn append(&mut self, key: &str, value: &[u8]) -> Result<SequenceNumber, LogError> {
            self.inner.append(key, value)
        }

        fn read_from(&self, sequence: SequenceNumber, max: usize) -> Result<Vec<RawRecord>, LogError> {
            self.inner.read_from(sequence, max)
        }

        fn latest_sequence(&self) -> Result<SequenceNumber, LogError> {
            if self.broken {
                return Err(LogError::Unavailable("disk detached".into()));
            }
            self.inner.latest_sequence()
        }
    }

    #[test]
    fn health_reports_unreadable_log() {
        let log = CommandLog::new(BreakableStore {
            inner: InMemoryLogStore::default(),
            broken: false,
        });
        let node = Node::start(NodeConfig::default(), log.clone(), EngineContext::dry_run()).unwrap();
        node.wait_until_applied(0, Duration::from_secs(5)).unwrap();
        assert_eq!(node.health().latest, Some(0));

        log.with_store(|store| store.broken = true);

        let health = node.health();
        assert_eq!(health.latest, None);
        assert!(health.log_error.unwrap().contains("disk detached"));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let node = node();
        node.wait_until_applied(0, Duration::from_secs(5)).unwrap();

        node.shutdown().unwrap();
        node.shutdown().unwrap();

        assert_eq!(node.phase(), ApplierPhase::ShuttingDown);
        assert_eq!(node.health().phase, "SHUTTING_DOWN");
    }
}
