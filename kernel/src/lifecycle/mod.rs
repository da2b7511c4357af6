// Query Lifecycle Manager
//
// Turns applied AS-SELECT commands into running computations and applied
// TERMINATE / DROP commands into orderly shutdowns. Computation handles
// are owned here and nowhere else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::log::Command;
use crate::state::{PersistentQuery, QueryId, QueryState};

pub mod dry_run;

pub use dry_run::{DryRunEngine, InMemoryTopicClient};

/// Property selecting the partition count of a sink topic.
pub const PARTITIONS_PROPERTY: &str = "PARTITIONS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic client unavailable: {0}")]
    Unavailable(String),

    #[error("topic `{topic}` rejected: {reason}")]
    Rejected { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to build query {query_id}: {reason}")]
    Build { query_id: QueryId, reason: String },

    #[error("failed to start query {query_id}: {reason}")]
    Start { query_id: QueryId, reason: String },

    #[error("sink topic error: {0}")]
    Topic(#[from] TopicError),
}

/// Control path of one running computation.
pub trait QueryHandle: Send {
    /// Ask the computation to stop. Must not block.
    fn request_stop(&mut self);

    /// Wait up to `timeout` for the computation to acknowledge the stop.
    fn await_stopped(&mut self, timeout: Duration) -> bool;

    /// Tear the computation down without waiting for acknowledgement.
    fn force_stop(&mut self);

    fn is_running(&self) -> bool;
}

/// External physical execution engine.
pub trait ExecutionEngine: Send + Sync {
    fn build_and_start(
        &self,
        command: &Command,
        query_id: QueryId,
    ) -> Result<Box<dyn QueryHandle>, EngineError>;
}

/// External topic administration.
pub trait TopicClient: Send + Sync {
    fn topic_exists(&self, topic: &str) -> Result<bool, TopicError>;

    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TopicError>;

    /// Deleting a missing topic succeeds.
    fn delete_topic(&self, topic: &str) -> Result<(), TopicError>;
}

/// Collaborators handed to a node at startup.
#[derive(Clone)]
pub struct EngineContext {
    pub engine: Arc<dyn ExecutionEngine>,
    pub topics: Arc<dyn TopicClient>,
}

impl EngineContext {
    pub fn new(engine: Arc<dyn ExecutionEngine>, topics: Arc<dyn TopicClient>) -> Self {
        Self { engine, topics }
    }

    /// In-process collaborators that track plans without processing data.
    pub fn dry_run() -> Self {
        Self::new(
            Arc::new(DryRunEngine::default()),
            Arc::new(InMemoryTopicClient::default()),
        )
    }
}

/// How a termination completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The computation acknowledged the stop within the bound.
    Stopped,
    /// The bound elapsed and the computation was torn down.
    Forced { waited: Duration },
    /// There was no computation to stop.
    NotRunning,
}

pub struct QueryLifecycleManager {
    context: EngineContext,
    handles: BTreeMap<QueryId, Box<dyn QueryHandle>>,
}

impl QueryLifecycleManager {
    pub fn new(context: EngineContext) -> Self {
        Self {
            context,
            handles: BTreeMap::new(),
        }
    }

    /// Build and start the computation for an applied AS-SELECT.
    ///
    /// Startup failure is reported through the returned query's state.
    pub fn start(&mut self, command: &Command, query_id: QueryId) -> PersistentQuery {
        let mut query = PersistentQuery::created(query_id, command);

        match self.launch(command, query_id) {
            Ok(handle) => {
                self.handles.insert(query_id, handle);
                query.state = QueryState::Running;
                info!(query_id = %query_id, sink = %query.sink, "query started");
            }
            Err(err) => {
                warn!(query_id = %query_id, sink = %query.sink, error = %err, "query failed to start");
                query.state = QueryState::Failed;
                query.failure = Some(err.to_string());
            }
        }

        query
    }

    fn launch(&self, command: &Command, query_id: QueryId) -> Result<Box<dyn QueryHandle>, EngineError> {
        let topic = command.topic();
        if !self.context.topics.topic_exists(topic)? {
            let partitions = partitions(command, query_id)?;
            debug!(topic, partitions, "creating sink topic");
            self.context.topics.create_topic(topic, partitions)?;
        }
        self.context.engine.build_and_start(command, query_id)
    }

    /// Stop a query, forcing it once `timeout` elapses.
    ///
    /// Idempotent: a query without a live computation is `NotRunning`.
    pub fn terminate(&mut self, query_id: QueryId, timeout: Duration) -> TerminateOutcome {
        let Some(mut handle) = self.handles.remove(&query_id) else {
            return TerminateOutcome::NotRunning;
        };

        if !handle.is_running() {
            return TerminateOutcome::Stopped;
        }

        let started = Instant::now();
        handle.request_stop();
        if handle.await_stopped(timeout) {
            debug!(query_id = %query_id, "query stopped");
            return TerminateOutcome::Stopped;
        }

        handle.force_stop();
        let waited = started.elapsed();
        warn!(
            query_id = %query_id,
            waited_ms = waited.as_millis() as u64,
            "query did not acknowledge shutdown in time, forced"
        );
        TerminateOutcome::Forced { waited }
    }

    pub fn delete_topic(&self, topic: &str) -> Result<(), TopicError> {
        self.context.topics.delete_topic(topic)
    }

    /// Stop every computation without recording terminations.
    pub fn shutdown_all(&mut self, timeout: Duration) {
        let ids: Vec<QueryId> = self.handles.keys().copied().collect();
        for id in ids {
            self.terminate(id, timeout);
        }
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }
}

fn partitions(command: &Command, query_id: QueryId) -> Result<u32, EngineError> {
    match command.property(PARTITIONS_PROPERTY) {
        None => Ok(1),
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(EngineError::Build {
                query_id,
                reason: format!("invalid {PARTITIONS_PROPERTY} `{raw}`"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::CommandKind;

    fn csas(name: &str) -> Command {
        Command::new(
            CommandKind::CreateStreamAsSelect,
            name,
            format!("CREATE STREAM {name} AS SELECT * FROM A;"),
        )
        .with_sources(["A"])
    }

    fn manager() -> (QueryLifecycleManager, Arc<DryRunEngine>, Arc<InMemoryTopicClient>) {
        let engine = Arc::new(DryRunEngine::default());
        let topics = Arc::new(InMemoryTopicClient::default());
        let context = EngineContext::new(engine.clone(), topics.clone());
        (QueryLifecycleManager::new(context), engine, topics)
    }

    #[test]
    fn start_creates_sink_topic_and_runs() {
        let (mut lifecycle, engine, topics) = manager();

        let query = lifecycle.start(&csas("B").with_property(PARTITIONS_PROPERTY, "3"), QueryId(1));

        assert_eq!(query.state, QueryState::Running);
        assert_eq!(topics.partitions("B"), Some(3));
        assert_eq!(engine.started(), vec![QueryId(1)]);
        assert_eq!(lifecycle.running(), 1);
    }

    #[test]
    fn build_failure_marks_query_failed() {
        let (mut lifecycle, engine, _) = manager();
        engine.fail_sink("B");

        let query = lifecycle.start(&csas("B"), QueryId(1));

        assert_eq!(query.state, QueryState::Failed);
        assert!(query.failure.unwrap().contains("failed to build query 1"));
        assert_eq!(lifecycle.running(), 0);
    }

    #[test]
    fn invalid_partitions_fail_startup() {
        let (mut lifecycle, _, topics) = manager();

        let query = lifecycle.start(&csas("B").with_property(PARTITIONS_PROPERTY, "zero"), QueryId(2));

        assert_eq!(query.state, QueryState::Failed);
        assert_eq!(topics.partitions("B"), None);
    }

    #[test]
    fn topic_outage_marks_query_failed() {
        let (mut lifecycle, _, topics) = manager();
        topics.set_available(false);

        let query = lifecycle.start(&csas("B"), QueryId(1));

        assert_eq!(query.state, QueryState::Failed);
        assert!(query.failure.unwrap().contains("sink topic error"));
    }

    #[test]
    fn terminate_is_idempotent() {
        let (mut lifecycle, _, _) = manager();
        lifecycle.start(&csas("B"), QueryId(1));

        let timeout = Duration::from_millis(200);
        assert_eq!(lifecycle.terminate(QueryId(1), timeout), TerminateOutcome::Stopped);
        assert_eq!(lifecycle.terminate(QueryId(1), timeout), TerminateOutcome::NotRunning);
    }

    #[test]
    fn unresponsive_query_is_forced_after_timeout() {
        let (mut lifecycle, engine, _) = manager();
        engine.ignore_stop_requests(true);
        lifecycle.start(&csas("B"), QueryId(1));

        let timeout = Duration::from_millis(100);
        let outcome = lifecycle.terminate(QueryId(1), timeout);

        let TerminateOutcome::Forced { waited } = outcome else {
            panic!("expected forced termination, got {outcome:?}");
        };
        assert!(waited >= timeout);
        assert_eq!(lifecycle.running(), 0);
    }
}
