// Command Executor
//
// Deterministic per-entry apply logic shared by the live applier and
// offline replay. Every per-command problem becomes a status; nothing
// here can stop the log from advancing.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::lifecycle::{EngineContext, QueryLifecycleManager, TerminateOutcome};
use crate::log::{Command, CommandKind, LogEntry};
use crate::rules::{RuleEngine, ValidationError};
use crate::state::{
    CommandStatus, DataSource, MetadataView, PersistentQuery, QueryId, QueryIdGenerator,
    QueryState, SourceKind,
};

/// Property asking DROP to delete the backing topic as well.
pub const DELETE_TOPIC_PROPERTY: &str = "DELETE_TOPIC";

pub struct CommandExecutor {
    view: MetadataView,
    rules: RuleEngine,
    lifecycle: QueryLifecycleManager,
    ids: QueryIdGenerator,
    shutdown_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        view: MetadataView,
        rules: RuleEngine,
        context: EngineContext,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            view,
            rules,
            lifecycle: QueryLifecycleManager::new(context),
            ids: QueryIdGenerator::new(),
            shutdown_timeout,
        }
    }

    pub fn view(&self) -> &MetadataView {
        &self.view
    }

    /// Apply one log entry and record its status.
    pub fn apply(&mut self, entry: &LogEntry) {
        let command = &entry.command;

        let duplicate = self.view.read(|store| {
            store
                .status(command.id)
                .is_some_and(|status| status.sequence < entry.sequence)
        });
        if duplicate {
            debug!(
                command_id = %command.id,
                sequence = entry.sequence,
                "command already applied at an earlier sequence, skipping"
            );
            return;
        }

        self.view.write(|store| {
            store.record_status(CommandStatus::executing(command.id, entry.sequence))
        });

        let status = match self.execute(command) {
            Ok(message) => {
                info!(
                    sequence = entry.sequence,
                    command_id = %command.id,
                    target = %command.target_id,
                    %message,
                    "command applied"
                );
                CommandStatus::success(command.id, entry.sequence, message)
            }
            Err(error) => {
                warn!(
                    sequence = entry.sequence,
                    command_id = %command.id,
                    target = %command.target_id,
                    %error,
                    "command rejected"
                );
                CommandStatus::error(command.id, entry.sequence, error.to_string())
            }
        };

        self.view.write(|store| store.record_status(status));
    }

    fn execute(&mut self, command: &Command) -> Result<String, ValidationError> {
        if let Err(violation) = self.view.read(|store| self.rules.evaluate(store, command)) {
            debug!(rule = violation.rule, "validation failed");
            return Err(violation.error);
        }

        match command.kind {
            CommandKind::CreateStream | CommandKind::CreateTable => self.create_source(command),
            CommandKind::CreateStreamAsSelect | CommandKind::CreateTableAsSelect => {
                self.create_as_select(command)
            }
            CommandKind::Drop => self.drop_source(command),
            CommandKind::Terminate => self.terminate(command),
        }
    }

    fn create_source(&mut self, command: &Command) -> Result<String, ValidationError> {
        let kind = source_kind(command)?;
        let replaced = self.retire_existing(&command.target_id);

        let source = DataSource::from_command(command, kind, None);
        self.view.write(|store| store.put_source(source));

        Ok(created_message(kind, replaced, false))
    }

    fn create_as_select(&mut self, command: &Command) -> Result<String, ValidationError> {
        let kind = source_kind(command)?;
        let replaced = self.retire_existing(&command.target_id);

        let query_id = self.ids.next_id();
        let source = DataSource::from_command(command, kind, Some(query_id));
        let registered = PersistentQuery::created(query_id, command);
        self.view.write(|store| {
            store.put_source(source);
            store.put_query(registered);
        });

        let started = self.lifecycle.start(command, query_id);
        self.view.write(|store| store.put_query(started));

        Ok(created_message(kind, replaced, true))
    }

    /// Stop the writer of a source about to be replaced.
    ///
    /// Returns whether a source existed under that name.
    fn retire_existing(&mut self, name: &str) -> bool {
        let Some(existing) = self.view.read(|store| store.source(name).cloned()) else {
            return false;
        };
        if let Some(writer) = existing.writer_query {
            self.stop_query(writer);
        }
        true
    }

    fn drop_source(&mut self, command: &Command) -> Result<String, ValidationError> {
        let removed = self
            .view
            .write(|store| store.remove_source(&command.target_id))
            .ok_or_else(|| ValidationError::NotFound {
                what: "Source",
                name: command.target_id.clone(),
            })?;

        if !command.flag(DELETE_TOPIC_PROPERTY) {
            return Ok(format!("Source `{}` dropped", removed.name));
        }

        match self.lifecycle.delete_topic(&removed.topic) {
            Ok(()) => Ok(format!(
                "Source `{}` dropped and topic `{}` deleted",
                removed.name, removed.topic
            )),
            Err(err) => {
                warn!(topic = %removed.topic, error = %err, "failed to delete topic of dropped source");
                Ok(format!(
                    "Source `{}` dropped; topic `{}` was not deleted: {err}",
                    removed.name, removed.topic
                ))
            }
        }
    }

    fn terminate(&mut self, command: &Command) -> Result<String, ValidationError> {
        let query_id: QueryId =
            command
                .target_id
                .parse()
                .map_err(|_| ValidationError::NotFound {
                    what: "Query",
                    name: command.target_id.clone(),
                })?;

        let state = self.view.read(|store| store.query(query_id).map(|q| q.state));
        match state {
            None => Err(ValidationError::NotFound {
                what: "Query",
                name: command.target_id.clone(),
            }),
            Some(QueryState::Terminated) => Ok(format!("Query {query_id} already terminated")),
            Some(_) => match self.stop_query(query_id) {
                TerminateOutcome::Forced { .. } => Ok(format!(
                    "Query {query_id} terminated (forced after shutdown timeout)"
                )),
                TerminateOutcome::Stopped | TerminateOutcome::NotRunning => {
                    Ok(format!("Query {query_id} terminated"))
                }
            },
        }
    }

    fn stop_query(&mut self, query_id: QueryId) -> TerminateOutcome {
        let outcome = self.lifecycle.terminate(query_id, self.shutdown_timeout);
        self.view.write(|store| {
            if let Some(query) = store.query_mut(query_id) {
                query.state = QueryState::Terminated;
            }
        });
        outcome
    }

    /// Called once replay has caught up, before new commands are accepted.
    pub fn finish_replay(&mut self) {
        let next = self
            .view
            .read(|store| store.max_query_id())
            .map_or(1, |id| id.0 + 1);
        self.ids.reseed(next);
        debug!(next_query_id = %self.ids.peek(), "query id generator reseeded");
    }

    /// Stop every computation this node owns.
    pub fn shutdown(&mut self) {
        let running = self.lifecycle.running();
        if running > 0 {
            info!(running, "stopping running queries");
        }
        self.lifecycle.shutdown_all(self.shutdown_timeout);
    }
}

fn source_kind(command: &Command) -> Result<SourceKind, ValidationError> {
    SourceKind::created_by(command.kind).ok_or_else(|| ValidationError::Invalid {
        reason: format!("{:?} does not create a source", command.kind),
    })
}

fn created_message(kind: SourceKind, replaced: bool, running: bool) -> String {
    let noun = match kind {
        SourceKind::Stream => "Stream",
        SourceKind::Table => "Table",
    };
    let verb = if replaced { "replaced" } else { "created" };
    if running {
        format!("{noun} {verb} and running")
    } else {
        format!("{noun} {verb}")
    }
}
