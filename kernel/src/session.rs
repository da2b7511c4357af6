// Client Sessions
//
// A session carries per-client statement properties and the consistency
// token of its last write, so every statement it issues observes the
// effects of the ones before it on the same node.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::log::{Command, CommandLogStore, SequenceNumber};
use crate::node::{Node, NodeError};
use crate::producer::Submission;
use crate::state::MetadataStore;

/// Statement text could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CompileError(pub String);

/// Turns statement text into a command. Parsing lives outside this crate.
pub trait StatementCompiler {
    fn compile(&self, statement: &str) -> Result<Command, CompileError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("statement rejected: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

pub struct Session<S: CommandLogStore + 'static> {
    node: Arc<Node<S>>,
    properties: BTreeMap<String, String>,
    last_sequence: Option<SequenceNumber>,
}

impl<S: CommandLogStore + 'static> Session<S> {
    pub fn new(node: Arc<Node<S>>) -> Self {
        Self {
            node,
            properties: BTreeMap::new(),
            last_sequence: None,
        }
    }

    pub fn node(&self) -> &Arc<Node<S>> {
        &self.node
    }

    /// Consistency token of the last command this session wrote.
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.last_sequence
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn unset_property(&mut self, key: &str) -> Option<String> {
        self.properties.remove(key)
    }

    /// Submit a command after this session's previous write has applied.
    ///
    /// Session properties are attached unless the command sets the same key.
    pub fn execute(&mut self, mut command: Command) -> Result<Submission, SessionError> {
        for (key, value) in &self.properties {
            command
                .properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let submission = self.node.submit_after(self.last_sequence, command)?;
        self.last_sequence = Some(submission.sequence);
        Ok(submission)
    }

    pub fn execute_statement(
        &mut self,
        compiler: &dyn StatementCompiler,
        statement: &str,
    ) -> Result<Submission, SessionError> {
        let command = compiler.compile(statement)?;
        self.execute(command)
    }

    /// Read the store with this session's writes visible.
    pub fn read<R>(&self, f: impl FnOnce(&MetadataStore) -> R) -> Result<R, SessionError> {
        Ok(self.node.read(self.last_sequence, f)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::lifecycle::EngineContext;
    use crate::log::{CommandKind, CommandLog, InMemoryLogStore};
    use crate::state::{CommandState, QueryState};

    struct KeywordCompiler;

    impl StatementCompiler for KeywordCompiler {
        fn compile(&self, statement: &str) -> Result<Command, CompileError> {
            let words: Vec<&str> = statement.trim_end_matches(';').split_whitespace().collect();
            match words.as_slice() {
                ["CREATE", "STREAM", name] => {
                    Ok(Command::new(CommandKind::CreateStream, *name, statement))
                }
                ["CREATE", "TABLE", name, "AS", "SELECT", "*", "FROM", from] => {
                    Ok(Command::new(CommandKind::CreateTableAsSelect, *name, statement)
                        .with_sources([*from]))
                }
                _ => Err(CompileError(format!("unsupported statement: {statement}"))),
            }
        }
    }

    fn session() -> Session<InMemoryLogStore> {
        let node = Node::start(
            NodeConfig::default(),
            CommandLog::new(InMemoryLogStore::default()),
            EngineContext::dry_run(),
        )
        .unwrap();
        Session::new(Arc::new(node))
    }

    #[test]
    fn dependent_statements_see_earlier_writes() {
        let mut session = session();

        session
            .execute_statement(&KeywordCompiler, "CREATE STREAM A;")
            .unwrap();
        let ctas = session
            .execute_statement(&KeywordCompiler, "CREATE TABLE T AS SELECT * FROM A;")
            .unwrap();

        assert_eq!(session.last_sequence(), Some(ctas.sequence));
        let (state, query) = session
            .read(|store| {
                (
                    store.status(ctas.command_id).map(|s| s.state),
                    store.queries().next().map(|q| q.state),
                )
            })
            .unwrap();
        assert_eq!(state, Some(CommandState::Success));
        assert_eq!(query, Some(QueryState::Running));
    }

    #[test]
    fn compile_errors_do_not_reach_the_log() {
        let mut session = session();

        let err = session
            .execute_statement(&KeywordCompiler, "SELECT 1;")
            .unwrap_err();

        assert!(matches!(err, SessionError::Compile(_)));
        assert_eq!(session.last_sequence(), None);
        assert_eq!(session.node().health().latest, Some(0));
    }

    #[test]
    fn session_properties_are_attached_unless_overridden() {
        let mut session = session();
        assert_eq!(session.set_property("auto.offset.reset", "earliest"), None);
        session.set_property("KAFKA_TOPIC", "from_session");

        let submission = session
            .execute(
                Command::new(CommandKind::CreateStream, "A", "CREATE STREAM A;")
                    .with_property("KAFKA_TOPIC", "a_topic"),
            )
            .unwrap();

        let source = session
            .read(|store| store.source("A").cloned())
            .unwrap()
            .unwrap();
        assert_eq!(source.topic, "a_topic");
        assert_eq!(
            source.properties.get("auto.offset.reset").map(String::as_str),
            Some("earliest")
        );
        assert_eq!(submission.sequence, 1);

        assert_eq!(
            session.unset_property("KAFKA_TOPIC"),
            Some("from_session".to_string())
        );
        assert_eq!(session.unset_property("KAFKA_TOPIC"), None);
    }
}
