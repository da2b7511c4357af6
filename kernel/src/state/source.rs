// Data Sources
//
// Streams and tables registered in the metadata store.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::log::{Command, CommandId, CommandKind};
use crate::state::QueryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    Stream,
    Table,
}

impl SourceKind {
    /// Kind of entity a CREATE command introduces, if any.
    pub fn created_by(kind: CommandKind) -> Option<Self> {
        match kind {
            CommandKind::CreateStream | CommandKind::CreateStreamAsSelect => Some(Self::Stream),
            CommandKind::CreateTable | CommandKind::CreateTableAsSelect => Some(Self::Table),
            CommandKind::Drop | CommandKind::Terminate => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => f.write_str("stream"),
            Self::Table => f.write_str("table"),
        }
    }
}

/// How record timestamps are derived for a source.
///
/// The absence of a timestamp column is its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "column", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimestampPolicy {
    /// Use the timestamp carried by the underlying record.
    EventTime,
    /// Extract the timestamp from the named column.
    Column(String),
}

impl TimestampPolicy {
    pub fn from_command(command: &Command) -> Self {
        match command.property("TIMESTAMP") {
            Some(column) if !column.trim().is_empty() => Self::Column(column.trim().to_string()),
            _ => Self::EventTime,
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            Self::EventTime => None,
            Self::Column(column) => Some(column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSource {
    pub name: String,
    pub kind: SourceKind,
    pub topic: String,
    pub statement_text: String,
    pub timestamp: TimestampPolicy,
    pub properties: BTreeMap<String, String>,
    pub created_by: CommandId,
    /// Query populating this source, for AS-SELECT sources.
    pub writer_query: Option<QueryId>,
}

impl DataSource {
    pub fn from_command(command: &Command, kind: SourceKind, writer_query: Option<QueryId>) -> Self {
        Self {
            name: command.target_id.clone(),
            kind,
            topic: command.topic().to_string(),
            statement_text: command.statement_text.clone(),
            timestamp: TimestampPolicy::from_command(command),
            properties: command.properties.clone(),
            created_by: command.id,
            writer_query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_policy_is_explicit() {
        let plain = Command::new(CommandKind::CreateStream, "A", "CREATE STREAM A;");
        assert_eq!(TimestampPolicy::from_command(&plain), TimestampPolicy::EventTime);
        assert_eq!(TimestampPolicy::from_command(&plain).column(), None);

        let with_column = plain.clone().with_property("TIMESTAMP", " EVENT_TS ");
        let policy = TimestampPolicy::from_command(&with_column);
        assert_eq!(policy.column(), Some("EVENT_TS"));

        let blank = plain.with_property("TIMESTAMP", "  ");
        assert_eq!(TimestampPolicy::from_command(&blank), TimestampPolicy::EventTime);
    }

    #[test]
    fn source_kind_follows_command_kind() {
        assert_eq!(
            SourceKind::created_by(CommandKind::CreateTableAsSelect),
            Some(SourceKind::Table)
        );
        assert_eq!(SourceKind::created_by(CommandKind::Terminate), None);
    }
}
