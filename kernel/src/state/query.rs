// Persistent Queries
//
// Long-running computations created by AS-SELECT commands.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::Serialize;

use crate::log::{Command, CommandId};

/// Cluster-unique query identifier, generated only by the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for QueryId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(QueryId)
    }
}

/// Lifecycle state of a persistent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Registered, computation not yet started.
    Created,

    /// Computation is processing.
    Running,

    /// The execution engine could not build or start the computation.
    Failed,

    /// Stopped by TERMINATE or by replacing its sink.
    Terminated,
}

impl QueryState {
    pub fn is_active(self) -> bool {
        self != Self::Terminated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistentQuery {
    pub id: QueryId,
    pub source_command: CommandId,
    pub sink: String,
    pub sources: Vec<String>,
    pub statement_text: String,
    pub state: QueryState,
    /// Startup failure reported by the execution engine.
    pub failure: Option<String>,
}

impl PersistentQuery {
    pub fn created(id: QueryId, command: &Command) -> Self {
        Self {
            id,
            source_command: command.id,
            sink: command.target_id.clone(),
            sources: command.sources.clone(),
            statement_text: command.statement_text.clone(),
            state: QueryState::Created,
            failure: None,
        }
    }
}

/// Sequential query id source.
#[derive(Debug)]
pub struct QueryIdGenerator {
    next: u64,
}

impl QueryIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> QueryId {
        let id = QueryId(self.next);
        self.next += 1;
        id
    }

    /// Ensure the next id is at least `next`. Never moves backwards.
    pub fn reseed(&mut self, next: u64) {
        self.next = self.next.max(next);
    }

    pub fn peek(&self) -> QueryId {
        QueryId(self.next)
    }
}

impl Default for QueryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_strictly_increasing() {
        let mut ids = QueryIdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();

        assert_eq!(first, QueryId(1));
        assert!(second > first);
    }

    #[test]
    fn reseed_never_moves_backwards() {
        let mut ids = QueryIdGenerator::new();
        ids.reseed(10);
        assert_eq!(ids.peek(), QueryId(10));

        ids.reseed(3);
        assert_eq!(ids.next_id(), QueryId(10));
        assert_eq!(ids.next_id(), QueryId(11));
    }

    #[test]
    fn parses_query_ids() {
        assert_eq!(" 42 ".parse::<QueryId>().unwrap(), QueryId(42));
        assert!("CSAS_A".parse::<QueryId>().is_err());
    }
}
