// Command Log
//
// The durable, totally-ordered sequence of accepted commands that every
// node consumes. Sequence numbers are assigned by the backing store at
// append time; readers follow the log through blocking tails.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod codec;
pub mod file;
pub mod store;

pub use file::FileLogStore;
pub use store::{CommandLogStore, InMemoryLogStore, RawRecord};

/// Position of a command in the log. The first entry is 1.
pub type SequenceNumber = u64;

/// Maximum number of records a tail pulls from the store per lock.
const TAIL_BATCH: usize = 256;

/// Stable identifier of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    CreateStream,
    CreateTable,
    CreateStreamAsSelect,
    CreateTableAsSelect,
    Drop,
    Terminate,
}

impl CommandKind {
    /// True for every kind that introduces a named entity.
    pub fn is_create(self) -> bool {
        matches!(
            self,
            Self::CreateStream
                | Self::CreateTable
                | Self::CreateStreamAsSelect
                | Self::CreateTableAsSelect
        )
    }

    /// True for the kinds backed by a persistent query.
    pub fn is_as_select(self) -> bool {
        matches!(self, Self::CreateStreamAsSelect | Self::CreateTableAsSelect)
    }
}

/// A validated logical command as produced by the statement compiler.
///
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    /// Name of the stream, table or query this command affects.
    pub target_id: String,
    pub kind: CommandKind,
    pub statement_text: String,
    pub properties: BTreeMap<String, String>,
    /// Entities an AS-SELECT reads from, resolved by the planner.
    pub sources: Vec<String>,
    pub submission_time: DateTime<Utc>,
}

impl Command {
    pub fn new(
        kind: CommandKind,
        target_id: impl Into<String>,
        statement_text: impl Into<String>,
    ) -> Self {
        Self {
            id: CommandId::new(),
            target_id: target_id.into(),
            kind,
            statement_text: statement_text.into(),
            properties: BTreeMap::new(),
            sources: Vec::new(),
            submission_time: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_sources<I, T>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Boolean property; anything other than `true` (any case) is false.
    pub fn flag(&self, key: &str) -> bool {
        self.property(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Name of the topic backing the target entity.
    pub fn topic(&self) -> &str {
        self.property("KAFKA_TOPIC").unwrap_or(&self.target_id)
    }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: SequenceNumber,
    pub command: Command,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("command log unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt log entry at sequence {sequence}: {reason}")]
    Corrupt {
        sequence: SequenceNumber,
        reason: String,
    },

    #[error("sequence {requested} is below the earliest retained sequence {earliest}")]
    OffsetOutOfRange {
        requested: SequenceNumber,
        earliest: SequenceNumber,
    },

    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    #[error("failed to encode command: {0}")]
    Encode(String),
}

struct Shared<S> {
    store: Mutex<S>,
    appended: Condvar,
}

/// Shared handle to the command log.
///
/// Appends and tails may run on different threads; the store lock
/// serializes them and the condition variable wakes blocked tails.
pub struct CommandLog<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for CommandLog<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: CommandLogStore> CommandLog<S> {
    pub fn new(store: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                appended: Condvar::new(),
            }),
        }
    }

    /// Append a command and return the sequence number the store assigned.
    pub fn append(&self, command: &Command) -> Result<SequenceNumber, LogError> {
        let (key, value) = codec::encode(command)?;
        let sequence = self.shared.store.lock().append(&key, &value)?;
        self.shared.appended.notify_all();
        Ok(sequence)
    }

    pub fn latest_sequence(&self) -> Result<SequenceNumber, LogError> {
        self.shared.store.lock().latest_sequence()
    }

    pub fn earliest_sequence(&self) -> Result<SequenceNumber, LogError> {
        self.shared.store.lock().earliest_sequence()
    }

    /// Run `f` against the store directly, then wake any tails.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = f(&mut self.shared.store.lock());
        self.shared.appended.notify_all();
        result
    }

    /// Follow the log starting at `from`.
    ///
    /// The tail blocks when caught up and ends once `stop` is raised and
    /// [`CommandLog::wake_tails`] is called.
    pub fn tail_from(&self, from: SequenceNumber, stop: Arc<AtomicBool>) -> LogTail<S> {
        LogTail {
            log: self.clone(),
            next: from.max(1),
            buffered: VecDeque::new(),
            stop,
            finished: false,
        }
    }

    /// Wake every blocked tail so it can observe its stop flag.
    pub fn wake_tails(&self) {
        // Taking the lock orders this wakeup after any in-flight stop check.
        let _store = self.shared.store.lock();
        self.shared.appended.notify_all();
    }
}

/// Blocking, restartable reader over the log.
pub struct LogTail<S> {
    log: CommandLog<S>,
    next: SequenceNumber,
    buffered: VecDeque<RawRecord>,
    stop: Arc<AtomicBool>,
    finished: bool,
}

impl<S: CommandLogStore> LogTail<S> {
    /// Next sequence number this tail will yield.
    pub fn position(&self) -> SequenceNumber {
        self.next
    }

    fn fill(&mut self) -> Result<bool, LogError> {
        let shared = &self.log.shared;
        let mut store = shared.store.lock();
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(false);
            }

            let earliest = store.earliest_sequence()?;
            if self.next < earliest {
                return Err(LogError::OffsetOutOfRange {
                    requested: self.next,
                    earliest,
                });
            }

            if store.latest_sequence()? >= self.next {
                let records = store.read_from(self.next, TAIL_BATCH)?;
                if records.is_empty() {
                    return Err(LogError::Corrupt {
                        sequence: self.next,
                        reason: "entry missing from store".into(),
                    });
                }
                self.buffered.extend(records);
                return Ok(true);
            }

            shared.appended.wait(&mut store);
        }
    }
}

impl<S: CommandLogStore> Iterator for LogTail<S> {
    type Item = Result<LogEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.buffered.is_empty() {
            match self.fill() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }

        let record = self.buffered.pop_front()?;
        self.next = record.sequence + 1;

        match codec::decode(&record) {
            Ok(command) => Some(Ok(LogEntry {
                sequence: record.sequence,
                command,
            })),
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
