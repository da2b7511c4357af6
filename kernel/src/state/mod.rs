// Metadata Store
//
// In-memory projection of every entity, persistent query and command
// status derived from the command log. It has no persistence of its own
// and is always reconstructible by replay. Only the applier writes it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::log::CommandId;

pub mod query;
pub mod source;
pub mod status;

pub use query::{PersistentQuery, QueryId, QueryIdGenerator, QueryState};
pub use source::{DataSource, SourceKind, TimestampPolicy};
pub use status::{CommandState, CommandStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataStore {
    sources: BTreeMap<String, DataSource>,
    queries: BTreeMap<QueryId, PersistentQuery>,
    statuses: BTreeMap<CommandId, CommandStatus>,
}

impl MetadataStore {
    pub fn source(&self, name: &str) -> Option<&DataSource> {
        self.sources.get(name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &DataSource> {
        self.sources.values()
    }

    pub fn query(&self, id: QueryId) -> Option<&PersistentQuery> {
        self.queries.get(&id)
    }

    pub fn queries(&self) -> impl Iterator<Item = &PersistentQuery> {
        self.queries.values()
    }

    pub fn status(&self, id: CommandId) -> Option<&CommandStatus> {
        self.statuses.get(&id)
    }

    /// All statuses in log order.
    pub fn statuses(&self) -> Vec<&CommandStatus> {
        let mut statuses: Vec<_> = self.statuses.values().collect();
        statuses.sort_by_key(|s| s.sequence);
        statuses
    }

    /// Non-terminated queries that read from or write to `name`.
    pub fn active_queries_using(&self, name: &str) -> Vec<QueryId> {
        self.queries
            .values()
            .filter(|q| q.state.is_active())
            .filter(|q| q.sink == name || q.sources.iter().any(|s| s == name))
            .map(|q| q.id)
            .collect()
    }

    pub fn max_query_id(&self) -> Option<QueryId> {
        self.queries.keys().next_back().copied()
    }

    pub(crate) fn put_source(&mut self, source: DataSource) -> Option<DataSource> {
        self.sources.insert(source.name.clone(), source)
    }

    pub(crate) fn remove_source(&mut self, name: &str) -> Option<DataSource> {
        self.sources.remove(name)
    }

    pub(crate) fn put_query(&mut self, query: PersistentQuery) {
        self.queries.insert(query.id, query);
    }

    pub(crate) fn query_mut(&mut self, id: QueryId) -> Option<&mut PersistentQuery> {
        self.queries.get_mut(&id)
    }

    pub(crate) fn record_status(&mut self, status: CommandStatus) {
        self.statuses.insert(status.command_id, status);
    }
}

/// Shared read handle over the node's metadata store.
///
/// Readers take the lock briefly; the applier is the only writer.
#[derive(Debug, Clone, Default)]
pub struct MetadataView {
    inner: Arc<RwLock<MetadataStore>>,
}

impl MetadataView {
    pub fn read<R>(&self, f: impl FnOnce(&MetadataStore) -> R) -> R {
        f(&self.inner.read())
    }

    /// Point-in-time copy of the whole store.
    pub fn snapshot(&self) -> MetadataStore {
        self.inner.read().clone()
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut MetadataStore) -> R) -> R {
        f(&mut self.inner.write())
    }
}
