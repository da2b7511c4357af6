// Command Validation Rules
//
// Rules are pure checks evaluated against the current metadata store
// before a command is applied. A rejection becomes the command's ERROR
// status; it never halts the applier.

use crate::log::{Command, CommandKind};
use crate::state::{MetadataStore, QueryId, SourceKind};

/// Property allowing a CREATE to overwrite an entity of the same kind.
pub const REPLACE_PROPERTY: &str = "REPLACE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Cannot add {kind} `{name}`: a {kind} with the same name already exists")]
    DuplicateTarget { name: String, kind: SourceKind },

    #[error("{what} `{name}` not found")]
    NotFound { what: &'static str, name: String },

    #[error("Cannot drop `{name}`: it is used by active queries [{}]", join_ids(.queries))]
    InUse { name: String, queries: Vec<QueryId> },

    #[error("{reason}")]
    Invalid { reason: String },
}

fn join_ids(ids: &[QueryId]) -> String {
    ids.iter()
        .map(QueryId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleResult {
    Pass,
    Reject(ValidationError),
}

/// Trait implemented by all validation rules.
///
/// Rules must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait CommandRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult;
}

/// Returned when a rule rejects a command.
#[derive(Debug, thiserror::Error)]
#[error("rule `{rule}` rejected command: {error}")]
pub struct RuleViolation {
    pub rule: &'static str,
    pub error: ValidationError,
}

/// Evaluates a set of rules in registration order.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Box<dyn CommandRule>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Engine with every rule a node enforces.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(UniqueTarget);
        engine.register(SourcesExist);
        engine.register(DropTargetExists);
        engine.register(DropNotInUse);
        engine.register(TerminateTargetExists);
        engine
    }

    pub fn register<R: CommandRule + 'static>(&mut self, rule: R) {
        self.rules.push(Box::new(rule));
    }

    /// Evaluate all rules.
    ///
    /// Stops at the first rejection.
    pub fn evaluate(&self, store: &MetadataStore, command: &Command) -> Result<(), RuleViolation> {
        for rule in &self.rules {
            match rule.check(store, command) {
                RuleResult::Pass => continue,
                RuleResult::Reject(error) => {
                    return Err(RuleViolation {
                        rule: rule.name(),
                        error,
                    })
                }
            }
        }
        Ok(())
    }
}

/// CREATE needs a free name, unless it replaces an entity of the same kind.
pub struct UniqueTarget;

impl CommandRule for UniqueTarget {
    fn name(&self) -> &'static str {
        "unique-target"
    }

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult {
        let Some(kind) = SourceKind::created_by(command.kind) else {
            return RuleResult::Pass;
        };
        match store.source(&command.target_id) {
            None => RuleResult::Pass,
            Some(existing) if existing.kind == kind && command.flag(REPLACE_PROPERTY) => {
                RuleResult::Pass
            }
            Some(existing) => RuleResult::Reject(ValidationError::DuplicateTarget {
                name: existing.name.clone(),
                kind: existing.kind,
            }),
        }
    }
}

/// AS-SELECT needs at least one source, and every source must exist.
pub struct SourcesExist;

impl CommandRule for SourcesExist {
    fn name(&self) -> &'static str {
        "sources-exist"
    }

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult {
        if !command.kind.is_as_select() {
            return RuleResult::Pass;
        }
        if command.sources.is_empty() {
            return RuleResult::Reject(ValidationError::Invalid {
                reason: format!("`{}` does not read from any source", command.target_id),
            });
        }
        if command.sources.contains(&command.target_id) {
            return RuleResult::Reject(ValidationError::Invalid {
                reason: format!("`{}` cannot read from itself", command.target_id),
            });
        }
        match command
            .sources
            .iter()
            .find(|name| store.source(name).is_none())
        {
            Some(missing) => RuleResult::Reject(ValidationError::NotFound {
                what: "Source",
                name: missing.clone(),
            }),
            None => RuleResult::Pass,
        }
    }
}

pub struct DropTargetExists;

impl CommandRule for DropTargetExists {
    fn name(&self) -> &'static str {
        "drop-target-exists"
    }

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult {
        if command.kind != CommandKind::Drop || store.source(&command.target_id).is_some() {
            return RuleResult::Pass;
        }
        RuleResult::Reject(ValidationError::NotFound {
            what: "Source",
            name: command.target_id.clone(),
        })
    }
}

/// A source cannot be dropped while a live query reads or writes it.
pub struct DropNotInUse;

impl CommandRule for DropNotInUse {
    fn name(&self) -> &'static str {
        "drop-not-in-use"
    }

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult {
        if command.kind != CommandKind::Drop {
            return RuleResult::Pass;
        }
        let queries = store.active_queries_using(&command.target_id);
        if queries.is_empty() {
            return RuleResult::Pass;
        }
        RuleResult::Reject(ValidationError::InUse {
            name: command.target_id.clone(),
            queries,
        })
    }
}

pub struct TerminateTargetExists;

impl CommandRule for TerminateTargetExists {
    fn name(&self) -> &'static str {
        "terminate-target-exists"
    }

    fn check(&self, store: &MetadataStore, command: &Command) -> RuleResult {
        if command.kind != CommandKind::Terminate {
            return RuleResult::Pass;
        }
        let known = command
            .target_id
            .parse::<QueryId>()
            .is_ok_and(|id| store.query(id).is_some());
        if known {
            return RuleResult::Pass;
        }
        RuleResult::Reject(ValidationError::NotFound {
            what: "Query",
            name: command.target_id.clone(),
        })
    }
}
