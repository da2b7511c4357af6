// Log Entry Codec
//
// Commands are persisted as key = target id, value = JSON document
// holding everything else. Decoding is strict: a record that fails its
// checksum or cannot be parsed is corruption, never skipped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Command, CommandId, CommandKind, LogError, RawRecord};

#[derive(Debug, Serialize, Deserialize)]
struct CommandValue {
    id: CommandId,
    kind: CommandKind,
    statement_text: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(default)]
    sources: Vec<String>,
    submission_time: DateTime<Utc>,
}

/// Split a command into its persisted key and value.
pub fn encode(command: &Command) -> Result<(String, Vec<u8>), LogError> {
    let value = CommandValue {
        id: command.id,
        kind: command.kind,
        statement_text: command.statement_text.clone(),
        properties: command.properties.clone(),
        sources: command.sources.clone(),
        submission_time: command.submission_time,
    };
    let bytes = serde_json::to_vec(&value).map_err(|e| LogError::Encode(e.to_string()))?;
    Ok((command.target_id.clone(), bytes))
}

/// Rebuild a command from a persisted record.
pub fn decode(record: &RawRecord) -> Result<Command, LogError> {
    let corrupt = |reason: String| LogError::Corrupt {
        sequence: record.sequence,
        reason,
    };

    if !record.is_intact() {
        return Err(corrupt("checksum mismatch".into()));
    }
    if record.key.is_empty() {
        return Err(corrupt("empty target id".into()));
    }

    let value: CommandValue = serde_json::from_slice(&record.value)
        .map_err(|e| corrupt(format!("undecodable value: {e}")))?;

    Ok(Command {
        id: value.id,
        target_id: record.key.clone(),
        kind: value.kind,
        statement_text: value.statement_text,
        properties: value.properties,
        sources: value.sources,
        submission_time: value.submission_time,
    })
}
