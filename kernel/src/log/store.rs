// Command Log Storage Abstraction
//
// Defines the durability contract for the command log. The persisted
// layout is a keyed record: key = target id (so a downstream collaborator
// can compact to the latest command per entity), value = encoded command.

use super::{LogError, SequenceNumber};

/// A record exactly as persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub sequence: SequenceNumber,
    pub key: String,
    pub value: Vec<u8>,
    /// CRC32 over key and value bytes.
    pub checksum: u32,
}

impl RawRecord {
    pub fn new(sequence: SequenceNumber, key: impl Into<String>, value: Vec<u8>) -> Self {
        let key = key.into();
        let checksum = Self::checksum_of(&key, &value);
        Self {
            sequence,
            key,
            value,
            checksum,
        }
    }

    pub fn checksum_of(key: &str, value: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(value);
        hasher.finalize()
    }

    pub fn is_intact(&self) -> bool {
        Self::checksum_of(&self.key, &self.value) == self.checksum
    }
}

/// Storage backend for the command log.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered
/// - Durable once `append` returns
///
/// Implementations MUST NOT:
/// - Reorder records
/// - Mutate existing records
/// - Leave sequence gaps
pub trait CommandLogStore: Send {
    /// Persist a record and return its assigned sequence number.
    ///
    /// Returns `LogError::Unavailable` when the backing medium rejects the write.
    fn append(&mut self, key: &str, value: &[u8]) -> Result<SequenceNumber, LogError>;

    /// Read up to `max` records starting at `sequence`, in order.
    fn read_from(&self, sequence: SequenceNumber, max: usize) -> Result<Vec<RawRecord>, LogError>;

    /// Sequence of the newest record, or 0 when empty.
    fn latest_sequence(&self) -> Result<SequenceNumber, LogError>;

    /// Sequence of the oldest retained record.
    fn earliest_sequence(&self) -> Result<SequenceNumber, LogError> {
        Ok(1)
    }
}

/// Volatile store used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    records: Vec<RawRecord>,
}

impl InMemoryLogStore {
    /// Append a pre-built record, bypassing encoding.
    ///
    /// The record's sequence must be exactly the next one.
    pub fn append_raw(&mut self, record: RawRecord) -> Result<(), LogError> {
        let expected = self.next_sequence();
        if record.sequence != expected {
            return Err(LogError::SequenceConflict {
                expected,
                actual: record.sequence,
            });
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_sequence(&self) -> SequenceNumber {
        self.records.last().map(|r| r.sequence + 1).unwrap_or(1)
    }
}

impl CommandLogStore for InMemoryLogStore {
    fn append(&mut self, key: &str, value: &[u8]) -> Result<SequenceNumber, LogError> {
        let sequence = self.next_sequence();
        self.records
            .push(RawRecord::new(sequence, key, value.to_vec()));
        Ok(sequence)
    }

    fn read_from(&self, sequence: SequenceNumber, max: usize) -> Result<Vec<RawRecord>, LogError> {
        let start = sequence.saturating_sub(1) as usize;
        Ok(self
            .records
            .iter()
            .skip(start)
            .take(max)
            .cloned()
            .collect())
    }

    fn latest_sequence(&self) -> Result<SequenceNumber, LogError> {
        Ok(self.records.last().map(|r| r.sequence).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_in_order() {
        let mut store = InMemoryLogStore::default();
        assert_eq!(store.latest_sequence().unwrap(), 0);

        store.append("A", b"one").unwrap();
        store.append("B", b"two").unwrap();
        store.append("A", b"three").unwrap();

        let records = store.read_from(2, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 2);
        assert_eq!(records[0].key, "B");
        assert_eq!(records[1].value, b"three".to_vec());
        assert!(records.iter().all(RawRecord::is_intact));
    }

    #[test]
    fn raw_append_rejects_gaps() {
        let mut store = InMemoryLogStore::default();
        store.append("A", b"one").unwrap();

        let err = store
            .append_raw(RawRecord::new(5, "B", b"two".to_vec()))
            .unwrap_err();

        assert_eq!(
            err,
            LogError::SequenceConflict {
                expected: 2,
                actual: 5
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn tampered_record_fails_checksum() {
        let mut record = RawRecord::new(1, "A", b"value".to_vec());
        assert!(record.is_intact());

        record.value[0] ^= 0xff;
        assert!(!record.is_intact());
    }
}
