// File Log Store
//
// Every record is a single frame appended to `commands.log`:
//
//   [sequence u64][key_len u32][value_len u32][crc u32][header_crc u32][key][value]
//
// Integers are big-endian. `crc` covers key and value; `header_crc` covers
// the 20 bytes before it. Appends are `sync_data`'d before they are
// acknowledged.
//
// On open, a trailing frame whose header is incomplete, or whose header is
// intact but whose body runs past the end of the file, is a torn append and
// is truncated. A complete header that fails its checksum is corruption and
// the store refuses to open. A complete frame with a bad body checksum is
// kept so that decoding reports it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::store::{CommandLogStore, RawRecord};
use super::{LogError, SequenceNumber};

/// File name used for the log within the log directory.
const LOG_FILE: &str = "commands.log";

/// Header fields covered by the header checksum.
const HEADER_FIELDS_LEN: usize = 8 + 4 + 4 + 4;

/// Fixed header size: the fields plus their checksum.
const FRAME_HEADER_LEN: usize = HEADER_FIELDS_LEN + 4;

/// Durable store persisting frames to a single append-only file.
pub struct FileLogStore {
    path: PathBuf,
    file: File,
    /// Length of the file covered by acknowledged frames.
    committed_len: u64,
    records: Vec<RawRecord>,
}

impl FileLogStore {
    /// Open or create the log in `dir`, loading every retained frame.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| unavailable("create log dir", e))?;
        let path = dir.join(LOG_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| unavailable("open log file", e))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| unavailable("read log file", e))?;

        let (records, valid_len) = parse_frames(&buf)?;
        if valid_len < buf.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = buf.len() - valid_len,
                "truncating torn append at end of command log"
            );
            file.set_len(valid_len as u64)
                .map_err(|e| unavailable("truncate torn frame", e))?;
        }

        debug!(path = %path.display(), records = records.len(), "opened command log");

        Ok(Self {
            path,
            file,
            committed_len: valid_len as u64,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn next_sequence(&self) -> SequenceNumber {
        self.records.last().map(|r| r.sequence + 1).unwrap_or(1)
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.file.sync_data()
    }
}

impl CommandLogStore for FileLogStore {
    fn append(&mut self, key: &str, value: &[u8]) -> Result<SequenceNumber, LogError> {
        let record = RawRecord::new(self.next_sequence(), key, value.to_vec());
        let frame = encode_frame(&record)?;

        if let Err(err) = self.write_frame(&frame) {
            // Drop any partial frame so later appends stay aligned.
            if let Err(rollback) = self.file.set_len(self.committed_len) {
                warn!(error = %rollback, "failed to roll back partial frame");
            }
            return Err(unavailable("append frame", err));
        }

        self.committed_len += frame.len() as u64;
        let sequence = record.sequence;
        self.records.push(record);
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

fn unavailable(context: &str, err: std::io::Error) -> LogError {
    LogError::Unavailable(format!("{context}: {err}"))
}

fn encode_frame(record: &RawRecord) -> Result<Vec<u8>, LogError> {
    let key_len = u32::try_from(record.key.len())
        .map_err(|_| LogError::Encode("target id too long".into()))?;
    let value_len = u32::try_from(record.value.len())
        .map_err(|_| LogError::Encode("command value too large".into()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + record.key.len() + record.value.len());
    frame.extend_from_slice(&record.sequence.to_be_bytes());
    frame.extend_from_slice(&key_len.to_be_bytes());
    frame.extend_from_slice(&value_len.to_be_bytes());
    frame.extend_from_slice(&record.checksum.to_be_bytes());
    let header_crc = crc32fast::hash(&frame[..HEADER_FIELDS_LEN]);
    frame.extend_from_slice(&header_crc.to_be_bytes());
    frame.extend_from_slice(record.key.as_bytes());
    frame.extend_from_slice(&record.value);
    Ok(frame)
}

/// Parse complete frames, returning them and the byte length they cover.
fn parse_frames(buf: &[u8]) -> Result<(Vec<RawRecord>, usize), LogError> {
    let mut records: Vec<RawRecord> = Vec::new();
    let mut offset = 0usize;

    while buf.len() - offset >= FRAME_HEADER_LEN {
        let expected = records.last().map(|r| r.sequence + 1).unwrap_or(1);
        let header = &buf[offset..offset + FRAME_HEADER_LEN];

        let header_crc = u32::from_be_bytes(array(&header[HEADER_FIELDS_LEN..]));
        if crc32fast::hash(&header[..HEADER_FIELDS_LEN]) != header_crc {
            return Err(LogError::Corrupt {
                sequence: expected,
                reason: format!("frame header checksum mismatch at byte {offset}"),
            });
        }

        let sequence = u64::from_be_bytes(array(&header[0..8]));
        let key_len = u32::from_be_bytes(array(&header[8..12])) as usize;
        let value_len = u32::from_be_bytes(array(&header[12..16])) as usize;
        let checksum = u32::from_be_bytes(array(&header[16..20]));

        if sequence != expected {
            return Err(LogError::Corrupt {
                sequence: expected,
                reason: format!("frame header carries sequence {sequence}"),
            });
        }

        // The header is intact, so a short body can only be a torn append.
        let body_start = offset + FRAME_HEADER_LEN;
        let body_end = body_start.saturating_add(key_len).saturating_add(value_len);
        if body_end > buf.len() {
            break;
        }

        let key_end = body_start + key_len;
        records.push(RawRecord {
            sequence,
            key: String::from_utf8_lossy(&buf[body_start..key_end]).into_owned(),
            value: buf[key_end..body_end].to_vec(),
            checksum,
        });
        offset = body_end;
    }

    Ok((records, offset))
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{codec, Command, CommandKind};

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            assert_eq!(store.append("A", b"first").unwrap(), 1);
            assert_eq!(store.append("B", b"second").unwrap(), 2);
        }

        let mut store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_sequence().unwrap(), 2);

        let records = store.read_from(1, 10).unwrap();
        assert_eq!(records[0].key, "A");
        assert_eq!(records[1].value, b"second".to_vec());
        assert!(records.iter().all(RawRecord::is_intact));

        assert_eq!(store.append("C", b"third").unwrap(), 3);
    }

    #[test]
    fn torn_trailing_frame_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store.append("A", b"complete").unwrap();
            store.path().to_path_buf()
        };

        let intact_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&2u64.to_be_bytes()).unwrap();
        file.write_all(&[0, 0]).unwrap();
        drop(file);

        let mut store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_sequence().unwrap(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        assert_eq!(store.append("B", b"next").unwrap(), 2);
    }

    #[test]
    fn torn_body_behind_intact_header_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store.append("A", b"complete").unwrap();
            store.path().to_path_buf()
        };
        let intact_len = fs::metadata(&path).unwrap().len();

        let frame = encode_frame(&RawRecord::new(2, "B", b"never acknowledged".to_vec())).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..FRAME_HEADER_LEN + 3]).unwrap();
        drop(file);

        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_sequence().unwrap(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
    }

    #[test]
    fn damaged_header_mid_log_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            store.append("A", b"first").unwrap();
            store.append("B", b"second").unwrap();
            store.append("C", b"third").unwrap();
            store.path().to_path_buf()
        };

        // Low byte of the second frame's key length.
        let second_frame = FRAME_HEADER_LEN + "A".len() + b"first".len();
        let mut bytes = fs::read(&path).unwrap();
        bytes[second_frame + 11] ^= 0x40;
        fs::write(&path, &bytes).unwrap();

        let err = FileLogStore::open(dir.path()).err().unwrap();
        assert!(matches!(err, LogError::Corrupt { sequence: 2, .. }));
        assert_eq!(fs::metadata(&path).unwrap().len(), bytes.len() as u64);
    }

    #[test]
    fn flipped_value_byte_surfaces_at_decode() {
        let dir = tempfile::tempdir().unwrap();
        let command = Command::new(CommandKind::CreateStream, "A", "CREATE STREAM A;");
        let path = {
            let mut store = FileLogStore::open(dir.path()).unwrap();
            let (key, value) = codec::encode(&command).unwrap();
            store.append(&key, &value).unwrap();
            store.path().to_path_buf()
        };

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x20;
        fs::write(&path, &bytes).unwrap();

        let store = FileLogStore::open(dir.path()).unwrap();
        let records = store.read_from(1, 1).unwrap();
        let err = codec::decode(&records[0]).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { sequence: 1, .. }));
    }
}
