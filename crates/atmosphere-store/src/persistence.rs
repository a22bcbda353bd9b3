//! Append-only log plus periodic snapshot, the persisted shape of `{data_dir}/store/`
//! (§4.2, §6). Every accepted write (including tombstones) is appended to
//! `log.cbor` as one length-prefixed record; `snapshot.cbor` holds a full
//! dump of every collection plus the log offset it was taken at. On open the
//! snapshot loads first, then the log replays from its recorded offset.

use atmosphere_types::Document;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

pub const SNAPSHOT_INTERVAL: u64 = 2000;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("corrupt log record: {0}")]
    Decode(#[from] serde_cbor::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub collection: String,
    pub document: Document,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub log_offset: u64,
    pub collections: BTreeMap<String, Vec<Document>>,
}

pub struct PersistentLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    writes_since_snapshot: u64,
}

impl PersistentLog {
    pub fn open(data_dir: &Path) -> Result<(Self, Snapshot, Vec<LogRecord>), PersistenceError> {
        fs::create_dir_all(data_dir).map_err(|source| PersistenceError::Io { path: data_dir.to_path_buf(), source })?;
        let snapshot = Self::load_snapshot(data_dir)?;
        // `log.cbor` is truncated every time a snapshot is taken, so whatever
        // remains in it is always exactly the writes the snapshot doesn't
        // already contain -- nothing needs to be skipped.
        let replay = Self::replay_log(data_dir)?;

        let log_path = data_dir.join("log.cbor");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| PersistenceError::Io { path: log_path.clone(), source })?;

        Ok((
            Self { dir: data_dir.to_path_buf(), writer: BufWriter::new(file), writes_since_snapshot: 0 },
            snapshot,
            replay,
        ))
    }

    fn load_snapshot(data_dir: &Path) -> Result<Snapshot, PersistenceError> {
        let path = data_dir.join("snapshot.cbor");
        if !path.exists() {
            return Ok(Snapshot::default());
        }
        let bytes = fs::read(&path).map_err(|source| PersistenceError::Io { path, source })?;
        Ok(serde_cbor::from_slice(&bytes)?)
    }

    fn replay_log(data_dir: &Path) -> Result<Vec<LogRecord>, PersistenceError> {
        let path = data_dir.join("log.cbor");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|source| PersistenceError::Io { path: path.clone(), source })?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        loop {
            match read_length_prefixed(&mut reader) {
                Ok(Some(bytes)) => records.push(serde_cbor::from_slice(&bytes)?),
                Ok(None) => break,
                Err(err) => return Err(PersistenceError::Io { path, source: err }),
            }
        }
        Ok(records)
    }

    /// Appends one accepted write. Triggers a snapshot once `SNAPSHOT_INTERVAL`
    /// writes have accumulated since the last one.
    pub fn append(&mut self, record: &LogRecord, snapshot_source: impl FnOnce() -> Snapshot) -> Result<(), PersistenceError> {
        let bytes = serde_cbor::to_vec(record)?;
        write_length_prefixed(&mut self.writer, &bytes)
            .map_err(|source| PersistenceError::Io { path: self.dir.join("log.cbor"), source })?;
        self.writer.flush().map_err(|source| PersistenceError::Io { path: self.dir.join("log.cbor"), source })?;
        self.writes_since_snapshot += 1;
        if self.writes_since_snapshot >= SNAPSHOT_INTERVAL {
            self.snapshot(snapshot_source())?;
        }
        Ok(())
    }

    /// Writes a full snapshot and truncates the log that precedes it. Called
    /// on the interval above and on clean shutdown (§4.2).
    pub fn snapshot(&mut self, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let path = self.dir.join("snapshot.cbor");
        let tmp_path = self.dir.join("snapshot.cbor.tmp");
        let bytes = serde_cbor::to_vec(&snapshot)?;
        fs::write(&tmp_path, &bytes).map_err(|source| PersistenceError::Io { path: tmp_path.clone(), source })?;
        fs::rename(&tmp_path, &path).map_err(|source| PersistenceError::Io { path, source })?;

        let log_path = self.dir.join("log.cbor");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&log_path)
            .map_err(|source| PersistenceError::Io { path: log_path, source })?;
        self.writer = BufWriter::new(file);
        self.writes_since_snapshot = 0;
        Ok(())
    }
}

fn write_length_prefixed(writer: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(bytes)
}

fn read_length_prefixed(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::{LogicalTimestamp, PeerId};
    use std::collections::BTreeMap as Map;

    fn sample_record(counter: u64, peer: PeerId) -> LogRecord {
        LogRecord {
            collection: "demo".into(),
            document: Document::new("x", LogicalTimestamp { counter, peer_id: peer }, Map::new()),
        }
    }

    #[test]
    fn append_then_reopen_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerId::generate();
        {
            let (mut log, _, _) = PersistentLog::open(dir.path()).unwrap();
            log.append(&sample_record(1, peer), Snapshot::default).unwrap();
            log.append(&sample_record(2, peer), Snapshot::default).unwrap();
        }
        let (_, snapshot, records) = PersistentLog::open(dir.path()).unwrap();
        assert_eq!(snapshot.log_offset, 0);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn snapshot_truncates_log_and_records_offset() {
        let dir = tempfile::tempdir().unwrap();
        let peer = PeerId::generate();
        let (mut log, _, _) = PersistentLog::open(dir.path()).unwrap();
        log.append(&sample_record(1, peer), Snapshot::default).unwrap();
        log.snapshot(Snapshot { log_offset: 1, collections: BTreeMap::new() }).unwrap();
        log.append(&sample_record(2, peer), Snapshot::default).unwrap();

        let (_, snapshot, records) = PersistentLog::open(dir.path()).unwrap();
        assert_eq!(snapshot.log_offset, 1);
        assert_eq!(records.len(), 1);
    }
}
