//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft_core::Storage, handed to RaftNode by raft-node
//! what: FileStorage (fsync'd files on disk), InMemoryStorage for tests and demos

use parking_lot::Mutex;
use raft_core::{LogEntry, LogIndex, NodeId, Storage, StorageError, Term};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically on every write
/// - log.jsonl: one json log entry per line, append-only
///
/// every write is fsync'd before it returns. a crash in the middle of an append can
/// leave a torn last line; it is dropped on load since it was never acknowledged.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    /// a torn trailing record left by a crash is cut off here, before anything is
    /// appended behind it
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let storage = Self { dir };
        let (log, torn) = storage.read_log()?;
        if torn {
            warn!(dir = %storage.dir.display(), entries = log.len(), "repairing torn log tail");
            storage.replace_file("log.jsonl", &Self::encode_lines(&log)?)?;
        }
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// write `bytes` to `name` through a synced temp file and a rename
    fn replace_file(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let temp_path = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(name))?;
        self.sync_dir()
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), StorageError> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// parse log.jsonl; the flag reports a dropped torn trailing record
    fn read_log(&self) -> Result<(Vec<LogEntry>, bool), StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok((Vec::new(), false));
        }

        let lines = BufReader::new(File::open(&path)?)
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        let mut log = Vec::with_capacity(lines.len());
        let mut torn = false;
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => log.push(entry),
                Err(e) if n + 1 == lines.len() => {
                    warn!(error = %e, line = n + 1, "dropping torn trailing log record");
                    torn = true;
                }
                Err(e) => {
                    return Err(StorageError::Corrupt(format!(
                        "{}: line {}: {e}",
                        path.display(),
                        n + 1
                    )))
                }
            }
        }
        Ok((log, torn))
    }

    fn encode_lines(entries: &[LogEntry]) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(&MetaData { term, voted_for })?;
        self.replace_file("meta.json", &json)?;
        debug!(term, voted_for = ?voted_for, "persisted term and vote");
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }
        let contents = fs::read(&path)?;
        let meta: MetaData = serde_json::from_slice(&contents)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let bytes = Self::encode_lines(entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        debug!(
            first = entries[0].index,
            count = entries.len(),
            "appended log entries"
        );
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.read_log()?.0)
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let mut log = self.load_log()?;
        let before = log.len();
        log.retain(|e| e.index < from_index);
        self.replace_file("log.jsonl", &Self::encode_lines(&log)?)?;
        debug!(from_index, dropped = before - log.len(), "truncated log");
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Debug, Default)]
struct MemState {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    fail_writes: bool,
}

/// in-memory storage for tests and demos
///
/// clones share the same state, so a test can keep a handle to inspect what a node
/// persisted, restart a node from it, or make writes fail on demand.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<MemState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// storage pre-seeded with a term, vote and log, as if left behind by a crash
    pub fn with_state(term: Term, voted_for: Option<NodeId>, log: Vec<LogEntry>) -> Self {
        let storage = Self::new();
        {
            let mut state = storage.inner.lock();
            state.term = term;
            state.voted_for = voted_for;
            state.log = log;
        }
        storage
    }

    /// make every subsequent write fail with `StorageError::Unavailable`
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn check_writable(state: &MemState) -> Result<(), StorageError> {
        if state.fail_writes {
            Err(StorageError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        let mut state = self.inner.lock();
        Self::check_writable(&state)?;
        state.term = term;
        state.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        let state = self.inner.lock();
        Ok((state.term, state.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut state = self.inner.lock();
        Self::check_writable(&state)?;
        state.log.extend_from_slice(entries);
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.inner.lock().log.clone())
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        let mut state = self.inner.lock();
        Self::check_writable(&state)?;
        state.log.retain(|e| e.index < from_index);
        Ok(())
    }
}
