//! Per-tablespace write-ahead log.
//!
//! Every durable change goes through the commit log before it is applied to
//! memory or storage. Each tablespace manager owns exactly one log instance,
//! created through [`CommitLogManager`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::Bytes;
use crate::model::{Table, TableSpaceName};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("commit log is closed")]
    Closed,
    #[error("commit log is not writable")]
    NotWritable,
    #[error("commit log unavailable: {0}")]
    Unavailable(String),
}

pub type LogResult<T> = Result<T, LogError>;

/// Monotonic sequence number assigned to each persisted log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A durable operation recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub transaction_id: u64,
    pub op: LogOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    CreateTable { table: Table },
    Insert { table: String, key: Bytes, value: Bytes },
    Update { table: String, key: Bytes, value: Bytes },
    Delete { table: String, key: Bytes },
}

impl LogEntry {
    pub fn new(transaction_id: u64, op: LogOp) -> Self {
        Self { transaction_id, op }
    }
}

/// The write-ahead log of one tablespace.
pub trait CommitLog: Send + Sync {
    /// Append a single entry, returning only once it is durable.
    fn log(&self, entry: LogEntry) -> LogResult<Lsn>;

    /// Append a batch of entries. Best-effort: on failure, entries before
    /// the failing one may already be durable.
    fn log_batch(&self, entries: Vec<LogEntry>) -> LogResult<Vec<Lsn>> {
        let mut sequence_numbers = Vec::with_capacity(entries.len());
        for entry in entries {
            sequence_numbers.push(self.log(entry)?);
        }
        Ok(sequence_numbers)
    }

    /// Replay every entry after `after` into `consumer`. With `fencing` the
    /// log also rejects writers until [`CommitLog::start_writing`] is
    /// called.
    fn recover(
        &self,
        after: Lsn,
        consumer: &mut dyn FnMut(Lsn, &LogEntry),
        fencing: bool,
    ) -> LogResult<()>;

    /// Stream entries after `after` into `consumer`; used by replicas
    /// trailing the tablespace leader.
    fn follow(&self, after: Lsn, consumer: &mut dyn FnMut(Lsn, &LogEntry)) -> LogResult<()>;

    fn current_lsn(&self) -> Lsn;

    /// Enable writes; required after a fencing recovery.
    fn start_writing(&self) -> LogResult<()>;

    /// Drop all entries.
    fn clear(&self) -> LogResult<()>;

    fn close(&self) -> LogResult<()>;

    fn is_closed(&self) -> bool;

    fn checkpoint(&self) -> LogResult<()> {
        Ok(())
    }
}

/// Creates the per-tablespace [`CommitLog`] instances for this node.
pub trait CommitLogManager: Send + Sync {
    fn create_log(&self, table_space: &TableSpaceName) -> LogResult<Box<dyn CommitLog>>;
}

/// Volatile commit log for single-node deployments and tests.
pub struct MemoryCommitLog {
    entries: Mutex<Vec<(Lsn, LogEntry)>>,
    current: AtomicU64,
    writable: AtomicBool,
    closed: AtomicBool,
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            current: AtomicU64::new(0),
            writable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> LogResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryCommitLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLog for MemoryCommitLog {
    fn log(&self, entry: LogEntry) -> LogResult<Lsn> {
        self.ensure_open()?;
        if !self.writable.load(Ordering::SeqCst) {
            return Err(LogError::NotWritable);
        }
        let mut entries = self.entries.lock();
        let lsn = Lsn(entries.last().map(|(lsn, _)| lsn.0).unwrap_or(0) + 1);
        entries.push((lsn, entry));
        self.current.store(lsn.0, Ordering::SeqCst);
        Ok(lsn)
    }

    fn recover(
        &self,
        after: Lsn,
        consumer: &mut dyn FnMut(Lsn, &LogEntry),
        fencing: bool,
    ) -> LogResult<()> {
        self.ensure_open()?;
        if fencing {
            self.writable.store(false, Ordering::SeqCst);
        }
        for (lsn, entry) in self.entries.lock().iter() {
            if *lsn > after {
                consumer(*lsn, entry);
            }
        }
        Ok(())
    }

    fn follow(&self, after: Lsn, consumer: &mut dyn FnMut(Lsn, &LogEntry)) -> LogResult<()> {
        self.ensure_open()?;
        for (lsn, entry) in self.entries.lock().iter() {
            if *lsn > after {
                consumer(*lsn, entry);
            }
        }
        Ok(())
    }

    fn current_lsn(&self) -> Lsn {
        Lsn(self.current.load(Ordering::SeqCst))
    }

    fn start_writing(&self) -> LogResult<()> {
        self.ensure_open()?;
        self.writable.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> LogResult<()> {
        self.ensure_open()?;
        self.entries.lock().clear();
        self.current.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> LogResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MemoryCommitLogManager;

impl MemoryCommitLogManager {
    pub fn new() -> Self {
        Self
    }
}

impl CommitLogManager for MemoryCommitLogManager {
    fn create_log(&self, _table_space: &TableSpaceName) -> LogResult<Box<dyn CommitLog>> {
        Ok(Box::new(MemoryCommitLog::new()))
    }
}
