use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::LogStoreError;

pub mod memory;

pub use memory::MemoryLog;

/// Logical election epoch. Monotonically non-decreasing.
pub type Term = u64;

/// 1-based record index. Zero means "no record".
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCode {
    /// Appended by a fresh leader to mark the start of its term.
    NoOp,
    /// Result of a client command.
    Client,
}

/// One replicated log record. Immutable once appended, except for the
/// `committed` flag which only ever advances to true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub code: RecordCode,
    pub index: LogIndex,
    pub term: Term,
    pub committed: bool,
    pub user_data: Bytes,
}

impl LogRecord {
    pub fn no_op(index: LogIndex, term: Term) -> Self {
        LogRecord {
            code: RecordCode::NoOp,
            index,
            term,
            committed: false,
            user_data: Bytes::new(),
        }
    }

    pub fn client(index: LogIndex, term: Term, user_data: Bytes) -> Self {
        LogRecord {
            code: RecordCode::Client,
            index,
            term,
            committed: false,
            user_data,
        }
    }

    /// Same record content, ignoring the commit flag. Two records with
    /// equal index and term are the same entry by the log matching rule.
    pub fn same_entry(&self, other: &LogRecord) -> bool {
        self.index == other.index && self.term == other.term
    }
}

/// Storage contract for the replicated log, the current term, and the
/// commit index. Implementations must uphold:
///
/// - append-only content: a committed record is never rewritten with a
///   different term or payload;
/// - contiguity: indices form `1..=last_index` with no gaps;
/// - commit monotonicity: the commit index never decreases;
/// - term monotonicity: the stored term never decreases.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn get_term(&self) -> Result<Term, LogStoreError>;

    async fn set_term(&mut self, term: Term) -> Result<(), LogStoreError>;

    /// Bump the stored term by one and return the new value.
    async fn incr_term(&mut self) -> Result<Term, LogStoreError>;

    async fn get_last_index(&self) -> Result<LogIndex, LogStoreError>;

    async fn get_last_term(&self) -> Result<Term, LogStoreError>;

    async fn get_commit_index(&self) -> Result<LogIndex, LogStoreError>;

    /// Append records whose indices continue `1..=last_index` without a
    /// gap.
    async fn append(&mut self, records: &[LogRecord]) -> Result<(), LogStoreError>;

    /// Append if `record.index == last_index + 1`; otherwise overwrite
    /// at that index and truncate everything after it.
    async fn replace_or_append(&mut self, record: LogRecord) -> Result<LogRecord, LogStoreError>;

    /// Mark everything up to `index` committed. Indexes at or below the
    /// current commit index are a no-op.
    async fn commit(&mut self, index: LogIndex) -> Result<(), LogStoreError>;

    async fn read(&self, index: LogIndex) -> Result<Option<LogRecord>, LogStoreError>;
}
