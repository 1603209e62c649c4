use async_trait::async_trait;
use tracing::debug;

use super::{LogIndex, LogRecord, LogStore, Term};
use crate::error::LogStoreError;

/// Volatile `LogStore` backed by a `Vec`. Suitable for tests and for
/// hosts that handle durability elsewhere. Record at index `i` lives at
/// slot `i - 1`.
#[derive(Debug, Default)]
pub struct MemoryLog {
    term: Term,
    commit_index: LogIndex,
    records: Vec<LogRecord>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }

    fn last_index(&self) -> LogIndex {
        self.records.len() as LogIndex
    }

    fn slot(&self, index: LogIndex) -> Option<&LogRecord> {
        if index == 0 {
            return None;
        }
        self.records.get(index as usize - 1)
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn get_term(&self) -> Result<Term, LogStoreError> {
        Ok(self.term)
    }

    async fn set_term(&mut self, term: Term) -> Result<(), LogStoreError> {
        if term < self.term {
            return Err(LogStoreError::TermRegression {
                current: self.term,
                got: term,
            });
        }
        self.term = term;
        Ok(())
    }

    async fn incr_term(&mut self) -> Result<Term, LogStoreError> {
        self.term += 1;
        Ok(self.term)
    }

    async fn get_last_index(&self) -> Result<LogIndex, LogStoreError> {
        Ok(self.last_index())
    }

    async fn get_last_term(&self) -> Result<Term, LogStoreError> {
        Ok(self.records.last().map(|r| r.term).unwrap_or(0))
    }

    async fn get_commit_index(&self) -> Result<LogIndex, LogStoreError> {
        Ok(self.commit_index)
    }

    async fn append(&mut self, records: &[LogRecord]) -> Result<(), LogStoreError> {
        for record in records {
            let expected = self.last_index() + 1;
            if record.index != expected {
                return Err(LogStoreError::OutOfOrder {
                    expected,
                    got: record.index,
                });
            }
            self.records.push(record.clone());
        }
        Ok(())
    }

    async fn replace_or_append(&mut self, record: LogRecord) -> Result<LogRecord, LogStoreError> {
        let last = self.last_index();
        if record.index == last + 1 {
            self.records.push(record.clone());
            return Ok(record);
        }
        if record.index == 0 || record.index > last {
            return Err(LogStoreError::OutOfOrder {
                expected: last + 1,
                got: record.index,
            });
        }
        let slot = record.index as usize - 1;
        let existing = &self.records[slot];
        if existing.committed && !existing.same_entry(&record) {
            return Err(LogStoreError::Storage(format!(
                "refusing to overwrite committed record {} (term {}) with term {}",
                existing.index, existing.term, record.term
            )));
        }
        debug!(
            index = record.index,
            dropped = last - record.index,
            "overwriting log tail"
        );
        self.records.truncate(slot);
        self.records.push(record.clone());
        Ok(record)
    }

    async fn commit(&mut self, index: LogIndex) -> Result<(), LogStoreError> {
        if index <= self.commit_index {
            return Ok(());
        }
        if index > self.last_index() {
            return Err(LogStoreError::Missing(index));
        }
        for record in &mut self.records[self.commit_index as usize..index as usize] {
            record.committed = true;
        }
        self.commit_index = index;
        Ok(())
    }

    async fn read(&self, index: LogIndex) -> Result<Option<LogRecord>, LogStoreError> {
        Ok(self.slot(index).cloned())
    }
}
