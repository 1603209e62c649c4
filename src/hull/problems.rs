use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::Message;

/// One thing that went wrong while handling traffic: a stale response,
/// a handler failure, a malformed frame.
#[derive(Debug, Clone)]
pub struct MessageProblem {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub detail: String,
    /// The offending message, when there was one.
    pub message: Option<Message>,
}

/// Bounded, most-recent-wins record of message problems. Handlers never
/// propagate these to the transport; they land here for diagnosis.
#[derive(Debug)]
pub struct ProblemHistory {
    entries: Vec<MessageProblem>,
    capacity: usize,
}

impl ProblemHistory {
    pub fn new(capacity: usize) -> Self {
        ProblemHistory {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn record(&mut self, detail: String, message: Option<Message>) {
        if self.entries.len() == self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(MessageProblem {
            id: Uuid::new_v4(),
            at: Utc::now(),
            detail,
            message,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&MessageProblem> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageProblem> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for ProblemHistory {
    fn default() -> Self {
        ProblemHistory::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_fall_off() {
        let mut history = ProblemHistory::new(3);
        for i in 0..5 {
            history.record(format!("problem {i}"), None);
        }
        assert_eq!(history.len(), 3);
        let details: Vec<_> = history.iter().map(|p| p.detail.as_str()).collect();
        assert_eq!(details, vec!["problem 2", "problem 3", "problem 4"]);
        assert_eq!(history.latest().unwrap().detail, "problem 4");
    }
}
