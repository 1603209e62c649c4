use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::log::Term;
use crate::message::{Message, NodeId};

pub mod candidate;
pub mod follower;
pub mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCode {
    Paused,
    Follower,
    Candidate,
    Leader,
}

impl RoleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleCode::Paused => "paused",
            RoleCode::Follower => "follower",
            RoleCode::Candidate => "candidate",
            RoleCode::Leader => "leader",
        }
    }
}

impl fmt::Display for RoleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler wants the hull to do once it returns. Handlers never
/// call back into the hull; transitions are data, applied by the owner.
#[derive(Debug)]
pub enum Transition {
    Stay,
    /// Become a candidate (fresh campaign, term bump happens on start).
    Campaign,
    /// Majority reached in `term`; become leader.
    Win { term: Term },
    /// Step down to follower. If a message is carried, the new follower
    /// reprocesses it.
    Demote { redispatch: Option<Message> },
}

/// A deadline owned by exactly one role state. Cancellation is
/// synchronous: once `terminate` runs, the deadline is gone and a
/// racing tick observes nothing to fire.
#[derive(Debug)]
pub struct StateTimer {
    name: &'static str,
    deadline: Option<Instant>,
    terminated: bool,
}

impl StateTimer {
    pub fn new(name: &'static str) -> Self {
        StateTimer {
            name,
            deadline: None,
            terminated: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arm (or re-arm) the timer `after` from now.
    pub fn arm(&mut self, after: Duration) {
        if self.terminated {
            return;
        }
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn terminate(&mut self) {
        self.deadline = None;
        self.terminated = true;
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => !self.terminated && now >= deadline,
            None => false,
        }
    }
}

/// Ballot memory: at most one grant per term, surviving role changes
/// within that term. Cleared whenever a higher term is observed.
#[derive(Debug, Default, Clone)]
pub struct VoteKeeper {
    voted_for: Option<NodeId>,
    voted_for_term: Term,
}

impl VoteKeeper {
    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn voted_for_term(&self) -> Term {
        self.voted_for_term
    }

    /// True when granting `candidate` a vote in `term` cannot be a
    /// second grant for that term.
    pub fn may_grant(&self, candidate: &NodeId, term: Term) -> bool {
        if term > self.voted_for_term {
            return true;
        }
        if term == self.voted_for_term {
            return match &self.voted_for {
                None => true,
                Some(previous) => previous == candidate,
            };
        }
        false
    }

    pub fn record(&mut self, candidate: NodeId, term: Term) {
        self.voted_for = Some(candidate);
        self.voted_for_term = term;
    }

    /// A higher term invalidates any ballot cast in an earlier one.
    pub fn observe_term(&mut self, term: Term) {
        if term > self.voted_for_term {
            self.voted_for = None;
            self.voted_for_term = term;
        }
    }
}
