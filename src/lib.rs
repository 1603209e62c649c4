//! Raft consensus core for replicated state machines.
//!
//! One [`Hull`] per node owns the active role state (follower,
//! candidate or leader), routes inbound messages and timer ticks to
//! it, and performs role transitions. The host supplies the transport
//! and application executor behind the [`Pilot`] trait and durable
//! storage behind [`LogStore`]; [`RaftNode`] wraps a hull in a tokio
//! task with a mailbox so the core stays single-writer.

pub mod config;
pub mod error;
pub mod events;
pub mod hull;
pub mod log;
pub mod logging;
pub mod message;
pub mod node;
pub mod pilot;
pub mod states;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ClusterConfig, Config, LocalConfig};
pub use events::{EventBus, HullEvent};
pub use hull::{Hull, MessageProblem, ProblemHistory};
pub use log::{LogIndex, LogRecord, LogStore, MemoryLog, RecordCode, Term};
pub use message::{Message, MessageCode, NodeId};
pub use node::{NodeHandle, RaftNode};
pub use pilot::{CommandReply, CommandResult, Pilot};
pub use states::RoleCode;
