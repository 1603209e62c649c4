use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{CommandError, TransportError};
use crate::log::{LogIndex, Term};
use crate::message::{Message, NodeId};

/// What a client gets back for a submitted command. Successful results
/// arrive only after the backing record is committed.
#[derive(Debug)]
pub struct CommandResult {
    /// Log index of the record carrying the result; absent when the
    /// command never made it into the log.
    pub index: Option<LogIndex>,
    pub term: Term,
    pub outcome: Result<Bytes, CommandError>,
    /// Where to retry when this node is not the leader.
    pub leader_hint: Option<NodeId>,
}

/// One-shot reply channel handed in with each client command.
pub type CommandReply = oneshot::Sender<CommandResult>;

/// Host-provided boundary below the consensus core: the transport that
/// carries messages between peers and the application executor that
/// turns client commands into state-machine results.
///
/// Sends are fire-and-forget; no delivery, ordering-across-senders, or
/// duplication guarantees are assumed. The core never retries a send,
/// the protocol's own timers reopen the channel.
#[async_trait]
pub trait Pilot: Send + Sync {
    /// Ship a message toward `target`.
    async fn send_message(&self, target: &NodeId, message: Message) -> Result<(), TransportError>;

    /// Ship a reply toward `target`. `request` is the message being
    /// answered, for transports that correlate the two.
    async fn send_response(
        &self,
        target: &NodeId,
        request: &Message,
        response: Message,
    ) -> Result<(), TransportError>;

    /// Execute a client command against the application. Called by the
    /// leader before the result is appended to the log; a failure is
    /// reported to the requesting client and nothing is appended.
    async fn process_command(&self, command: Bytes) -> Result<Bytes, CommandError>;
}
