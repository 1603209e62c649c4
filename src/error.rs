use thiserror::Error;

/// Raised by `Pilot` send operations. The core logs these and keeps
/// going; the next heartbeat or reply reopens the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {detail}")]
    Unreachable { peer: String, detail: String },
    #[error("send to {peer} failed: {detail}")]
    SendFailed { peer: String, detail: String },
}

/// Raised by `LogStore` operations. A failed write must leave in-memory
/// cursors untouched; the operation is retried on the next tick.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("append at index {got} breaks contiguity, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("commit index {got} behind current {current}")]
    CommitRegression { current: u64, got: u64 },
    #[error("term {got} behind stored term {current}")]
    TermRegression { current: u64, got: u64 },
    #[error("no record at index {0}")]
    Missing(u64),
}

/// An incoming message violates framing or term rules. Recorded to the
/// message problem history, never propagated to the transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("unexpected {code} received by {role}")]
    Unexpected { code: &'static str, role: &'static str },
    #[error("stale {code} from term {term}, current term {current}")]
    Stale {
        code: &'static str,
        term: u64,
        current: u64,
    },
}

/// A client command failed in the application executor. Reported to the
/// requesting client; the leader carries on.
#[derive(Debug, Clone, Error)]
#[error("command failed: {0}")]
pub struct CommandError(pub String);

/// Only raised when a log invariant is detected broken. The node halts.
#[derive(Debug, Error)]
#[error("log invariant violated: {0}")]
pub struct FatalError(pub String);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node_uris must contain at least one node")]
    EmptyCluster,
    #[error("local uri {0} is not part of node_uris")]
    UriNotInCluster(String),
    #[error("heartbeat_period {heartbeat}ms must be at most half of leader_lost_timeout {leader_lost}ms")]
    HeartbeatTooSlow { heartbeat: u64, leader_lost: u64 },
    #[error("election_timeout_min {min}ms must exceed leader_lost_timeout {leader_lost}ms")]
    ElectionWindowTooEarly { min: u64, leader_lost: u64 },
    #[error("election_timeout_min {min}ms must not exceed election_timeout_max {max}ms")]
    ElectionWindowInverted { min: u64, max: u64 },
}

/// Lifecycle misuse of a hull by its host.
#[derive(Debug, Error)]
pub enum HullError {
    #[error("hull already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Everything a message or timer handler can fail with. The hull sorts
/// these into the problem history, except `Fatal` which halts the node.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    LogStore(#[from] LogStoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}
