use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::log::{LogIndex, LogRecord, Term};

/// Opaque node identity, a URI string. Cheap to clone, hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(uri: impl Into<String>) -> Self {
        NodeId(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(uri: &str) -> Self {
        NodeId(uri.to_string())
    }
}

impl From<String> for NodeId {
    fn from(uri: String) -> Self {
        NodeId(uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCode {
    RequestVote,
    RequestVoteResponse,
    AppendEntries,
    AppendResponse,
}

impl MessageCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageCode::RequestVote => "request_vote",
            MessageCode::RequestVoteResponse => "request_vote_response",
            MessageCode::AppendEntries => "append_entries",
            MessageCode::AppendResponse => "append_response",
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vote solicitation from a candidate. Carries the candidate's log tail
/// so receivers can apply the up-to-date rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub term: Term,
    pub vote: bool,
}

/// Replication push from a leader. An empty `entries` list is a
/// heartbeat; `leader_commit` is always meaningful either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogRecord>,
}

impl AppendEntries {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Follower's answer to an AppendEntries. On success,
/// `last_entry_index` acknowledges the highest index this exchange
/// proved matching; `last_index` always reports the local log end so a
/// leader can jump its cursor instead of walking back one at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub term: Term,
    pub success: bool,
    pub last_entry_index: Option<LogIndex>,
    pub last_index: LogIndex,
}

/// The closed set of wire messages. Every variant shares sender,
/// receiver and term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendResponse(AppendResponse),
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::RequestVote(_) => MessageCode::RequestVote,
            Message::RequestVoteResponse(_) => MessageCode::RequestVoteResponse,
            Message::AppendEntries(_) => MessageCode::AppendEntries,
            Message::AppendResponse(_) => MessageCode::AppendResponse,
        }
    }

    pub fn sender(&self) -> &NodeId {
        match self {
            Message::RequestVote(m) => &m.sender,
            Message::RequestVoteResponse(m) => &m.sender,
            Message::AppendEntries(m) => &m.sender,
            Message::AppendResponse(m) => &m.sender,
        }
    }

    pub fn receiver(&self) -> &NodeId {
        match self {
            Message::RequestVote(m) => &m.receiver,
            Message::RequestVoteResponse(m) => &m.receiver,
            Message::AppendEntries(m) => &m.receiver,
            Message::AppendResponse(m) => &m.receiver,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendResponse(m) => m.term,
        }
    }
}

/// Frame a message for the wire.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a framed message. Unknown shapes surface as decode errors for
/// the problem history, never as panics.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    bincode::deserialize(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn node(uri: &str) -> NodeId {
        NodeId::from(uri)
    }

    #[test]
    fn round_trip_every_variant() {
        let messages = vec![
            Message::RequestVote(RequestVote {
                sender: node("mem://1"),
                receiver: node("mem://2"),
                term: 3,
                last_log_index: 7,
                last_log_term: 2,
            }),
            Message::RequestVoteResponse(RequestVoteResponse {
                sender: node("mem://2"),
                receiver: node("mem://1"),
                term: 3,
                vote: true,
            }),
            Message::AppendEntries(AppendEntries {
                sender: node("mem://1"),
                receiver: node("mem://3"),
                term: 3,
                prev_log_index: 7,
                prev_log_term: 2,
                leader_commit: 5,
                entries: vec![LogRecord::client(
                    8,
                    3,
                    Bytes::copy_from_slice(b"add 1"),
                )],
            }),
            Message::AppendResponse(AppendResponse {
                sender: node("mem://3"),
                receiver: node("mem://1"),
                term: 3,
                success: true,
                last_entry_index: Some(8),
                last_index: 8,
            }),
        ];

        for message in messages {
            let frame = encode(&message).unwrap();
            assert_eq!(decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn heartbeat_is_empty_entries() {
        let hb = AppendEntries {
            sender: node("mem://1"),
            receiver: node("mem://2"),
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![],
        };
        assert!(hb.is_heartbeat());
    }

    #[test]
    fn garbage_frames_are_decode_errors() {
        assert!(matches!(
            decode(&[0xff, 0x01, 0x02]),
            Err(ProtocolError::Decode(_))
        ));
    }
}
