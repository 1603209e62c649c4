use tokio::sync::broadcast;

use crate::log::{LogIndex, Term};
use crate::message::{MessageCode, NodeId};
use crate::states::RoleCode;

/// Observable lifecycle of one hull. Tests and monitoring subscribe to
/// this instead of hooking into the states themselves.
#[derive(Debug, Clone)]
pub enum HullEvent {
    RoleChanged {
        uri: NodeId,
        from: RoleCode,
        to: RoleCode,
        term: Term,
    },
    MessageDispatched {
        uri: NodeId,
        code: MessageCode,
        sender: NodeId,
    },
    ElectionStarted {
        uri: NodeId,
        term: Term,
    },
    VoteGranted {
        uri: NodeId,
        candidate: NodeId,
        term: Term,
    },
    LeaderElected {
        uri: NodeId,
        term: Term,
    },
    CommitAdvanced {
        uri: NodeId,
        from: LogIndex,
        to: LogIndex,
    },
    ProblemRecorded {
        uri: NodeId,
        detail: String,
    },
}

/// Fan-out wrapper around a broadcast channel. Sends never fail; a
/// bus with no subscribers just drops events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HullEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        EventBus { tx }
    }

    pub fn publish(&self, event: HullEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HullEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
