use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ClusterConfig, LocalConfig};
use crate::error::{CommandError, HullError};
use crate::events::HullEvent;
use crate::hull::Hull;
use crate::log::LogStore;
use crate::message::{Message, NodeId};
use crate::pilot::{CommandResult, Pilot};

enum NodeControl {
    Deliver(Message),
    Command {
        data: Bytes,
        reply: oneshot::Sender<CommandResult>,
    },
    Stop,
}

/// Runs one hull on its own tokio task. The mailbox serializes message
/// delivery, client commands and timer firings, so the hull never sees
/// two callers at once.
pub struct RaftNode {
    handle: NodeHandle,
    task: JoinHandle<()>,
}

impl RaftNode {
    /// Validate, start the hull as a follower, and spawn its driver
    /// task.
    pub async fn spawn(
        cluster: ClusterConfig,
        local: LocalConfig,
        pilot: Arc<dyn Pilot>,
        log: Box<dyn LogStore>,
    ) -> Result<RaftNode, HullError> {
        let uri = local.uri.clone();
        let mut hull = Hull::new(cluster, local, pilot, log)?;
        hull.start().await?;
        let events = hull.event_bus();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task_uri = uri.clone();
        let task = tokio::spawn(async move {
            loop {
                let deadline = hull.next_deadline();
                tokio::select! {
                    control = rx.recv() => match control {
                        Some(NodeControl::Deliver(message)) => hull.on_message(message).await,
                        Some(NodeControl::Command { data, reply }) => {
                            hull.on_client_command(data, reply).await
                        }
                        Some(NodeControl::Stop) | None => {
                            info!(uri = %task_uri, "node stopping");
                            break;
                        }
                    },
                    _ = sleep_until_or_forever(deadline) => {
                        hull.on_tick(Instant::now()).await;
                    }
                }
            }
        });

        Ok(RaftNode {
            handle: NodeHandle { uri, tx, events },
            task,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn uri(&self) -> &NodeId {
        &self.handle.uri
    }

    /// Ask the driver task to wind down and wait for it.
    pub async fn shutdown(self) {
        let _ = self.handle.tx.send(NodeControl::Stop);
        let _ = self.task.await;
    }
}

/// Cheap cloneable front door to a running node.
pub struct NodeHandle {
    uri: NodeId,
    tx: mpsc::UnboundedSender<NodeControl>,
    events: crate::events::EventBus,
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        NodeHandle {
            uri: self.uri.clone(),
            tx: self.tx.clone(),
            events: self.events.clone(),
        }
    }
}

impl NodeHandle {
    pub fn uri(&self) -> &NodeId {
        &self.uri
    }

    /// Hand an inbound message to the node. Returns false when the node
    /// has stopped.
    pub fn deliver(&self, message: Message) -> bool {
        self.tx.send(NodeControl::Deliver(message)).is_ok()
    }

    /// Submit a client command and wait for its result. Leaders answer
    /// after commit; other roles answer right away with a leader hint.
    pub async fn submit_command(&self, data: Bytes) -> Result<CommandResult, CommandError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(NodeControl::Command { data, reply })
            .map_err(|_| CommandError("node stopped".to_string()))?;
        response
            .await
            .map_err(|_| CommandError("node stopped before replying".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HullEvent> {
        self.events.subscribe()
    }

    pub fn stop(&self) {
        debug!(uri = %self.uri, "stop requested");
        let _ = self.tx.send(NodeControl::Stop);
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::states::RoleCode;
    use crate::test_support::AdderPilot;
    use std::time::Duration;

    fn single_node_configs() -> (ClusterConfig, LocalConfig) {
        let uri = NodeId::from("mem://solo");
        let cluster = ClusterConfig::new(vec![uri.clone()]);
        let local = LocalConfig {
            uri,
            working_dir: None,
        };
        (cluster, local)
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_elects_itself_and_serves_commands() {
        let (cluster, local) = single_node_configs();
        let pilot = Arc::new(AdderPilot::new());
        let node = RaftNode::spawn(cluster, local, pilot, Box::new(MemoryLog::new()))
            .await
            .unwrap();
        let handle = node.handle();
        let mut events = handle.subscribe();

        // Leader-lost fires, the campaign starts, and a majority of one
        // is immediate.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut saw_leader = false;
        while let Ok(event) = events.try_recv() {
            if let HullEvent::RoleChanged {
                to: RoleCode::Leader,
                ..
            } = event
            {
                saw_leader = true;
            }
        }
        assert!(saw_leader, "expected the lone node to take office");

        let first = handle
            .submit_command(Bytes::from_static(b"add 1"))
            .await
            .unwrap();
        assert_eq!(first.outcome.unwrap(), Bytes::from("1"));

        let second = handle
            .submit_command(Bytes::from_static(b"add 2"))
            .await
            .unwrap();
        assert_eq!(second.outcome.unwrap(), Bytes::from("3"));
        assert!(second.index.unwrap() > first.index.unwrap());

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_after_stop_report_the_closed_node() {
        let (cluster, local) = single_node_configs();
        let pilot = Arc::new(AdderPilot::new());
        let node = RaftNode::spawn(cluster, local, pilot, Box::new(MemoryLog::new()))
            .await
            .unwrap();
        let handle = node.handle();
        node.shutdown().await;

        let err = handle
            .submit_command(Bytes::from_static(b"add 1"))
            .await
            .unwrap_err();
        assert!(err.0.contains("stopped"));
    }
}
