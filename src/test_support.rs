//! Deterministic in-process scaffolding for consensus tests: a
//! recording pilot with a tiny adder application, and a multi-hull
//! cluster that shuttles messages one at a time.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::config::{ClusterConfig, LocalConfig};
use crate::error::{CommandError, TransportError};
use crate::hull::Hull;
use crate::log::MemoryLog;
use crate::message::{Message, NodeId};
use crate::pilot::Pilot;

/// Pilot that parks outbound messages for the test to deliver and
/// applies `add N` commands to a running total.
pub struct AdderPilot {
    outbox: Mutex<Vec<(NodeId, Message)>>,
    total: Mutex<i64>,
}

impl AdderPilot {
    pub fn new() -> Self {
        AdderPilot {
            outbox: Mutex::new(Vec::new()),
            total: Mutex::new(0),
        }
    }

    pub async fn take_outbox(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut *self.outbox.lock().await)
    }

    pub async fn total(&self) -> i64 {
        *self.total.lock().await
    }
}

impl Default for AdderPilot {
    fn default() -> Self {
        AdderPilot::new()
    }
}

#[async_trait]
impl Pilot for AdderPilot {
    async fn send_message(&self, target: &NodeId, message: Message) -> Result<(), TransportError> {
        self.outbox.lock().await.push((target.clone(), message));
        Ok(())
    }

    async fn send_response(
        &self,
        target: &NodeId,
        _request: &Message,
        response: Message,
    ) -> Result<(), TransportError> {
        self.outbox.lock().await.push((target.clone(), response));
        Ok(())
    }

    async fn process_command(&self, command: Bytes) -> Result<Bytes, CommandError> {
        let text = std::str::from_utf8(&command)
            .map_err(|_| CommandError("command is not utf-8".to_string()))?;
        let value: i64 = text
            .strip_prefix("add ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CommandError(format!("unrecognized command: {text}")))?;
        let mut total = self.total.lock().await;
        *total += value;
        Ok(Bytes::from(total.to_string()))
    }
}

/// A cluster of hulls driven directly, with no runtime and no real
/// timers. Messages move only when the test says so, one at a time, so
/// every interleaving is reproducible. Nodes in `down` neither send
/// nor receive: their traffic is dropped at delivery time, so tests
/// should quiesce with `deliver_all_pending` before changing the
/// partition.
pub struct TestCluster {
    pub uris: Vec<NodeId>,
    hulls: BTreeMap<NodeId, Hull>,
    pilots: BTreeMap<NodeId, Arc<AdderPilot>>,
    down: HashSet<NodeId>,
}

impl TestCluster {
    pub async fn new(size: usize) -> Self {
        Self::from_logs((0..size).map(|_| MemoryLog::new()).collect()).await
    }

    /// Build a cluster whose nodes start from pre-seeded logs.
    pub async fn from_logs(logs: Vec<MemoryLog>) -> Self {
        let uris: Vec<NodeId> = (0..logs.len())
            .map(|i| NodeId::from(format!("mem://n{i}")))
            .collect();
        let cluster_config = ClusterConfig::new(uris.clone());

        let mut hulls = BTreeMap::new();
        let mut pilots = BTreeMap::new();
        for (uri, log) in uris.iter().zip(logs) {
            let pilot = Arc::new(AdderPilot::new());
            let local = LocalConfig {
                uri: uri.clone(),
                working_dir: None,
            };
            let mut hull = Hull::new(
                cluster_config.clone(),
                local,
                pilot.clone(),
                Box::new(log),
            )
            .expect("valid test config");
            hull.start().await.expect("fresh hull starts");
            hulls.insert(uri.clone(), hull);
            pilots.insert(uri.clone(), pilot);
        }
        TestCluster {
            uris,
            hulls,
            pilots,
            down: HashSet::new(),
        }
    }

    pub fn hull(&self, uri: &NodeId) -> &Hull {
        self.hulls.get(uri).expect("known node")
    }

    pub fn hull_mut(&mut self, uri: &NodeId) -> &mut Hull {
        self.hulls.get_mut(uri).expect("known node")
    }

    pub fn pilot(&self, uri: &NodeId) -> Arc<AdderPilot> {
        self.pilots.get(uri).expect("known node").clone()
    }

    pub fn set_down(&mut self, uri: &NodeId) {
        self.down.insert(uri.clone());
    }

    pub fn set_up(&mut self, uri: &NodeId) {
        self.down.remove(uri);
    }

    /// Shuttle messages between hulls until every outbox is empty.
    /// Traffic to or from a downed node is dropped.
    pub async fn deliver_all_pending(&mut self) {
        loop {
            let mut batch = Vec::new();
            for uri in self.uris.clone() {
                let outbox = self.pilots.get(&uri).expect("known node").take_outbox().await;
                for (target, message) in outbox {
                    if self.down.contains(&uri) || self.down.contains(&target) {
                        continue;
                    }
                    batch.push(message);
                }
            }
            if batch.is_empty() {
                return;
            }
            for message in batch {
                let target = message.receiver().clone();
                if let Some(hull) = self.hulls.get_mut(&target) {
                    hull.on_message(message).await;
                }
            }
        }
    }
}
