use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message::NodeId;

/// Cluster-wide settings, identical on every node. All periods are in
/// milliseconds on the wire and in files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Full membership, including the local node.
    pub node_uris: Vec<NodeId>,
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period: u64,
    #[serde(default = "default_leader_lost_timeout")]
    pub leader_lost_timeout: u64,
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min: u64,
    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max: u64,
}

/// Per-node settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalConfig {
    pub uri: NodeId,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub local: LocalConfig,
}

fn default_heartbeat_period() -> u64 {
    50
}

fn default_leader_lost_timeout() -> u64 {
    250
}

fn default_election_timeout_min() -> u64 {
    300
}

fn default_election_timeout_max() -> u64 {
    600
}

impl ClusterConfig {
    pub fn new(node_uris: Vec<NodeId>) -> Self {
        ClusterConfig {
            node_uris,
            heartbeat_period: default_heartbeat_period(),
            leader_lost_timeout: default_leader_lost_timeout(),
            election_timeout_min: default_election_timeout_min(),
            election_timeout_max: default_election_timeout_max(),
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period)
    }

    pub fn leader_lost_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_lost_timeout)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max)
    }

    /// Enforce the timeout ladder: heartbeats at least twice as fast as
    /// leader-lost detection, and the election window strictly above it
    /// so a freshly started follower cannot pre-empt an election.
    pub fn validate(&self, local: &LocalConfig) -> Result<(), ConfigError> {
        if self.node_uris.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }
        if !self.node_uris.contains(&local.uri) {
            return Err(ConfigError::UriNotInCluster(local.uri.to_string()));
        }
        if self.heartbeat_period * 2 > self.leader_lost_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_period,
                leader_lost: self.leader_lost_timeout,
            });
        }
        if self.election_timeout_min <= self.leader_lost_timeout {
            return Err(ConfigError::ElectionWindowTooEarly {
                min: self.election_timeout_min,
                leader_lost: self.leader_lost_timeout,
            });
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::ElectionWindowInverted {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.cluster.validate(&config.local)?;
        Ok(config)
    }
}
