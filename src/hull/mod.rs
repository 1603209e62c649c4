use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, LocalConfig};
use crate::error::{CoreError, FatalError, HullError, LogStoreError};
use crate::events::{EventBus, HullEvent};
use crate::log::{LogIndex, LogRecord, LogStore, Term};
use crate::message::{Message, NodeId};
use crate::pilot::{CommandReply, CommandResult, Pilot};
use crate::states::{Candidate, Follower, Leader, RoleCode, Transition, VoteKeeper};

pub mod problems;

pub use problems::{MessageProblem, ProblemHistory};

/// Everything a role state needs from its node: configuration, the
/// transport/app boundary, the log, ballot memory, and the event bus.
/// Split out from the Hull so a state and its context can be borrowed
/// at the same time.
pub struct Chassis {
    cluster: ClusterConfig,
    local: LocalConfig,
    pub(crate) pilot: Arc<dyn Pilot>,
    pub(crate) log: Box<dyn LogStore>,
    pub(crate) votes: VoteKeeper,
    events: EventBus,
    problems: ProblemHistory,
}

impl Chassis {
    pub fn my_uri(&self) -> &NodeId {
        &self.local.uri
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.cluster.node_uris
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.cluster
            .node_uris
            .iter()
            .filter(|n| **n != self.local.uri)
            .cloned()
            .collect()
    }

    /// Smallest majority of the full membership.
    pub fn quorum(&self) -> usize {
        self.cluster.node_uris.len() / 2 + 1
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.cluster.heartbeat_period()
    }

    pub fn leader_lost_timeout(&self) -> Duration {
        self.cluster.leader_lost_timeout()
    }

    /// Fresh draw from the configured election window on every call.
    pub fn election_timeout(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let millis = rng
            .gen_range(self.cluster.election_timeout_min..=self.cluster.election_timeout_max);
        Duration::from_millis(millis)
    }

    /// Adopt `term` if it is ahead of ours, clearing any ballot cast in
    /// an earlier term.
    pub(crate) async fn observe_term(&mut self, term: Term) -> Result<bool, LogStoreError> {
        let current = self.log.get_term().await?;
        if term <= current {
            return Ok(false);
        }
        debug!(uri = %self.my_uri(), from = current, to = term, "adopting newer term");
        self.log.set_term(term).await?;
        self.votes.observe_term(term);
        Ok(true)
    }

    pub(crate) async fn advance_commit(&mut self, to: LogIndex) -> Result<(), LogStoreError> {
        let from = self.log.get_commit_index().await?;
        if to <= from {
            return Ok(());
        }
        self.log.commit(to).await?;
        debug!(uri = %self.my_uri(), from, to, "commit advanced");
        self.publish(HullEvent::CommitAdvanced {
            uri: self.my_uri().clone(),
            from,
            to,
        });
        Ok(())
    }

    /// Fire-and-forget send. Transport trouble is logged and swallowed;
    /// the protocol's timers take care of retrying.
    pub(crate) async fn send(&self, message: Message) {
        let target = message.receiver().clone();
        debug!(uri = %self.my_uri(), %target, code = %message.code(), "sending");
        if let Err(error) = self.pilot.send_message(&target, message).await {
            warn!(uri = %self.my_uri(), %target, %error, "send failed");
        }
    }

    pub(crate) async fn respond(&self, request: &Message, response: Message) {
        let target = response.receiver().clone();
        debug!(uri = %self.my_uri(), %target, code = %response.code(), "responding");
        if let Err(error) = self.pilot.send_response(&target, request, response).await {
            warn!(uri = %self.my_uri(), %target, %error, "response send failed");
        }
    }

    pub(crate) fn publish(&self, event: HullEvent) {
        self.events.publish(event);
    }

    pub(crate) fn record_problem(&mut self, message: Option<Message>, detail: String) {
        warn!(uri = %self.my_uri(), %detail, "message problem");
        self.problems.record(detail.clone(), message);
        self.events.publish(HullEvent::ProblemRecorded {
            uri: self.my_uri().clone(),
            detail,
        });
    }
}

/// One role state, exactly one active per hull.
enum Role {
    Paused,
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    fn code(&self) -> RoleCode {
        match self {
            Role::Paused => RoleCode::Paused,
            Role::Follower(_) => RoleCode::Follower,
            Role::Candidate(_) => RoleCode::Candidate,
            Role::Leader(_) => RoleCode::Leader,
        }
    }
}

/// The per-node consensus core. Owns the active role state, routes
/// inbound messages and timer ticks to it, and performs transitions.
/// Single-writer: the owning task is the only caller.
pub struct Hull {
    chassis: Chassis,
    role: Role,
}

impl Hull {
    pub fn new(
        cluster: ClusterConfig,
        local: LocalConfig,
        pilot: Arc<dyn Pilot>,
        log: Box<dyn LogStore>,
    ) -> Result<Self, HullError> {
        cluster.validate(&local)?;
        Ok(Hull {
            chassis: Chassis {
                cluster,
                local,
                pilot,
                log,
                votes: VoteKeeper::default(),
                events: EventBus::new(),
                problems: ProblemHistory::default(),
            },
            role: Role::Paused,
        })
    }

    /// Leave the paused state and begin life as a follower.
    pub async fn start(&mut self) -> Result<(), HullError> {
        if !matches!(self.role, Role::Paused) {
            return Err(HullError::AlreadyStarted);
        }
        info!(uri = %self.chassis.my_uri(), "hull starting");
        self.enter_follower().await;
        Ok(())
    }

    /// Route one inbound message to the active state, applying any
    /// transition it asks for. Handler failures never reach the caller;
    /// they land in the problem history.
    pub async fn on_message(&mut self, message: Message) {
        if message.receiver() != self.chassis.my_uri() {
            self.chassis.record_problem(
                Some(message.clone()),
                format!("message addressed to {}", message.receiver()),
            );
            return;
        }
        self.chassis.publish(HullEvent::MessageDispatched {
            uri: self.chassis.my_uri().clone(),
            code: message.code(),
            sender: message.sender().clone(),
        });

        let mut pending = Some(message);
        let mut hops = 0;
        while let Some(message) = pending.take() {
            hops += 1;
            if hops > 3 {
                self.chassis
                    .record_problem(Some(message), "message redispatch loop".to_string());
                return;
            }
            let snapshot = message.clone();
            let outcome = match &mut self.role {
                Role::Paused => {
                    self.chassis.record_problem(
                        Some(message),
                        "message received while paused".to_string(),
                    );
                    return;
                }
                Role::Follower(state) => state.on_message(&mut self.chassis, message).await,
                Role::Candidate(state) => state.on_message(&mut self.chassis, message).await,
                Role::Leader(state) => state.on_message(&mut self.chassis, message).await,
            };
            match outcome {
                Ok(transition) => pending = self.apply(transition).await,
                Err(CoreError::Fatal(fatal)) => self.halt(fatal).await,
                Err(error) => self
                    .chassis
                    .record_problem(Some(snapshot), error.to_string()),
            }
        }
    }

    /// Check the active state's timer against `now`, firing it when
    /// expired. The node runtime calls this from its sleep loop.
    pub async fn on_tick(&mut self, now: Instant) {
        let outcome = match &mut self.role {
            Role::Paused => return,
            Role::Follower(state) => state.on_timeout(&mut self.chassis, now).await,
            Role::Candidate(state) => state.on_timeout(&mut self.chassis, now).await,
            Role::Leader(state) => state.on_timeout(&mut self.chassis, now).await,
        };
        match outcome {
            Ok(transition) => {
                if self.apply(transition).await.is_some() {
                    // Timers never carry a message to reprocess.
                    self.chassis
                        .record_problem(None, "timer produced a redispatch".to_string());
                }
            }
            Err(CoreError::Fatal(fatal)) => self.halt(fatal).await,
            Err(error) => self.chassis.record_problem(None, error.to_string()),
        }
    }

    /// Submit a client command. Leaders run it through the application
    /// and answer after commit; everyone else answers immediately with
    /// a leader hint.
    pub async fn on_client_command(&mut self, command: Bytes, reply: CommandReply) {
        let term = self.chassis.log.get_term().await.unwrap_or(0);
        let outcome = match &mut self.role {
            Role::Leader(leader) => {
                leader
                    .append_client_command(&mut self.chassis, command, reply)
                    .await
            }
            Role::Follower(follower) => {
                let _ = reply.send(CommandResult {
                    index: None,
                    term,
                    outcome: Err(crate::error::CommandError("not the leader".to_string())),
                    leader_hint: follower.leader_uri().cloned(),
                });
                Ok(())
            }
            Role::Candidate(_) | Role::Paused => {
                let _ = reply.send(CommandResult {
                    index: None,
                    term,
                    outcome: Err(crate::error::CommandError("not the leader".to_string())),
                    leader_hint: None,
                });
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {}
            Err(CoreError::Fatal(fatal)) => self.halt(fatal).await,
            Err(error) => self.chassis.record_problem(None, error.to_string()),
        }
    }

    /// Stop the current state and run for leadership.
    pub async fn start_campaign(&mut self) {
        let from = self.stop_current();
        let mut candidate = Candidate::new();
        match candidate.start(&mut self.chassis).await {
            Ok(()) => {
                let won = candidate.has_majority(self.chassis.quorum());
                let term = candidate.term();
                self.role = Role::Candidate(candidate);
                self.announce(from, RoleCode::Candidate).await;
                if won {
                    self.win_vote(term).await;
                }
            }
            Err(error) => {
                self.chassis
                    .record_problem(None, format!("campaign failed to start: {error}"));
                self.enter_follower().await;
            }
        }
    }

    /// The election in `term` was won; take office.
    pub async fn win_vote(&mut self, term: Term) {
        let from = self.stop_current();
        info!(uri = %self.chassis.my_uri(), term, "promoting to leader");
        let mut leader = Leader::new(term);
        match leader.start(&mut self.chassis).await {
            Ok(()) => {
                self.role = Role::Leader(leader);
                self.announce(from, RoleCode::Leader).await;
            }
            Err(CoreError::Fatal(fatal)) => self.halt(fatal).await,
            Err(error) => {
                self.chassis
                    .record_problem(None, format!("leader failed to start: {error}"));
                self.enter_follower().await;
            }
        }
    }

    /// Step down to follower; when a message is supplied the fresh
    /// follower reprocesses it.
    pub async fn demote_and_handle(&mut self, message: Option<Message>) {
        info!(uri = %self.chassis.my_uri(), from = %self.role.code(), "demoting to follower");
        self.enter_follower().await;
        if let Some(message) = message {
            self.on_message(message).await;
        }
    }

    async fn apply(&mut self, transition: Transition) -> Option<Message> {
        match transition {
            Transition::Stay => None,
            Transition::Campaign => {
                self.start_campaign().await;
                None
            }
            Transition::Win { term } => {
                self.win_vote(term).await;
                None
            }
            Transition::Demote { redispatch } => {
                info!(uri = %self.chassis.my_uri(), from = %self.role.code(), "demoting to follower");
                self.enter_follower().await;
                redispatch
            }
        }
    }

    async fn enter_follower(&mut self) {
        let from = self.stop_current();
        let mut follower = Follower::new();
        follower.start(&self.chassis);
        self.role = Role::Follower(follower);
        self.announce(from, RoleCode::Follower).await;
    }

    fn stop_current(&mut self) -> RoleCode {
        let code = self.role.code();
        match &mut self.role {
            Role::Paused => {}
            Role::Follower(state) => state.stop(),
            Role::Candidate(state) => state.stop(),
            Role::Leader(state) => state.stop(),
        }
        self.role = Role::Paused;
        code
    }

    async fn announce(&self, from: RoleCode, to: RoleCode) {
        let term = self.chassis.log.get_term().await.unwrap_or(0);
        self.chassis.publish(HullEvent::RoleChanged {
            uri: self.chassis.my_uri().clone(),
            from,
            to,
            term,
        });
    }

    async fn halt(&mut self, fatal: FatalError) {
        error!(uri = %self.chassis.my_uri(), %fatal, "invariant violation, halting");
        let from = self.stop_current();
        self.chassis.record_problem(None, fatal.to_string());
        self.announce(from, RoleCode::Paused).await;
    }

    // Introspection, used by hosts and tests.

    pub fn my_uri(&self) -> &NodeId {
        self.chassis.my_uri()
    }

    pub fn cluster_node_ids(&self) -> &[NodeId] {
        self.chassis.node_ids()
    }

    pub fn role_code(&self) -> RoleCode {
        self.role.code()
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.chassis.heartbeat_period()
    }

    pub fn leader_lost_timeout(&self) -> Duration {
        self.chassis.leader_lost_timeout()
    }

    pub fn election_timeout(&self) -> Duration {
        self.chassis.election_timeout()
    }

    /// Leader the local follower currently recognizes.
    pub fn leader_uri(&self) -> Option<&NodeId> {
        match &self.role {
            Role::Follower(follower) => follower.leader_uri(),
            Role::Leader(_) => Some(self.chassis.my_uri()),
            _ => None,
        }
    }

    pub async fn current_term(&self) -> Result<Term, LogStoreError> {
        self.chassis.log.get_term().await
    }

    pub async fn last_index(&self) -> Result<LogIndex, LogStoreError> {
        self.chassis.log.get_last_index().await
    }

    pub async fn commit_index(&self) -> Result<LogIndex, LogStoreError> {
        self.chassis.log.get_commit_index().await
    }

    pub async fn read_record(&self, index: LogIndex) -> Result<Option<LogRecord>, LogStoreError> {
        self.chassis.log.read(index).await
    }

    /// Earliest armed timer deadline of the active state, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.role {
            Role::Paused => None,
            Role::Follower(state) => state.next_deadline(),
            Role::Candidate(state) => state.next_deadline(),
            Role::Leader(state) => state.next_deadline(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HullEvent> {
        self.chassis.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> EventBus {
        self.chassis.events.clone()
    }

    pub fn problem_history(&self) -> &ProblemHistory {
        &self.chassis.problems
    }

    #[cfg(test)]
    pub(crate) fn leader_cursor(
        &self,
        peer: &NodeId,
    ) -> Option<crate::states::leader::FollowerCursor> {
        match &self.role {
            Role::Leader(leader) => leader.cursor(peer).cloned(),
            _ => None,
        }
    }
}
