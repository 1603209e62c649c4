use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CommandError, CoreError, ProtocolError};
use crate::events::HullEvent;
use crate::hull::Chassis;
use crate::log::{LogIndex, LogRecord, Term};
use crate::message::{
    AppendEntries, AppendResponse, Message, NodeId, RequestVote, RequestVoteResponse,
};
use crate::pilot::{CommandReply, CommandResult};
use crate::states::{StateTimer, Transition};

/// Ceiling on entries shipped in one AppendEntries.
const MAX_BATCH: usize = 10;

/// Replication bookkeeping for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerCursor {
    /// Lowest index not yet sent to this peer.
    pub next_index: LogIndex,
    /// Highest index known stored on this peer. Monotonic within a
    /// leader's term.
    pub match_index: LogIndex,
    /// Log end the peer reported on its latest reply.
    pub last_heartbeat_index: LogIndex,
}

impl FollowerCursor {
    fn new(next_index: LogIndex) -> Self {
        FollowerCursor {
            next_index,
            match_index: 0,
            last_heartbeat_index: 0,
        }
    }
}

/// Term owner: replicates entries, drives the commit index forward,
/// and answers clients once their records are committed.
#[derive(Debug)]
pub struct Leader {
    term: Term,
    cursors: HashMap<NodeId, FollowerCursor>,
    pending_replies: BTreeMap<LogIndex, CommandReply>,
    heartbeat_timer: StateTimer,
    terminated: bool,
}

impl Leader {
    pub fn new(term: Term) -> Self {
        Leader {
            term,
            cursors: HashMap::new(),
            pending_replies: BTreeMap::new(),
            heartbeat_timer: StateTimer::new("heartbeat"),
            terminated: false,
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn cursor(&self, peer: &NodeId) -> Option<&FollowerCursor> {
        self.cursors.get(peer)
    }

    /// Take office: set up cursors, stake out the term with a NO_OP
    /// record, push it to everyone, and start the heartbeat clock.
    pub async fn start(&mut self, chassis: &mut Chassis) -> Result<(), CoreError> {
        let last_index = chassis.log.get_last_index().await?;
        for peer in chassis.peer_ids() {
            self.cursors.insert(peer, FollowerCursor::new(last_index + 1));
        }

        let no_op = LogRecord::no_op(last_index + 1, self.term);
        chassis.log.append(std::slice::from_ref(&no_op)).await?;

        info!(
            uri = %chassis.my_uri(),
            term = self.term,
            no_op_index = no_op.index,
            "taking office"
        );
        chassis.publish(HullEvent::LeaderElected {
            uri: chassis.my_uri().clone(),
            term: self.term,
        });

        // A cluster of one reaches majority by itself.
        self.maybe_advance_commit(chassis).await?;

        for peer in self.peer_list() {
            self.send_update(chassis, &peer).await?;
        }
        self.heartbeat_timer.arm(chassis.heartbeat_period());
        Ok(())
    }

    pub fn stop(&mut self) {
        self.terminated = true;
        self.heartbeat_timer.terminate();
        // Clients still waiting will see the channel close and retry
        // against the next leader.
        self.pending_replies.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heartbeat_timer.deadline()
    }

    pub async fn on_timeout(
        &mut self,
        chassis: &mut Chassis,
        now: Instant,
    ) -> Result<Transition, CoreError> {
        if self.terminated || !self.heartbeat_timer.expired(now) {
            return Ok(Transition::Stay);
        }
        for peer in self.peer_list() {
            self.send_update(chassis, &peer).await?;
        }
        self.heartbeat_timer.arm(chassis.heartbeat_period());
        Ok(Transition::Stay)
    }

    pub async fn on_message(
        &mut self,
        chassis: &mut Chassis,
        message: Message,
    ) -> Result<Transition, CoreError> {
        match &message {
            Message::AppendResponse(response) => self.on_append_response(chassis, response).await,
            Message::RequestVote(request) => {
                self.on_request_vote(chassis, &message, request).await
            }
            Message::AppendEntries(append) => {
                self.on_append_entries(chassis, &message, append).await
            }
            Message::RequestVoteResponse(response) => {
                if response.term == self.term {
                    // Stragglers from the campaign we already won.
                    debug!(uri = %chassis.my_uri(), from = %response.sender, "leftover ballot");
                } else {
                    let error = ProtocolError::Stale {
                        code: message.code().as_str(),
                        term: response.term,
                        current: self.term,
                    };
                    chassis.record_problem(Some(message.clone()), error.to_string());
                }
                Ok(Transition::Stay)
            }
        }
    }

    /// Run a client command through the application, append the result,
    /// and start replicating. The reply fires once the record commits.
    pub async fn append_client_command(
        &mut self,
        chassis: &mut Chassis,
        command: Bytes,
        reply: CommandReply,
    ) -> Result<(), CoreError> {
        match chassis.pilot.process_command(command).await {
            Err(error) => {
                warn!(uri = %chassis.my_uri(), %error, "client command failed");
                let _ = reply.send(CommandResult {
                    index: None,
                    term: self.term,
                    outcome: Err(error),
                    leader_hint: None,
                });
                Ok(())
            }
            Ok(result) => {
                let index = chassis.log.get_last_index().await? + 1;
                let record = LogRecord::client(index, self.term, result);
                if let Err(error) = chassis.log.append(std::slice::from_ref(&record)).await {
                    let _ = reply.send(CommandResult {
                        index: None,
                        term: self.term,
                        outcome: Err(CommandError(format!("log append failed: {error}"))),
                        leader_hint: None,
                    });
                    return Err(error.into());
                }
                self.pending_replies.insert(index, reply);

                for peer in self.peer_list() {
                    let lagging = self
                        .cursors
                        .get(&peer)
                        .map(|c| c.next_index <= index)
                        .unwrap_or(false);
                    if lagging {
                        self.send_update(chassis, &peer).await?;
                    }
                }
                // With no peers the record is already majority-held.
                self.maybe_advance_commit(chassis).await?;
                Ok(())
            }
        }
    }

    async fn on_append_response(
        &mut self,
        chassis: &mut Chassis,
        response: &AppendResponse,
    ) -> Result<Transition, CoreError> {
        if response.term > self.term {
            chassis.observe_term(response.term).await?;
            info!(
                uri = %chassis.my_uri(),
                from = %response.sender,
                term = response.term,
                "follower is ahead of us, resigning"
            );
            return Ok(Transition::Demote { redispatch: None });
        }
        if response.term < self.term {
            debug!(
                uri = %chassis.my_uri(),
                from = %response.sender,
                term = response.term,
                "ignoring response from an earlier term"
            );
            return Ok(Transition::Stay);
        }
        let cursor = match self.cursors.get_mut(&response.sender) {
            Some(cursor) => cursor,
            None => {
                chassis.record_problem(
                    None,
                    format!("append response from outsider {}", response.sender),
                );
                return Ok(Transition::Stay);
            }
        };

        if !response.success {
            // Walk back one step, or jump straight to the end of the
            // follower's log when its hint is shorter still.
            let stepped = cursor.next_index.saturating_sub(1).max(1);
            let hinted = response.last_index + 1;
            cursor.next_index = stepped.min(hinted).max(1);
            cursor.last_heartbeat_index = response.last_index;
            debug!(
                uri = %chassis.my_uri(),
                peer = %response.sender,
                next_index = cursor.next_index,
                "backing down"
            );
            self.send_update(chassis, &response.sender).await?;
            return Ok(Transition::Stay);
        }

        if let Some(acked) = response.last_entry_index {
            if acked > cursor.match_index {
                cursor.match_index = acked;
            }
            cursor.next_index = cursor.match_index + 1;
        }
        cursor.last_heartbeat_index = response.last_index;

        self.maybe_advance_commit(chassis).await?;

        let last_index = chassis.log.get_last_index().await?;
        let needs_more = self
            .cursors
            .get(&response.sender)
            .map(|c| c.next_index <= last_index)
            .unwrap_or(false);
        if needs_more {
            self.send_update(chassis, &response.sender).await?;
        }
        Ok(Transition::Stay)
    }

    async fn on_request_vote(
        &mut self,
        chassis: &mut Chassis,
        raw: &Message,
        request: &RequestVote,
    ) -> Result<Transition, CoreError> {
        if request.term > self.term {
            chassis.observe_term(request.term).await?;
            info!(
                uri = %chassis.my_uri(),
                candidate = %request.sender,
                term = request.term,
                "candidate is ahead of us, resigning"
            );
            return Ok(Transition::Demote {
                redispatch: Some(raw.clone()),
            });
        }
        // Tell the stale candidate what term it is.
        chassis
            .respond(
                raw,
                Message::RequestVoteResponse(RequestVoteResponse {
                    sender: chassis.my_uri().clone(),
                    receiver: request.sender.clone(),
                    term: self.term,
                    vote: false,
                }),
            )
            .await;
        Ok(Transition::Stay)
    }

    async fn on_append_entries(
        &mut self,
        chassis: &mut Chassis,
        raw: &Message,
        append: &AppendEntries,
    ) -> Result<Transition, CoreError> {
        if append.term > self.term {
            chassis.observe_term(append.term).await?;
            info!(
                uri = %chassis.my_uri(),
                rival = %append.sender,
                term = append.term,
                "newer leader exists, resigning"
            );
            return Ok(Transition::Demote {
                redispatch: Some(raw.clone()),
            });
        }
        if append.term == self.term {
            // Two leaders in one term would break election safety.
            chassis.record_problem(
                Some(raw.clone()),
                format!("rival leader {} in our own term {}", append.sender, self.term),
            );
        }
        let last_index = chassis.log.get_last_index().await?;
        chassis
            .respond(
                raw,
                Message::AppendResponse(AppendResponse {
                    sender: chassis.my_uri().clone(),
                    receiver: append.sender.clone(),
                    term: self.term,
                    success: false,
                    last_entry_index: None,
                    last_index,
                }),
            )
            .await;
        Ok(Transition::Stay)
    }

    fn peer_list(&self) -> Vec<NodeId> {
        self.cursors.keys().cloned().collect()
    }

    /// Ship the peer whatever it is owed: a bounded batch when it lags,
    /// a bare heartbeat when it is current.
    async fn send_update(&self, chassis: &mut Chassis, peer: &NodeId) -> Result<(), CoreError> {
        let cursor = match self.cursors.get(peer) {
            Some(cursor) => cursor.clone(),
            None => return Ok(()),
        };
        let last_index = chassis.log.get_last_index().await?;
        let leader_commit = chassis.log.get_commit_index().await?;

        let mut entries = Vec::new();
        let prev_log_index;
        if cursor.next_index > last_index {
            prev_log_index = last_index;
        } else {
            prev_log_index = cursor.next_index - 1;
            let end = last_index.min(cursor.next_index + MAX_BATCH as u64 - 1);
            for index in cursor.next_index..=end {
                match chassis.log.read(index).await? {
                    Some(record) => entries.push(record),
                    None => {
                        return Err(crate::error::FatalError(format!(
                            "log hole at index {index} below last index {last_index}"
                        ))
                        .into())
                    }
                }
            }
        }
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match chassis.log.read(prev_log_index).await? {
                Some(record) => record.term,
                None => 0,
            }
        };

        chassis
            .send(Message::AppendEntries(AppendEntries {
                sender: chassis.my_uri().clone(),
                receiver: peer.clone(),
                term: self.term,
                prev_log_index,
                prev_log_term,
                leader_commit,
                entries,
            }))
            .await;
        Ok(())
    }

    /// Raft commitment rule: the largest index backed by a majority
    /// (counting ourselves) whose record is from our own term becomes
    /// the new commit index. Client replies fire in index order.
    async fn maybe_advance_commit(&mut self, chassis: &mut Chassis) -> Result<(), CoreError> {
        let last_index = chassis.log.get_last_index().await?;
        let commit_index = chassis.log.get_commit_index().await?;
        let quorum = chassis.quorum();

        let mut candidate = last_index;
        while candidate > commit_index {
            let backing =
                1 + self
                    .cursors
                    .values()
                    .filter(|c| c.match_index >= candidate)
                    .count();
            if backing >= quorum {
                let record = chassis
                    .log
                    .read(candidate)
                    .await?
                    .ok_or_else(|| crate::error::LogStoreError::Missing(candidate))?;
                if record.term == self.term {
                    chassis.advance_commit(candidate).await?;
                    self.fire_replies(chassis, candidate).await?;
                    return Ok(());
                }
            }
            candidate -= 1;
        }
        Ok(())
    }

    async fn fire_replies(
        &mut self,
        chassis: &mut Chassis,
        up_to: LogIndex,
    ) -> Result<(), CoreError> {
        let ready: Vec<LogIndex> = self
            .pending_replies
            .range(..=up_to)
            .map(|(index, _)| *index)
            .collect();
        for index in ready {
            let reply = match self.pending_replies.remove(&index) {
                Some(reply) => reply,
                None => continue,
            };
            let record = chassis
                .log
                .read(index)
                .await?
                .ok_or(crate::error::LogStoreError::Missing(index))?;
            debug!(uri = %chassis.my_uri(), index, "answering client");
            let _ = reply.send(CommandResult {
                index: Some(index),
                term: record.term,
                outcome: Ok(record.user_data),
                leader_hint: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogStore, MemoryLog, RecordCode};
    use crate::states::RoleCode;
    use crate::test_support::TestCluster;
    use tokio::sync::oneshot;

    async fn elect(cluster: &mut TestCluster, uri: &NodeId) {
        cluster.hull_mut(uri).start_campaign().await;
        cluster.deliver_all_pending().await;
        assert_eq!(cluster.hull(uri).role_code(), RoleCode::Leader);
    }

    #[tokio::test]
    async fn taking_office_opens_the_term_with_a_no_op() {
        let mut cluster = TestCluster::new(3).await;
        let (a, b, c) = (
            cluster.uris[0].clone(),
            cluster.uris[1].clone(),
            cluster.uris[2].clone(),
        );

        elect(&mut cluster, &a).await;

        let no_op = cluster.hull(&a).read_record(1).await.unwrap().unwrap();
        assert_eq!(no_op.code, RecordCode::NoOp);
        assert_eq!(no_op.term, 1);

        for peer in [&b, &c] {
            let cursor = cluster.hull_mut(&a).leader_cursor(peer).unwrap();
            assert_eq!(cursor.match_index, 1);
            assert_eq!(cursor.next_index, 2);
        }
    }

    #[tokio::test]
    async fn replication_batches_stay_bounded() {
        let mut cluster = TestCluster::new(3).await;
        let a = cluster.uris[0].clone();
        elect(&mut cluster, &a).await;

        // Pile up commands while no acks come back.
        for n in 0..15 {
            let (tx, _rx) = oneshot::channel();
            cluster
                .hull_mut(&a)
                .on_client_command(Bytes::from(format!("add {n}")), tx)
                .await;
        }

        let outbox = cluster.pilot(&a).take_outbox().await;
        assert!(!outbox.is_empty());
        for (_, message) in outbox {
            match message {
                Message::AppendEntries(append) => {
                    assert!(append.entries.len() <= MAX_BATCH);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        cluster.deliver_all_pending().await;
    }

    #[tokio::test]
    async fn failure_hint_jumps_the_cursor_back() {
        let mut cluster = TestCluster::new(3).await;
        let (a, b) = (cluster.uris[0].clone(), cluster.uris[1].clone());
        elect(&mut cluster, &a).await;

        cluster
            .hull_mut(&a)
            .on_message(Message::AppendResponse(AppendResponse {
                sender: b.clone(),
                receiver: a.clone(),
                term: 1,
                success: false,
                last_entry_index: None,
                last_index: 0,
            }))
            .await;

        let cursor = cluster.hull_mut(&a).leader_cursor(&b).unwrap();
        assert_eq!(cursor.next_index, 1);

        let outbox = cluster.pilot(&a).take_outbox().await;
        match &outbox[..] {
            [(target, Message::AppendEntries(resend))] => {
                assert_eq!(target, &b);
                assert_eq!(resend.prev_log_index, 0);
                assert_eq!(resend.entries.len(), 1);
            }
            other => panic!("expected an immediate resend, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prior_term_records_commit_only_behind_a_current_term_one() {
        // Everyone holds record 1 from term 1; only the future leader
        // also holds record 2.
        let mut seeded = Vec::new();
        for n in 0..3 {
            let mut log = MemoryLog::new();
            log.set_term(1).await.unwrap();
            let mut records = vec![LogRecord::client(1, 1, Bytes::from("one"))];
            if n == 0 {
                records.push(LogRecord::client(2, 1, Bytes::from("two")));
            }
            log.append(&records).await.unwrap();
            seeded.push(log);
        }
        let mut cluster = TestCluster::from_logs(seeded).await;
        let a = cluster.uris[0].clone();

        elect(&mut cluster, &a).await;

        // The term-1 record became committed, but only by riding behind
        // the term-2 NO_OP.
        assert_eq!(cluster.hull(&a).current_term().await.unwrap(), 2);
        assert_eq!(cluster.hull(&a).commit_index().await.unwrap(), 3);
        let carried = cluster.hull(&a).read_record(2).await.unwrap().unwrap();
        assert!(carried.committed);
        assert_eq!(carried.term, 1);
    }

    #[tokio::test]
    async fn higher_term_response_forces_resignation() {
        let mut cluster = TestCluster::new(3).await;
        let (a, b) = (cluster.uris[0].clone(), cluster.uris[1].clone());
        elect(&mut cluster, &a).await;

        cluster
            .hull_mut(&a)
            .on_message(Message::AppendResponse(AppendResponse {
                sender: b.clone(),
                receiver: a.clone(),
                term: 9,
                success: false,
                last_entry_index: None,
                last_index: 0,
            }))
            .await;

        assert_eq!(cluster.hull(&a).role_code(), RoleCode::Follower);
        assert_eq!(cluster.hull(&a).current_term().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn stale_candidate_is_told_the_current_term() {
        let mut cluster = TestCluster::new(3).await;
        let (a, c) = (cluster.uris[0].clone(), cluster.uris[2].clone());
        elect(&mut cluster, &a).await;

        cluster
            .hull_mut(&a)
            .on_message(Message::RequestVote(RequestVote {
                sender: c.clone(),
                receiver: a.clone(),
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            }))
            .await;

        let outbox = cluster.pilot(&a).take_outbox().await;
        match &outbox[..] {
            [(target, Message::RequestVoteResponse(response))] => {
                assert_eq!(target, &c);
                assert!(!response.vote);
                assert_eq!(response.term, 1);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(cluster.hull(&a).role_code(), RoleCode::Leader);
    }

    #[tokio::test]
    async fn rival_leader_in_our_term_is_a_problem() {
        let mut cluster = TestCluster::new(3).await;
        let (a, b) = (cluster.uris[0].clone(), cluster.uris[1].clone());
        elect(&mut cluster, &a).await;

        cluster
            .hull_mut(&a)
            .on_message(Message::AppendEntries(AppendEntries {
                sender: b.clone(),
                receiver: a.clone(),
                term: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
                entries: vec![],
            }))
            .await;

        assert_eq!(cluster.hull(&a).role_code(), RoleCode::Leader);
        assert_eq!(cluster.hull(&a).problem_history().len(), 1);
        let outbox = cluster.pilot(&a).take_outbox().await;
        match &outbox[..] {
            [(_, Message::AppendResponse(response))] => assert!(!response.success),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
