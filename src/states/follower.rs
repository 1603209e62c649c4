use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, FatalError, ProtocolError};
use crate::events::HullEvent;
use crate::hull::Chassis;
use crate::message::{
    AppendEntries, AppendResponse, Message, NodeId, RequestVote, RequestVoteResponse,
};
use crate::states::{StateTimer, Transition};

/// Passive cluster member. Accepts replication from the current leader,
/// grants votes, and campaigns when the leader goes quiet.
#[derive(Debug)]
pub struct Follower {
    leader_uri: Option<NodeId>,
    leader_lost_timer: StateTimer,
    terminated: bool,
}

impl Follower {
    pub fn new() -> Self {
        Follower {
            leader_uri: None,
            leader_lost_timer: StateTimer::new("leader-lost"),
            terminated: false,
        }
    }

    pub fn leader_uri(&self) -> Option<&NodeId> {
        self.leader_uri.as_ref()
    }

    pub fn start(&mut self, chassis: &Chassis) {
        self.leader_lost_timer.arm(chassis.leader_lost_timeout());
        debug!(uri = %chassis.my_uri(), "follower started");
    }

    pub fn stop(&mut self) {
        self.terminated = true;
        self.leader_lost_timer.terminate();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.leader_lost_timer.deadline()
    }

    pub async fn on_timeout(
        &mut self,
        chassis: &mut Chassis,
        now: Instant,
    ) -> Result<Transition, CoreError> {
        if self.terminated || !self.leader_lost_timer.expired(now) {
            return Ok(Transition::Stay);
        }
        info!(
            uri = %chassis.my_uri(),
            leader = ?self.leader_uri,
            "no word from a leader, starting campaign"
        );
        Ok(Transition::Campaign)
    }

    pub async fn on_message(
        &mut self,
        chassis: &mut Chassis,
        message: Message,
    ) -> Result<Transition, CoreError> {
        match &message {
            Message::AppendEntries(append) => self.on_append_entries(chassis, append).await,
            Message::RequestVote(request) => self.on_request_vote(chassis, &message, request).await,
            Message::RequestVoteResponse(_) | Message::AppendResponse(_) => {
                // Stale answers to a campaign or a reign that already
                // ended; remember them for diagnosis and move on.
                let error = ProtocolError::Unexpected {
                    code: message.code().as_str(),
                    role: "follower",
                };
                chassis.record_problem(Some(message.clone()), error.to_string());
                Ok(Transition::Stay)
            }
        }
    }

    async fn on_append_entries(
        &mut self,
        chassis: &mut Chassis,
        append: &AppendEntries,
    ) -> Result<Transition, CoreError> {
        let current = chassis.log.get_term().await?;
        let last_index = chassis.log.get_last_index().await?;

        if append.term < current {
            debug!(
                uri = %chassis.my_uri(),
                sender = %append.sender,
                term = append.term,
                current,
                "rejecting append from a stale term"
            );
            self.reply_append(chassis, append, current, false, None, last_index)
                .await;
            return Ok(Transition::Stay);
        }
        if append.term > current {
            chassis.observe_term(append.term).await?;
        }

        self.leader_lost_timer.arm(chassis.leader_lost_timeout());
        self.leader_uri = Some(append.sender.clone());

        let term = chassis.log.get_term().await?;

        // Log-match check: the record before the incoming batch must
        // exist here with the leader's term for the batch to connect.
        if append.prev_log_index > 0 {
            let matched = match chassis.log.read(append.prev_log_index).await? {
                Some(record) => record.term == append.prev_log_term,
                None => false,
            };
            if !matched {
                debug!(
                    uri = %chassis.my_uri(),
                    prev_log_index = append.prev_log_index,
                    prev_log_term = append.prev_log_term,
                    last_index,
                    "log mismatch, asking leader to back down"
                );
                self.reply_append(chassis, append, term, false, None, last_index)
                    .await;
                return Ok(Transition::Stay);
            }
        }

        let mut last_index = last_index;
        for entry in &append.entries {
            let mut entry = entry.clone();
            // The local commit index is the only source of truth for
            // the committed flag on this node.
            entry.committed = false;
            match chassis.log.read(entry.index).await? {
                Some(existing) => {
                    if existing.term == entry.term {
                        continue;
                    }
                    if existing.committed {
                        return Err(FatalError(format!(
                            "leader {} tried to overwrite committed record {}",
                            append.sender, existing.index
                        ))
                        .into());
                    }
                    let replaced = chassis.log.replace_or_append(entry).await?;
                    last_index = replaced.index;
                }
                None => {
                    if entry.index != last_index + 1 {
                        chassis.record_problem(
                            None,
                            format!(
                                "append from {} skips from {} to {}",
                                append.sender, last_index, entry.index
                            ),
                        );
                        self.reply_append(chassis, append, term, false, None, last_index)
                            .await;
                        return Ok(Transition::Stay);
                    }
                    chassis.log.append(std::slice::from_ref(&entry)).await?;
                    last_index = entry.index;
                }
            }
        }

        let commit_index = chassis.log.get_commit_index().await?;
        if append.leader_commit > commit_index {
            let to = append.leader_commit.min(last_index);
            if to > commit_index {
                chassis.advance_commit(to).await?;
            }
        }

        let acked = append.prev_log_index + append.entries.len() as u64;
        self.reply_append(chassis, append, term, true, Some(acked), last_index)
            .await;
        Ok(Transition::Stay)
    }

    async fn on_request_vote(
        &mut self,
        chassis: &mut Chassis,
        raw: &Message,
        request: &RequestVote,
    ) -> Result<Transition, CoreError> {
        let current = chassis.log.get_term().await?;
        if request.term < current {
            debug!(
                uri = %chassis.my_uri(),
                candidate = %request.sender,
                term = request.term,
                current,
                "denying vote to stale candidate"
            );
            self.reply_vote(chassis, raw, request, current, false).await;
            return Ok(Transition::Stay);
        }
        if request.term > current {
            chassis.observe_term(request.term).await?;
        }

        let last_term = chassis.log.get_last_term().await?;
        let last_index = chassis.log.get_last_index().await?;
        let up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);
        let free_to_grant = chassis.votes.may_grant(&request.sender, request.term);

        if up_to_date && free_to_grant {
            chassis.votes.record(request.sender.clone(), request.term);
            self.leader_lost_timer.arm(chassis.leader_lost_timeout());
            info!(
                uri = %chassis.my_uri(),
                candidate = %request.sender,
                term = request.term,
                "vote granted"
            );
            chassis.publish(HullEvent::VoteGranted {
                uri: chassis.my_uri().clone(),
                candidate: request.sender.clone(),
                term: request.term,
            });
            self.reply_vote(chassis, raw, request, request.term, true)
                .await;
        } else {
            let term = chassis.log.get_term().await?;
            debug!(
                uri = %chassis.my_uri(),
                candidate = %request.sender,
                up_to_date,
                free_to_grant,
                "vote denied"
            );
            self.reply_vote(chassis, raw, request, term, false).await;
        }
        Ok(Transition::Stay)
    }

    async fn reply_append(
        &self,
        chassis: &mut Chassis,
        append: &AppendEntries,
        term: u64,
        success: bool,
        last_entry_index: Option<u64>,
        last_index: u64,
    ) {
        let response = Message::AppendResponse(AppendResponse {
            sender: chassis.my_uri().clone(),
            receiver: append.sender.clone(),
            term,
            success,
            last_entry_index,
            last_index,
        });
        let request = Message::AppendEntries(append.clone());
        chassis.respond(&request, response).await;
    }

    async fn reply_vote(
        &self,
        chassis: &mut Chassis,
        raw: &Message,
        request: &RequestVote,
        term: u64,
        vote: bool,
    ) {
        if !vote {
            warn!(
                uri = %chassis.my_uri(),
                candidate = %request.sender,
                term = request.term,
                "refusing ballot"
            );
        }
        let response = Message::RequestVoteResponse(RequestVoteResponse {
            sender: chassis.my_uri().clone(),
            receiver: request.sender.clone(),
            term,
            vote,
        });
        chassis.respond(raw, response).await;
    }
}

impl Default for Follower {
    fn default() -> Self {
        Follower::new()
    }
}
