use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{CoreError, ProtocolError};
use crate::events::HullEvent;
use crate::hull::Chassis;
use crate::log::Term;
use crate::message::{
    AppendEntries, AppendResponse, Message, NodeId, RequestVote, RequestVoteResponse,
};
use crate::states::{StateTimer, Transition};

/// Runs one election in one term: solicits votes, tallies replies, and
/// either wins, steps down, or lets the timer trigger a fresh campaign.
#[derive(Debug)]
pub struct Candidate {
    term: Term,
    ballots: HashMap<NodeId, Option<bool>>,
    reply_count: usize,
    election_timer: StateTimer,
    terminated: bool,
}

impl Candidate {
    pub fn new() -> Self {
        Candidate {
            term: 0,
            ballots: HashMap::new(),
            reply_count: 0,
            election_timer: StateTimer::new("election"),
            terminated: false,
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Bump the term, vote for ourselves, and ask everyone else.
    pub async fn start(&mut self, chassis: &mut Chassis) -> Result<(), CoreError> {
        self.term = chassis.log.incr_term().await?;
        chassis.votes.observe_term(self.term);
        chassis.votes.record(chassis.my_uri().clone(), self.term);

        self.ballots.clear();
        self.reply_count = 0;

        let last_log_index = chassis.log.get_last_index().await?;
        let last_log_term = chassis.log.get_last_term().await?;

        info!(
            uri = %chassis.my_uri(),
            term = self.term,
            last_log_index,
            "campaign started"
        );
        chassis.publish(HullEvent::ElectionStarted {
            uri: chassis.my_uri().clone(),
            term: self.term,
        });

        for node in chassis.node_ids().to_vec() {
            if node == *chassis.my_uri() {
                self.ballots.insert(node, Some(true));
                continue;
            }
            self.ballots.insert(node.clone(), None);
            chassis
                .send(Message::RequestVote(RequestVote {
                    sender: chassis.my_uri().clone(),
                    receiver: node,
                    term: self.term,
                    last_log_index,
                    last_log_term,
                }))
                .await;
        }

        let timeout = chassis.election_timeout();
        debug!(uri = %chassis.my_uri(), ?timeout, "election timer armed");
        self.election_timer.arm(timeout);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.terminated = true;
        self.election_timer.terminate();
    }

    /// Won already? True straight after `start` in a cluster small
    /// enough that the self-vote is a majority.
    pub fn has_majority(&self, quorum: usize) -> bool {
        self.ballots
            .values()
            .filter(|b| matches!(b, Some(true)))
            .count()
            >= quorum
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.election_timer.deadline()
    }

    /// Election timer ran out without a winner: run a fresh campaign in
    /// the next term.
    pub async fn on_timeout(
        &mut self,
        chassis: &mut Chassis,
        now: Instant,
    ) -> Result<Transition, CoreError> {
        if self.terminated || !self.election_timer.expired(now) {
            return Ok(Transition::Stay);
        }
        info!(
            uri = %chassis.my_uri(),
            term = self.term,
            "campaign timed out, trying again"
        );
        Ok(Transition::Campaign)
    }

    pub async fn on_message(
        &mut self,
        chassis: &mut Chassis,
        message: Message,
    ) -> Result<Transition, CoreError> {
        match &message {
            Message::RequestVoteResponse(response) => {
                self.on_vote_response(chassis, response).await
            }
            Message::AppendEntries(append) => {
                self.on_append_entries(chassis, &message, append).await
            }
            Message::RequestVote(request) => {
                self.on_request_vote(chassis, &message, request).await
            }
            Message::AppendResponse(_) => {
                let error = ProtocolError::Unexpected {
                    code: message.code().as_str(),
                    role: "candidate",
                };
                chassis.record_problem(Some(message.clone()), error.to_string());
                Ok(Transition::Stay)
            }
        }
    }

    async fn on_vote_response(
        &mut self,
        chassis: &mut Chassis,
        response: &RequestVoteResponse,
    ) -> Result<Transition, CoreError> {
        if response.term < self.term {
            debug!(
                uri = %chassis.my_uri(),
                from = %response.sender,
                term = response.term,
                "ignoring out of date vote"
            );
            return Ok(Transition::Stay);
        }
        if response.term > self.term {
            chassis.observe_term(response.term).await?;
            info!(
                uri = %chassis.my_uri(),
                term = response.term,
                "voter is ahead of us, stepping down"
            );
            return Ok(Transition::Demote { redispatch: None });
        }

        match self.ballots.get_mut(&response.sender) {
            Some(slot) => {
                if slot.is_none() {
                    *slot = Some(response.vote);
                    self.reply_count += 1;
                }
            }
            None => {
                chassis.record_problem(
                    None,
                    format!("vote response from outsider {}", response.sender),
                );
                return Ok(Transition::Stay);
            }
        }

        let quorum = chassis.quorum();
        let yes = self
            .ballots
            .values()
            .filter(|b| matches!(b, Some(true)))
            .count();
        let outstanding = self.ballots.values().filter(|b| b.is_none()).count();
        info!(
            uri = %chassis.my_uri(),
            term = self.term,
            yes,
            outstanding,
            quorum,
            "ballot counted"
        );

        if yes >= quorum {
            self.election_timer.cancel();
            return Ok(Transition::Win { term: self.term });
        }
        if yes + outstanding < quorum {
            // Lost this round even if every silent peer said yes.
            // Redraw the timer; the term bumps when it fires.
            let timeout = chassis.election_timeout();
            info!(
                uri = %chassis.my_uri(),
                term = self.term,
                ?timeout,
                "campaign lost, waiting to retry"
            );
            self.election_timer.arm(timeout);
        }
        Ok(Transition::Stay)
    }

    async fn on_append_entries(
        &mut self,
        chassis: &mut Chassis,
        raw: &Message,
        append: &AppendEntries,
    ) -> Result<Transition, CoreError> {
        if append.term >= self.term {
            chassis.observe_term(append.term).await?;
            info!(
                uri = %chassis.my_uri(),
                leader = %append.sender,
                term = append.term,
                "a leader is out there, stepping down"
            );
            return Ok(Transition::Demote {
                redispatch: Some(raw.clone()),
            });
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

    async fn on_request_vote(
        &mut self,
        chassis: &mut Chassis,
        raw: &Message,
        request: &RequestVote,
    ) -> Result<Transition, CoreError> {
        if request.term > self.term {
            chassis.observe_term(request.term).await?;
            return Ok(Transition::Demote {
                redispatch: Some(raw.clone()),
            });
        }
        // We voted for ourselves in this term; a rival in the same or
        // an older term is denied.
        debug!(
            uri = %chassis.my_uri(),
            rival = %request.sender,
            term = request.term,
            "denying rival candidate"
        );
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
}

impl Default for Candidate {
    fn default() -> Self {
        Candidate::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::RoleCode;
    use crate::test_support::TestCluster;
    use std::time::Duration;

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    fn vote_request(sender: &NodeId, receiver: &NodeId, term: Term) -> Message {
        Message::RequestVote(RequestVote {
            sender: sender.clone(),
            receiver: receiver.clone(),
            term,
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    fn vote_response(sender: &NodeId, receiver: &NodeId, term: Term, vote: bool) -> Message {
        Message::RequestVoteResponse(RequestVoteResponse {
            sender: sender.clone(),
            receiver: receiver.clone(),
            term,
            vote,
        })
    }

    #[tokio::test]
    async fn campaign_solicits_every_peer() {
        let mut cluster = TestCluster::new(3).await;
        let b = cluster.uris[1].clone();

        cluster.hull_mut(&b).start_campaign().await;

        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Candidate);
        assert_eq!(cluster.hull(&b).current_term().await.unwrap(), 1);
        let outbox = cluster.pilot(&b).take_outbox().await;
        assert_eq!(outbox.len(), 2);
        for (_, message) in outbox {
            match message {
                Message::RequestVote(request) => assert_eq!(request.term, 1),
                other => panic!("unexpected campaign message {other:?}"),
            }
        }
        assert!(cluster.hull(&b).next_deadline().is_some());
    }

    #[tokio::test]
    async fn rival_in_the_same_term_is_denied() {
        let mut cluster = TestCluster::new(3).await;
        let (b, c) = (cluster.uris[1].clone(), cluster.uris[2].clone());

        cluster.hull_mut(&b).start_campaign().await;
        cluster.pilot(&b).take_outbox().await;

        cluster
            .hull_mut(&b)
            .on_message(vote_request(&c, &b, 1))
            .await;

        let outbox = cluster.pilot(&b).take_outbox().await;
        match &outbox[..] {
            [(target, Message::RequestVoteResponse(response))] => {
                assert_eq!(target, &c);
                assert!(!response.vote);
                assert_eq!(response.term, 1);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Candidate);
    }

    #[tokio::test]
    async fn fresher_candidate_pulls_us_down_and_gets_the_ballot() {
        let mut cluster = TestCluster::new(3).await;
        let (b, c) = (cluster.uris[1].clone(), cluster.uris[2].clone());

        cluster.hull_mut(&b).start_campaign().await;
        cluster.pilot(&b).take_outbox().await;

        cluster
            .hull_mut(&b)
            .on_message(vote_request(&c, &b, 2))
            .await;

        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Follower);
        assert_eq!(cluster.hull(&b).current_term().await.unwrap(), 2);
        let outbox = cluster.pilot(&b).take_outbox().await;
        match &outbox[..] {
            [(_, Message::RequestVoteResponse(response))] => {
                assert!(response.vote);
                assert_eq!(response.term, 2);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn voter_with_a_higher_term_forces_step_down() {
        let mut cluster = TestCluster::new(3).await;
        let (b, c) = (cluster.uris[1].clone(), cluster.uris[2].clone());

        cluster.hull_mut(&b).start_campaign().await;
        cluster.pilot(&b).take_outbox().await;

        cluster
            .hull_mut(&b)
            .on_message(vote_response(&c, &b, 7, false))
            .await;

        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Follower);
        assert_eq!(cluster.hull(&b).current_term().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn hopeless_round_redraws_the_timer_without_a_term_bump() {
        let mut cluster = TestCluster::new(3).await;
        let (a, b, c) = (
            cluster.uris[0].clone(),
            cluster.uris[1].clone(),
            cluster.uris[2].clone(),
        );

        cluster.hull_mut(&b).start_campaign().await;
        cluster.pilot(&b).take_outbox().await;

        cluster
            .hull_mut(&b)
            .on_message(vote_response(&a, &b, 1, false))
            .await;
        cluster
            .hull_mut(&b)
            .on_message(vote_response(&c, &b, 1, false))
            .await;

        // Beaten, but the term only bumps when the timer fires.
        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Candidate);
        assert_eq!(cluster.hull(&b).current_term().await.unwrap(), 1);
        assert!(cluster.hull(&b).next_deadline().is_some());

        cluster.hull_mut(&b).on_tick(far_future()).await;
        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Candidate);
        assert_eq!(cluster.hull(&b).current_term().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_ballots_are_counted_once() {
        let mut cluster = TestCluster::new(5).await;
        let (a, b) = (cluster.uris[0].clone(), cluster.uris[1].clone());

        cluster.hull_mut(&b).start_campaign().await;
        cluster.pilot(&b).take_outbox().await;

        // Quorum of five is three; one repeated yes must not win it.
        cluster
            .hull_mut(&b)
            .on_message(vote_response(&a, &b, 1, true))
            .await;
        cluster
            .hull_mut(&b)
            .on_message(vote_response(&a, &b, 1, true))
            .await;

        assert_eq!(cluster.hull(&b).role_code(), RoleCode::Candidate);
    }
}
