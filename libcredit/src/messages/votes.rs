use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Uncertain,
    Approved,
    Rejected,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VotesError {
    #[error("{0} is not a participant of this transaction")]
    NotAParticipant(NodeId),
    #[error("{0} has already voted")]
    AlreadyVoted(NodeId),
}

/// The circulating ballot of a payment.
///
/// The coordinator lists every participant once, in path order, and sends the message to the first of them. Each
/// participant records its vote and forwards to the next one; the last one sends it back to the coordinator. When
/// every participant approved, the coordinator appends its own approval and sends the final message to everybody:
/// only that final message allows a participant to commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantsVotesMessage {
    coordinator: NodeId,
    votes: Vec<(NodeId, Vote)>,
}

impl ParticipantsVotesMessage {
    pub fn new(coordinator: NodeId) -> Self {
        ParticipantsVotesMessage { coordinator, votes: Vec::new() }
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    /// Adds a participant with an uncertain vote. Returns false for duplicates and for the coordinator itself.
    pub fn add_participant(&mut self, node: NodeId) -> bool {
        if node == self.coordinator || self.votes.iter().any(|(n, _)| *n == node) {
            return false;
        }
        self.votes.push((node, Vote::Uncertain));
        true
    }

    /// Every participant, coordinator excluded, in circulation order.
    pub fn participants(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.votes.iter().map(|(n, _)| *n).filter(move |n| *n != self.coordinator)
    }

    pub fn participants_count(&self) -> usize {
        self.participants().count()
    }

    pub fn vote_of(&self, node: &NodeId) -> Option<Vote> {
        self.votes.iter().find(|(n, _)| n == node).map(|(_, v)| *v)
    }

    fn set_vote(&mut self, node: &NodeId, vote: Vote) -> Result<(), VotesError> {
        let entry = self.votes.iter_mut().find(|(n, _)| n == node).ok_or(VotesError::NotAParticipant(*node))?;
        if entry.1 != Vote::Uncertain {
            return Err(VotesError::AlreadyVoted(*node));
        }
        entry.1 = vote;
        Ok(())
    }

    pub fn approve(&mut self, node: &NodeId) -> Result<(), VotesError> {
        self.set_vote(node, Vote::Approved)
    }

    pub fn reject(&mut self, node: &NodeId) -> Result<(), VotesError> {
        self.set_vote(node, Vote::Rejected)
    }

    /// Marks the message as rejected on behalf of the coordinator, e.g. after a timeout.
    pub fn reject_by_coordinator(&mut self) {
        self.votes.retain(|(n, _)| *n != self.coordinator);
        self.votes.push((self.coordinator, Vote::Rejected));
    }

    pub fn approve_by_coordinator(&mut self) {
        self.votes.retain(|(n, _)| *n != self.coordinator);
        self.votes.push((self.coordinator, Vote::Approved));
    }

    pub fn first_participant(&self) -> Option<NodeId> {
        self.participants().next()
    }

    /// The participant after `node`, or `None` when `node` is the last one.
    pub fn next_participant(&self, node: &NodeId) -> Option<NodeId> {
        let mut participants = self.participants().skip_while(|n| n != node);
        participants.next()?;
        participants.next()
    }

    pub fn contains_rejection(&self) -> bool {
        self.votes.iter().any(|(_, v)| *v == Vote::Rejected)
    }

    /// Every participant approved. The coordinator may not have voted yet.
    pub fn all_participants_approved(&self) -> bool {
        let mut participants = self.votes.iter().filter(|(n, _)| *n != self.coordinator).peekable();
        participants.peek().is_some() && participants.all(|(_, v)| *v == Vote::Approved)
    }

    /// The final, committing state: every participant and the coordinator approved.
    pub fn achieved_consensus(&self) -> bool {
        self.all_participants_approved() && self.vote_of(&self.coordinator) == Some(Vote::Approved)
    }

    /// Same coordinator and same participants in the same order.
    pub fn has_same_participants(&self, other: &ParticipantsVotesMessage) -> bool {
        self.coordinator == other.coordinator && self.participants().eq(other.participants())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    fn ballot() -> ParticipantsVotesMessage {
        let mut votes = ParticipantsVotesMessage::new(id("a"));
        assert!(votes.add_participant(id("b")));
        assert!(votes.add_participant(id("c")));
        assert!(!votes.add_participant(id("b")));
        assert!(!votes.add_participant(id("a")));
        votes
    }

    #[test]
    fn circulation_order() {
        let votes = ballot();
        assert_eq!(votes.first_participant(), Some(id("b")));
        assert_eq!(votes.next_participant(&id("b")), Some(id("c")));
        assert_eq!(votes.next_participant(&id("c")), None);
        assert_eq!(votes.next_participant(&id("z")), None);
    }

    #[test]
    fn consensus_needs_the_coordinator() {
        let mut votes = ballot();
        votes.approve(&id("b")).unwrap();
        assert!(!votes.all_participants_approved());
        votes.approve(&id("c")).unwrap();
        assert!(votes.all_participants_approved());
        assert!(!votes.achieved_consensus());
        votes.approve_by_coordinator();
        assert!(votes.achieved_consensus());
        assert_eq!(votes.participants_count(), 2);
        assert_eq!(votes.next_participant(&id("c")), None);
    }

    #[test]
    fn rejections() {
        let mut votes = ballot();
        votes.approve(&id("b")).unwrap();
        assert_eq!(votes.approve(&id("b")), Err(VotesError::AlreadyVoted(id("b"))));
        assert_eq!(votes.reject(&id("z")), Err(VotesError::NotAParticipant(id("z"))));
        votes.reject(&id("c")).unwrap();
        assert!(votes.contains_rejection());
        assert!(!votes.all_participants_approved());
    }

    #[test]
    fn empty_ballot_never_agrees() {
        let mut votes = ParticipantsVotesMessage::new(id("a"));
        votes.approve_by_coordinator();
        assert!(!votes.achieved_consensus());
    }

    #[test]
    fn participant_consistency() {
        let mut one = ballot();
        let two = ballot();
        assert!(one.has_same_participants(&two));
        one.approve(&id("b")).unwrap();
        one.approve_by_coordinator();
        assert!(one.has_same_participants(&two));
        let mut three = ParticipantsVotesMessage::new(id("a"));
        three.add_participant(id("c"));
        three.add_participant(id("b"));
        assert!(!three.has_same_participants(&two));
    }
}
