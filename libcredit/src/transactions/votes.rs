//! Votes handling shared by intermediate nodes and receivers.

use crate::ids::NodeId;
use crate::messages::{Message, MessageType, ParticipantsVotesMessage, Vote, VotesStatus};
use crate::storage::PaymentRecord;
use crate::transactions::context::NodeContext;
use crate::transactions::payment::PaymentCore;
use crate::transactions::result::TransactionState;
use log::*;
use std::time::Duration;

/// Where a participant stands after handling a votes related event.
pub(crate) enum VotesOutcome {
    /// Voted, waiting for the coordinator's decision.
    Waiting(TransactionState),
    /// Probing the coordinator for the outcome.
    Recovering(TransactionState),
    Committed,
    RolledBack,
    /// The message was not meant for this transaction; nothing changed.
    Ignored,
}

impl PaymentCore {
    pub(crate) fn final_votes_state(&self, ctx: &NodeContext<'_>) -> TransactionState {
        TransactionState::wait_for_messages(&[MessageType::ParticipantsVotes], self.votes_timeout(ctx))
    }

    /// Votes wait sized by the ballot this node has seen, if any.
    pub(crate) fn votes_timeout(&self, ctx: &NodeContext<'_>) -> Duration {
        ctx.config.votes_timeout(self.votes.as_ref().map_or(0, ParticipantsVotesMessage::participants_count))
    }

    /// Handles a votes message. `valid` is the role's verdict on its own reservations.
    pub(crate) fn process_votes(
        &mut self,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        votes: ParticipantsVotesMessage,
        valid: bool,
        record: Option<PaymentRecord>,
    ) -> VotesOutcome {
        let me = self.node_id;
        if votes.coordinator() != self.coordinator {
            warn!("{}: votes from {} name a foreign coordinator", self.id.short(), sender.short());
            return VotesOutcome::Ignored;
        }
        let Some(my_vote) = votes.vote_of(&me) else {
            warn!("{}: votes from {} do not list this node", self.id.short(), sender.short());
            return VotesOutcome::Ignored;
        };
        if votes.contains_rejection() {
            info!("{}: votes contain a rejection, rolling back", self.id.short());
            self.rollback(ctx);
            return VotesOutcome::RolledBack;
        }
        if votes.achieved_consensus() {
            let known = self.votes.as_ref().is_some_and(|v| v.has_same_participants(&votes));
            if sender != self.coordinator || !self.voted || my_vote != Vote::Approved || !known {
                warn!("{}: unexpected final votes from {}", self.id.short(), sender.short());
                return VotesOutcome::Ignored;
            }
            return self.commit_votes(ctx, votes, record);
        }
        if my_vote != Vote::Uncertain {
            debug!("{}: already voted, ignoring a repeated ballot", self.id.short());
            return VotesOutcome::Ignored;
        }
        let mut votes = votes;
        if !valid {
            info!("{}: reservations do not match, voting against", self.id.short());
            if let Err(e) = votes.reject(&me) {
                warn!("{}: {e}", self.id.short());
            }
            self.send(ctx, self.coordinator, Message::ParticipantsVotes(votes));
            self.rollback(ctx);
            return VotesOutcome::RolledBack;
        }
        if let Err(e) = votes.approve(&me) {
            warn!("{}: {e}", self.id.short());
            return VotesOutcome::Ignored;
        }
        let next = votes.next_participant(&me).unwrap_or(self.coordinator);
        debug!("{}: approved, passing votes to {}", self.id.short(), next.short());
        self.send(ctx, next, Message::ParticipantsVotes(votes.clone()));
        self.votes = Some(votes);
        self.voted = true;
        VotesOutcome::Waiting(self.final_votes_state(ctx).persisted())
    }

    fn commit_votes(
        &mut self,
        ctx: &mut NodeContext<'_>,
        votes: ParticipantsVotesMessage,
        record: Option<PaymentRecord>,
    ) -> VotesOutcome {
        match self.commit(ctx, &votes, record) {
            Ok(()) => {
                info!("{}: committed", self.id.short());
                VotesOutcome::Committed
            }
            Err(e) => {
                error!("{}: commit failed, retrying later. {e}", self.id.short());
                self.votes = Some(votes);
                VotesOutcome::Recovering(TransactionState::awake_after(ctx.config.recovery_retry_delay()))
            }
        }
    }

    /// One recovery step: commit an already known consensus, or ask the coordinator how the votes ended.
    pub(crate) fn recovery_step(&mut self, ctx: &mut NodeContext<'_>, record: Option<PaymentRecord>) -> VotesOutcome {
        if let Some(votes) = self.votes.clone().filter(ParticipantsVotesMessage::achieved_consensus) {
            return self.commit_votes(ctx, votes, record);
        }
        if !self.voted {
            info!("{}: no votes before the timeout, rolling back", self.id.short());
            self.rollback(ctx);
            return VotesOutcome::RolledBack;
        }
        if self.probe_sent {
            self.probe_sent = false;
            return self.retry_recovery(ctx);
        }
        debug!("{}: asking {} for the votes status", self.id.short(), self.coordinator.short());
        self.send(ctx, self.coordinator, Message::VotesStatusRequest);
        self.probe_sent = true;
        VotesOutcome::Recovering(TransactionState::wait_for_messages(
            &[MessageType::VotesStatusResponse, MessageType::ParticipantsVotes],
            ctx.config.max_network_delay(2),
        ))
    }

    pub(crate) fn process_votes_status(
        &mut self,
        ctx: &mut NodeContext<'_>,
        status: VotesStatus,
        record: Option<PaymentRecord>,
    ) -> VotesOutcome {
        self.probe_sent = false;
        match status {
            VotesStatus::Known(votes) if votes.coordinator() == self.coordinator => {
                if votes.achieved_consensus() && self.voted && votes.vote_of(&self.node_id) == Some(Vote::Approved) {
                    self.commit_votes(ctx, votes, record)
                } else {
                    info!("{}: the coordinator did not commit, rolling back", self.id.short());
                    self.rollback(ctx);
                    VotesOutcome::RolledBack
                }
            }
            VotesStatus::Known(_) => {
                warn!("{}: votes status names a foreign coordinator", self.id.short());
                self.retry_recovery(ctx)
            }
            VotesStatus::InProgress => self.retry_recovery(ctx),
            VotesStatus::Unknown => {
                info!("{}: the coordinator does not know this payment, rolling back", self.id.short());
                self.rollback(ctx);
                VotesOutcome::RolledBack
            }
        }
    }

    fn retry_recovery(&mut self, ctx: &mut NodeContext<'_>) -> VotesOutcome {
        self.recovery_attempts = self.recovery_attempts.saturating_add(1);
        if self.recovery_attempts >= ctx.config.max_recovery_attempts {
            error!(
                "{}: no decision from {} after {} attempts, rolling back",
                self.id.short(),
                self.coordinator.short(),
                self.recovery_attempts
            );
            self.rollback(ctx);
            return VotesOutcome::RolledBack;
        }
        VotesOutcome::Recovering(TransactionState::awake_after(ctx.config.recovery_retry_delay()))
    }
}
