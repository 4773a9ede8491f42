use crate::amount::TrustLineAmount;
use crate::error::ProtocolError;
use crate::ids::{NodeId, PathId};
use crate::messages::{
    Envelope, Message, MessageType, PaymentKind, RejectReason, ReservationRequest, ReservationResponse, ResponseState,
};
use crate::transactions::context::NodeContext;
use crate::transactions::payment::PaymentCore;
use crate::transactions::result::{MessageResult, Outcome, RoleKind, TransactionResult, TransactionState};
use crate::transactions::votes::VotesOutcome;
use crate::trust_lines::ReservationDirection;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntermediateStage {
    PreviousNeighborRequestProcessing,
    CoordinatorRequestProcessing,
    NextNeighborResponseProcessing,
    FinalPathConfigurationChecking,
    TtlProlongation,
    VotesChecking,
    Recovery,
}

/// This node's part of one path.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PathLeg {
    previous: NodeId,
    next: Option<NodeId>,
    amount: TrustLineAmount,
    confirmed: bool,
}

/// A node relaying a payment: incoming capacity from the previous neighbour, outgoing capacity toward the next one,
/// for every path of the payment that crosses it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntermediateRole {
    stage: IntermediateStage,
    current_path: Option<PathId>,
    paths: BTreeMap<PathId, PathLeg>,
    ttl_prolongations: u8,
}

impl IntermediateRole {
    pub(crate) fn new() -> Self {
        IntermediateRole {
            stage: IntermediateStage::PreviousNeighborRequestProcessing,
            current_path: None,
            paths: BTreeMap::new(),
            ttl_prolongations: 0,
        }
    }

    pub fn stage(&self) -> IntermediateStage {
        self.stage
    }

    pub(crate) fn prepare_recovery(&mut self) {
        self.stage = IntermediateStage::Recovery;
    }

    pub(crate) fn run(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let message = core.pop_message();
        // The coordinator may drop or fix a path whatever this node is waiting for, as long as it has not voted.
        if let Some(Envelope { message: Message::FinalPathConfiguration { path_id, amount }, .. }) = &message {
            if !core.voted && self.stage != IntermediateStage::Recovery {
                return self.on_final_path_configuration(core, ctx, *path_id, *amount);
            }
        }
        match self.stage {
            IntermediateStage::PreviousNeighborRequestProcessing | IntermediateStage::VotesChecking => match message {
                Some(Envelope { sender, message: Message::IntermediateNodeReservationRequest(request), .. })
                    if !core.voted =>
                {
                    self.on_previous_neighbor_request(core, ctx, sender, request)
                }
                Some(Envelope { sender, message: Message::ParticipantsVotes(votes), .. })
                    if self.stage == IntermediateStage::VotesChecking =>
                {
                    let valid = self.reservations_match(core);
                    let outcome = core.process_votes(ctx, sender, votes, valid, None);
                    Ok(self.apply_votes_outcome(core, ctx, outcome))
                }
                Some(envelope) => {
                    debug!("{}: ignoring {envelope}", core.id.short());
                    if let Message::IntermediateNodeReservationRequest(request) = envelope.message {
                        let reason = RejectReason::ProtocolViolation;
                        self.reject_request(core, ctx, envelope.sender, request.path_id, reason);
                    }
                    Ok(self.finish_or_wait(core, ctx))
                }
                None if self.stage == IntermediateStage::VotesChecking => {
                    warn!("{}: no votes in time, starting recovery", core.id.short());
                    self.stage = IntermediateStage::Recovery;
                    let outcome = core.recovery_step(ctx, None);
                    Ok(self.apply_votes_outcome(core, ctx, outcome))
                }
                None => Ok(self.finish_or_wait(core, ctx)),
            },
            IntermediateStage::CoordinatorRequestProcessing => match message {
                Some(Envelope {
                    message: Message::CoordinatorReservationRequest { path_id, amount, next_node }, ..
                }) => self.on_coordinator_request(core, ctx, path_id, amount, next_node),
                _ => {
                    warn!("{}: coordinator request did not arrive", core.id.short());
                    self.drop_current_path(core, ctx);
                    Ok(self.finish_or_wait(core, ctx))
                }
            },
            IntermediateStage::NextNeighborResponseProcessing => match message {
                Some(Envelope { sender, message: Message::IntermediateNodeReservationResponse(response), .. }) => {
                    self.on_next_neighbor_response(core, ctx, sender, response)
                }
                _ => {
                    warn!("{}: next neighbour did not answer", core.id.short());
                    self.reject_to_coordinator(core, ctx, RejectReason::Timeout);
                    Ok(self.finish_or_wait(core, ctx))
                }
            },
            IntermediateStage::FinalPathConfigurationChecking => Ok(self.prolong_ttl(core, ctx)),
            IntermediateStage::TtlProlongation => match message {
                Some(Envelope { message: Message::TtlProlongationResponse { alive }, .. }) => {
                    Ok(self.on_ttl_response(core, ctx, alive))
                }
                _ => Ok(self.on_ttl_response(core, ctx, false)),
            },
            IntermediateStage::Recovery => {
                let outcome = match message {
                    Some(Envelope { message: Message::VotesStatusResponse(status), .. }) => {
                        core.process_votes_status(ctx, status, None)
                    }
                    Some(Envelope { sender, message: Message::ParticipantsVotes(votes), .. }) => {
                        let valid = self.reservations_match(core);
                        core.process_votes(ctx, sender, votes, valid, None)
                    }
                    _ => core.recovery_step(ctx, None),
                };
                Ok(self.apply_votes_outcome(core, ctx, outcome))
            }
        }
    }

    //------------------------------------      Path negotiation    ------------------------------------------------//

    fn on_previous_neighbor_request(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        previous: NodeId,
        request: ReservationRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = request.path_id;
        if request.coordinator != core.coordinator || request.kind != core.kind || self.paths.contains_key(&path_id) {
            warn!("{}: inconsistent reservation request from {}", core.id.short(), previous.short());
            self.reject_request(core, ctx, previous, path_id, RejectReason::ProtocolViolation);
            return Ok(self.finish_or_wait(core, ctx));
        }
        if !ctx.trust_lines.is_neighbor(&previous) {
            self.reject_request(core, ctx, previous, path_id, RejectReason::NoTrustLine);
            return Ok(self.finish_or_wait(core, ctx));
        }
        let available = ctx.trust_lines.available(&previous, ReservationDirection::Incoming, core.capacity_kind())?;
        let amount = request.amount.min(available);
        if amount.is_zero() {
            info!("{}: nothing available from {} on path {path_id}", core.id.short(), previous.short());
            self.reject_request(core, ctx, previous, path_id, RejectReason::InsufficientCapacity);
            return Ok(self.finish_or_wait(core, ctx));
        }
        core.reserve(ctx, previous, path_id, amount, ReservationDirection::Incoming)?;
        self.paths.insert(path_id, PathLeg { previous, next: None, amount, confirmed: false });
        self.current_path = Some(path_id);
        debug!("{}: reserved {amount} from {} on path {path_id}", core.id.short(), previous.short());
        let response = ReservationResponse::accepted(path_id, amount);
        core.send(ctx, previous, Message::IntermediateNodeReservationResponse(response));
        self.stage = IntermediateStage::CoordinatorRequestProcessing;
        Ok(TransactionState::wait_for_messages(
            &[MessageType::CoordinatorReservationRequest, MessageType::FinalPathConfiguration],
            ctx.config.max_network_delay(4),
        )
        .into())
    }

    fn on_coordinator_request(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        path_id: PathId,
        requested: TrustLineAmount,
        next: NodeId,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some((previous, reserved)) =
            self.current_path.filter(|p| *p == path_id).and_then(|p| self.paths.get(&p)).map(|l| (l.previous, l.amount))
        else {
            warn!("{}: coordinator asked about unknown path {path_id}", core.id.short());
            let response = ReservationResponse::rejected(path_id, RejectReason::ProtocolViolation);
            core.send(ctx, core.coordinator, Message::CoordinatorReservationResponse(response));
            self.drop_current_path(core, ctx);
            return Ok(self.finish_or_wait(core, ctx));
        };
        let loops_back = next == previous && core.kind != PaymentKind::Cycle;
        if next == core.node_id || loops_back || !ctx.trust_lines.is_neighbor(&next) {
            self.reject_to_coordinator(core, ctx, RejectReason::NoTrustLine);
            return Ok(self.finish_or_wait(core, ctx));
        }
        let available = ctx.trust_lines.available(&next, ReservationDirection::Outgoing, core.capacity_kind())?;
        let amount = requested.min(reserved).min(available);
        if amount.is_zero() {
            info!("{}: nothing available toward {} on path {path_id}", core.id.short(), next.short());
            self.reject_to_coordinator(core, ctx, RejectReason::InsufficientCapacity);
            return Ok(self.finish_or_wait(core, ctx));
        }
        core.reserve(ctx, next, path_id, amount, ReservationDirection::Outgoing)?;
        core.shortage_path(ctx, path_id, amount)?;
        if let Some(leg) = self.paths.get_mut(&path_id) {
            leg.next = Some(next);
            leg.amount = amount;
        }
        let request = ReservationRequest { path_id, amount, coordinator: core.coordinator, kind: core.kind };
        core.send(ctx, next, Message::IntermediateNodeReservationRequest(request));
        self.stage = IntermediateStage::NextNeighborResponseProcessing;
        Ok(TransactionState::wait_for_messages(
            &[MessageType::IntermediateNodeReservationResponse, MessageType::FinalPathConfiguration],
            ctx.config.max_network_delay(2),
        )
        .into())
    }

    fn on_next_neighbor_response(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        response: ReservationResponse,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(path_id) = self.current_path.filter(|p| *p == response.path_id) else {
            warn!("{}: response for unexpected path {}", core.id.short(), response.path_id);
            self.reject_to_coordinator(core, ctx, RejectReason::ProtocolViolation);
            return Ok(self.finish_or_wait(core, ctx));
        };
        let Some(leg) = self.paths.get(&path_id).filter(|leg| leg.next == Some(sender)) else {
            warn!("{}: response from {} who was not asked", core.id.short(), sender.short());
            self.reject_to_coordinator(core, ctx, RejectReason::ProtocolViolation);
            return Ok(self.finish_or_wait(core, ctx));
        };
        let reserved = leg.amount;
        let amount = match response.state {
            ResponseState::Rejected(reason) => {
                info!("{}: {} rejected path {path_id} ({reason:?})", core.id.short(), sender.short());
                self.reject_to_coordinator(core, ctx, reason);
                return Ok(self.finish_or_wait(core, ctx));
            }
            ResponseState::Accepted if response.amount.is_zero() => {
                self.reject_to_coordinator(core, ctx, RejectReason::ProtocolViolation);
                return Ok(self.finish_or_wait(core, ctx));
            }
            ResponseState::Accepted => response.amount.min(reserved),
        };
        if amount < reserved {
            core.shortage_path(ctx, path_id, amount)?;
            if let Some(leg) = self.paths.get_mut(&path_id) {
                leg.amount = amount;
            }
        }
        let response = ReservationResponse::accepted(path_id, amount);
        core.send(ctx, core.coordinator, Message::CoordinatorReservationResponse(response));
        self.stage = IntermediateStage::FinalPathConfigurationChecking;
        self.ttl_prolongations = 0;
        Ok(self.final_configuration_state(ctx).into())
    }

    fn final_configuration_state(&self, ctx: &NodeContext<'_>) -> TransactionState {
        let hops = ctx.config.max_path_length as u64;
        TransactionState::wait_for_messages(&[MessageType::FinalPathConfiguration], ctx.config.max_network_delay(hops))
    }

    fn on_final_path_configuration(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(leg) = self.paths.get(&path_id) else {
            debug!("{}: final configuration for unknown path {path_id}", core.id.short());
            return Ok(self.resume_waiting(core, ctx));
        };
        if amount.is_zero() {
            debug!("{}: path {path_id} dropped by the coordinator", core.id.short());
            self.release(core, ctx, path_id);
            return Ok(self.resume_waiting(core, ctx));
        }
        if amount > leg.amount || leg.next.is_none() {
            warn!("{}: final amount {amount} does not fit path {path_id}", core.id.short());
            let state = ResponseState::Rejected(RejectReason::ProtocolViolation);
            core.send(ctx, core.coordinator, Message::FinalAmountsConfigurationResponse { path_id, state });
            self.release(core, ctx, path_id);
            return Ok(self.resume_waiting(core, ctx));
        }
        core.shortage_path(ctx, path_id, amount)?;
        if let Some(leg) = self.paths.get_mut(&path_id) {
            leg.amount = amount;
            leg.confirmed = true;
        }
        debug!("{}: path {path_id} confirmed at {amount}", core.id.short());
        let state = ResponseState::Accepted;
        core.send(ctx, core.coordinator, Message::FinalAmountsConfigurationResponse { path_id, state });
        if self.current_path == Some(path_id) {
            self.current_path = None;
        }
        Ok(self.resume_waiting(core, ctx))
    }

    fn prolong_ttl(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        debug!("{}: no final configuration yet, checking the coordinator is alive", core.id.short());
        core.send(ctx, core.coordinator, Message::TtlProlongationRequest);
        self.stage = IntermediateStage::TtlProlongation;
        TransactionState::wait_for_messages(
            &[MessageType::TtlProlongationResponse, MessageType::FinalPathConfiguration],
            ctx.config.max_network_delay(2),
        )
        .into()
    }

    fn on_ttl_response(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>, alive: bool) -> TransactionResult {
        if !alive {
            info!("{}: coordinator gone, rolling back", core.id.short());
            core.rollback(ctx);
            return self.rolled_back(core);
        }
        self.ttl_prolongations = self.ttl_prolongations.saturating_add(1);
        if self.ttl_prolongations > ctx.config.max_ttl_prolongations {
            warn!("{}: final configuration never came", core.id.short());
            self.drop_current_path(core, ctx);
            return self.finish_or_wait(core, ctx);
        }
        self.stage = IntermediateStage::FinalPathConfigurationChecking;
        self.final_configuration_state(ctx).into()
    }

    //------------------------------------         Helpers          ------------------------------------------------//

    fn release(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>, path_id: PathId) {
        core.release_path(ctx, path_id);
        self.paths.remove(&path_id);
        if self.current_path == Some(path_id) {
            self.current_path = None;
        }
    }

    fn reject_request(
        &self,
        core: &PaymentCore,
        ctx: &mut NodeContext<'_>,
        previous: NodeId,
        path_id: PathId,
        reason: RejectReason,
    ) {
        let response = ReservationResponse::rejected(path_id, reason);
        core.send(ctx, previous, Message::IntermediateNodeReservationResponse(response));
    }

    fn drop_current_path(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) {
        if let Some(path_id) = self.current_path {
            self.release(core, ctx, path_id);
        }
    }

    /// Releases the current path and tells the coordinator it failed here.
    fn reject_to_coordinator(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>, reason: RejectReason) {
        if let Some(path_id) = self.current_path {
            let response = ReservationResponse::rejected(path_id, reason);
            core.send(ctx, core.coordinator, Message::CoordinatorReservationResponse(response));
        }
        self.drop_current_path(core, ctx);
    }

    /// After a path ended one way or the other: wait for votes while a confirmed path remains, exit otherwise.
    fn finish_or_wait(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        self.drop_current_path(core, ctx);
        if self.paths.values().any(|leg| leg.confirmed) {
            self.stage = IntermediateStage::VotesChecking;
            return self.votes_checking_state(core, ctx).into();
        }
        core.rollback(ctx);
        self.rolled_back(core)
    }

    /// Goes back to waiting for whatever the current stage expects, or wraps up when no path is in negotiation.
    fn resume_waiting(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        if self.current_path.is_none() {
            return self.finish_or_wait(core, ctx);
        }
        match self.stage {
            IntermediateStage::CoordinatorRequestProcessing => TransactionState::wait_for_messages(
                &[MessageType::CoordinatorReservationRequest, MessageType::FinalPathConfiguration],
                ctx.config.max_network_delay(4),
            )
            .into(),
            IntermediateStage::NextNeighborResponseProcessing => TransactionState::wait_for_messages(
                &[MessageType::IntermediateNodeReservationResponse, MessageType::FinalPathConfiguration],
                ctx.config.max_network_delay(2),
            )
            .into(),
            IntermediateStage::FinalPathConfigurationChecking | IntermediateStage::TtlProlongation => {
                self.final_configuration_state(ctx).into()
            }
            _ => self.finish_or_wait(core, ctx),
        }
    }

    fn votes_checking_state(&self, core: &PaymentCore, ctx: &NodeContext<'_>) -> TransactionState {
        if core.voted {
            return core.final_votes_state(ctx);
        }
        TransactionState::wait_for_messages(
            &[
                MessageType::ParticipantsVotes,
                MessageType::IntermediateNodeReservationRequest,
                MessageType::FinalPathConfiguration,
            ],
            core.votes_timeout(ctx),
        )
    }

    /// Every remaining path is confirmed, with matching amounts in and out.
    fn reservations_match(&self, core: &PaymentCore) -> bool {
        !self.paths.is_empty()
            && self.paths.iter().all(|(path_id, leg)| {
                leg.confirmed
                    && core.reserved(ReservationDirection::Incoming, Some(*path_id)) == leg.amount
                    && core.reserved(ReservationDirection::Outgoing, Some(*path_id)) == leg.amount
            })
    }

    fn apply_votes_outcome(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        outcome: VotesOutcome,
    ) -> TransactionResult {
        match outcome {
            VotesOutcome::Waiting(state) => {
                self.stage = IntermediateStage::VotesChecking;
                state.into()
            }
            VotesOutcome::Recovering(state) => {
                self.stage = IntermediateStage::Recovery;
                state.into()
            }
            VotesOutcome::Committed => self.result(core, Outcome::Committed),
            VotesOutcome::RolledBack => self.rolled_back(core),
            VotesOutcome::Ignored if core.voted || self.stage == IntermediateStage::Recovery => {
                self.stage = IntermediateStage::VotesChecking;
                core.final_votes_state(ctx).into()
            }
            VotesOutcome::Ignored => self.votes_checking_state(core, ctx).into(),
        }
    }

    fn rolled_back(&self, core: &PaymentCore) -> TransactionResult {
        self.result(core, Outcome::RolledBack)
    }

    fn result(&self, core: &PaymentCore, outcome: Outcome) -> TransactionResult {
        let amount = match outcome {
            Outcome::Committed => self.paths.values().map(|leg| leg.amount).sum(),
            Outcome::RolledBack => TrustLineAmount::ZERO,
        };
        let role = RoleKind::Intermediate;
        TransactionResult::Message(MessageResult { transaction_id: core.id, role, outcome, amount })
    }
}
