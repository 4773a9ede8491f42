use crate::amount::TrustLineAmount;
use crate::conflict::{ConflictDecision, ConflictResolver};
use crate::error::ProtocolError;
use crate::ids::{NodeId, PathId, TransactionId};
use crate::messages::{
    Envelope, Message, MessageType, ParticipantsVotesMessage, PaymentKind, RejectReason, ReservationRequest,
    ReservationResponse, ResponseState,
};
use crate::paths::{Path, PathNodeState, PathStats};
use crate::storage::{PaymentDirection, PaymentRecord};
use crate::transactions::context::{LiveTransactions, NodeContext};
use crate::transactions::payment::PaymentCore;
use crate::transactions::result::{CommandResult, ResultCode, TransactionResult, TransactionState};
use crate::transactions::{Resource, ResourceType};
use crate::trust_lines::ReservationDirection;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorStage {
    Initialisation,
    /// Waiting for candidate paths.
    ReceiverResourceProcessing,
    ReceiverResponseProcessing,
    AmountReservation,
    FirstNeighborResponseProcessing,
    NextNeighborResponseProcessing,
    FinalAmountsConfigurationConfirmation,
    VotesChecking,
}

/// The node that started a payment, or a cycle closing.
///
/// Paths are negotiated one at a time, hop by hop. Each path's flow starts at what the first hop can carry and shrinks
/// to the smallest amount any later hop accepts. A payment keeps adding paths until the requested amount is covered;
/// a cycle closing has exactly one path, which starts and ends here, and moves whatever flow survives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorRole {
    stage: CoordinatorStage,
    receiver: NodeId,
    amount: TrustLineAmount,
    paths: Vec<PathStats>,
    current: Option<PathId>,
    pending_confirmations: BTreeSet<NodeId>,
    collected: TrustLineAmount,
    /// Transaction this one is waiting on after a capacity conflict.
    waiting_for: Option<TransactionId>,
}

impl CoordinatorRole {
    pub(crate) fn payment(receiver: NodeId, amount: TrustLineAmount) -> Self {
        CoordinatorRole {
            stage: CoordinatorStage::Initialisation,
            receiver,
            amount,
            paths: Vec::new(),
            current: None,
            pending_confirmations: BTreeSet::new(),
            collected: TrustLineAmount::ZERO,
            waiting_for: None,
        }
    }

    pub(crate) fn cycle(path: Path) -> Self {
        let receiver = path.destination();
        CoordinatorRole {
            paths: vec![PathStats::new(path)],
            ..CoordinatorRole::payment(receiver, TrustLineAmount::ZERO)
        }
    }

    pub fn stage(&self) -> CoordinatorStage {
        self.stage
    }

    pub fn receiver(&self) -> NodeId {
        self.receiver
    }

    pub fn amount(&self) -> TrustLineAmount {
        self.amount
    }

    pub fn collected(&self) -> TrustLineAmount {
        self.collected
    }

    pub fn paths(&self) -> &[PathStats] {
        &self.paths
    }

    pub fn waiting_for(&self) -> Option<TransactionId> {
        self.waiting_for
    }

    /// Only a coordinator in votes checking is ever persisted, and it resumes there: the votes timeout turns into a
    /// rejection, since nothing was committed before the restart.
    pub(crate) fn prepare_recovery(&mut self) {
        self.stage = CoordinatorStage::VotesChecking;
    }

    pub(crate) fn run(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        live: &dyn LiveTransactions,
    ) -> Result<TransactionResult, ProtocolError> {
        let message = core.pop_message();
        match self.stage {
            CoordinatorStage::Initialisation => match core.kind {
                PaymentKind::Payment => Ok(self.initialise_payment(core, ctx)),
                PaymentKind::Cycle => self.initialise_cycle(core, ctx, live),
            },
            CoordinatorStage::ReceiverResourceProcessing => self.on_paths(core, ctx),
            CoordinatorStage::ReceiverResponseProcessing => match message {
                Some(Envelope { sender, message: Message::ReceiverInitPaymentResponse { state }, .. })
                    if sender == self.receiver =>
                {
                    if let ResponseState::Rejected(reason) = state {
                        info!("{}: {} refused the payment ({reason:?})", core.id.short(), sender.short());
                        return Ok(self.finish(core, ResultCode::ReceiverRejected));
                    }
                    self.stage = CoordinatorStage::AmountReservation;
                    self.reserve_next(core, ctx, live)
                }
                Some(envelope) => Ok(self.ignore(core, ctx, envelope)),
                None => {
                    warn!("{}: receiver {} did not answer", core.id.short(), self.receiver.short());
                    Ok(self.finish(core, ResultCode::NoResponse))
                }
            },
            CoordinatorStage::AmountReservation => self.reserve_next(core, ctx, live),
            CoordinatorStage::FirstNeighborResponseProcessing => match message {
                Some(Envelope { sender, message: Message::IntermediateNodeReservationResponse(response), .. }) => {
                    self.on_first_neighbor_response(core, ctx, sender, response)
                }
                Some(envelope) => Ok(self.ignore(core, ctx, envelope)),
                None => {
                    warn!("{}: first hop did not answer", core.id.short());
                    self.drop_path(core, ctx)
                }
            },
            CoordinatorStage::NextNeighborResponseProcessing => match message {
                Some(Envelope { sender, message: Message::CoordinatorReservationResponse(response), .. }) => {
                    self.on_next_neighbor_response(core, ctx, sender, response)
                }
                Some(Envelope { sender, message: Message::IntermediateNodeReservationRequest(request), .. })
                    if core.kind == PaymentKind::Cycle =>
                {
                    self.on_cycle_closing_request(core, ctx, sender, request)
                }
                Some(envelope) => Ok(self.ignore(core, ctx, envelope)),
                None => {
                    warn!("{}: no reservation response in time", core.id.short());
                    self.drop_path(core, ctx)
                }
            },
            CoordinatorStage::FinalAmountsConfigurationConfirmation => match message {
                Some(Envelope {
                    sender,
                    message: Message::FinalAmountsConfigurationResponse { path_id, state },
                    ..
                }) => self.on_final_amount_confirmation(core, ctx, sender, path_id, state),
                Some(envelope) => Ok(self.ignore(core, ctx, envelope)),
                None => {
                    warn!("{}: final amounts were not confirmed in time", core.id.short());
                    self.drop_path(core, ctx)
                }
            },
            CoordinatorStage::VotesChecking => match message {
                Some(Envelope { sender, message: Message::ParticipantsVotes(votes), .. }) => {
                    self.on_votes(core, ctx, sender, votes)
                }
                Some(envelope) => Ok(self.ignore(core, ctx, envelope)),
                None => {
                    warn!("{}: votes did not come back in time", core.id.short());
                    Ok(self.reject_votes(core, ctx))
                }
            },
        }
    }

    //------------------------------------      Initialisation      ------------------------------------------------//

    fn initialise_payment(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        if self.amount.is_zero() || self.receiver == core.node_id {
            warn!("{}: cannot pay {} to {}", core.id.short(), self.amount, self.receiver.short());
            return self.finish(core, ResultCode::InvalidCommand);
        }
        info!("{}: paying {} to {}", core.id.short(), self.amount, self.receiver.short());
        ctx.outbox.request_paths(core.id, self.receiver);
        self.stage = CoordinatorStage::ReceiverResourceProcessing;
        self.waiting_state(core, ctx).into()
    }

    fn on_paths(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(Resource::Paths { paths, .. }) = core.take_resource() else {
            warn!("{}: no paths to {} in time", core.id.short(), self.receiver.short());
            return Ok(self.finish(core, ResultCode::NoPaths));
        };
        for path in paths {
            if let Err(e) = path.validate_payment(&core.node_id, &self.receiver, ctx.config.max_path_length) {
                debug!("{}: skipping path {path}. {e}", core.id.short());
                continue;
            }
            if self.paths.len() > usize::from(PathId::MAX) || self.paths.iter().any(|p| *p.path() == path) {
                continue;
            }
            self.paths.push(PathStats::new(path));
        }
        if self.paths.is_empty() {
            info!("{}: no usable path to {}", core.id.short(), self.receiver.short());
            return Ok(self.finish(core, ResultCode::NoPaths));
        }
        debug!("{}: {} candidate paths", core.id.short(), self.paths.len());
        core.send(ctx, self.receiver, Message::ReceiverInitPaymentRequest { amount: self.amount });
        self.stage = CoordinatorStage::ReceiverResponseProcessing;
        Ok(self.waiting_state(core, ctx).into())
    }

    fn initialise_cycle(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        live: &dyn LiveTransactions,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(path) = self.paths.first().map(|p| p.path().clone()) else {
            return Err(ProtocolError::runtime("cycle closing without a path"));
        };
        if let Err(e) = path.validate_cycle(&core.node_id, ctx.config.max_path_length) {
            warn!("{}: refusing cycle {path}. {e}", core.id.short());
            return Ok(self.finish(core, ResultCode::InvalidCommand));
        }
        let last = path.intermediates().last().copied().unwrap_or(self.receiver);
        let incoming = ctx.trust_lines.available_incoming_cycle(&last).unwrap_or(TrustLineAmount::ZERO);
        if incoming.is_zero() {
            info!("{}: {} owes nothing to close on cycle {path}", core.id.short(), last.short());
            ctx.outbox.close_edge(last, core.node_id);
            return Ok(self.finish(core, ResultCode::NoCycleAmount));
        }
        info!("{}: closing cycle {path}, up to {incoming}", core.id.short());
        self.amount = incoming;
        self.stage = CoordinatorStage::AmountReservation;
        self.reserve_next(core, ctx, live)
    }

    //------------------------------------    Amount reservation    ------------------------------------------------//

    fn path(&self, path_id: PathId) -> Result<&PathStats, ProtocolError> {
        self.paths.get(usize::from(path_id)).ok_or_else(|| ProtocolError::runtime(format!("no path {path_id}")))
    }

    fn path_mut(&mut self, path_id: PathId) -> Result<&mut PathStats, ProtocolError> {
        self.paths.get_mut(usize::from(path_id)).ok_or_else(|| ProtocolError::runtime(format!("no path {path_id}")))
    }

    fn current(&self) -> Result<PathId, ProtocolError> {
        self.current.ok_or_else(|| ProtocolError::runtime("no path under negotiation"))
    }

    fn next_untried_path(&self) -> Option<PathId> {
        self.paths
            .iter()
            .position(|p| p.is_valid() && !p.is_confirmed() && p.node_state(1) == Some(PathNodeState::NotSent))
            .and_then(|i| PathId::try_from(i).ok())
    }

    /// Opens the next path: reserves toward its first hop and asks the hop to reserve back.
    fn reserve_next(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        live: &dyn LiveTransactions,
    ) -> Result<TransactionResult, ProtocolError> {
        let remaining = self.amount.saturating_sub(self.collected);
        if remaining.is_zero() {
            return self.start_votes(core, ctx);
        }
        let path_id = match self.current.or_else(|| self.next_untried_path()) {
            Some(path_id) => path_id,
            None => return Ok(self.out_of_paths(core, ctx)),
        };
        self.current = Some(path_id);
        let first_hop = self.path(path_id)?.first_hop();
        let available = ctx
            .trust_lines
            .available(&first_hop, ReservationDirection::Outgoing, core.capacity_kind())
            .unwrap_or(TrustLineAmount::ZERO);
        let amount = remaining.min(available);
        if amount.is_zero() {
            let blockers = ctx.trust_lines.blocking_transactions(&first_hop, ReservationDirection::Outgoing, &core.id);
            if let ConflictDecision::WaitFor(winner) = ConflictResolver::resolve(&core.id, &blockers, live) {
                if self.waiting_for != Some(winner) {
                    let (id, hop, winner) = (core.id.short(), first_hop.short(), winner.short());
                    info!("{id}: capacity toward {hop} held by {winner}, waiting");
                }
                self.waiting_for = Some(winner);
                return Ok(TransactionState::awake_after(ctx.config.conflict_poll_delay()).into());
            }
            self.waiting_for = None;
            debug!("{}: nothing available toward {} on path {path_id}", core.id.short(), first_hop.short());
            self.path_mut(path_id)?.invalidate();
            self.current = None;
            if core.kind == PaymentKind::Cycle {
                ctx.outbox.close_edge(core.node_id, first_hop);
                return Ok(self.finish(core, ResultCode::NoCycleAmount));
            }
            return Ok(TransactionState::as_fast_as_possible().into());
        }
        self.waiting_for = None;
        core.reserve(ctx, first_hop, path_id, amount, ReservationDirection::Outgoing)?;
        let stats = self.path_mut(path_id)?;
        stats.start(amount);
        stats.set_node_state(1, PathNodeState::ReservationRequestSent);
        debug!("{}: path {path_id} opened with {amount} toward {}", core.id.short(), first_hop.short());
        let request = ReservationRequest { path_id, amount, coordinator: core.node_id, kind: core.kind };
        core.send(ctx, first_hop, Message::IntermediateNodeReservationRequest(request));
        self.stage = CoordinatorStage::FirstNeighborResponseProcessing;
        Ok(self.waiting_state(core, ctx).into())
    }

    fn on_first_neighbor_response(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        response: ReservationResponse,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let stats = self.path(path_id)?;
        if sender != stats.first_hop() || response.path_id != path_id {
            return Ok(self.ignore_response(core, ctx, sender));
        }
        let direct = stats.path().len() == 2;
        let amount = match response.state {
            ResponseState::Accepted if !response.amount.is_zero() => response.amount,
            state => {
                info!("{}: {} turned down path {path_id} ({state:?})", core.id.short(), sender.short());
                return self.drop_path(core, ctx);
            }
        };
        let stats = self.path_mut(path_id)?;
        let flow = stats.shortage(amount);
        core.shortage_path(ctx, path_id, flow)?;
        if direct {
            stats.set_node_state(1, PathNodeState::ReservationApproved);
            return self.send_final_configuration(core, ctx);
        }
        stats.set_node_state(1, PathNodeState::NeighbourReservationApproved);
        self.ask_next_hop(core, ctx)
    }

    fn ask_next_hop(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let stats = self.path_mut(path_id)?;
        let (Some(node), Some(next_node)) = (stats.current_node(), stats.next_node()) else {
            return Err(ProtocolError::runtime(format!("path {path_id} has no next hop")));
        };
        let amount = stats.flow();
        stats.set_node_state(stats.cursor() + 1, PathNodeState::ReservationRequestSent);
        trace!("{}: asking {} to reserve {amount} toward {}", core.id.short(), node.short(), next_node.short());
        core.send(ctx, node, Message::CoordinatorReservationRequest { path_id, amount, next_node });
        self.stage = CoordinatorStage::NextNeighborResponseProcessing;
        Ok(self.waiting_state(core, ctx).into())
    }

    fn on_next_neighbor_response(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        response: ReservationResponse,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let stats = self.path(path_id)?;
        if stats.current_node() != Some(sender) || response.path_id != path_id {
            return Ok(self.ignore_response(core, ctx, sender));
        }
        let amount = match response.state {
            ResponseState::Accepted if !response.amount.is_zero() => response.amount,
            state => {
                info!("{}: path {path_id} failed after {} ({state:?})", core.id.short(), sender.short());
                return self.drop_path(core, ctx);
            }
        };
        let is_cycle = core.kind == PaymentKind::Cycle;
        let stats = self.path_mut(path_id)?;
        let flow = stats.shortage(amount);
        let reached_tail = stats.is_last_intermediate();
        stats.set_current_state(PathNodeState::ReservationApproved);
        stats.advance();
        core.shortage_path(ctx, path_id, flow)?;
        if !reached_tail {
            self.path_mut(path_id)?.set_current_state(PathNodeState::NeighbourReservationApproved);
            return self.ask_next_hop(core, ctx);
        }
        if is_cycle && core.reserved(ReservationDirection::Incoming, Some(path_id)).is_zero() {
            warn!("{}: the cycle was reported closed but nothing reached this node", core.id.short());
            return self.drop_path(core, ctx);
        }
        self.path_mut(path_id)?.set_current_state(PathNodeState::ReservationApproved);
        self.send_final_configuration(core, ctx)
    }

    /// A cycle closes on its coordinator: the last node of the path asks it to take the amount back.
    fn on_cycle_closing_request(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        request: ReservationRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let last = self.path(path_id)?.path().intermediates().last().copied();
        let path_id_ok = request.path_id == path_id && request.kind == PaymentKind::Cycle;
        let reason = if Some(sender) != last || request.coordinator != core.node_id || !path_id_ok {
            Some(RejectReason::ProtocolViolation)
        } else {
            None
        };
        let amount = match reason {
            Some(_) => TrustLineAmount::ZERO,
            None => request.amount.min(ctx.trust_lines.available_incoming_cycle(&sender)?),
        };
        let reason = reason.or(amount.is_zero().then_some(RejectReason::InsufficientCapacity));
        let response = match reason {
            Some(reason) => {
                info!("{}: refusing to close the cycle from {} ({reason:?})", core.id.short(), sender.short());
                ReservationResponse::rejected(request.path_id, reason)
            }
            None => {
                core.reserve(ctx, sender, path_id, amount, ReservationDirection::Incoming)?;
                ReservationResponse::accepted(path_id, amount)
            }
        };
        core.send(ctx, sender, Message::IntermediateNodeReservationResponse(response));
        Ok(self.waiting_state(core, ctx).into())
    }

    //------------------------------------   Final configuration    ------------------------------------------------//

    fn send_final_configuration(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let stats = self.path(path_id)?;
        if !stats.is_reservation_complete() {
            return Err(ProtocolError::runtime(format!("path {path_id} is not reserved end to end")));
        }
        let amount = stats.flow();
        let participants = stats.participants();
        core.shortage_path(ctx, path_id, amount)?;
        debug!("{}: path {path_id} reserved end to end with {amount}", core.id.short());
        for node in &participants {
            core.send(ctx, *node, Message::FinalPathConfiguration { path_id, amount });
        }
        self.pending_confirmations = participants.into_iter().collect();
        self.stage = CoordinatorStage::FinalAmountsConfigurationConfirmation;
        Ok(self.waiting_state(core, ctx).into())
    }

    fn on_final_amount_confirmation(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        path_id: PathId,
        state: ResponseState,
    ) -> Result<TransactionResult, ProtocolError> {
        if self.current != Some(path_id) || !self.pending_confirmations.contains(&sender) {
            return Ok(self.ignore_response(core, ctx, sender));
        }
        if let ResponseState::Rejected(reason) = state {
            info!("{}: {} refused the final amount of path {path_id} ({reason:?})", core.id.short(), sender.short());
            return self.drop_path(core, ctx);
        }
        self.pending_confirmations.remove(&sender);
        if !self.pending_confirmations.is_empty() {
            return Ok(self.waiting_state(core, ctx).into());
        }
        let stats = self.path_mut(path_id)?;
        stats.confirm();
        let flow = stats.flow();
        self.collected += flow;
        self.current = None;
        let (id, collected, amount) = (core.id.short(), self.collected, self.amount);
        info!("{id}: path {path_id} confirmed with {flow}, {collected} of {amount} collected");
        if core.kind == PaymentKind::Cycle || self.collected >= self.amount {
            return self.start_votes(core, ctx);
        }
        self.stage = CoordinatorStage::AmountReservation;
        Ok(TransactionState::as_fast_as_possible().into())
    }

    /// Abandons the current path: releases its reservations and tells every contacted node to do the same.
    fn drop_path(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = self.current()?;
        let first_hop_failed = self.stage == CoordinatorStage::FirstNeighborResponseProcessing;
        let stats = self.path_mut(path_id)?;
        let edge = match (first_hop_failed, stats.current_node(), stats.next_node()) {
            (false, Some(from), Some(to)) => (from, to),
            _ => (core.node_id, stats.first_hop()),
        };
        let contacted = stats.contacted_nodes();
        stats.invalidate();
        core.release_path(ctx, path_id);
        for node in contacted {
            core.send(ctx, node, Message::FinalPathConfiguration { path_id, amount: TrustLineAmount::ZERO });
        }
        debug!("{}: path {path_id} dropped", core.id.short());
        self.current = None;
        self.pending_confirmations.clear();
        if core.kind == PaymentKind::Cycle {
            ctx.outbox.close_edge(edge.0, edge.1);
            core.rollback(ctx);
            return Ok(self.finish(core, ResultCode::Rejected));
        }
        self.stage = CoordinatorStage::AmountReservation;
        Ok(TransactionState::as_fast_as_possible().into())
    }

    fn out_of_paths(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        info!(
            "{}: paths exhausted with {} of {} collected",
            core.id.short(),
            self.collected,
            self.amount
        );
        self.release_confirmed_paths(core, ctx);
        core.rollback(ctx);
        self.finish(core, ResultCode::InsufficientFunds)
    }

    /// Tells the participants of already confirmed paths that the payment will not happen.
    fn release_confirmed_paths(&self, core: &PaymentCore, ctx: &mut NodeContext<'_>) {
        let confirmed = self.paths.iter().enumerate().filter(|(_, p)| p.is_confirmed());
        for (index, stats) in confirmed {
            let Ok(path_id) = PathId::try_from(index) else { continue };
            for node in stats.participants() {
                core.send(ctx, node, Message::FinalPathConfiguration { path_id, amount: TrustLineAmount::ZERO });
            }
        }
    }

    //------------------------------------          Votes           ------------------------------------------------//

    fn start_votes(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let mut votes = ParticipantsVotesMessage::new(core.node_id);
        for stats in self.paths.iter().filter(|p| p.is_confirmed()) {
            for node in stats.participants() {
                votes.add_participant(node);
            }
        }
        let Some(first) = votes.first_participant() else {
            return Err(ProtocolError::runtime("votes without participants"));
        };
        debug!("{}: collecting votes from {} participants", core.id.short(), votes.participants_count());
        core.send(ctx, first, Message::ParticipantsVotes(votes.clone()));
        core.votes = Some(votes);
        self.stage = CoordinatorStage::VotesChecking;
        Ok(self.waiting_state(core, ctx).persisted().into())
    }

    fn on_votes(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        sender: NodeId,
        votes: ParticipantsVotesMessage,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(sent) = core.votes.as_ref() else {
            return Err(ProtocolError::runtime("votes checking without a ballot"));
        };
        if !votes.has_same_participants(sent) {
            warn!("{}: {} returned a ballot with different participants", core.id.short(), sender.short());
            return Ok(self.reject_votes(core, ctx));
        }
        if votes.contains_rejection() {
            info!("{}: a participant voted against", core.id.short());
            core.votes = Some(votes);
            return Ok(self.reject_votes(core, ctx));
        }
        if !votes.all_participants_approved() || !self.reservations_directions_ok(core) {
            warn!("{}: votes or reservations are inconsistent, rejecting", core.id.short());
            return Ok(self.reject_votes(core, ctx));
        }
        let mut votes = votes;
        votes.approve_by_coordinator();
        let record = match core.kind {
            PaymentKind::Payment => {
                PaymentRecord::new(core.id, PaymentDirection::Outgoing, self.receiver, self.collected)
            }
            PaymentKind::Cycle => {
                PaymentRecord::new(core.id, PaymentDirection::CycleClosing, core.node_id, self.collected)
            }
        };
        core.commit(ctx, &votes, Some(record))?;
        for node in votes.participants() {
            core.send(ctx, node, Message::ParticipantsVotes(votes.clone()));
        }
        core.votes = Some(votes);
        info!("{}: committed {}", core.id.short(), self.collected);
        Ok(self.finish(core, ResultCode::Ok))
    }

    /// Reservations must match the shape of the operation before anything is committed. A payment only sends; a
    /// cycle sends to its first hop exactly what it takes back from its last one.
    fn reservations_directions_ok(&self, core: &PaymentCore) -> bool {
        match core.kind {
            PaymentKind::Payment => {
                core.reserved(ReservationDirection::Incoming, None).is_zero()
                    && core.reserved(ReservationDirection::Outgoing, None) == self.collected
                    && self.collected == self.amount
            }
            PaymentKind::Cycle => {
                let mut singles = core.reservations.values().filter_map(|list| match list.as_slice() {
                    [single] => Some((single.direction(), single.amount())),
                    _ => None,
                });
                match (singles.next(), singles.next(), core.reservations.len()) {
                    (Some((first, a)), Some((second, b)), 2) => {
                        first == second.opposite() && a == b && a == self.collected
                    }
                    _ => false,
                }
            }
        }
    }

    /// Rejects on behalf of the coordinator, tells every participant, keeps the verdict for later status requests
    /// and releases everything.
    fn reject_votes(&mut self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) -> TransactionResult {
        self.notify_rejection(core, ctx);
        if let Some(votes) = core.votes.clone() {
            let mut io = ctx.begin_io();
            io.save_votes(core.id, &votes);
            io.delete_transaction(core.id);
            match io.commit() {
                Ok(()) => core.persisted = false,
                Err(e) => warn!("{}: could not record the rejected votes. {e}", core.id.short()),
            }
        }
        core.rollback(ctx);
        if core.kind == PaymentKind::Cycle {
            if let Some(stats) = self.paths.first() {
                ctx.outbox.close_edge(core.node_id, stats.first_hop());
            }
        }
        self.finish(core, ResultCode::Rejected)
    }

    fn notify_rejection(&self, core: &mut PaymentCore, ctx: &mut NodeContext<'_>) {
        let Some(mut votes) = core.votes.take() else { return };
        votes.reject_by_coordinator();
        for node in votes.participants() {
            core.send(ctx, node, Message::ParticipantsVotes(votes.clone()));
        }
        core.votes = Some(votes);
    }

    /// Unwinds after a failed step and reports the failure.
    pub(crate) fn abort(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        error: &ProtocolError,
    ) -> CommandResult {
        if self.stage == CoordinatorStage::VotesChecking {
            self.notify_rejection(core, ctx);
        } else {
            self.release_confirmed_paths(core, ctx);
            let current = self.current.and_then(|p| self.paths.get(usize::from(p)).map(|stats| (p, stats)));
            if let Some((path_id, stats)) = current {
                for node in stats.contacted_nodes() {
                    core.send(ctx, node, Message::FinalPathConfiguration { path_id, amount: TrustLineAmount::ZERO });
                }
            }
        }
        core.rollback(ctx);
        CommandResult {
            transaction_id: core.id,
            kind: core.kind,
            code: ResultCode::from_error(error),
            amount: TrustLineAmount::ZERO,
        }
    }

    //------------------------------------         Helpers          ------------------------------------------------//

    fn waiting_state(&self, core: &PaymentCore, ctx: &NodeContext<'_>) -> TransactionState {
        let config = ctx.config;
        match self.stage {
            CoordinatorStage::Initialisation | CoordinatorStage::AmountReservation => {
                TransactionState::as_fast_as_possible()
            }
            CoordinatorStage::ReceiverResourceProcessing => {
                TransactionState::wait_for_resources(&[ResourceType::Paths], config.resource_timeout())
            }
            CoordinatorStage::ReceiverResponseProcessing => TransactionState::wait_for_messages(
                &[MessageType::ReceiverInitPaymentResponse],
                config.max_network_delay(2),
            ),
            CoordinatorStage::FirstNeighborResponseProcessing => TransactionState::wait_for_messages(
                &[MessageType::IntermediateNodeReservationResponse],
                config.max_network_delay(2),
            ),
            CoordinatorStage::NextNeighborResponseProcessing if core.kind == PaymentKind::Cycle => {
                TransactionState::wait_for_messages(
                    &[MessageType::CoordinatorReservationResponse, MessageType::IntermediateNodeReservationRequest],
                    config.max_network_delay(4),
                )
            }
            CoordinatorStage::NextNeighborResponseProcessing => TransactionState::wait_for_messages(
                &[MessageType::CoordinatorReservationResponse],
                config.max_network_delay(4),
            ),
            CoordinatorStage::FinalAmountsConfigurationConfirmation => TransactionState::wait_for_messages(
                &[MessageType::FinalAmountsConfigurationResponse],
                config.max_network_delay(2),
            ),
            CoordinatorStage::VotesChecking => {
                TransactionState::wait_for_messages(&[MessageType::ParticipantsVotes], core.votes_timeout(ctx))
            }
        }
    }

    fn ignore(&self, core: &PaymentCore, ctx: &NodeContext<'_>, envelope: Envelope) -> TransactionResult {
        debug!("{}: ignoring {envelope} in {:?}", core.id.short(), self.stage);
        self.waiting_state(core, ctx).keeping_deadline().into()
    }

    fn ignore_response(&self, core: &PaymentCore, ctx: &NodeContext<'_>, sender: NodeId) -> TransactionResult {
        debug!("{}: ignoring a stray response from {} in {:?}", core.id.short(), sender.short(), self.stage);
        self.waiting_state(core, ctx).keeping_deadline().into()
    }

    fn finish(&self, core: &PaymentCore, code: ResultCode) -> TransactionResult {
        let amount = if code == ResultCode::Ok { self.collected } else { TrustLineAmount::ZERO };
        TransactionResult::Command(CommandResult { transaction_id: core.id, kind: core.kind, code, amount })
    }
}
