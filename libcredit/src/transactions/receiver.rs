use crate::amount::TrustLineAmount;
use crate::error::ProtocolError;
use crate::ids::{NodeId, PathId};
use crate::messages::{
    Envelope, Message, MessageType, PaymentKind, RejectReason, ReservationRequest, ReservationResponse, ResponseState,
};
use crate::storage::{PaymentDirection, PaymentRecord};
use crate::transactions::context::NodeContext;
use crate::transactions::payment::PaymentCore;
use crate::transactions::result::{MessageResult, Outcome, RoleKind, TransactionResult, TransactionState};
use crate::transactions::votes::VotesOutcome;
use crate::trust_lines::ReservationDirection;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverStage {
    CoordinatorRequestApproving,
    AmountReservationsProcessing,
    VotesChecking,
    Recovery,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IncomingPath {
    previous: NodeId,
    amount: TrustLineAmount,
    confirmed: bool,
}

/// The payee. Collects incoming reservations from any neighbour until they add up to the requested amount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverRole {
    stage: ReceiverStage,
    amount: TrustLineAmount,
    paths: BTreeMap<PathId, IncomingPath>,
}

impl ReceiverRole {
    pub(crate) fn new() -> Self {
        ReceiverRole {
            stage: ReceiverStage::CoordinatorRequestApproving,
            amount: TrustLineAmount::ZERO,
            paths: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> ReceiverStage {
        self.stage
    }

    pub fn amount(&self) -> TrustLineAmount {
        self.amount
    }

    pub(crate) fn prepare_recovery(&mut self) {
        self.stage = ReceiverStage::Recovery;
    }

    pub(crate) fn run(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
    ) -> Result<TransactionResult, ProtocolError> {
        let message = core.pop_message();
        match self.stage {
            ReceiverStage::CoordinatorRequestApproving => match message {
                Some(Envelope { sender, message: Message::ReceiverInitPaymentRequest { amount }, .. })
                    if sender == core.coordinator =>
                {
                    Ok(self.on_init_request(core, ctx, amount))
                }
                _ => Ok(self.result(core, Outcome::RolledBack)),
            },
            ReceiverStage::AmountReservationsProcessing | ReceiverStage::VotesChecking => match message {
                Some(Envelope { sender, message: Message::IntermediateNodeReservationRequest(request), .. })
                    if !core.voted =>
                {
                    self.on_reservation_request(core, ctx, sender, request)
                }
                Some(Envelope { message: Message::FinalPathConfiguration { path_id, amount }, .. }) if !core.voted => {
                    self.on_final_path_configuration(core, ctx, path_id, amount)
                }
                Some(Envelope { sender, message: Message::ParticipantsVotes(votes), .. }) => {
                    let valid = self.reservations_match(core);
                    let outcome = core.process_votes(ctx, sender, votes, valid, Some(self.record(core)));
                    Ok(self.apply_votes_outcome(core, ctx, outcome))
                }
                Some(envelope) => {
                    debug!("{}: ignoring {envelope}", core.id.short());
                    Ok(self.waiting_state(core, ctx).keeping_deadline().into())
                }
                None if self.stage == ReceiverStage::AmountReservationsProcessing => {
                    warn!(
                        "{}: collected {} of {} before the timeout, rolling back",
                        core.id.short(),
                        self.collected(),
                        self.amount
                    );
                    core.rollback(ctx);
                    Ok(self.result(core, Outcome::RolledBack))
                }
                None => {
                    warn!("{}: no votes in time, starting recovery", core.id.short());
                    self.stage = ReceiverStage::Recovery;
                    let outcome = core.recovery_step(ctx, Some(self.record(core)));
                    Ok(self.apply_votes_outcome(core, ctx, outcome))
                }
            },
            ReceiverStage::Recovery => {
                let record = Some(self.record(core));
                let outcome = match message {
                    Some(Envelope { message: Message::VotesStatusResponse(status), .. }) => {
                        core.process_votes_status(ctx, status, record)
                    }
                    Some(Envelope { sender, message: Message::ParticipantsVotes(votes), .. }) => {
                        let valid = self.reservations_match(core);
                        core.process_votes(ctx, sender, votes, valid, record)
                    }
                    _ => core.recovery_step(ctx, record),
                };
                Ok(self.apply_votes_outcome(core, ctx, outcome))
            }
        }
    }

    fn on_init_request(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        amount: TrustLineAmount,
    ) -> TransactionResult {
        let available = ctx.trust_lines.total_incoming_available();
        let state = if amount.is_zero() {
            ResponseState::Rejected(RejectReason::ProtocolViolation)
        } else if available < amount {
            ResponseState::Rejected(RejectReason::InsufficientCapacity)
        } else {
            ResponseState::Accepted
        };
        core.send(ctx, core.coordinator, Message::ReceiverInitPaymentResponse { state });
        if !state.is_accepted() {
            info!("{}: refusing {amount} from {} (can take {available})", core.id.short(), core.coordinator.short());
            return self.result(core, Outcome::RolledBack);
        }
        info!("{}: expecting {amount} from {}", core.id.short(), core.coordinator.short());
        self.amount = amount;
        self.stage = ReceiverStage::AmountReservationsProcessing;
        self.waiting_state(core, ctx).into()
    }

    fn on_reservation_request(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        previous: NodeId,
        request: ReservationRequest,
    ) -> Result<TransactionResult, ProtocolError> {
        let path_id = request.path_id;
        let rejection = if request.coordinator != core.coordinator
            || request.kind != PaymentKind::Payment
            || self.paths.contains_key(&path_id)
        {
            Some(RejectReason::ProtocolViolation)
        } else if !ctx.trust_lines.is_neighbor(&previous) {
            Some(RejectReason::NoTrustLine)
        } else if self.collected() + request.amount > self.amount {
            Some(RejectReason::Overshoot)
        } else {
            None
        };
        let amount = match rejection {
            Some(_) => TrustLineAmount::ZERO,
            None => request.amount.min(ctx.trust_lines.available_incoming(&previous)?),
        };
        let rejection = rejection.or(amount.is_zero().then_some(RejectReason::InsufficientCapacity));
        if let Some(reason) = rejection {
            info!("{}: rejecting path {path_id} from {} ({reason:?})", core.id.short(), previous.short());
            let response = ReservationResponse::rejected(path_id, reason);
            core.send(ctx, previous, Message::IntermediateNodeReservationResponse(response));
            return Ok(self.waiting_state(core, ctx).keeping_deadline().into());
        }
        core.reserve(ctx, previous, path_id, amount, ReservationDirection::Incoming)?;
        self.paths.insert(path_id, IncomingPath { previous, amount, confirmed: false });
        debug!("{}: reserved {amount} from {} on path {path_id}", core.id.short(), previous.short());
        let response = ReservationResponse::accepted(path_id, amount);
        core.send(ctx, previous, Message::IntermediateNodeReservationResponse(response));
        self.update_stage();
        Ok(self.waiting_state(core, ctx).into())
    }

    fn on_final_path_configuration(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<TransactionResult, ProtocolError> {
        let Some(reserved) = self.paths.get(&path_id).map(|p| p.amount) else {
            debug!("{}: final configuration for unknown path {path_id}", core.id.short());
            return Ok(self.waiting_state(core, ctx).into());
        };
        if amount.is_zero() || amount > reserved {
            if !amount.is_zero() {
                warn!("{}: final amount {amount} above the reserved {reserved}", core.id.short());
                let state = ResponseState::Rejected(RejectReason::Overshoot);
                core.send(ctx, core.coordinator, Message::FinalAmountsConfigurationResponse { path_id, state });
            }
            core.release_path(ctx, path_id);
            self.paths.remove(&path_id);
            self.update_stage();
            return Ok(self.waiting_state(core, ctx).into());
        }
        core.shortage_path(ctx, path_id, amount)?;
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.amount = amount;
            path.confirmed = true;
        }
        let state = ResponseState::Accepted;
        core.send(ctx, core.coordinator, Message::FinalAmountsConfigurationResponse { path_id, state });
        self.update_stage();
        Ok(self.waiting_state(core, ctx).into())
    }

    fn collected(&self) -> TrustLineAmount {
        self.paths.values().map(|p| p.amount).sum()
    }

    fn update_stage(&mut self) {
        self.stage = if self.collected() == self.amount {
            ReceiverStage::VotesChecking
        } else {
            ReceiverStage::AmountReservationsProcessing
        };
    }

    fn waiting_state(&self, core: &PaymentCore, ctx: &NodeContext<'_>) -> TransactionState {
        if core.voted {
            return core.final_votes_state(ctx);
        }
        let timeout = match self.stage {
            ReceiverStage::VotesChecking => core.votes_timeout(ctx),
            _ => ctx.config.receiver_reservations_timeout(),
        };
        TransactionState::wait_for_messages(
            &[
                MessageType::IntermediateNodeReservationRequest,
                MessageType::FinalPathConfiguration,
                MessageType::ParticipantsVotes,
            ],
            timeout,
        )
    }

    /// The whole amount arrived over confirmed paths, and nothing leaves this node.
    fn reservations_match(&self, core: &PaymentCore) -> bool {
        self.collected() == self.amount
            && self.paths.values().all(|p| p.confirmed)
            && core.reserved(ReservationDirection::Incoming, None) == self.amount
            && core.reserved(ReservationDirection::Outgoing, None).is_zero()
    }

    fn record(&self, core: &PaymentCore) -> PaymentRecord {
        PaymentRecord::new(core.id, PaymentDirection::Incoming, core.coordinator, self.amount)
    }

    fn apply_votes_outcome(
        &mut self,
        core: &mut PaymentCore,
        ctx: &mut NodeContext<'_>,
        outcome: VotesOutcome,
    ) -> TransactionResult {
        match outcome {
            VotesOutcome::Waiting(state) => {
                self.stage = ReceiverStage::VotesChecking;
                state.into()
            }
            VotesOutcome::Recovering(state) => {
                self.stage = ReceiverStage::Recovery;
                state.into()
            }
            VotesOutcome::Committed => {
                info!("{}: received {} from {}", core.id.short(), self.amount, core.coordinator.short());
                self.result(core, Outcome::Committed)
            }
            VotesOutcome::RolledBack => self.result(core, Outcome::RolledBack),
            VotesOutcome::Ignored => {
                if self.stage == ReceiverStage::Recovery {
                    self.stage = ReceiverStage::VotesChecking;
                }
                self.waiting_state(core, ctx).into()
            }
        }
    }

    fn result(&self, core: &PaymentCore, outcome: Outcome) -> TransactionResult {
        let amount = match outcome {
            Outcome::Committed => self.amount,
            Outcome::RolledBack => TrustLineAmount::ZERO,
        };
        TransactionResult::Message(MessageResult { transaction_id: core.id, role: RoleKind::Receiver, outcome, amount })
    }
}
