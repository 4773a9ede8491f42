use crate::amount::TrustLineAmount;
use crate::error::ProtocolError;
use crate::ids::{NodeId, PathId, TransactionId};
use crate::messages::{Envelope, Message, MessageType, ParticipantsVotesMessage, PaymentKind};
use crate::paths::Path;
use crate::storage::PaymentRecord;
use crate::transactions::context::{LiveTransactions, NodeContext};
use crate::transactions::coordinator::CoordinatorRole;
use crate::transactions::intermediate::IntermediateRole;
use crate::transactions::receiver::ReceiverRole;
use crate::transactions::result::{CommandResult, RoleKind, TransactionResult};
use crate::transactions::Resource;
use crate::trust_lines::{AmountReservation, CapacityKind, ReservationDirection, TrustLineError, TrustLinesManager};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// State every role of a payment carries: identity, the reservations held on behalf of the payment and the votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PaymentCore {
    pub(crate) id: TransactionId,
    pub(crate) node_id: NodeId,
    pub(crate) coordinator: NodeId,
    pub(crate) kind: PaymentKind,
    pub(crate) reservations: BTreeMap<NodeId, Vec<AmountReservation>>,
    /// The last votes message this node saw or produced.
    pub(crate) votes: Option<ParticipantsVotesMessage>,
    /// This node approved and forwarded the votes. From here on only the coordinator decides.
    pub(crate) voted: bool,
    pub(crate) recovery_attempts: u8,
    pub(crate) probe_sent: bool,
    pub(crate) persisted: bool,
    pub(crate) step: u32,
    #[serde(skip)]
    inbox: VecDeque<Envelope>,
    #[serde(skip)]
    resources: Vec<Resource>,
}

impl PaymentCore {
    fn new(id: TransactionId, node_id: NodeId, coordinator: NodeId, kind: PaymentKind) -> Self {
        PaymentCore {
            id,
            node_id,
            coordinator,
            kind,
            reservations: BTreeMap::new(),
            votes: None,
            voted: false,
            recovery_attempts: 0,
            probe_sent: false,
            persisted: false,
            step: 0,
            inbox: VecDeque::new(),
            resources: Vec::new(),
        }
    }

    pub(crate) fn capacity_kind(&self) -> CapacityKind {
        match self.kind {
            PaymentKind::Payment => CapacityKind::Regular,
            PaymentKind::Cycle => CapacityKind::Cycle,
        }
    }

    pub(crate) fn pop_message(&mut self) -> Option<Envelope> {
        self.inbox.pop_front()
    }

    pub(crate) fn take_resource(&mut self) -> Option<Resource> {
        self.resources.pop()
    }

    pub(crate) fn send(&self, ctx: &mut NodeContext<'_>, recipient: NodeId, message: Message) {
        ctx.send(recipient, self.id, message);
    }

    //------------------------------------       Reservations       ------------------------------------------------//

    pub(crate) fn reserve(
        &mut self,
        ctx: &mut NodeContext<'_>,
        contractor: NodeId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    ) -> Result<AmountReservation, TrustLineError> {
        let kind = self.capacity_kind();
        let reservation = ctx.trust_lines.reserve(contractor, self.id, path_id, amount, direction, kind)?;
        trace!("{}: reserved {amount} {direction} with {} on path {path_id}", self.id.short(), contractor.short());
        self.reservations.entry(contractor).or_default().push(reservation.clone());
        Ok(reservation)
    }

    /// Shrinks every reservation of `path_id` that holds more than `amount`.
    pub(crate) fn shortage_path(
        &mut self,
        ctx: &mut NodeContext<'_>,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<(), TrustLineError> {
        for (contractor, list) in self.reservations.iter_mut() {
            for reservation in list.iter_mut().filter(|r| r.path_id() == path_id && r.amount() > amount) {
                *reservation = ctx.trust_lines.shortage(contractor, reservation, amount)?;
            }
        }
        Ok(())
    }

    pub(crate) fn release_path(&mut self, ctx: &mut NodeContext<'_>, path_id: PathId) {
        let id = self.id;
        for (contractor, list) in self.reservations.iter_mut() {
            list.retain(|r| {
                if r.path_id() != path_id {
                    return true;
                }
                if let Err(e) = ctx.trust_lines.release(contractor, r) {
                    warn!("{}: could not release reservation {} on path {path_id}. {e}", id.short(), r.id());
                }
                false
            });
        }
        self.reservations.retain(|_, list| !list.is_empty());
    }

    /// Releases every reservation this transaction holds.
    pub(crate) fn rollback(&mut self, ctx: &mut NodeContext<'_>) {
        let mut released = 0;
        for (contractor, list) in std::mem::take(&mut self.reservations) {
            for reservation in list {
                match ctx.trust_lines.release(&contractor, &reservation) {
                    Ok(()) => released += 1,
                    Err(e) => warn!("{}: could not release reservation {}. {e}", self.id.short(), reservation.id()),
                }
            }
        }
        debug!("{}: rolled back, {released} reservations released", self.id.short());
    }

    pub(crate) fn has_reservations(&self) -> bool {
        !self.reservations.is_empty()
    }

    pub(crate) fn path_ids(&self) -> BTreeSet<PathId> {
        self.reservations.values().flatten().map(AmountReservation::path_id).collect()
    }

    /// Sum of this transaction's reservations in `direction`, optionally restricted to one path.
    pub(crate) fn reserved(&self, direction: ReservationDirection, path_id: Option<PathId>) -> TrustLineAmount {
        self.reservations
            .values()
            .flatten()
            .filter(|r| r.direction() == direction && path_id.is_none_or(|p| r.path_id() == p))
            .map(AmountReservation::amount)
            .sum()
    }

    pub(crate) fn restore_reservations(&self, trust_lines: &mut TrustLinesManager) -> Result<(), TrustLineError> {
        for (contractor, list) in &self.reservations {
            for reservation in list {
                trust_lines.restore_reservation(*contractor, reservation.clone())?;
            }
        }
        Ok(())
    }

    //------------------------------------          Commit          ------------------------------------------------//

    /// Makes the payment durable, then applies it in memory.
    ///
    /// The new trust lines, the votes and `record` are written in one batch that also drops the transaction snapshot.
    /// If the batch fails nothing changes, and the reservations are still held.
    pub(crate) fn commit(
        &mut self,
        ctx: &mut NodeContext<'_>,
        votes: &ParticipantsVotesMessage,
        record: Option<PaymentRecord>,
    ) -> Result<(), ProtocolError> {
        let updated = ctx.trust_lines.preview_commit(&self.id)?;
        let mut io = ctx.begin_io();
        for line in &updated {
            io.save_trust_line(line);
        }
        io.save_votes(self.id, votes);
        if let Some(record) = record {
            io.save_payment_record(record);
        }
        io.delete_transaction(self.id);
        io.commit()?;
        ctx.trust_lines.commit(&self.id)?;
        self.reservations.clear();
        self.persisted = false;
        Ok(())
    }
}

/// What a node does in a given payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Role {
    /// Started the payment or the cycle closing.
    Coordinator(CoordinatorRole),
    Intermediate(IntermediateRole),
    Receiver(ReceiverRole),
}

/// One node's share of a payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentTransaction {
    core: PaymentCore,
    role: Role,
}

impl PaymentTransaction {
    /// A payment of `amount` from this node to `receiver`.
    pub fn payment(id: TransactionId, node_id: NodeId, receiver: NodeId, amount: TrustLineAmount) -> Self {
        PaymentTransaction {
            core: PaymentCore::new(id, node_id, node_id, PaymentKind::Payment),
            role: Role::Coordinator(CoordinatorRole::payment(receiver, amount)),
        }
    }

    /// Closes the debt cycle `path`, which starts and ends at this node.
    pub fn cycle_closing(id: TransactionId, node_id: NodeId, path: Path) -> Self {
        PaymentTransaction {
            core: PaymentCore::new(id, node_id, node_id, PaymentKind::Cycle),
            role: Role::Coordinator(CoordinatorRole::cycle(path)),
        }
    }

    /// The intermediate side of a payment, created from the first reservation request reaching this node.
    pub fn intermediate(node_id: NodeId, envelope: Envelope) -> Result<Self, ProtocolError> {
        let Message::IntermediateNodeReservationRequest(request) = &envelope.message else {
            let message_type = envelope.message_type();
            return Err(ProtocolError::value(format!("{message_type} cannot start an intermediate transaction")));
        };
        let mut core = PaymentCore::new(envelope.transaction_id, node_id, request.coordinator, request.kind);
        core.inbox.push_back(envelope);
        Ok(PaymentTransaction { core, role: Role::Intermediate(IntermediateRole::new()) })
    }

    /// The receiver side of a payment, created from the coordinator's init request.
    pub fn receiver(node_id: NodeId, envelope: Envelope) -> Result<Self, ProtocolError> {
        if envelope.message_type() != MessageType::ReceiverInitPaymentRequest {
            let message_type = envelope.message_type();
            return Err(ProtocolError::value(format!("{message_type} cannot start a receiver transaction")));
        }
        let mut core = PaymentCore::new(envelope.transaction_id, node_id, envelope.sender, PaymentKind::Payment);
        core.inbox.push_back(envelope);
        Ok(PaymentTransaction { core, role: Role::Receiver(ReceiverRole::new()) })
    }

    pub fn id(&self) -> TransactionId {
        self.core.id
    }

    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    pub fn coordinator(&self) -> NodeId {
        self.core.coordinator
    }

    pub fn kind(&self) -> PaymentKind {
        self.core.kind
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_kind(&self) -> RoleKind {
        match self.role {
            Role::Coordinator(_) => RoleKind::Coordinator,
            Role::Intermediate(_) => RoleKind::Intermediate,
            Role::Receiver(_) => RoleKind::Receiver,
        }
    }

    pub fn is_cycle_closer(&self) -> bool {
        matches!(self.role, Role::Coordinator(_)) && self.core.kind == PaymentKind::Cycle
    }

    /// Number of steps run so far.
    pub fn step(&self) -> u32 {
        self.core.step
    }

    pub fn is_persisted(&self) -> bool {
        self.core.persisted
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.core.persisted = true;
    }

    pub fn reservations(&self) -> impl Iterator<Item = (&NodeId, &AmountReservation)> {
        self.core.reservations.iter().flat_map(|(c, list)| list.iter().map(move |r| (c, r)))
    }

    pub fn push_message(&mut self, envelope: Envelope) {
        self.core.inbox.push_back(envelope);
    }

    pub fn push_resource(&mut self, resource: Resource) {
        self.core.resources.push(resource);
    }

    /// Runs one step. Whatever the step did not consume from the inbox is dropped afterwards.
    pub fn run(
        &mut self,
        ctx: &mut NodeContext<'_>,
        live: &dyn LiveTransactions,
    ) -> Result<TransactionResult, ProtocolError> {
        self.core.step += 1;
        trace!("{}: step {} as {:?}", self.core.id.short(), self.core.step, self.role_kind());
        let result = match &mut self.role {
            Role::Coordinator(role) => role.run(&mut self.core, ctx, live),
            Role::Intermediate(role) => role.run(&mut self.core, ctx),
            Role::Receiver(role) => role.run(&mut self.core, ctx),
        };
        self.core.inbox.clear();
        self.core.resources.clear();
        result
    }

    /// Unwinds a transaction whose step failed. Returns the terminal result for locally started transactions.
    pub fn abort(&mut self, ctx: &mut NodeContext<'_>, error: &ProtocolError) -> Option<CommandResult> {
        warn!("{}: aborting. {error}", self.core.id.short());
        match &mut self.role {
            Role::Coordinator(role) => Some(role.abort(&mut self.core, ctx, error)),
            Role::Intermediate(_) | Role::Receiver(_) => {
                self.core.rollback(ctx);
                None
            }
        }
    }

    /// Puts the reservations of a transaction loaded from storage back into `trust_lines`.
    pub fn restore_reservations(&self, trust_lines: &mut TrustLinesManager) -> Result<(), ProtocolError> {
        self.core.restore_reservations(trust_lines)?;
        Ok(())
    }

    /// Prepares a transaction loaded from storage to resume. Participants ask the coordinator for the outcome; a
    /// coordinator that crashed before committing rejects.
    pub fn prepare_recovery(&mut self) {
        self.core.recovery_attempts = 0;
        self.core.probe_sent = false;
        self.core.persisted = true;
        match &mut self.role {
            Role::Coordinator(role) => role.prepare_recovery(),
            Role::Intermediate(role) => role.prepare_recovery(),
            Role::Receiver(role) => role.prepare_recovery(),
        }
    }
}
