use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rentflow_core::{
    Aggregate, AggregateRoot, DomainError, ItemId, LineId, LocationId, TransactionId, UnitId,
};
use rentflow_events::Event;

use crate::charge::{ExtraCharge, RatePeriod, compute_line_charge, rental_days_used};
use crate::returns::RentalReturn;

/// Stored lifecycle status of a rental line. OVERDUE is derived, see
/// [`RentalLine::is_overdue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalLineStatus {
    Booked,
    Active,
    PartiallyReturned,
    Returned,
    Closed,
    Cancelled,
}

impl RentalLineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RentalLineStatus::Booked => "booked",
            RentalLineStatus::Active => "active",
            RentalLineStatus::PartiallyReturned => "partially_returned",
            RentalLineStatus::Returned => "returned",
            RentalLineStatus::Closed => "closed",
            RentalLineStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RentalLineStatus::Closed | RentalLineStatus::Cancelled)
    }

    /// Units are out with the customer.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            RentalLineStatus::Active | RentalLineStatus::PartiallyReturned
        )
    }

    /// Status after a return brings the cumulative returned quantity to `returned`.
    pub fn after_return(returned: u32, quantity: u32) -> Self {
        if returned >= quantity {
            RentalLineStatus::Returned
        } else {
            RentalLineStatus::PartiallyReturned
        }
    }
}

impl core::fmt::Display for RentalLineStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a line's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<RentalLineStatus>,
    pub to: RentalLineStatus,
    /// Business date of the transition.
    pub on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Read view of a line's lifecycle at a given business date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalLifecycle {
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub status: RentalLineStatus,
    pub overdue: bool,
    pub quantity: u32,
    pub returned_quantity: u32,
    pub rental_start: NaiveDate,
    pub rental_end: NaiveDate,
    pub status_history: Vec<StatusChange>,
}

/// Aggregate root: RentalLine (one item/quantity entry of a rental transaction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalLine {
    id: LineId,
    transaction_id: TransactionId,
    item_id: ItemId,
    location_id: LocationId,
    quantity: u32,
    unit_rate: i64,
    rate_period: RatePeriod,
    daily_late_rate: i64,
    rental_start: NaiveDate,
    rental_end: NaiveDate,
    discount: i64,
    tax: i64,
    extra_charges: Vec<ExtraCharge>,
    status: RentalLineStatus,
    allocated_unit_ids: Vec<UnitId>,
    returns: Vec<RentalReturn>,
    returned_quantity: u32,
    status_history: Vec<StatusChange>,
    booked_at: Option<DateTime<Utc>>,
    settled_amount: Option<i64>,
    version: u64,
    created: bool,
}

impl RentalLine {
    /// Create an empty, not-yet-booked aggregate instance for rehydration.
    pub fn empty(id: LineId) -> Self {
        let epoch = NaiveDate::default();
        Self {
            id,
            transaction_id: TransactionId::from_uuid(uuid::Uuid::nil()),
            item_id: ItemId::from_uuid(uuid::Uuid::nil()),
            location_id: LocationId::from_uuid(uuid::Uuid::nil()),
            quantity: 0,
            unit_rate: 0,
            rate_period: RatePeriod::daily(),
            daily_late_rate: 0,
            rental_start: epoch,
            rental_end: epoch,
            discount: 0,
            tax: 0,
            extra_charges: Vec::new(),
            status: RentalLineStatus::Booked,
            allocated_unit_ids: Vec::new(),
            returns: Vec::new(),
            returned_quantity: 0,
            status_history: Vec::new(),
            booked_at: None,
            settled_amount: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> LineId {
        self.id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn unit_rate(&self) -> i64 {
        self.unit_rate
    }

    pub fn rate_period(&self) -> RatePeriod {
        self.rate_period
    }

    pub fn daily_late_rate(&self) -> i64 {
        self.daily_late_rate
    }

    pub fn rental_start(&self) -> NaiveDate {
        self.rental_start
    }

    pub fn rental_end(&self) -> NaiveDate {
        self.rental_end
    }

    pub fn discount(&self) -> i64 {
        self.discount
    }

    pub fn tax(&self) -> i64 {
        self.tax
    }

    pub fn extra_charges(&self) -> &[ExtraCharge] {
        &self.extra_charges
    }

    pub fn status(&self) -> RentalLineStatus {
        self.status
    }

    pub fn allocated_unit_ids(&self) -> &[UnitId] {
        &self.allocated_unit_ids
    }

    pub fn returns(&self) -> &[RentalReturn] {
        &self.returns
    }

    /// Paid amount pinned to this line when it closed.
    pub fn settled_amount(&self) -> Option<i64> {
        self.settled_amount
    }

    pub fn returned_quantity(&self) -> u32 {
        self.returned_quantity
    }

    pub fn outstanding_quantity(&self) -> u32 {
        self.quantity.saturating_sub(self.returned_quantity)
    }

    pub fn status_history(&self) -> &[StatusChange] {
        &self.status_history
    }

    pub fn booked_at(&self) -> Option<DateTime<Utc>> {
        self.booked_at
    }

    pub fn is_booked(&self) -> bool {
        self.created
    }

    /// Units allocated to the line that have not come back yet.
    pub fn units_out(&self) -> Vec<UnitId> {
        self.allocated_unit_ids
            .iter()
            .copied()
            .filter(|u| !self.has_returned_unit(*u))
            .collect()
    }

    pub fn has_returned_unit(&self, unit_id: UnitId) -> bool {
        self.returns
            .iter()
            .flat_map(|r| r.lines.iter())
            .any(|l| l.unit_id == unit_id)
    }

    pub fn find_return_by_key(&self, idempotency_key: &str) -> Option<&RentalReturn> {
        self.returns
            .iter()
            .find(|r| r.idempotency_key == idempotency_key)
    }

    pub fn is_overdue(&self, as_of: NaiveDate) -> bool {
        self.status.is_open() && as_of > self.rental_end && self.returned_quantity < self.quantity
    }

    pub fn lifecycle(&self, as_of: NaiveDate) -> RentalLifecycle {
        RentalLifecycle {
            line_id: self.id,
            transaction_id: self.transaction_id,
            status: self.status,
            overdue: self.is_overdue(as_of),
            quantity: self.quantity,
            returned_quantity: self.returned_quantity,
            rental_start: self.rental_start,
            rental_end: self.rental_end,
            status_history: self.status_history.clone(),
        }
    }

    fn push_status(
        &mut self,
        to: RentalLineStatus,
        on: NaiveDate,
        occurred_at: DateTime<Utc>,
    ) {
        let from = if self.status_history.is_empty() {
            None
        } else {
            Some(self.status)
        };
        self.status = to;
        self.status_history.push(StatusChange {
            from,
            to,
            on,
            occurred_at,
        });
    }
}

impl AggregateRoot for RentalLine {
    type Id = LineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: BookLine (units have already been reserved by the inventory ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLine {
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: u32,
    pub unit_rate: i64,
    pub rate_period: RatePeriod,
    pub daily_late_rate: i64,
    pub rental_start: NaiveDate,
    pub rental_end: NaiveDate,
    pub discount: i64,
    pub tax: i64,
    pub unit_ids: Vec<UnitId>,
    pub booked_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ActivateLine (units have already been moved to RENTED).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateLine {
    pub line_id: LineId,
    pub activated_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordReturn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReturn {
    pub line_id: LineId,
    pub rental_return: RentalReturn,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddExtraCharge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddExtraCharge {
    pub line_id: LineId,
    pub charge: ExtraCharge,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CloseLine. `paid_amount` is the share of the transaction's
/// payments allocated to this line at close time; it must equal the line total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseLine {
    pub line_id: LineId,
    pub paid_amount: i64,
    pub closed_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelLine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelLine {
    pub line_id: LineId,
    pub cancelled_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalLineCommand {
    BookLine(BookLine),
    ActivateLine(ActivateLine),
    RecordReturn(RecordReturn),
    AddExtraCharge(AddExtraCharge),
    CloseLine(CloseLine),
    CancelLine(CancelLine),
}

/// Event: LineBooked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineBooked {
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: u32,
    pub unit_rate: i64,
    pub rate_period: RatePeriod,
    pub daily_late_rate: i64,
    pub rental_start: NaiveDate,
    pub rental_end: NaiveDate,
    pub discount: i64,
    pub tax: i64,
    pub unit_ids: Vec<UnitId>,
    pub booked_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineActivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineActivated {
    pub line_id: LineId,
    pub activated_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReturnRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRecorded {
    pub line_id: LineId,
    pub rental_return: RentalReturn,
    pub total_returned_after: u32,
    pub status_after: RentalLineStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ExtraChargeAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraChargeAdded {
    pub line_id: LineId,
    pub charge: ExtraCharge,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineClosed {
    pub line_id: LineId,
    #[serde(default)]
    pub settled_amount: i64,
    pub closed_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCancelled {
    pub line_id: LineId,
    pub released_unit_ids: Vec<UnitId>,
    pub cancelled_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RentalLineEvent {
    LineBooked(LineBooked),
    LineActivated(LineActivated),
    ReturnRecorded(ReturnRecorded),
    ExtraChargeAdded(ExtraChargeAdded),
    LineClosed(LineClosed),
    LineCancelled(LineCancelled),
}

impl Event for RentalLineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RentalLineEvent::LineBooked(_) => "rental.line.booked",
            RentalLineEvent::LineActivated(_) => "rental.line.activated",
            RentalLineEvent::ReturnRecorded(_) => "rental.line.return_recorded",
            RentalLineEvent::ExtraChargeAdded(_) => "rental.line.extra_charge_added",
            RentalLineEvent::LineClosed(_) => "rental.line.closed",
            RentalLineEvent::LineCancelled(_) => "rental.line.cancelled",
        }
    }

    fn version(&self) -> u32 {
        match self {
            // v2 pins the settled amount.
            RentalLineEvent::LineClosed(_) => 2,
            _ => 1,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RentalLineEvent::LineBooked(e) => e.occurred_at,
            RentalLineEvent::LineActivated(e) => e.occurred_at,
            RentalLineEvent::ReturnRecorded(e) => e.occurred_at,
            RentalLineEvent::ExtraChargeAdded(e) => e.occurred_at,
            RentalLineEvent::LineClosed(e) => e.occurred_at,
            RentalLineEvent::LineCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for RentalLine {
    type Command = RentalLineCommand;
    type Event = RentalLineEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RentalLineEvent::LineBooked(e) => {
                self.id = e.line_id;
                self.transaction_id = e.transaction_id;
                self.item_id = e.item_id;
                self.location_id = e.location_id;
                self.quantity = e.quantity;
                self.unit_rate = e.unit_rate;
                self.rate_period = e.rate_period;
                self.daily_late_rate = e.daily_late_rate;
                self.rental_start = e.rental_start;
                self.rental_end = e.rental_end;
                self.discount = e.discount;
                self.tax = e.tax;
                self.allocated_unit_ids = e.unit_ids.clone();
                self.booked_at = Some(e.occurred_at);
                self.created = true;
                self.push_status(RentalLineStatus::Booked, e.booked_on, e.occurred_at);
            }
            RentalLineEvent::LineActivated(e) => {
                self.push_status(RentalLineStatus::Active, e.activated_on, e.occurred_at);
            }
            RentalLineEvent::ReturnRecorded(e) => {
                self.returned_quantity = e.total_returned_after;
                self.extra_charges
                    .extend(e.rental_return.extra_charges.iter().cloned());
                self.returns.push(e.rental_return.clone());
                // Every return is a history entry, including consecutive partial ones.
                self.push_status(e.status_after, e.rental_return.return_date, e.occurred_at);
            }
            RentalLineEvent::ExtraChargeAdded(e) => {
                self.extra_charges.push(e.charge.clone());
            }
            RentalLineEvent::LineClosed(e) => {
                self.settled_amount = Some(e.settled_amount);
                self.push_status(RentalLineStatus::Closed, e.closed_on, e.occurred_at);
            }
            RentalLineEvent::LineCancelled(e) => {
                self.push_status(RentalLineStatus::Cancelled, e.cancelled_on, e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RentalLineCommand::BookLine(cmd) => self.handle_book(cmd),
            RentalLineCommand::ActivateLine(cmd) => self.handle_activate(cmd),
            RentalLineCommand::RecordReturn(cmd) => self.handle_record_return(cmd),
            RentalLineCommand::AddExtraCharge(cmd) => self.handle_add_extra_charge(cmd),
            RentalLineCommand::CloseLine(cmd) => self.handle_close(cmd),
            RentalLineCommand::CancelLine(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl RentalLine {
    fn ensure_booked(&self, line_id: LineId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("rental line {line_id}")));
        }
        if self.id != line_id {
            return Err(DomainError::invariant("line_id mismatch"));
        }
        Ok(())
    }

    fn handle_book(&self, cmd: &BookLine) -> Result<Vec<RentalLineEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!("line {} already booked", cmd.line_id)));
        }
        if self.id != cmd.line_id {
            return Err(DomainError::invariant("line_id mismatch"));
        }
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.unit_ids.len() != cmd.quantity as usize {
            return Err(DomainError::invariant(format!(
                "line {} books {} units but {} were allocated",
                cmd.line_id,
                cmd.quantity,
                cmd.unit_ids.len()
            )));
        }
        if cmd.unit_rate < 0 || cmd.daily_late_rate < 0 {
            return Err(DomainError::validation("rates must be non-negative"));
        }
        if cmd.discount < 0 || cmd.tax < 0 {
            return Err(DomainError::validation("discount and tax must be non-negative"));
        }
        if cmd.rental_end < cmd.rental_start {
            return Err(DomainError::validation("rental_end is before rental_start"));
        }
        if cmd.rate_period.value == 0 {
            return Err(DomainError::validation("rate period value must be at least 1"));
        }
        let quoted = compute_line_charge(
            cmd.quantity,
            cmd.unit_rate,
            cmd.rate_period,
            rental_days_used(cmd.rental_start, cmd.rental_end),
        );
        if cmd.discount > quoted {
            return Err(DomainError::validation(format!(
                "discount {} exceeds the quoted subtotal {quoted}",
                cmd.discount
            )));
        }

        Ok(vec![RentalLineEvent::LineBooked(LineBooked {
            line_id: cmd.line_id,
            transaction_id: cmd.transaction_id,
            item_id: cmd.item_id,
            location_id: cmd.location_id,
            quantity: cmd.quantity,
            unit_rate: cmd.unit_rate,
            rate_period: cmd.rate_period,
            daily_late_rate: cmd.daily_late_rate,
            rental_start: cmd.rental_start,
            rental_end: cmd.rental_end,
            discount: cmd.discount,
            tax: cmd.tax,
            unit_ids: cmd.unit_ids.clone(),
            booked_on: cmd.booked_on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_activate(&self, cmd: &ActivateLine) -> Result<Vec<RentalLineEvent>, DomainError> {
        self.ensure_booked(cmd.line_id)?;
        if self.status != RentalLineStatus::Booked {
            return Err(DomainError::invalid_line_transition(self.id, self.status, "activate"));
        }

        Ok(vec![RentalLineEvent::LineActivated(LineActivated {
            line_id: cmd.line_id,
            activated_on: cmd.activated_on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record_return(
        &self,
        cmd: &RecordReturn,
    ) -> Result<Vec<RentalLineEvent>, DomainError> {
        self.ensure_booked(cmd.line_id)?;
        if !self.status.is_open() {
            return Err(DomainError::invalid_line_transition(self.id, self.status, "return"));
        }
        if cmd.rental_return.line_id != self.id {
            return Err(DomainError::invariant("return belongs to another line"));
        }

        let requested = cmd.rental_return.quantity();
        let outstanding = self.outstanding_quantity();
        if requested == 0 {
            return Err(DomainError::validation("return must contain at least one unit"));
        }
        if requested > outstanding {
            return Err(DomainError::OverReturn {
                line_id: self.id,
                requested,
                outstanding,
            });
        }

        let total_returned_after = self.returned_quantity + requested;
        Ok(vec![RentalLineEvent::ReturnRecorded(ReturnRecorded {
            line_id: cmd.line_id,
            rental_return: cmd.rental_return.clone(),
            total_returned_after,
            status_after: RentalLineStatus::after_return(total_returned_after, self.quantity),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_extra_charge(
        &self,
        cmd: &AddExtraCharge,
    ) -> Result<Vec<RentalLineEvent>, DomainError> {
        self.ensure_booked(cmd.line_id)?;
        if self.status.is_terminal() {
            return Err(DomainError::invalid_line_transition(
                self.id,
                self.status,
                "add extra charge",
            ));
        }
        if cmd.charge.amount < 0 {
            return Err(DomainError::validation("extra charge amount must be non-negative"));
        }

        Ok(vec![RentalLineEvent::ExtraChargeAdded(ExtraChargeAdded {
            line_id: cmd.line_id,
            charge: cmd.charge.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, cmd: &CloseLine) -> Result<Vec<RentalLineEvent>, DomainError> {
        self.ensure_booked(cmd.line_id)?;
        if self.status != RentalLineStatus::Returned {
            return Err(DomainError::invalid_line_transition(self.id, self.status, "close"));
        }
        let total = crate::settlement::settle_line(self, cmd.closed_on).total;
        if cmd.paid_amount < total {
            return Err(DomainError::validation(format!(
                "line {} has a balance of {} and cannot close",
                self.id,
                total - cmd.paid_amount
            )));
        }
        if cmd.paid_amount > total {
            return Err(DomainError::validation(format!(
                "line {} holds a credit of {} that must be refunded before it closes",
                self.id,
                cmd.paid_amount - total
            )));
        }

        Ok(vec![RentalLineEvent::LineClosed(LineClosed {
            line_id: cmd.line_id,
            settled_amount: cmd.paid_amount,
            closed_on: cmd.closed_on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelLine) -> Result<Vec<RentalLineEvent>, DomainError> {
        self.ensure_booked(cmd.line_id)?;
        if self.status != RentalLineStatus::Booked {
            return Err(DomainError::invalid_line_transition(self.id, self.status, "cancel"));
        }

        Ok(vec![RentalLineEvent::LineCancelled(LineCancelled {
            line_id: cmd.line_id,
            released_unit_ids: self.allocated_unit_ids.clone(),
            cancelled_on: cmd.cancelled_on,
            occurred_at: cmd.occurred_at,
        })])
    }
}
