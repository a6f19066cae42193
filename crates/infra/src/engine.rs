//! `RentalEngine`: the single entry point over the ledgers.
//!
//! ```text
//! transaction lock (TransactionBook)
//!   ↓
//! line lock (RentalLine)
//!   ↓
//! stock pool locks (sorted by item/location)
//! ```
//!
//! Every operation takes the locks it needs in that order, decides everything
//! on copies, commits, and only then publishes the committed facts on the bus.
//! Publication is best-effort: a failed publish is logged and the commit stands.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use rentflow_core::{AggregateId, DomainError, ItemId, LineId, LocationId, TransactionId, UnitId};
use rentflow_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use rentflow_inventory::{Allocation, InventoryUnit, StockLevel, StockMovement};
use rentflow_rental::{
    ActivateLine, AddExtraCharge, BookLine, CancelLine, ExtraCharge, LineSettlement, PaymentKind,
    PaymentRecord, RatePeriod, RentalLifecycle, RentalLine, RentalLineCommand, RentalLineStatus,
    RentalReturnEvent, ReturnRequest, TransactionSettlement,
};

use crate::audit::ReturnEventLog;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, poisoned};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::idempotency::{IdempotencyRegistry, IdempotencyScope, IdempotentResult};
use crate::inventory_ledger::{InventoryLedger, activation_changes, cancellation_changes};
use crate::line_repository::{CommittedLineEvents, LineRepository};
use crate::return_workflow::{ReturnOutcome, ReturnWorkflow};
use crate::settlement_ledger::{
    PaymentRequest, SettlementLedger, close_settled, decide_payment,
    refund_required_for_cancel, settle_book, snapshot_lines,
};

/// Envelope type published on the engine's bus.
pub type EngineEnvelope = EventEnvelope<JsonValue>;

pub type InMemoryRentalEngine = RentalEngine<InMemoryEventStore, InMemoryEventBus<EngineEnvelope>>;

pub const UNIT_AGGREGATE_TYPE: &str = "inventory.unit";
pub const RETURN_AGGREGATE_TYPE: &str = "rental.return";
pub const TRANSACTION_AGGREGATE_TYPE: &str = "settlement.transaction";

/// `CreateBooking` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub transaction_id: TransactionId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub quantity: u32,
    pub unit_rate: i64,
    pub rate_period: RatePeriod,
    /// Falls back to `EngineConfig::default_daily_late_rate`.
    pub daily_late_rate: Option<i64>,
    pub rental_start: NaiveDate,
    pub rental_end: NaiveDate,
    pub discount: i64,
    pub tax: i64,
    pub booked_on: NaiveDate,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingOutcome {
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub unit_ids: Vec<UnitId>,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInput {
    pub amount: i64,
    pub method: String,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    pub payment: PaymentRecord,
    pub settlement: TransactionSettlement,
    pub closed_lines: Vec<LineId>,
    pub replayed: bool,
}

pub struct RentalEngine<S, B> {
    config: EngineConfig,
    lines: LineRepository<S>,
    inventory: InventoryLedger,
    settlements: SettlementLedger,
    idempotency: IdempotencyRegistry,
    returns: ReturnEventLog,
    bus: B,
}

impl InMemoryRentalEngine {
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(config, InMemoryEventStore::new(), InMemoryEventBus::new())
    }
}

impl<S, B> RentalEngine<S, B>
where
    S: EventStore,
    B: EventBus<EngineEnvelope>,
{
    pub fn new(config: EngineConfig, store: S, bus: B) -> Self {
        Self {
            config,
            lines: LineRepository::new(store),
            inventory: InventoryLedger::new(),
            settlements: SettlementLedger::new(),
            idempotency: IdempotencyRegistry::new(),
            returns: ReturnEventLog::new(),
            bus,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn inventory(&self) -> &InventoryLedger {
        &self.inventory
    }

    pub fn lines(&self) -> &LineRepository<S> {
        &self.lines
    }

    pub fn subscribe(&self) -> Subscription<EngineEnvelope> {
        self.bus.subscribe()
    }

    pub fn bus_subscribers(&self) -> usize {
        self.bus.subscriber_count()
    }

    // ---- inventory ------------------------------------------------------

    pub fn onboard_unit(
        &self,
        unit_id: UnitId,
        item_id: ItemId,
        location_id: LocationId,
    ) -> EngineResult<StockMovement> {
        let movement = observe("onboard_unit", self.inventory.onboard_unit(unit_id, item_id, location_id))?;
        self.publish_movements(std::slice::from_ref(&movement));
        Ok(movement)
    }

    pub fn send_to_maintenance(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        let movement = observe("send_to_maintenance", self.inventory.send_to_maintenance(unit_id))?;
        tracing::info!(%unit_id, "unit sent to maintenance");
        self.publish_movements(std::slice::from_ref(&movement));
        Ok(movement)
    }

    pub fn complete_repair(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        let movement = observe("complete_repair", self.inventory.complete_repair(unit_id))?;
        tracing::info!(%unit_id, "unit repaired");
        self.publish_movements(std::slice::from_ref(&movement));
        Ok(movement)
    }

    pub fn retire_unit(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        let movement = observe("retire_unit", self.inventory.retire(unit_id))?;
        tracing::info!(%unit_id, "unit retired");
        self.publish_movements(std::slice::from_ref(&movement));
        Ok(movement)
    }

    pub fn unit(&self, unit_id: UnitId) -> EngineResult<InventoryUnit> {
        self.inventory.unit(unit_id)
    }

    pub fn stock_level(&self, item_id: ItemId, location_id: LocationId) -> EngineResult<StockLevel> {
        self.inventory.stock_level(item_id, location_id)
    }

    pub fn verify_stock(&self, item_id: ItemId, location_id: LocationId) -> EngineResult<StockLevel> {
        self.inventory.verify_stock(item_id, location_id)
    }

    pub fn movements_for_unit(&self, unit_id: UnitId) -> EngineResult<Vec<StockMovement>> {
        self.inventory.movements_for_unit(unit_id)
    }

    pub fn movements_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> EngineResult<Vec<StockMovement>> {
        self.inventory.movements_for_transaction(transaction_id)
    }

    // ---- bookings -------------------------------------------------------

    /// Reserve units and book a new line on a transaction.
    ///
    /// Fails with `InsufficientStock` and creates nothing when the pool cannot
    /// cover the quantity.
    pub fn create_booking(&self, request: BookingRequest) -> EngineResult<BookingOutcome> {
        observe("create_booking", self.create_booking_inner(request))
    }

    fn create_booking_inner(&self, request: BookingRequest) -> EngineResult<BookingOutcome> {
        let transaction_id = request.transaction_id;
        let target = format!("transaction {transaction_id}");
        let key = request.idempotency_key.as_deref();
        if key.is_some_and(|k| k.trim().is_empty()) {
            return Err(DomainError::validation("idempotency key must not be blank").into());
        }

        let book_handle = self.settlements.open(transaction_id)?;
        let mut book = book_handle.lock().map_err(poisoned("transaction book"))?;

        if let Some(k) = key {
            if let Some(IdempotentResult::Booking(line_id)) =
                self.idempotency.check(IdempotencyScope::Booking, k, &target)?
            {
                let line = self.lines.snapshot(line_id)?;
                tracing::debug!(%line_id, %transaction_id, idempotency_key = k, "booking replayed");
                return Ok(BookingOutcome {
                    line_id,
                    transaction_id,
                    unit_ids: line.allocated_unit_ids().to_vec(),
                    replayed: true,
                });
            }
        }

        let line_id = LineId::new();
        let allocation = Allocation {
            transaction_id,
            line_id,
        };
        let daily_late_rate = request
            .daily_late_rate
            .unwrap_or(self.config.default_daily_late_rate);
        let mut line = RentalLine::empty(line_id);

        let reserved = self.inventory.reserve(
            request.item_id,
            request.location_id,
            request.quantity,
            allocation,
            key,
            |picked| {
                if let Some(k) = key {
                    self.idempotency.claim(
                        IdempotencyScope::Booking,
                        k,
                        &target,
                        IdempotentResult::Booking(line_id),
                    )?;
                }
                let committed = self.lines.commit(
                    &mut line,
                    RentalLineCommand::BookLine(BookLine {
                        line_id,
                        transaction_id,
                        item_id: request.item_id,
                        location_id: request.location_id,
                        quantity: request.quantity,
                        unit_rate: request.unit_rate,
                        rate_period: request.rate_period,
                        daily_late_rate,
                        rental_start: request.rental_start,
                        rental_end: request.rental_end,
                        discount: request.discount,
                        tax: request.tax,
                        unit_ids: picked.to_vec(),
                        booked_on: request.booked_on,
                        occurred_at: Utc::now(),
                    }),
                );
                if committed.is_err() {
                    if let Some(k) = key {
                        self.idempotency.release(IdempotencyScope::Booking, k)?;
                    }
                }
                committed
            },
        )?;

        let unit_ids = line.allocated_unit_ids().to_vec();
        self.lines.insert(line)?;
        book.add_line(line_id);
        drop(book);

        tracing::info!(
            %line_id,
            %transaction_id,
            item_id = %request.item_id,
            location_id = %request.location_id,
            quantity = request.quantity,
            "booking created"
        );
        self.publish_line_events(&reserved.committed);
        self.publish_movements(&reserved.movements);

        Ok(BookingOutcome {
            line_id,
            transaction_id,
            unit_ids,
            replayed: false,
        })
    }

    /// Move a BOOKED line to ACTIVE and its units from RESERVED to RENTED.
    pub fn activate_rental(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<RentalLifecycle> {
        observe("activate_rental", self.activate_rental_inner(line_id, as_of))
    }

    fn activate_rental_inner(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<RentalLifecycle> {
        let handle = self.lines.handle(line_id)?;
        let mut line = handle.lock().map_err(poisoned("rental line"))?;

        if line.status() != RentalLineStatus::Booked {
            return Err(DomainError::invalid_line_transition(line_id, line.status(), "activate").into());
        }
        if !self.config.allow_early_activation && as_of < line.rental_start() {
            return Err(DomainError::validation(format!(
                "line {line_id} starts on {} and cannot be activated on {as_of}",
                line.rental_start()
            ))
            .into());
        }

        let allocation = Allocation {
            transaction_id: line.transaction_id(),
            line_id,
        };
        let changes = activation_changes(line.allocated_unit_ids(), Some(allocation));
        let line_ref = &mut *line;
        let outcome = self.inventory.transition_units(&changes, None, |_| {
            self.lines.commit(
                line_ref,
                RentalLineCommand::ActivateLine(ActivateLine {
                    line_id,
                    activated_on: as_of,
                    occurred_at: Utc::now(),
                }),
            )
        })?;

        let lifecycle = line.lifecycle(as_of);
        drop(line);

        tracing::info!(%line_id, transaction_id = %lifecycle.transaction_id, %as_of, "rental activated");
        self.publish_line_events(&outcome.committed);
        self.publish_movements(&outcome.movements);
        Ok(lifecycle)
    }

    /// Activate every BOOKED line whose start date is on or before `as_of`.
    ///
    /// Lines that stop being BOOKED concurrently are skipped.
    pub fn activate_due(&self, as_of: NaiveDate) -> EngineResult<Vec<LineId>> {
        let mut activated = Vec::new();
        for handle in self.lines.all()? {
            let (line_id, due) = {
                let line = handle.lock().map_err(poisoned("rental line"))?;
                (
                    line.id_typed(),
                    line.status() == RentalLineStatus::Booked && line.rental_start() <= as_of,
                )
            };
            if !due {
                continue;
            }
            match self.activate_rental(line_id, as_of) {
                Ok(_) => activated.push(line_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => continue,
            }
        }
        tracing::info!(%as_of, activated = activated.len(), "due rentals activated");
        Ok(activated)
    }

    /// Cancel a BOOKED line and release its reserved units.
    ///
    /// Fails with `RefundRequired` when the transaction has been paid more
    /// than it would owe without this line.
    pub fn cancel_booking(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<RentalLifecycle> {
        observe("cancel_booking", self.cancel_booking_inner(line_id, as_of))
    }

    fn cancel_booking_inner(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<RentalLifecycle> {
        let transaction_id = self.lines.snapshot(line_id)?.transaction_id();
        let book_handle = self.settlements.existing(transaction_id)?;
        let book = book_handle.lock().map_err(poisoned("transaction book"))?;

        let settlement = settle_book(&book, &snapshot_lines(&self.lines, &book)?, as_of);
        refund_required_for_cancel(&settlement, line_id, book.net_paid())?;

        let handle = self.lines.handle(line_id)?;
        let mut line = handle.lock().map_err(poisoned("rental line"))?;
        if line.status() != RentalLineStatus::Booked {
            return Err(DomainError::invalid_line_transition(line_id, line.status(), "cancel").into());
        }

        let allocation = Allocation {
            transaction_id,
            line_id,
        };
        let changes = cancellation_changes(line.allocated_unit_ids(), allocation);
        let line_ref = &mut *line;
        let outcome = self.inventory.transition_units(&changes, None, |_| {
            self.lines.commit(
                line_ref,
                RentalLineCommand::CancelLine(CancelLine {
                    line_id,
                    cancelled_on: as_of,
                    occurred_at: Utc::now(),
                }),
            )
        })?;

        let lifecycle = line.lifecycle(as_of);
        drop(line);
        drop(book);

        tracing::info!(%line_id, %transaction_id, released = outcome.movements.len(), "booking cancelled");
        self.publish_line_events(&outcome.committed);
        self.publish_movements(&outcome.movements);
        Ok(lifecycle)
    }

    /// Add a caller-supplied charge (cleaning fee, delivery) to an open line.
    pub fn add_extra_charge(
        &self,
        line_id: LineId,
        charge: ExtraCharge,
        as_of: NaiveDate,
    ) -> EngineResult<LineSettlement> {
        let committed = observe("add_extra_charge", self.add_extra_charge_inner(line_id, charge))?;
        self.publish_line_events(&committed);
        self.get_settlement(line_id, as_of)
    }

    fn add_extra_charge_inner(&self, line_id: LineId, charge: ExtraCharge) -> EngineResult<CommittedLineEvents> {
        let charge = ExtraCharge::new(charge.description, charge.amount)?;
        let handle = self.lines.handle(line_id)?;
        let mut line = handle.lock().map_err(poisoned("rental line"))?;
        let amount = charge.amount;
        let committed = self.lines.commit(
            &mut line,
            RentalLineCommand::AddExtraCharge(AddExtraCharge {
                line_id,
                charge,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(%line_id, amount, "extra charge added");
        Ok(committed)
    }

    // ---- returns --------------------------------------------------------

    /// Record a physical return, release the units and close the line if it
    /// is now fully returned and paid.
    pub fn process_return(&self, request: &ReturnRequest) -> EngineResult<ReturnOutcome> {
        observe("process_return", self.process_return_inner(request))
    }

    fn process_return_inner(&self, request: &ReturnRequest) -> EngineResult<ReturnOutcome> {
        let workflow = ReturnWorkflow {
            lines: &self.lines,
            inventory: &self.inventory,
            idempotency: &self.idempotency,
            audit: &self.returns,
            policy: self.config.charge_policy(),
        };
        let mut outcome = workflow.process(request)?;
        if outcome.replayed {
            return Ok(outcome);
        }

        if let Some(committed) = &outcome.line_events {
            self.publish_line_events(committed);
        }
        self.publish_movements(&outcome.movements);
        self.publish_return_event(&outcome.event, outcome.log_position);

        if outcome.line_status == RentalLineStatus::Returned {
            let closed = self.close_settled(outcome.rental_return.transaction_id, request.return_date)?;
            if closed.contains(&request.line_id) {
                outcome.line_status = RentalLineStatus::Closed;
            }
        }
        Ok(outcome)
    }

    pub fn return_events(&self) -> EngineResult<Vec<RentalReturnEvent>> {
        self.returns.all()
    }

    pub fn return_events_for_line(&self, line_id: LineId) -> EngineResult<Vec<RentalReturnEvent>> {
        self.returns.for_line(line_id)
    }

    // ---- settlement -----------------------------------------------------

    pub fn get_settlement(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<LineSettlement> {
        let transaction_id = self.lines.snapshot(line_id)?.transaction_id();
        self.get_transaction_settlement(transaction_id, as_of)?
            .lines
            .into_iter()
            .find(|l| l.line_id == line_id)
            .ok_or_else(|| {
                DomainError::invariant(format!(
                    "line {line_id} is missing from transaction {transaction_id}"
                ))
                .into()
            })
    }

    pub fn get_transaction_settlement(
        &self,
        transaction_id: TransactionId,
        as_of: NaiveDate,
    ) -> EngineResult<TransactionSettlement> {
        let book_handle = self.settlements.existing(transaction_id)?;
        let book = book_handle.lock().map_err(poisoned("transaction book"))?;
        let lines = snapshot_lines(&self.lines, &book)?;
        Ok(settle_book(&book, &lines, as_of))
    }

    pub fn get_lifecycle(&self, line_id: LineId, as_of: NaiveDate) -> EngineResult<RentalLifecycle> {
        Ok(self.lines.snapshot(line_id)?.lifecycle(as_of))
    }

    pub fn line(&self, line_id: LineId) -> EngineResult<RentalLine> {
        self.lines.snapshot(line_id)
    }

    /// Lines with units still out past their end date.
    pub fn overdue_lines(&self, as_of: NaiveDate) -> EngineResult<Vec<RentalLifecycle>> {
        let mut out = Vec::new();
        for handle in self.lines.all()? {
            let line = handle.lock().map_err(poisoned("rental line"))?;
            if line.is_overdue(as_of) {
                out.push(line.lifecycle(as_of));
            }
        }
        Ok(out)
    }

    pub fn apply_payment(
        &self,
        transaction_id: TransactionId,
        input: PaymentInput,
        as_of: NaiveDate,
    ) -> EngineResult<PaymentOutcome> {
        observe(
            "apply_payment",
            self.record_payment(transaction_id, PaymentKind::Payment, input, as_of),
        )
    }

    pub fn apply_refund(
        &self,
        transaction_id: TransactionId,
        input: PaymentInput,
        as_of: NaiveDate,
    ) -> EngineResult<PaymentOutcome> {
        observe(
            "apply_refund",
            self.record_payment(transaction_id, PaymentKind::Refund, input, as_of),
        )
    }

    fn record_payment(
        &self,
        transaction_id: TransactionId,
        kind: PaymentKind,
        input: PaymentInput,
        as_of: NaiveDate,
    ) -> EngineResult<PaymentOutcome> {
        let target = format!("transaction {transaction_id}");
        let book_handle = self.settlements.existing(transaction_id)?;
        let mut book = book_handle.lock().map_err(poisoned("transaction book"))?;

        if let Some(key) = input.idempotency_key.as_deref() {
            if let Some(IdempotentResult::Payment(payment_id)) =
                self.idempotency.check(IdempotencyScope::Payment, key, &target)?
            {
                let payment = book.find_payment(payment_id).cloned().ok_or_else(|| {
                    DomainError::invariant(format!("payment {payment_id} missing from its transaction"))
                })?;
                tracing::debug!(%transaction_id, %payment_id, idempotency_key = key, "payment replayed");
                let settlement = settle_book(&book, &snapshot_lines(&self.lines, &book)?, as_of);
                return Ok(PaymentOutcome {
                    payment,
                    settlement,
                    closed_lines: vec![],
                    replayed: true,
                });
            }
        }

        let before = settle_book(&book, &snapshot_lines(&self.lines, &book)?, as_of);
        let request = PaymentRequest {
            kind,
            amount: input.amount,
            method: input.method,
            reference: input.reference,
            idempotency_key: input.idempotency_key,
        };
        let payment = decide_payment(&before, book.net_paid(), &request, Utc::now())?;
        if let Some(key) = payment.idempotency_key.as_deref() {
            self.idempotency.claim(
                IdempotencyScope::Payment,
                key,
                &target,
                IdempotentResult::Payment(payment.payment_id),
            )?;
        }
        book.record(payment.clone());
        tracing::info!(
            %transaction_id,
            payment_id = %payment.payment_id,
            kind = ?payment.kind,
            amount = payment.amount,
            "payment recorded"
        );

        let closed = close_settled(&self.lines, &book, as_of)?;
        let settlement = settle_book(&book, &snapshot_lines(&self.lines, &book)?, as_of);
        let position = book.payments().len() as u64;
        drop(book);

        self.publish_payment(&payment, position);
        for c in &closed {
            self.publish_line_events(c);
        }

        Ok(PaymentOutcome {
            payment,
            settlement,
            closed_lines: closed_line_ids(&closed),
            replayed: false,
        })
    }

    /// Take the transaction lock and close fully returned, settled lines.
    fn close_settled(&self, transaction_id: TransactionId, as_of: NaiveDate) -> EngineResult<Vec<LineId>> {
        let book_handle = self.settlements.existing(transaction_id)?;
        let book = book_handle.lock().map_err(poisoned("transaction book"))?;
        let closed = close_settled(&self.lines, &book, as_of)?;
        drop(book);

        for c in &closed {
            self.publish_line_events(c);
        }
        Ok(closed_line_ids(&closed))
    }

    // ---- publication ----------------------------------------------------

    fn publish(&self, envelope: EngineEnvelope) {
        let event_type = envelope.event_type().to_string();
        match self.bus.publish(envelope) {
            Ok(()) => tracing::trace!(
                event_type = %event_type,
                subscribers = self.bus.subscriber_count(),
                "committed event published"
            ),
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = ?e, "failed to publish committed event")
            }
        }
    }

    fn publish_line_events(&self, committed: &CommittedLineEvents) {
        for stored in &committed.stored {
            self.publish(stored.to_envelope());
        }
    }

    fn publish_movements(&self, movements: &[StockMovement]) {
        for m in movements {
            self.publish_fact(
                AggregateId::from(Uuid::from(m.unit_id)),
                UNIT_AGGREGATE_TYPE,
                m.unit_version,
                "inventory.movement.recorded",
                m.occurred_at,
                m,
            );
        }
    }

    fn publish_return_event(&self, event: &RentalReturnEvent, position: u64) {
        self.publish_fact(
            AggregateId::from(event.line_id),
            RETURN_AGGREGATE_TYPE,
            position,
            "rental.return.recorded",
            event.recorded_at,
            event,
        );
    }

    fn publish_payment(&self, payment: &PaymentRecord, position: u64) {
        let event_type = match payment.kind {
            PaymentKind::Payment => "settlement.payment.recorded",
            PaymentKind::Refund => "settlement.refund.recorded",
        };
        self.publish_fact(
            AggregateId::from(Uuid::from(payment.transaction_id)),
            TRANSACTION_AGGREGATE_TYPE,
            position,
            event_type,
            payment.recorded_at,
            payment,
        );
    }

    fn publish_fact<T: Serialize>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        event_type: &str,
        occurred_at: chrono::DateTime<Utc>,
        fact: &T,
    ) {
        match serde_json::to_value(fact) {
            Ok(payload) => self.publish(EventEnvelope::new(
                Uuid::now_v7(),
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                occurred_at,
                payload,
            )),
            Err(e) => tracing::warn!(event_type, error = %e, "failed to serialize committed fact"),
        }
    }
}

fn closed_line_ids(closed: &[CommittedLineEvents]) -> Vec<LineId> {
    closed
        .iter()
        .filter_map(|c| c.stored.first().map(|s| LineId::from(s.aggregate_id)))
        .collect()
}

/// Log the outcome of a rejected operation at the level its error class needs.
fn observe<T>(operation: &'static str, result: EngineResult<T>) -> EngineResult<T> {
    if let Err(e) = &result {
        log_rejection(operation, e);
    }
    result
}

fn log_rejection(operation: &'static str, e: &EngineError) {
    if e.is_fatal() {
        tracing::error!(operation, code = e.code(), error = %e, "integrity violation");
    } else {
        tracing::warn!(operation, code = e.code(), error = %e, "request rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentflow_rental::{ReturnCondition, UnitReturn};
    use std::time::Duration;

    fn day(n: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Days::new(n)
    }

    struct Fixture {
        engine: InMemoryRentalEngine,
        item: ItemId,
        loc: LocationId,
    }

    fn fixture(units: usize, config: EngineConfig) -> Fixture {
        let engine = InMemoryRentalEngine::in_memory(config);
        let item = ItemId::new();
        let loc = LocationId::new();
        for _ in 0..units {
            engine.onboard_unit(UnitId::new(), item, loc).unwrap();
        }
        Fixture { engine, item, loc }
    }

    fn booking(f: &Fixture, txn: TransactionId, qty: u32, end: u64) -> BookingRequest {
        BookingRequest {
            transaction_id: txn,
            item_id: f.item,
            location_id: f.loc,
            quantity: qty,
            unit_rate: 100,
            rate_period: RatePeriod::daily(),
            daily_late_rate: Some(20),
            rental_start: day(0),
            rental_end: day(end),
            discount: 0,
            tax: 0,
            booked_on: day(0),
            idempotency_key: None,
        }
    }

    fn good_return(line_id: LineId, units: &[UnitId], on: NaiveDate, key: &str) -> ReturnRequest {
        ReturnRequest {
            line_id,
            idempotency_key: key.into(),
            return_date: on,
            inspector: None,
            units: units
                .iter()
                .map(|u| UnitReturn {
                    unit_id: *u,
                    quantity: 1,
                    condition: ReturnCondition::Good,
                    damage_charge: 0,
                    damage_description: None,
                })
                .collect(),
            extra_charges: vec![],
        }
    }

    fn pay(amount: i64, key: Option<&str>) -> PaymentInput {
        PaymentInput {
            amount,
            method: "card".into(),
            reference: None,
            idempotency_key: key.map(str::to_string),
        }
    }

    #[test]
    fn booking_replay_returns_the_same_line() {
        let f = fixture(3, EngineConfig::default());
        let txn = TransactionId::new();
        let mut req = booking(&f, txn, 2, 3);
        req.idempotency_key = Some("book-1".into());

        let first = f.engine.create_booking(req.clone()).unwrap();
        let again = f.engine.create_booking(req.clone()).unwrap();
        assert!(again.replayed);
        assert_eq!(again.line_id, first.line_id);
        assert_eq!(again.unit_ids, first.unit_ids);
        assert_eq!(f.engine.stock_level(f.item, f.loc).unwrap().reserved, 2);

        req.transaction_id = TransactionId::new();
        let err = f.engine.create_booking(req).unwrap_err();
        assert_eq!(err.code(), "duplicate_idempotency_key");
    }

    #[test]
    fn default_late_rate_comes_from_config() {
        let config = EngineConfig {
            default_daily_late_rate: 35,
            ..EngineConfig::default()
        };
        let f = fixture(1, config);
        let mut req = booking(&f, TransactionId::new(), 1, 3);
        req.daily_late_rate = None;
        let out = f.engine.create_booking(req).unwrap();
        assert_eq!(f.engine.line(out.line_id).unwrap().daily_late_rate(), 35);
    }

    #[test]
    fn early_activation_can_be_disabled() {
        let config = EngineConfig {
            allow_early_activation: false,
            ..EngineConfig::default()
        };
        let f = fixture(1, config);
        let mut req = booking(&f, TransactionId::new(), 1, 5);
        req.rental_start = day(2);
        let out = f.engine.create_booking(req).unwrap();

        let err = f.engine.activate_rental(out.line_id, day(1)).unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
        assert_eq!(f.engine.activate_due(day(1)).unwrap(), vec![]);
        assert_eq!(f.engine.activate_due(day(2)).unwrap(), vec![out.line_id]);
        assert_eq!(f.engine.stock_level(f.item, f.loc).unwrap().rented, 1);
    }

    #[test]
    fn cancel_releases_units_and_zeroes_the_line() {
        let f = fixture(2, EngineConfig::default());
        let txn = TransactionId::new();
        let out = f.engine.create_booking(booking(&f, txn, 2, 3)).unwrap();

        let lifecycle = f.engine.cancel_booking(out.line_id, day(0)).unwrap();
        assert_eq!(lifecycle.status, RentalLineStatus::Cancelled);
        assert_eq!(f.engine.stock_level(f.item, f.loc).unwrap().available, 2);
        assert_eq!(
            f.engine.get_settlement(out.line_id, day(0)).unwrap().summary.total,
            0
        );
        assert!(f.engine.activate_rental(out.line_id, day(0)).is_err());
    }

    #[test]
    fn cancel_after_prepayment_requires_refund() {
        let f = fixture(1, EngineConfig::default());
        let txn = TransactionId::new();
        let out = f.engine.create_booking(booking(&f, txn, 1, 3)).unwrap();
        f.engine.apply_payment(txn, pay(300, None), day(0)).unwrap();

        let err = f.engine.cancel_booking(out.line_id, day(0)).unwrap_err();
        assert_eq!(
            err.domain(),
            Some(&DomainError::RefundRequired {
                transaction_id: txn,
                amount: 300,
            })
        );

        f.engine.apply_refund(txn, pay(300, None), day(0)).unwrap();
        f.engine.cancel_booking(out.line_id, day(0)).unwrap();
    }

    #[test]
    fn paying_a_returned_line_closes_it() {
        let f = fixture(1, EngineConfig::default());
        let txn = TransactionId::new();
        let out = f.engine.create_booking(booking(&f, txn, 1, 3)).unwrap();
        f.engine.activate_rental(out.line_id, day(0)).unwrap();

        let ret = f
            .engine
            .process_return(&good_return(out.line_id, &out.unit_ids, day(3), "r1"))
            .unwrap();
        assert_eq!(ret.line_status, RentalLineStatus::Returned);

        let err = f.engine.apply_payment(txn, pay(301, None), day(3)).unwrap_err();
        assert_eq!(err.code(), "overpayment");

        let paid = f.engine.apply_payment(txn, pay(300, Some("p1")), day(3)).unwrap();
        assert_eq!(paid.closed_lines, vec![out.line_id]);
        assert_eq!(paid.settlement.summary.balance_due, 0);
        assert_eq!(
            f.engine.get_lifecycle(out.line_id, day(3)).unwrap().status,
            RentalLineStatus::Closed
        );

        let replay = f.engine.apply_payment(txn, pay(300, Some("p1")), day(3)).unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.payment.payment_id, paid.payment.payment_id);
    }

    #[test]
    fn prepaid_line_closes_on_full_return() {
        let f = fixture(1, EngineConfig::default());
        let txn = TransactionId::new();
        let out = f.engine.create_booking(booking(&f, txn, 1, 2)).unwrap();
        f.engine.apply_payment(txn, pay(200, None), day(0)).unwrap();
        f.engine.activate_rental(out.line_id, day(0)).unwrap();

        let ret = f
            .engine
            .process_return(&good_return(out.line_id, &out.unit_ids, day(2), "r1"))
            .unwrap();
        assert_eq!(ret.line_status, RentalLineStatus::Closed);
    }

    #[test]
    fn extra_charge_rejected_on_closed_or_cancelled_lines() {
        let f = fixture(1, EngineConfig::default());
        let out = f.engine.create_booking(booking(&f, TransactionId::new(), 1, 2)).unwrap();
        let s = f
            .engine
            .add_extra_charge(out.line_id, ExtraCharge::new("cleaning", 25).unwrap(), day(0))
            .unwrap();
        assert_eq!(s.summary.extra_charges, 25);

        f.engine.cancel_booking(out.line_id, day(0)).unwrap();
        let err = f
            .engine
            .add_extra_charge(out.line_id, ExtraCharge::new("cleaning", 25).unwrap(), day(0))
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::InvalidLineTransition { .. })));
    }

    #[test]
    fn overdue_lines_are_reported() {
        let f = fixture(2, EngineConfig::default());
        let out = f.engine.create_booking(booking(&f, TransactionId::new(), 2, 2)).unwrap();
        f.engine.activate_rental(out.line_id, day(0)).unwrap();

        assert!(f.engine.overdue_lines(day(2)).unwrap().is_empty());
        let overdue = f.engine.overdue_lines(day(3)).unwrap();
        assert_eq!(overdue.len(), 1);
        assert!(overdue[0].overdue);
    }

    #[test]
    fn committed_facts_are_published() {
        let f = fixture(2, EngineConfig::default());
        let sub = f.engine.subscribe();
        let out = f.engine.create_booking(booking(&f, TransactionId::new(), 1, 2)).unwrap();

        let first = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.event_type(), "rental.line.booked");
        assert_eq!(first.aggregate_id(), AggregateId::from(out.line_id));

        let second = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(second.event_type(), "inventory.movement.recorded");
        assert_eq!(second.sequence_number(), 2);

        drop(sub);
        f.engine.create_booking(booking(&f, TransactionId::new(), 1, 2)).unwrap();
        assert_eq!(f.engine.bus_subscribers(), 0);
    }
}
