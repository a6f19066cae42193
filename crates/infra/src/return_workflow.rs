//! Return & inspection workflow.
//!
//! ```text
//! lock line
//!   ↓
//! replay? (key already recorded on this line)
//!   ↓
//! build_return (all validation, no side effects)
//!   ↓
//! lock unit pools, decide RENTED → AVAILABLE / DAMAGED / LOST
//!   ↓
//! claim key → commit RecordReturn → append audit event
//!   ↓
//! apply unit changes + movements
//! ```
//!
//! Any failure before the last step leaves units, line and logs untouched.

use chrono::Utc;

use rentflow_core::{AggregateRoot, DomainError};
use rentflow_inventory::{Allocation, StockMovement};
use rentflow_rental::{
    ChargePolicy, RecordReturn, RentalLineCommand, RentalLineStatus, RentalReturn,
    RentalReturnEvent, ReturnRequest, build_return,
};

use crate::audit::ReturnEventLog;
use crate::error::{EngineResult, poisoned};
use crate::event_store::EventStore;
use crate::idempotency::{IdempotencyRegistry, IdempotencyScope, IdempotentResult};
use crate::inventory_ledger::{InventoryLedger, UnitChange, return_change};
use crate::line_repository::{CommittedLineEvents, LineRepository};

#[derive(Debug, Clone)]
pub struct ReturnOutcome {
    pub rental_return: RentalReturn,
    pub event: RentalReturnEvent,
    pub line_status: RentalLineStatus,
    /// Empty on replay.
    pub movements: Vec<StockMovement>,
    /// `None` on replay.
    pub line_events: Option<CommittedLineEvents>,
    /// Position of the audit event in the return log.
    pub log_position: u64,
    pub replayed: bool,
}

pub struct ReturnWorkflow<'a, S> {
    pub lines: &'a LineRepository<S>,
    pub inventory: &'a InventoryLedger,
    pub idempotency: &'a IdempotencyRegistry,
    pub audit: &'a ReturnEventLog,
    pub policy: ChargePolicy,
}

impl<S> ReturnWorkflow<'_, S>
where
    S: EventStore,
{
    pub fn process(&self, request: &ReturnRequest) -> EngineResult<ReturnOutcome> {
        let line_id = request.line_id;
        let key = request.idempotency_key.as_str();
        let target = format!("line {line_id}");

        let handle = self.lines.handle(line_id)?;
        let mut line = handle.lock().map_err(poisoned("rental line"))?;

        if let Some(existing) = line.find_return_by_key(key) {
            tracing::debug!(%line_id, idempotency_key = key, return_id = %existing.return_id, "return replayed");
            let (log_position, event) = self.recorded_event(existing)?;
            return Ok(ReturnOutcome {
                rental_return: existing.clone(),
                line_status: line.status(),
                event,
                movements: vec![],
                line_events: None,
                log_position,
                replayed: true,
            });
        }
        if let Some(result) = self.idempotency.check(IdempotencyScope::Return, key, &target)? {
            return Err(DomainError::invariant(format!(
                "return key '{key}' is registered as {result:?} but missing from line {line_id}"
            ))
            .into());
        }

        let rental_return = build_return(&line, request, self.policy.grace_period_days, Utc::now())?;
        let allocation = Allocation {
            transaction_id: line.transaction_id(),
            line_id,
        };
        let changes: Vec<UnitChange> = rental_return
            .lines
            .iter()
            .map(|rl| {
                return_change(
                    rl.unit_id,
                    rl.condition.target_unit_status(),
                    rl.condition.movement_reason(),
                    allocation,
                )
            })
            .collect();

        let idempotency = self.idempotency;
        let lines = self.lines;
        let audit = self.audit;
        let return_id = rental_return.return_id;
        let recorded = rental_return.clone();
        let line_ref = &mut *line;

        let outcome = self.inventory.transition_units(&changes, Some(key), move |_| {
            idempotency.claim(
                IdempotencyScope::Return,
                key,
                &target,
                IdempotentResult::Return { line_id, return_id },
            )?;
            let committed = match lines.commit(
                line_ref,
                RentalLineCommand::RecordReturn(RecordReturn {
                    line_id,
                    rental_return: recorded.clone(),
                    occurred_at: Utc::now(),
                }),
            ) {
                Ok(c) => c,
                Err(e) => {
                    idempotency.release(IdempotencyScope::Return, key)?;
                    return Err(e);
                }
            };
            let event = RentalReturnEvent::summarize(
                &recorded,
                line_ref.returned_quantity(),
                line_ref.status(),
            );
            let position = audit.append(event.clone())?;
            Ok((committed, event, position))
        })?;

        let (committed, event, log_position) = outcome.committed;
        tracing::info!(
            %line_id,
            %return_id,
            transaction_id = %rental_return.transaction_id,
            returned = event.returned_quantity,
            good = event.good,
            damaged = event.damaged,
            lost = event.lost,
            late_fees = event.late_fees,
            damage_charges = event.damage_charges,
            status = %event.line_status_after,
            line_version = line.version(),
            "return recorded"
        );

        Ok(ReturnOutcome {
            rental_return,
            line_status: line.status(),
            event,
            movements: outcome.movements,
            line_events: Some(committed),
            log_position,
            replayed: false,
        })
    }

    fn recorded_event(&self, rental_return: &RentalReturn) -> EngineResult<(u64, RentalReturnEvent)> {
        self.audit
            .find(|e| e.return_id == rental_return.return_id)?
            .ok_or_else(|| {
                DomainError::invariant(format!(
                    "return {} has no audit event",
                    rental_return.return_id
                ))
                .into()
            })
    }
}
