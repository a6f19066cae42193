//! Return and inspection records, and the pure validation that builds them.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rentflow_core::{
    DomainError, DomainResult, Entity, InspectionId, LineId, ReturnId, ReturnLineId,
    TransactionId, UnitId,
};
use rentflow_inventory::{MovementReason, UnitStatus};

use crate::charge::{ExtraCharge, compute_damage_charge, compute_late_fee, days_overdue};
use crate::line::{RentalLine, RentalLineStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCondition {
    Good,
    Damaged,
    Lost,
}

impl ReturnCondition {
    pub fn target_unit_status(self) -> UnitStatus {
        match self {
            ReturnCondition::Good => UnitStatus::Available,
            ReturnCondition::Damaged => UnitStatus::Damaged,
            ReturnCondition::Lost => UnitStatus::Lost,
        }
    }

    pub fn movement_reason(self) -> MovementReason {
        match self {
            ReturnCondition::Good => MovementReason::ReturnedGood,
            ReturnCondition::Damaged => MovementReason::ReturnedDamaged,
            ReturnCondition::Lost => MovementReason::ReturnedLost,
        }
    }

    pub fn needs_inspection(self) -> bool {
        self != ReturnCondition::Good
    }
}

/// One unit in a return request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReturn {
    pub unit_id: UnitId,
    pub quantity: u32,
    pub condition: ReturnCondition,
    /// Flat, caller-assessed charge; only allowed when the condition is not GOOD.
    #[serde(default)]
    pub damage_charge: i64,
    #[serde(default)]
    pub damage_description: Option<String>,
}

/// Inbound `ProcessReturn` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRequest {
    pub line_id: LineId,
    pub idempotency_key: String,
    pub return_date: NaiveDate,
    #[serde(default)]
    pub inspector: Option<String>,
    pub units: Vec<UnitReturn>,
    #[serde(default)]
    pub extra_charges: Vec<ExtraCharge>,
}

impl ReturnRequest {
    pub fn requested_quantity(&self) -> u32 {
        self.units
            .iter()
            .fold(0u32, |acc, u| acc.saturating_add(u.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalReturnLine {
    pub return_line_id: ReturnLineId,
    pub unit_id: UnitId,
    pub quantity: u32,
    pub condition: ReturnCondition,
    pub return_date: NaiveDate,
}

impl Entity for RentalReturnLine {
    type Id = ReturnLineId;

    fn id(&self) -> &Self::Id {
        &self.return_line_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionReport {
    pub inspection_id: InspectionId,
    pub return_line_id: ReturnLineId,
    pub unit_id: UnitId,
    pub condition: ReturnCondition,
    pub damage_description: Option<String>,
    pub damage_charge: i64,
    pub inspector: Option<String>,
    pub inspected_at: DateTime<Utc>,
}

impl Entity for InspectionReport {
    type Id = InspectionId;

    fn id(&self) -> &Self::Id {
        &self.inspection_id
    }
}

/// One committed return: immutable once recorded on the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalReturn {
    pub return_id: ReturnId,
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub idempotency_key: String,
    pub return_date: NaiveDate,
    pub lines: Vec<RentalReturnLine>,
    pub inspections: Vec<InspectionReport>,
    pub extra_charges: Vec<ExtraCharge>,
    /// Late fee assessed for the returned units at return time.
    pub late_fee: i64,
    pub damage_charge: i64,
    pub recorded_at: DateTime<Utc>,
}

impl Entity for RentalReturn {
    type Id = ReturnId;

    fn id(&self) -> &Self::Id {
        &self.return_id
    }
}

impl RentalReturn {
    pub fn quantity(&self) -> u32 {
        self.lines
            .iter()
            .fold(0u32, |acc, l| acc.saturating_add(l.quantity))
    }

    pub fn quantity_in(&self, condition: ReturnCondition) -> u32 {
        self.lines
            .iter()
            .filter(|l| l.condition == condition)
            .fold(0u32, |acc, l| acc.saturating_add(l.quantity))
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.lines.iter().map(|l| l.unit_id).collect()
    }
}

/// Append-only audit summary of one committed return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentalReturnEvent {
    pub event_id: Uuid,
    pub return_id: ReturnId,
    pub line_id: LineId,
    pub transaction_id: TransactionId,
    pub returned_quantity: u32,
    pub good: u32,
    pub damaged: u32,
    pub lost: u32,
    pub total_returned_after: u32,
    pub line_status_after: RentalLineStatus,
    pub damage_charges: i64,
    pub late_fees: i64,
    pub recorded_at: DateTime<Utc>,
}

impl RentalReturnEvent {
    pub fn summarize(
        rental_return: &RentalReturn,
        total_returned_after: u32,
        line_status_after: RentalLineStatus,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            return_id: rental_return.return_id,
            line_id: rental_return.line_id,
            transaction_id: rental_return.transaction_id,
            returned_quantity: rental_return.quantity(),
            good: rental_return.quantity_in(ReturnCondition::Good),
            damaged: rental_return.quantity_in(ReturnCondition::Damaged),
            lost: rental_return.quantity_in(ReturnCondition::Lost),
            total_returned_after,
            line_status_after,
            damage_charges: rental_return.damage_charge,
            late_fees: rental_return.late_fee,
            recorded_at: rental_return.recorded_at,
        }
    }
}

/// Validate a return request against the line and build the immutable return.
///
/// Covers every check that only needs line state. Unit status (still RENTED,
/// version) is checked by the inventory ledger under its pool lock.
pub fn build_return(
    line: &RentalLine,
    request: &ReturnRequest,
    grace_period_days: u32,
    recorded_at: DateTime<Utc>,
) -> DomainResult<RentalReturn> {
    if !line.is_booked() {
        return Err(DomainError::not_found(format!("rental line {}", request.line_id)));
    }
    if line.id_typed() != request.line_id {
        return Err(DomainError::invariant("return request routed to the wrong line"));
    }
    if !line.status().is_open() {
        return Err(DomainError::invalid_line_transition(
            line.id_typed(),
            line.status(),
            "return",
        ));
    }
    if request.idempotency_key.trim().is_empty() {
        return Err(DomainError::validation("idempotency key is required"));
    }
    if request.units.is_empty() {
        return Err(DomainError::validation("return must contain at least one unit"));
    }

    let requested = request.requested_quantity();
    let outstanding = line.outstanding_quantity();
    if requested > outstanding {
        return Err(DomainError::OverReturn {
            line_id: line.id_typed(),
            requested,
            outstanding,
        });
    }

    if request.return_date < line.rental_start() {
        return Err(DomainError::validation(format!(
            "return date {} is before rental start {}",
            request.return_date,
            line.rental_start()
        )));
    }

    let mut seen = HashSet::with_capacity(request.units.len());
    for unit in &request.units {
        if unit.quantity != 1 {
            return Err(DomainError::validation(format!(
                "unit {} must be returned with quantity 1, got {}",
                unit.unit_id, unit.quantity
            )));
        }
        if !seen.insert(unit.unit_id) {
            return Err(DomainError::validation(format!(
                "unit {} appears more than once in the return",
                unit.unit_id
            )));
        }
        if !line.allocated_unit_ids().contains(&unit.unit_id) {
            return Err(DomainError::validation(format!(
                "unit {} is not allocated to line {}",
                unit.unit_id,
                line.id_typed()
            )));
        }
        if line.has_returned_unit(unit.unit_id) {
            return Err(DomainError::validation(format!(
                "unit {} was already returned",
                unit.unit_id
            )));
        }
        if unit.damage_charge < 0 {
            return Err(DomainError::validation("damage charge must be non-negative"));
        }
        if unit.damage_charge > 0 && !unit.condition.needs_inspection() {
            return Err(DomainError::validation(format!(
                "unit {} is returned in good condition and cannot carry a damage charge",
                unit.unit_id
            )));
        }
    }
    for charge in &request.extra_charges {
        if charge.amount < 0 {
            return Err(DomainError::validation("extra charge amount must be non-negative"));
        }
    }

    let mut lines = Vec::with_capacity(request.units.len());
    let mut inspections = Vec::new();
    for unit in &request.units {
        let return_line_id = ReturnLineId::new();
        lines.push(RentalReturnLine {
            return_line_id,
            unit_id: unit.unit_id,
            quantity: unit.quantity,
            condition: unit.condition,
            return_date: request.return_date,
        });
        if unit.condition.needs_inspection() {
            inspections.push(InspectionReport {
                inspection_id: InspectionId::new(),
                return_line_id,
                unit_id: unit.unit_id,
                condition: unit.condition,
                damage_description: unit.damage_description.clone(),
                damage_charge: unit.damage_charge,
                inspector: request.inspector.clone(),
                inspected_at: recorded_at,
            });
        }
    }

    let late_fee = compute_late_fee(
        days_overdue(line.rental_end(), request.return_date, grace_period_days),
        line.daily_late_rate(),
        requested,
    );

    Ok(RentalReturn {
        return_id: ReturnId::new(),
        line_id: line.id_typed(),
        transaction_id: line.transaction_id(),
        idempotency_key: request.idempotency_key.clone(),
        return_date: request.return_date,
        damage_charge: compute_damage_charge(&inspections),
        lines,
        inspections,
        extra_charges: request.extra_charges.clone(),
        late_fee,
        recorded_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::tests::{activate, book, day};
    use proptest::prelude::*;

    fn unit_return(unit_id: UnitId, condition: ReturnCondition, charge: i64) -> UnitReturn {
        UnitReturn {
            unit_id,
            quantity: 1,
            condition,
            damage_charge: charge,
            damage_description: None,
        }
    }

    fn request(line: &RentalLine, units: Vec<UnitReturn>, on: NaiveDate) -> ReturnRequest {
        ReturnRequest {
            line_id: line.id_typed(),
            idempotency_key: "ret-1".into(),
            return_date: on,
            inspector: Some("sam".into()),
            units,
            extra_charges: Vec::new(),
        }
    }

    #[test]
    fn late_damaged_return_builds_inspection_and_fees() {
        let mut line = book(3, 0, 3);
        activate(&mut line);
        let unit = line.allocated_unit_ids()[0];

        let rr = build_return(
            &line,
            &request(&line, vec![unit_return(unit, ReturnCondition::Damaged, 150)], day(5)),
            0,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(rr.quantity(), 1);
        assert_eq!(rr.late_fee, 40);
        assert_eq!(rr.damage_charge, 150);
        assert_eq!(rr.inspections.len(), 1);
        assert_eq!(rr.inspections[0].return_line_id, rr.lines[0].return_line_id);
        assert_eq!(rr.inspections[0].inspector.as_deref(), Some("sam"));
    }

    #[test]
    fn grace_period_reduces_late_days() {
        let mut line = book(1, 0, 3);
        activate(&mut line);
        let unit = line.allocated_unit_ids()[0];
        let rr = build_return(
            &line,
            &request(&line, vec![unit_return(unit, ReturnCondition::Good, 0)], day(5)),
            1,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rr.late_fee, 20);
        assert!(rr.inspections.is_empty());
    }

    #[test]
    fn over_return_wins_over_unit_checks() {
        let mut line = book(1, 0, 3);
        activate(&mut line);
        let units = vec![
            unit_return(UnitId::new(), ReturnCondition::Good, 0),
            unit_return(UnitId::new(), ReturnCondition::Good, 0),
        ];
        let err = build_return(&line, &request(&line, units, day(2)), 0, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::OverReturn { requested: 2, outstanding: 1, .. }
        ));
    }

    #[test]
    fn rejects_malformed_unit_entries() {
        let mut line = book(2, 0, 3);
        activate(&mut line);
        let a = line.allocated_unit_ids()[0];

        let dup = vec![
            unit_return(a, ReturnCondition::Good, 0),
            unit_return(a, ReturnCondition::Good, 0),
        ];
        let cases = vec![
            request(&line, vec![], day(2)),
            request(&line, dup, day(2)),
            request(&line, vec![UnitReturn { quantity: 0, ..unit_return(a, ReturnCondition::Good, 0) }], day(2)),
            request(&line, vec![unit_return(UnitId::new(), ReturnCondition::Good, 0)], day(2)),
            request(&line, vec![unit_return(a, ReturnCondition::Good, 10)], day(2)),
            request(&line, vec![unit_return(a, ReturnCondition::Damaged, -1)], day(2)),
        ];
        for req in cases {
            let err = build_return(&line, &req, 0, Utc::now()).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{req:?} -> {err:?}");
        }
    }

    #[test]
    fn return_before_start_is_rejected() {
        let mut line = book(1, 2, 4);
        activate(&mut line);
        let unit = line.allocated_unit_ids()[0];
        let err = build_return(
            &line,
            &request(&line, vec![unit_return(unit, ReturnCondition::Good, 0)], day(1)),
            0,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn booked_line_cannot_take_returns() {
        let line = book(1, 0, 3);
        let unit = line.allocated_unit_ids()[0];
        let err = build_return(
            &line,
            &request(&line, vec![unit_return(unit, ReturnCondition::Good, 0)], day(1)),
            0,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidLineTransition { .. }));
    }

    #[test]
    fn condition_maps_to_unit_status() {
        assert_eq!(ReturnCondition::Good.target_unit_status(), UnitStatus::Available);
        assert_eq!(ReturnCondition::Damaged.target_unit_status(), UnitStatus::Damaged);
        assert_eq!(ReturnCondition::Lost.target_unit_status(), UnitStatus::Lost);
        for c in [ReturnCondition::Good, ReturnCondition::Damaged, ReturnCondition::Lost] {
            assert!(UnitStatus::Rented.can_transition_to(c.target_unit_status()));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn never_accepts_more_than_outstanding(qty in 1u32..6, already in 0u32..6, extra in 1u32..4) {
            let already = already.min(qty);
            let mut line = book(qty, 0, 3);
            activate(&mut line);

            let unit_ids = line.allocated_unit_ids().to_vec();
            if already > 0 {
                let first: Vec<_> = unit_ids[..already as usize]
                    .iter()
                    .map(|u| unit_return(*u, ReturnCondition::Good, 0))
                    .collect();
                let rr = build_return(&line, &request(&line, first, day(1)), 0, Utc::now()).unwrap();
                let cmd = crate::line::RentalLineCommand::RecordReturn(crate::line::RecordReturn {
                    line_id: line.id_typed(),
                    rental_return: rr,
                    occurred_at: Utc::now(),
                });
                rentflow_events::execute(&mut line, &cmd).unwrap();
            }

            let outstanding = qty - already;
            let mut units: Vec<_> = unit_ids[already as usize..]
                .iter()
                .map(|u| unit_return(*u, ReturnCondition::Good, 0))
                .collect();
            for _ in 0..extra {
                units.push(unit_return(UnitId::new(), ReturnCondition::Good, 0));
            }
            let requested = outstanding + extra;

            let result = build_return(&line, &request(&line, units, day(2)), 0, Utc::now());
            match result {
                Err(DomainError::OverReturn { requested: r, outstanding: o, .. }) => {
                    prop_assert_eq!(r, requested);
                    prop_assert_eq!(o, outstanding);
                }
                Err(DomainError::InvalidLineTransition { .. }) => prop_assert_eq!(outstanding, 0),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
