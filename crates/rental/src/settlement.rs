//! Settlement math: line summaries, payment records and FIFO payment allocation.
//!
//! Summaries are derived on demand and never stored, so recomputing with the
//! same facts and `as_of` always yields the same numbers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rentflow_core::{Entity, LineId, PaymentId, TransactionId, ValueObject};

use crate::charge::{ExtraCharge, compute_line_charge, compute_line_total, rental_days_used};
use crate::line::{RentalLine, RentalLineStatus};

/// Billing knobs that are engine configuration rather than line data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChargePolicy {
    /// Days after `rental_end` before late fees accrue.
    pub grace_period_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Payment,
    Refund,
}

/// Append-only payment or refund against a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub transaction_id: TransactionId,
    pub kind: PaymentKind,
    /// Always positive; `kind` carries the direction.
    pub amount: i64,
    pub method: String,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Entity for PaymentRecord {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.payment_id
    }
}

impl PaymentRecord {
    pub fn signed_amount(&self) -> i64 {
        match self.kind {
            PaymentKind::Payment => self.amount,
            PaymentKind::Refund => -self.amount,
        }
    }
}

/// Net amount paid (payments minus refunds).
pub fn net_paid(payments: &[PaymentRecord]) -> i64 {
    payments
        .iter()
        .fold(0i64, |acc, p| acc.saturating_add(p.signed_amount()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub subtotal: i64,
    pub late_fees: i64,
    pub damage_charges: i64,
    pub extra_charges: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub paid_amount: i64,
    /// Never negative; money paid beyond `total` shows up in `refund_due`.
    pub balance_due: i64,
    /// Credit owed back to the customer; only an explicit refund clears it.
    pub refund_due: i64,
}

impl ValueObject for SettlementSummary {}

impl SettlementSummary {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a summary from billed charges.
    ///
    /// The discount applied is capped at the billed subtotal, so an early
    /// return never turns a booked discount into a negative total.
    pub fn from_charges(
        subtotal: i64,
        late_fees: i64,
        damage_charges: i64,
        extras: &[ExtraCharge],
        discount: i64,
        tax: i64,
    ) -> Self {
        let discount = discount.clamp(0, subtotal.max(0));
        let extra_charges = extras
            .iter()
            .fold(0i64, |acc, c| acc.saturating_add(c.amount));
        let base = subtotal.saturating_sub(discount).saturating_add(tax);
        let total = compute_line_total(base, late_fees, damage_charges, extras);
        Self {
            subtotal,
            late_fees,
            damage_charges,
            extra_charges,
            discount,
            tax,
            total,
            paid_amount: 0,
            balance_due: total,
            refund_due: 0,
        }
    }

    pub fn with_paid(self, paid_amount: i64) -> Self {
        Self {
            paid_amount,
            balance_due: self.total.saturating_sub(paid_amount).max(0),
            refund_due: paid_amount.saturating_sub(self.total).max(0),
            ..self
        }
    }

    /// Field-wise sum (paid and balance included).
    pub fn add(self, other: &SettlementSummary) -> Self {
        Self {
            subtotal: self.subtotal.saturating_add(other.subtotal),
            late_fees: self.late_fees.saturating_add(other.late_fees),
            damage_charges: self.damage_charges.saturating_add(other.damage_charges),
            extra_charges: self.extra_charges.saturating_add(other.extra_charges),
            discount: self.discount.saturating_add(other.discount),
            tax: self.tax.saturating_add(other.tax),
            total: self.total.saturating_add(other.total),
            paid_amount: self.paid_amount.saturating_add(other.paid_amount),
            balance_due: self.balance_due.saturating_add(other.balance_due),
            refund_due: self.refund_due.saturating_add(other.refund_due),
        }
    }
}

/// Derive a line's charges as of a business date (paid amount left at zero).
///
/// Returned units bill from rental start to their return date; units still out
/// bill through `as_of`. A booked line shows its contracted quote and a
/// cancelled line is zero.
pub fn settle_line(line: &RentalLine, as_of: NaiveDate) -> SettlementSummary {
    let extras = line.extra_charges();

    match line.status() {
        RentalLineStatus::Cancelled => SettlementSummary::zero(),
        RentalLineStatus::Booked => {
            let quote = compute_line_charge(
                line.quantity(),
                line.unit_rate(),
                line.rate_period(),
                rental_days_used(line.rental_start(), line.rental_end()),
            );
            SettlementSummary::from_charges(quote, 0, 0, extras, line.discount(), line.tax())
        }
        _ => {
            let mut subtotal = 0i64;
            let mut late_fees = 0i64;
            let mut damage = 0i64;
            for r in line.returns() {
                subtotal = subtotal.saturating_add(compute_line_charge(
                    r.quantity(),
                    line.unit_rate(),
                    line.rate_period(),
                    rental_days_used(line.rental_start(), r.return_date),
                ));
                late_fees = late_fees.saturating_add(r.late_fee);
                damage = damage.saturating_add(r.damage_charge);
            }

            let outstanding = line.outstanding_quantity();
            if outstanding > 0 {
                subtotal = subtotal.saturating_add(compute_line_charge(
                    outstanding,
                    line.unit_rate(),
                    line.rate_period(),
                    rental_days_used(line.rental_start(), as_of),
                ));
            }

            SettlementSummary::from_charges(
                subtotal,
                late_fees,
                damage,
                extras,
                line.discount(),
                line.tax(),
            )
        }
    }
}

/// Allocate a net paid amount to lines in the given (booking) order.
///
/// Each line takes up to its total; anything left over (a credit after an early
/// return, say) stays on the last line with a positive total.
pub fn allocate_payments(line_totals: &[(LineId, i64)], net_paid: i64) -> Vec<(LineId, i64)> {
    let mut remaining = net_paid.max(0);
    let mut shares: Vec<(LineId, i64)> = line_totals
        .iter()
        .map(|(line_id, total)| {
            let share = remaining.min((*total).max(0));
            remaining -= share;
            (*line_id, share)
        })
        .collect();

    if remaining > 0 {
        let sink = line_totals
            .iter()
            .rposition(|(_, total)| *total > 0)
            .or_else(|| shares.len().checked_sub(1));
        if let Some(idx) = sink {
            shares[idx].1 = shares[idx].1.saturating_add(remaining);
        }
    }
    shares
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettlement {
    pub line_id: LineId,
    pub status: RentalLineStatus,
    pub overdue: bool,
    pub summary: SettlementSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSettlement {
    pub transaction_id: TransactionId,
    pub as_of: NaiveDate,
    pub summary: SettlementSummary,
    pub lines: Vec<LineSettlement>,
}

/// Settle every line of a transaction (`lines` in booking order) and spread the
/// transaction's payments over them.
///
/// A closed line keeps the amount pinned when it closed; only the rest of the
/// net paid amount is allocated FIFO over the lines that are still open.
pub fn settle_transaction(
    transaction_id: TransactionId,
    lines: &[&RentalLine],
    payments: &[PaymentRecord],
    as_of: NaiveDate,
) -> TransactionSettlement {
    let unpaid: Vec<(&RentalLine, SettlementSummary)> =
        lines.iter().map(|l| (*l, settle_line(l, as_of))).collect();
    let pinned = pinned_paid(lines);
    let open: Vec<(LineId, i64)> = unpaid
        .iter()
        .filter(|(l, _)| l.settled_amount().is_none())
        .map(|(l, s)| (l.id_typed(), s.total))
        .collect();
    let mut open_shares = allocate_payments(&open, net_paid(payments).saturating_sub(pinned))
        .into_iter()
        .map(|(_, share)| share);

    let mut summary = SettlementSummary::zero();
    let mut out = Vec::with_capacity(unpaid.len());
    for (line, s) in unpaid {
        let paid = match line.settled_amount() {
            Some(settled) => settled,
            None => open_shares.next().unwrap_or(0),
        };
        let s = s.with_paid(paid);
        summary = summary.add(&s);
        out.push(LineSettlement {
            line_id: line.id_typed(),
            status: line.status(),
            overdue: line.is_overdue(as_of),
            summary: s,
        });
    }

    TransactionSettlement {
        transaction_id,
        as_of,
        summary,
        lines: out,
    }
}

/// Sum of the amounts pinned by closed lines; refunds may not dig into it.
pub fn pinned_paid(lines: &[&RentalLine]) -> i64 {
    lines
        .iter()
        .filter_map(|l| l.settled_amount())
        .fold(0i64, |acc, p| acc.saturating_add(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::tests::{activate, book, day};
    use crate::line::{RecordReturn, RentalLineCommand};
    use crate::returns::{ReturnCondition, ReturnRequest, UnitReturn, build_return};
    use proptest::prelude::*;
    use rentflow_events::execute;

    fn return_units(line: &mut RentalLine, n: usize, condition: ReturnCondition, charge: i64, on: NaiveDate) {
        let units: Vec<_> = line.units_out().into_iter().take(n).collect();
        let request = ReturnRequest {
            line_id: line.id_typed(),
            idempotency_key: format!("ret-{on}-{n}"),
            return_date: on,
            inspector: None,
            units: units
                .into_iter()
                .map(|unit_id| UnitReturn {
                    unit_id,
                    quantity: 1,
                    condition,
                    damage_charge: charge,
                    damage_description: None,
                })
                .collect(),
            extra_charges: Vec::new(),
        };
        let rr = build_return(line, &request, 0, Utc::now()).unwrap();
        execute(
            line,
            &RentalLineCommand::RecordReturn(RecordReturn {
                line_id: line.id_typed(),
                rental_return: rr,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
    }

    fn book_discounted(quantity: u32, start: u32, end: u32, discount: i64) -> RentalLine {
        let line_id = LineId::new();
        let mut line = RentalLine::empty(line_id);
        let cmd = RentalLineCommand::BookLine(crate::line::BookLine {
            line_id,
            transaction_id: TransactionId::new(),
            item_id: rentflow_core::ItemId::new(),
            location_id: rentflow_core::LocationId::new(),
            quantity,
            unit_rate: 100,
            rate_period: crate::charge::RatePeriod::daily(),
            daily_late_rate: 20,
            rental_start: day(start),
            rental_end: day(end),
            discount,
            tax: 0,
            unit_ids: (0..quantity).map(|_| rentflow_core::UnitId::new()).collect(),
            booked_on: day(start),
            occurred_at: Utc::now(),
        });
        execute(&mut line, &cmd).unwrap();
        line
    }

    fn payment(transaction_id: TransactionId, kind: PaymentKind, amount: i64) -> PaymentRecord {
        PaymentRecord {
            payment_id: PaymentId::new(),
            transaction_id,
            kind,
            amount,
            method: "card".into(),
            reference: None,
            idempotency_key: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn clean_full_return() {
        let mut line = book(2, 0, 3);
        activate(&mut line);
        return_units(&mut line, 2, ReturnCondition::Good, 0, day(3));

        let s = settle_line(&line, day(3));
        assert_eq!(s.subtotal, 600);
        assert_eq!(s.late_fees, 0);
        assert_eq!(s.damage_charges, 0);
        assert_eq!(s.total, 600);
        assert_eq!(s.balance_due, 600);
    }

    #[test]
    fn partial_late_damaged_return() {
        let mut line = book(3, 0, 3);
        activate(&mut line);
        return_units(&mut line, 1, ReturnCondition::Damaged, 150, day(5));

        let s = settle_line(&line, day(5));
        assert_eq!(s.late_fees, 40);
        assert_eq!(s.damage_charges, 150);
        // One unit billed for 5 days, two still out billed through as_of.
        assert_eq!(s.subtotal, 500 + 1000);
        assert_eq!(line.status(), RentalLineStatus::PartiallyReturned);
    }

    #[test]
    fn booked_shows_quote_and_cancelled_is_zero() {
        let line = book(2, 0, 4);
        let s = settle_line(&line, day(0));
        assert_eq!(s.subtotal, 800);
        assert_eq!(s.total, 800);

        let mut cancelled = book(2, 0, 4);
        let cmd = RentalLineCommand::CancelLine(crate::line::CancelLine {
            line_id: cancelled.id_typed(),
            cancelled_on: day(0),
            occurred_at: Utc::now(),
        });
        execute(&mut cancelled, &cmd).unwrap();
        assert_eq!(settle_line(&cancelled, day(9)), SettlementSummary::zero());
    }

    #[test]
    fn total_formula_holds() {
        let extras = [ExtraCharge::new("delivery", 25).unwrap()];
        let s = SettlementSummary::from_charges(1000, 40, 150, &extras, 100, 80);
        assert_eq!(s.extra_charges, 25);
        assert_eq!(s.total, 1000 - 100 + 80 + 40 + 150 + 25);
        let paid = s.with_paid(500);
        assert_eq!(paid.balance_due, paid.total - 500);
        assert_eq!(paid.refund_due, 0);
    }

    #[test]
    fn overpayment_is_a_refund_due_not_a_negative_balance() {
        let s = SettlementSummary::from_charges(100, 0, 0, &[], 0, 0).with_paid(300);
        assert_eq!(s.balance_due, 0);
        assert_eq!(s.refund_due, 200);
    }

    #[test]
    fn discount_is_capped_at_billed_subtotal() {
        let s = SettlementSummary::from_charges(100, 20, 0, &[], 250, 10);
        assert_eq!(s.discount, 100);
        assert_eq!(s.total, 10 + 20);

        // Early return of a discounted booking.
        let mut line = book_discounted(1, 0, 5, 400);
        activate(&mut line);
        return_units(&mut line, 1, ReturnCondition::Good, 0, day(1));
        let s = settle_line(&line, day(1));
        assert_eq!(s.subtotal, 100);
        assert_eq!(s.discount, 100);
        assert_eq!(s.total, 0);
    }

    #[test]
    fn fifo_allocation_fills_first_booked_line_first() {
        let a = LineId::new();
        let b = LineId::new();
        let c = LineId::new();
        let shares = allocate_payments(&[(a, 300), (b, 0), (c, 500)], 450);
        assert_eq!(shares, vec![(a, 300), (b, 0), (c, 150)]);

        let credit = allocate_payments(&[(a, 300), (b, 0)], 400);
        assert_eq!(credit, vec![(a, 400), (b, 0)]);
    }

    #[test]
    fn transaction_settlement_nets_refunds() {
        let mut first = book(2, 0, 3);
        activate(&mut first);
        return_units(&mut first, 2, ReturnCondition::Good, 0, day(3));
        let second = book(1, 0, 2);
        let txn = TransactionId::new();

        let payments = vec![
            payment(txn, PaymentKind::Payment, 700),
            payment(txn, PaymentKind::Refund, 50),
        ];
        let t = settle_transaction(txn, &[&first, &second], &payments, day(3));

        assert_eq!(t.summary.total, 600 + 200);
        assert_eq!(t.summary.paid_amount, 650);
        assert_eq!(t.summary.balance_due, 150);
        assert_eq!(t.lines[0].summary.balance_due, 0);
        assert_eq!(t.lines[1].summary.paid_amount, 50);
    }

    #[test]
    fn closed_line_keeps_its_pinned_share() {
        let txn = TransactionId::new();
        // Booked first and still accruing.
        let mut long = book(1, 0, 10);
        activate(&mut long);
        let mut short = book(1, 0, 2);
        activate(&mut short);
        return_units(&mut short, 1, ReturnCondition::Good, 0, day(2));
        let cmd = RentalLineCommand::CloseLine(crate::line::CloseLine {
            line_id: short.id_typed(),
            paid_amount: 200,
            closed_on: day(3),
            occurred_at: Utc::now(),
        });
        execute(&mut short, &cmd).unwrap();

        let payments = vec![payment(txn, PaymentKind::Payment, 500)];
        let t = settle_transaction(txn, &[&long, &short], &payments, day(6));
        assert_eq!(t.lines[1].status, RentalLineStatus::Closed);
        assert_eq!(t.lines[1].summary.paid_amount, 200);
        assert_eq!(t.lines[1].summary.balance_due, 0);
        assert_eq!(t.lines[0].summary.paid_amount, 300);
        assert_eq!(t.lines[0].summary.balance_due, 300);
        assert_eq!(pinned_paid(&[&long, &short]), 200);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn recompute_is_deterministic(returned in 0usize..4, ret_day in 0u32..10, as_of in 0u32..15) {
            let mut line = book(3, 0, 3);
            activate(&mut line);
            if returned > 0 {
                return_units(&mut line, returned.min(3), ReturnCondition::Good, 0, day(ret_day));
            }
            let a = settle_line(&line, day(as_of));
            let b = settle_line(&line, day(as_of));
            prop_assert_eq!(a, b);
            prop_assert_eq!(
                a.total,
                a.subtotal - a.discount + a.tax + a.late_fees + a.damage_charges + a.extra_charges
            );
        }

        #[test]
        fn allocation_conserves_paid(totals in proptest::collection::vec(0i64..1_000, 1..6), paid in 0i64..6_000) {
            let lines: Vec<_> = totals.iter().map(|t| (LineId::new(), *t)).collect();
            let shares = allocate_payments(&lines, paid);
            prop_assert_eq!(shares.iter().map(|(_, s)| *s).sum::<i64>(), paid);
            prop_assert!(shares.iter().all(|(_, s)| *s >= 0));
        }
    }
}
