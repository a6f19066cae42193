//! Charge calculator.
//!
//! Pure, deterministic functions. Money is `i64` in minor units of the single
//! implicit currency; all arithmetic saturates instead of wrapping.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use rentflow_core::{DomainError, DomainResult, ValueObject};

use crate::returns::InspectionReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Day,
    Week,
    Month,
}

impl PeriodUnit {
    /// Length of one period in days (a month bills as 30 days).
    pub fn days(self) -> i64 {
        match self {
            PeriodUnit::Day => 1,
            PeriodUnit::Week => 7,
            PeriodUnit::Month => 30,
        }
    }
}

/// Billing period of a rate, e.g. "per 2 weeks".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePeriod {
    pub value: u32,
    pub unit: PeriodUnit,
}

impl ValueObject for RatePeriod {}

impl RatePeriod {
    pub fn new(value: u32, unit: PeriodUnit) -> DomainResult<Self> {
        if value == 0 {
            return Err(DomainError::validation("rate period value must be at least 1"));
        }
        Ok(Self { value, unit })
    }

    pub fn daily() -> Self {
        Self {
            value: 1,
            unit: PeriodUnit::Day,
        }
    }

    pub fn in_days(&self) -> i64 {
        period_in_days(self.value, self.unit)
    }
}

/// Caller-supplied charge passed through to the line total (cleaning fee, fuel...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraCharge {
    pub description: String,
    pub amount: i64,
}

impl ValueObject for ExtraCharge {}

impl ExtraCharge {
    pub fn new(description: impl Into<String>, amount: i64) -> DomainResult<Self> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(DomainError::validation("extra charge description is required"));
        }
        if amount < 0 {
            return Err(DomainError::validation("extra charge amount must be non-negative"));
        }
        Ok(Self { description, amount })
    }
}

pub fn period_in_days(value: u32, unit: PeriodUnit) -> i64 {
    i64::from(value).saturating_mul(unit.days())
}

/// `quantity * unit_rate * ceil(rental_days_used / period_in_days)`.
///
/// A started period bills in full. Non-positive usage bills nothing.
pub fn compute_line_charge(
    quantity: u32,
    unit_rate: i64,
    period: RatePeriod,
    rental_days_used: i64,
) -> i64 {
    let period_days = period.in_days();
    if rental_days_used <= 0 || period_days <= 0 {
        return 0;
    }
    let periods = rental_days_used.div_euclid(period_days)
        + i64::from(rental_days_used.rem_euclid(period_days) != 0);

    i64::from(quantity)
        .saturating_mul(unit_rate)
        .saturating_mul(periods)
}

pub fn compute_late_fee(days_overdue: i64, daily_late_rate: i64, quantity: u32) -> i64 {
    if days_overdue <= 0 {
        return 0;
    }
    days_overdue
        .saturating_mul(daily_late_rate)
        .saturating_mul(i64::from(quantity))
}

pub fn compute_damage_charge(reports: &[InspectionReport]) -> i64 {
    reports
        .iter()
        .fold(0i64, |acc, r| acc.saturating_add(r.damage_charge))
}

pub fn compute_line_total(base: i64, late_fee: i64, damage: i64, extras: &[ExtraCharge]) -> i64 {
    extras
        .iter()
        .fold(base.saturating_add(late_fee).saturating_add(damage), |acc, c| {
            acc.saturating_add(c.amount)
        })
}

/// Whole days from `start` to `through`, never less than one.
pub fn rental_days_used(start: NaiveDate, through: NaiveDate) -> i64 {
    (through - start).num_days().max(1)
}

/// Days past `rental_end` (after the grace period) at which units came back.
pub fn days_overdue(rental_end: NaiveDate, returned_on: NaiveDate, grace_days: u32) -> i64 {
    ((returned_on - rental_end).num_days() - i64::from(grace_days)).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + chrono::Days::new(u64::from(n))
    }

    #[test]
    fn partial_periods_bill_in_full() {
        let week = RatePeriod::new(1, PeriodUnit::Week).unwrap();
        assert_eq!(compute_line_charge(1, 500, week, 1), 500);
        assert_eq!(compute_line_charge(1, 500, week, 7), 500);
        assert_eq!(compute_line_charge(1, 500, week, 8), 1000);
        assert_eq!(compute_line_charge(2, 500, week, 15), 3000);
    }

    #[test]
    fn daily_rate_for_three_days() {
        assert_eq!(compute_line_charge(2, 100, RatePeriod::daily(), 3), 600);
    }

    #[test]
    fn month_is_thirty_days() {
        assert_eq!(period_in_days(1, PeriodUnit::Month), 30);
        assert_eq!(period_in_days(2, PeriodUnit::Week), 14);
        let month = RatePeriod::new(1, PeriodUnit::Month).unwrap();
        assert_eq!(compute_line_charge(1, 3000, month, 31), 6000);
    }

    #[test]
    fn zero_period_value_is_rejected() {
        assert!(RatePeriod::new(0, PeriodUnit::Day).is_err());
    }

    #[test]
    fn late_fee_only_for_positive_overdue() {
        assert_eq!(compute_late_fee(2, 20, 1), 40);
        assert_eq!(compute_late_fee(0, 20, 3), 0);
        assert_eq!(compute_late_fee(-4, 20, 3), 0);
    }

    #[test]
    fn day_helpers() {
        assert_eq!(rental_days_used(day(0), day(3)), 3);
        assert_eq!(rental_days_used(day(0), day(0)), 1);
        assert_eq!(rental_days_used(day(5), day(2)), 1);

        assert_eq!(days_overdue(day(3), day(5), 0), 2);
        assert_eq!(days_overdue(day(3), day(5), 1), 1);
        assert_eq!(days_overdue(day(3), day(2), 0), 0);
    }

    #[test]
    fn total_passes_extras_through() {
        let extras = vec![
            ExtraCharge::new("cleaning", 25).unwrap(),
            ExtraCharge::new("fuel", 10).unwrap(),
        ];
        assert_eq!(compute_line_total(600, 40, 150, &extras), 825);
    }

    #[test]
    fn extra_charge_validation() {
        assert!(ExtraCharge::new("  ", 5).is_err());
        assert!(ExtraCharge::new("cleaning", -1).is_err());
    }

    #[test]
    fn arithmetic_saturates() {
        assert_eq!(compute_line_charge(u32::MAX, i64::MAX, RatePeriod::daily(), 10), i64::MAX);
        assert_eq!(compute_late_fee(i64::MAX, 2, 2), i64::MAX);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn line_charge_is_deterministic_and_monotonic(
            qty in 1u32..50,
            rate in 0i64..10_000,
            value in 1u32..5,
            unit in prop_oneof![Just(PeriodUnit::Day), Just(PeriodUnit::Week), Just(PeriodUnit::Month)],
            days in 1i64..400,
        ) {
            let period = RatePeriod::new(value, unit).unwrap();
            let a = compute_line_charge(qty, rate, period, days);
            let b = compute_line_charge(qty, rate, period, days);
            prop_assert_eq!(a, b);

            // One more day never costs less.
            prop_assert!(compute_line_charge(qty, rate, period, days + 1) >= a);

            // Exact multiple of a unit-quantity single-period charge.
            let one = compute_line_charge(1, rate, period, 1);
            prop_assert_eq!(a % one.max(1), 0);
        }

        #[test]
        fn late_fee_is_never_negative(days in -30i64..30, rate in 0i64..1_000, qty in 0u32..20) {
            prop_assert!(compute_late_fee(days, rate, qty) >= 0);
        }
    }
}
