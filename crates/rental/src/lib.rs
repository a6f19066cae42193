//! Rental domain module: charges, line lifecycle, returns and settlement math.
//!
//! Everything here is pure: the charge calculator is a set of free functions,
//! the rental line is an event-sourced aggregate, and settlement summaries are
//! derived from line facts and payment records on demand. Locking, storage and
//! unit bookkeeping live in `rentflow-infra`.

pub mod charge;
pub mod line;
pub mod returns;
pub mod settlement;

pub use charge::{
    ExtraCharge, PeriodUnit, RatePeriod, compute_damage_charge, compute_late_fee,
    compute_line_charge, compute_line_total, days_overdue, period_in_days, rental_days_used,
};
pub use line::{
    ActivateLine, AddExtraCharge, BookLine, CancelLine, CloseLine, ExtraChargeAdded,
    LineActivated, LineBooked, LineCancelled, LineClosed, RecordReturn, RentalLifecycle,
    RentalLine, RentalLineCommand, RentalLineEvent, RentalLineStatus, ReturnRecorded,
    StatusChange,
};
pub use returns::{
    InspectionReport, RentalReturn, RentalReturnEvent, RentalReturnLine, ReturnCondition,
    ReturnRequest, UnitReturn, build_return,
};
pub use settlement::{
    ChargePolicy, LineSettlement, PaymentKind, PaymentRecord, SettlementSummary,
    TransactionSettlement, allocate_payments, net_paid, pinned_paid, settle_line,
    settle_transaction,
};
