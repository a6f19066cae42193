//! Settlement ledger: per-transaction line lists and payment records.
//!
//! Each transaction has a `TransactionBook` behind its own mutex. That mutex is
//! the transaction lock and is always taken before any line lock. Summaries
//! are never stored; they are re-derived from line snapshots on every read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, NaiveDate, Utc};

use rentflow_core::{DomainError, DomainResult, LineId, PaymentId, TransactionId, find_by_id};
use rentflow_rental::{
    CloseLine, PaymentKind, PaymentRecord, RentalLine, RentalLineCommand, RentalLineStatus,
    TransactionSettlement, net_paid, settle_transaction,
};

use crate::error::{EngineResult, poisoned};
use crate::event_store::EventStore;
use crate::line_repository::{CommittedLineEvents, LineRepository};

#[derive(Debug, Clone)]
pub struct TransactionBook {
    transaction_id: TransactionId,
    /// Booking order; payments are allocated first-booked, first-paid.
    lines: Vec<LineId>,
    payments: Vec<PaymentRecord>,
}

pub type TransactionHandle = Arc<Mutex<TransactionBook>>;

impl TransactionBook {
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            lines: Vec::new(),
            payments: Vec::new(),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn lines(&self) -> &[LineId] {
        &self.lines
    }

    pub fn payments(&self) -> &[PaymentRecord] {
        &self.payments
    }

    pub fn net_paid(&self) -> i64 {
        net_paid(&self.payments)
    }

    pub fn add_line(&mut self, line_id: LineId) {
        if !self.lines.contains(&line_id) {
            self.lines.push(line_id);
        }
    }

    pub fn find_payment(&self, payment_id: PaymentId) -> Option<&PaymentRecord> {
        find_by_id(&self.payments, &payment_id)
    }

    pub fn record(&mut self, payment: PaymentRecord) {
        self.payments.push(payment);
    }
}

/// A payment or refund request, before it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub kind: PaymentKind,
    pub amount: i64,
    pub method: String,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Decide whether a payment or refund is acceptable against the current
/// settlement and build its record.
pub fn decide_payment(
    settlement: &TransactionSettlement,
    paid_so_far: i64,
    request: &PaymentRequest,
    recorded_at: DateTime<Utc>,
) -> DomainResult<PaymentRecord> {
    let transaction_id = settlement.transaction_id;
    if request.amount <= 0 {
        return Err(DomainError::validation("amount must be positive"));
    }
    if request.method.trim().is_empty() {
        return Err(DomainError::validation("payment method is required"));
    }
    if request.idempotency_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
        return Err(DomainError::validation("idempotency key must not be blank"));
    }

    match request.kind {
        PaymentKind::Payment => {
            let outstanding = settlement.summary.balance_due;
            if request.amount > outstanding {
                return Err(DomainError::Overpayment {
                    transaction_id,
                    amount: request.amount,
                    outstanding: outstanding.max(0),
                });
            }
        }
        PaymentKind::Refund => {
            // Shares pinned by closed lines are settled and cannot be refunded.
            let pinned = settlement
                .lines
                .iter()
                .filter(|l| l.status == RentalLineStatus::Closed)
                .fold(0i64, |acc, l| acc.saturating_add(l.summary.paid_amount));
            let refundable = paid_so_far.saturating_sub(pinned).max(0);
            if request.amount > refundable {
                return Err(DomainError::validation(format!(
                    "refund of {} exceeds the {refundable} refundable on transaction \
                     {transaction_id} ({pinned} is settled on closed lines)",
                    request.amount
                )));
            }
        }
    }

    Ok(PaymentRecord {
        payment_id: PaymentId::new(),
        transaction_id,
        kind: request.kind,
        amount: request.amount,
        method: request.method.clone(),
        reference: request.reference.clone(),
        idempotency_key: request.idempotency_key.clone(),
        recorded_at,
    })
}

/// Refund needed before a line can be cancelled, if any.
///
/// Cancelling zeroes the line's charges; when the transaction has been paid
/// more than what would remain, the excess must be refunded first.
pub fn refund_required_for_cancel(
    settlement: &TransactionSettlement,
    line_id: LineId,
    paid_so_far: i64,
) -> DomainResult<()> {
    let line_total = settlement
        .lines
        .iter()
        .find(|l| l.line_id == line_id)
        .map(|l| l.summary.total)
        .unwrap_or(0);
    let remaining_total = settlement.summary.total.saturating_sub(line_total);
    let excess = paid_so_far.saturating_sub(remaining_total);
    if excess > 0 {
        return Err(DomainError::RefundRequired {
            transaction_id: settlement.transaction_id,
            amount: excess,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SettlementLedger {
    books: RwLock<HashMap<TransactionId, TransactionHandle>>,
}

impl SettlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction lock handle, created on first booking.
    pub fn open(&self, transaction_id: TransactionId) -> EngineResult<TransactionHandle> {
        if let Some(h) = self.get(transaction_id)? {
            return Ok(h);
        }
        let mut books = self.books.write().map_err(poisoned("transaction books"))?;
        Ok(Arc::clone(books.entry(transaction_id).or_insert_with(|| {
            Arc::new(Mutex::new(TransactionBook::new(transaction_id)))
        })))
    }

    /// Transaction lock handle for a transaction with at least one booking.
    pub fn existing(&self, transaction_id: TransactionId) -> EngineResult<TransactionHandle> {
        self.get(transaction_id)?
            .ok_or_else(|| DomainError::not_found(format!("transaction {transaction_id}")).into())
    }

    fn get(&self, transaction_id: TransactionId) -> EngineResult<Option<TransactionHandle>> {
        Ok(self
            .books
            .read()
            .map_err(poisoned("transaction books"))?
            .get(&transaction_id)
            .map(Arc::clone))
    }
}

/// Snapshot a transaction's lines, each under its own line lock.
///
/// The caller holds the transaction lock.
pub fn snapshot_lines<S: EventStore>(
    repo: &LineRepository<S>,
    book: &TransactionBook,
) -> EngineResult<Vec<RentalLine>> {
    book.lines().iter().map(|id| repo.snapshot(*id)).collect()
}

pub fn settle_book(book: &TransactionBook, lines: &[RentalLine], as_of: NaiveDate) -> TransactionSettlement {
    let refs: Vec<&RentalLine> = lines.iter().collect();
    settle_transaction(book.transaction_id(), &refs, book.payments(), as_of)
}

/// Close every RETURNED line of the transaction that is paid exactly: no
/// balance left and no credit waiting for a refund.
///
/// The caller holds the transaction lock.
pub fn close_settled<S: EventStore>(
    repo: &LineRepository<S>,
    book: &TransactionBook,
    as_of: NaiveDate,
) -> EngineResult<Vec<CommittedLineEvents>> {
    let lines = snapshot_lines(repo, book)?;
    let settlement = settle_book(book, &lines, as_of);

    let mut closed = Vec::new();
    for ls in &settlement.lines {
        if ls.status != RentalLineStatus::Returned
            || ls.summary.balance_due != 0
            || ls.summary.refund_due != 0
        {
            continue;
        }
        let handle = repo.handle(ls.line_id)?;
        let mut line = handle.lock().map_err(poisoned("rental line"))?;
        // Re-check under the line lock.
        if line.status() != RentalLineStatus::Returned {
            continue;
        }
        let committed = repo.commit(
            &mut line,
            RentalLineCommand::CloseLine(CloseLine {
                line_id: ls.line_id,
                paid_amount: ls.summary.paid_amount,
                closed_on: as_of,
                occurred_at: Utc::now(),
            }),
        )?;
        tracing::info!(
            line_id = %ls.line_id,
            transaction_id = %book.transaction_id(),
            settled_amount = ls.summary.paid_amount,
            "line closed"
        );
        closed.push(committed);
    }
    Ok(closed)
}
