//! Domain error model.

use serde::Serialize;
use thiserror::Error;

use crate::id::{ItemId, LineId, LocationId, TransactionId, UnitId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
///
/// Variants carry enough structured detail (ids, requested vs available
/// quantities) for a caller to render a message without parsing strings.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (data integrity defect).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict occurred (e.g. stale stream version).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Fewer units are AVAILABLE than requested.
    #[error("insufficient stock for item {item_id} at {location_id}: requested {requested}, available {available}")]
    InsufficientStock {
        item_id: ItemId,
        location_id: LocationId,
        requested: u32,
        available: u32,
    },

    /// A unit status change is not in the transition table.
    #[error("invalid transition for unit {unit_id}: {from} -> {to}")]
    InvalidUnitTransition {
        unit_id: UnitId,
        from: String,
        to: String,
    },

    /// A rental line command is not allowed in the line's current status.
    #[error("line {line_id} cannot {action} while {status}")]
    InvalidLineTransition {
        line_id: LineId,
        status: String,
        action: String,
    },

    /// Return request exceeds the quantity still out on rent.
    #[error("over-return on line {line_id}: requested {requested}, outstanding {outstanding}")]
    OverReturn {
        line_id: LineId,
        requested: u32,
        outstanding: u32,
    },

    /// Idempotency key already committed for a different request target.
    #[error("idempotency key '{key}' already used for {existing_target}")]
    DuplicateIdempotencyKey { key: String, existing_target: String },

    /// Optimistic concurrency failure on a single unit.
    #[error("stale version for unit {unit_id}: expected {expected}, actual {actual}")]
    StaleUnitVersion {
        unit_id: UnitId,
        expected: u64,
        actual: u64,
    },

    /// Payment would push the balance below zero.
    #[error("payment of {amount} on transaction {transaction_id} exceeds outstanding balance {outstanding}")]
    Overpayment {
        transaction_id: TransactionId,
        amount: i64,
        outstanding: i64,
    },

    /// Operation would leave a negative balance; a refund must be recorded first.
    #[error("transaction {transaction_id} needs a refund of {amount} first")]
    RefundRequired {
        transaction_id: TransactionId,
        amount: i64,
    },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_line_transition(
        line_id: LineId,
        status: impl core::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidLineTransition {
            line_id,
            status: status.to_string(),
            action: action.into(),
        }
    }

    /// Integrity violations: a programming or data error, never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_) | Self::InvalidUnitTransition { .. }
        )
    }

    /// Conflicts the caller should resolve by re-running the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleUnitVersion { .. } | Self::Conflict(_))
    }

    /// Stable machine-readable code (used by transports).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidId(_) => "invalid_id",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::InvalidUnitTransition { .. } => "invalid_unit_transition",
            Self::InvalidLineTransition { .. } => "invalid_line_transition",
            Self::OverReturn { .. } => "over_return",
            Self::DuplicateIdempotencyKey { .. } => "duplicate_idempotency_key",
            Self::StaleUnitVersion { .. } => "stale_unit_version",
            Self::Overpayment { .. } => "overpayment",
            Self::RefundRequired { .. } => "refund_required",
        }
    }
}
