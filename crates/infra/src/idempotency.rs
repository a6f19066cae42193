//! Client idempotency keys.
//!
//! A key is remembered together with the target it was first used for (a
//! transaction or a line) and the id of what the request produced. Reusing the
//! key for the same target replays that result; reusing it for a different
//! target is rejected with `DuplicateIdempotencyKey`.
//!
//! Claims are made inside an operation's commit step, under the locks of the
//! target, so two concurrent submissions of one key cannot both commit.

use std::collections::HashMap;
use std::sync::RwLock;

use rentflow_core::{DomainError, LineId, PaymentId, ReturnId};

use crate::error::{EngineResult, poisoned};

/// Keys are unique per kind of operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IdempotencyScope {
    Booking,
    Return,
    Payment,
}

/// What a committed request produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdempotentResult {
    Booking(LineId),
    Return { line_id: LineId, return_id: ReturnId },
    Payment(PaymentId),
}

#[derive(Debug, Clone)]
struct Claim {
    target: String,
    result: IdempotentResult,
}

#[derive(Debug, Default)]
pub struct IdempotencyRegistry {
    claims: RwLock<HashMap<(IdempotencyScope, String), Claim>>,
}

impl IdempotencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a key up before doing any work.
    ///
    /// `Ok(Some(_))` means the same request already committed and should be
    /// replayed. `Ok(None)` means the key is unused.
    pub fn check(
        &self,
        scope: IdempotencyScope,
        key: &str,
        target: &str,
    ) -> EngineResult<Option<IdempotentResult>> {
        let claims = self.claims.read().map_err(poisoned("idempotency registry"))?;
        match claims.get(&(scope, key.to_string())) {
            None => Ok(None),
            Some(c) if c.target == target => Ok(Some(c.result)),
            Some(c) => Err(duplicate(key, &c.target)),
        }
    }

    /// Record a key for a committed result. Fails if the key is already taken.
    pub fn claim(
        &self,
        scope: IdempotencyScope,
        key: &str,
        target: &str,
        result: IdempotentResult,
    ) -> EngineResult<()> {
        let mut claims = self.claims.write().map_err(poisoned("idempotency registry"))?;
        let entry = (scope, key.to_string());
        if let Some(existing) = claims.get(&entry) {
            return Err(duplicate(key, &existing.target));
        }
        claims.insert(
            entry,
            Claim {
                target: target.to_string(),
                result,
            },
        );
        Ok(())
    }

    /// Undo a claim whose operation failed to commit.
    pub fn release(&self, scope: IdempotencyScope, key: &str) -> EngineResult<()> {
        self.claims
            .write()
            .map_err(poisoned("idempotency registry"))?
            .remove(&(scope, key.to_string()));
        Ok(())
    }
}

fn duplicate(key: &str, existing_target: &str) -> crate::error::EngineError {
    DomainError::DuplicateIdempotencyKey {
        key: key.to_string(),
        existing_target: existing_target.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_target_replays_and_other_target_is_rejected() {
        let reg = IdempotencyRegistry::new();
        let line_id = LineId::new();
        assert_eq!(reg.check(IdempotencyScope::Booking, "k1", "txn-a").unwrap(), None);

        reg.claim(IdempotencyScope::Booking, "k1", "txn-a", IdempotentResult::Booking(line_id))
            .unwrap();

        assert_eq!(
            reg.check(IdempotencyScope::Booking, "k1", "txn-a").unwrap(),
            Some(IdempotentResult::Booking(line_id))
        );
        let err = reg.check(IdempotencyScope::Booking, "k1", "txn-b").unwrap_err();
        assert_eq!(err.code(), "duplicate_idempotency_key");
    }

    #[test]
    fn scopes_are_independent() {
        let reg = IdempotencyRegistry::new();
        reg.claim(
            IdempotencyScope::Payment,
            "k",
            "txn-a",
            IdempotentResult::Payment(PaymentId::new()),
        )
        .unwrap();
        assert_eq!(reg.check(IdempotencyScope::Return, "k", "line-a").unwrap(), None);
    }

    #[test]
    fn double_claim_fails_and_release_frees_the_key() {
        let reg = IdempotencyRegistry::new();
        let result = IdempotentResult::Booking(LineId::new());
        reg.claim(IdempotencyScope::Booking, "k", "t", result).unwrap();
        assert!(reg.claim(IdempotencyScope::Booking, "k", "t", result).is_err());

        reg.release(IdempotencyScope::Booking, "k").unwrap();
        assert_eq!(reg.check(IdempotencyScope::Booking, "k", "t").unwrap(), None);
    }
}
