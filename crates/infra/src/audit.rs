//! Append-only audit log of committed returns.

use std::sync::RwLock;

use rentflow_core::{LineId, TransactionId};
use rentflow_rental::RentalReturnEvent;

use crate::error::{EngineResult, poisoned};

#[derive(Debug, Default)]
pub struct ReturnEventLog {
    events: RwLock<Vec<RentalReturnEvent>>,
}

impl ReturnEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event; returns its 1-based position in the log.
    pub fn append(&self, event: RentalReturnEvent) -> EngineResult<u64> {
        let mut events = self.events.write().map_err(poisoned("return event log"))?;
        events.push(event);
        Ok(events.len() as u64)
    }

    pub fn all(&self) -> EngineResult<Vec<RentalReturnEvent>> {
        Ok(self.events.read().map_err(poisoned("return event log"))?.clone())
    }

    pub fn for_line(&self, line_id: LineId) -> EngineResult<Vec<RentalReturnEvent>> {
        self.filtered(|e| e.line_id == line_id)
    }

    pub fn for_transaction(&self, transaction_id: TransactionId) -> EngineResult<Vec<RentalReturnEvent>> {
        self.filtered(|e| e.transaction_id == transaction_id)
    }

    /// First event matching `f`, with its 1-based position.
    pub fn find(
        &self,
        f: impl Fn(&RentalReturnEvent) -> bool,
    ) -> EngineResult<Option<(u64, RentalReturnEvent)>> {
        Ok(self
            .events
            .read()
            .map_err(poisoned("return event log"))?
            .iter()
            .enumerate()
            .find(|(_, e)| f(e))
            .map(|(i, e)| (i as u64 + 1, e.clone())))
    }

    pub fn len(&self) -> EngineResult<usize> {
        Ok(self.events.read().map_err(poisoned("return event log"))?.len())
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    fn filtered(&self, f: impl Fn(&RentalReturnEvent) -> bool) -> EngineResult<Vec<RentalReturnEvent>> {
        Ok(self
            .events
            .read()
            .map_err(poisoned("return event log"))?
            .iter()
            .filter(|e| f(e))
            .cloned()
            .collect())
    }
}
