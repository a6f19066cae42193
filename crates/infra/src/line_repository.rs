//! Rental line repository: event-sourced storage with per-line locks.
//!
//! Lines are persisted as event streams and cached as `Arc<Mutex<RentalLine>>`
//! handles. The mutex is the line lock: every command on a line runs while the
//! caller holds it, so a reader never observes a half-applied return.
//!
//! ```text
//! lock line
//!   ↓
//! handle command (pure decision, produces events)
//!   ↓
//! append to store (ExpectedVersion::Exact(line.version()))
//!   ↓
//! apply events to the cached line
//! ```
//!
//! Publication is the engine's job and happens after the whole operation
//! commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use uuid::Uuid;

use rentflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion, LineId};
use rentflow_rental::{RentalLine, RentalLineCommand, RentalLineEvent};

use crate::error::{EngineError, EngineResult, poisoned};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

pub const LINE_AGGREGATE_TYPE: &str = "rental.line";

pub type LineHandle = Arc<Mutex<RentalLine>>;

/// Events committed by one command, typed and stored side by side.
#[derive(Debug, Clone)]
pub struct CommittedLineEvents {
    pub stored: Vec<StoredEvent>,
    pub events: Vec<RentalLineEvent>,
}

pub struct LineRepository<S> {
    store: S,
    cache: RwLock<HashMap<LineId, LineHandle>>,
}

impl<S> LineRepository<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the lock handle for a booked line, rehydrating it on first access.
    pub fn handle(&self, line_id: LineId) -> EngineResult<LineHandle> {
        if let Some(h) = self
            .cache
            .read()
            .map_err(poisoned("line cache"))?
            .get(&line_id)
        {
            return Ok(Arc::clone(h));
        }

        let line = self.rehydrate(line_id)?;
        if !line.is_booked() {
            return Err(DomainError::not_found(format!("rental line {line_id}")).into());
        }

        let mut cache = self.cache.write().map_err(poisoned("line cache"))?;
        // Another caller may have loaded it meanwhile; keep the first handle.
        let h = cache
            .entry(line_id)
            .or_insert_with(|| Arc::new(Mutex::new(line)));
        Ok(Arc::clone(h))
    }

    /// Register a freshly booked line (already committed via [`Self::commit`]).
    ///
    /// If a reader already rehydrated it from the store, that handle is kept.
    pub fn insert(&self, line: RentalLine) -> EngineResult<LineHandle> {
        let line_id = line.id_typed();
        let mut cache = self.cache.write().map_err(poisoned("line cache"))?;
        let h = cache
            .entry(line_id)
            .or_insert_with(|| Arc::new(Mutex::new(line)));
        Ok(Arc::clone(h))
    }

    /// Every line in the store, sorted by id (booking order, ids are UUIDv7).
    pub fn all(&self) -> EngineResult<Vec<LineHandle>> {
        let ids = self.store.list_streams(LINE_AGGREGATE_TYPE)?;
        ids.into_iter()
            .map(|id| self.handle(LineId::from(id)))
            .collect()
    }

    /// Snapshot a line under its lock.
    pub fn snapshot(&self, line_id: LineId) -> EngineResult<RentalLine> {
        let h = self.handle(line_id)?;
        let guard = h.lock().map_err(poisoned("rental line"))?;
        Ok(guard.clone())
    }

    /// Decide, persist, then apply a command on a line the caller has locked.
    ///
    /// On error nothing is persisted and the line is unchanged.
    pub fn commit(
        &self,
        line: &mut RentalLine,
        command: RentalLineCommand,
    ) -> EngineResult<CommittedLineEvents> {
        let decided = line.handle(&command)?;
        if decided.is_empty() {
            return Ok(CommittedLineEvents {
                stored: vec![],
                events: vec![],
            });
        }

        let aggregate_id = AggregateId::from(line.id_typed());
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, LINE_AGGREGATE_TYPE, Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stored = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(line.version()))?;

        for ev in &decided {
            line.apply(ev);
        }

        Ok(CommittedLineEvents {
            stored,
            events: decided,
        })
    }

    fn rehydrate(&self, line_id: LineId) -> EngineResult<RentalLine> {
        let aggregate_id = AggregateId::from(line_id);
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut line = RentalLine::empty(line_id);
        apply_history(&mut line, &history)?;
        Ok(line)
    }
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> EngineResult<()> {
    // Ensure the stream belongs to this aggregate and is strictly increasing.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))
            .into());
        }
        if e.sequence_number <= last {
            return Err(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))
            .into());
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> EngineResult<()>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| EngineError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::{NaiveDate, Utc};
    use rentflow_core::{ItemId, LocationId, TransactionId, UnitId};
    use rentflow_rental::{ActivateLine, BookLine, RatePeriod, RentalLineStatus};

    fn book_cmd(line_id: LineId) -> RentalLineCommand {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        RentalLineCommand::BookLine(BookLine {
            line_id,
            transaction_id: TransactionId::new(),
            item_id: ItemId::new(),
            location_id: LocationId::new(),
            quantity: 1,
            unit_rate: 100,
            rate_period: RatePeriod::daily(),
            daily_late_rate: 10,
            rental_start: start,
            rental_end: start,
            discount: 0,
            tax: 0,
            unit_ids: vec![UnitId::new()],
            booked_on: start,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn committed_line_rehydrates_from_store() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo = LineRepository::new(Arc::clone(&store));
        let line_id = LineId::new();

        let mut line = RentalLine::empty(line_id);
        let committed = repo.commit(&mut line, book_cmd(line_id)).unwrap();
        assert_eq!(committed.stored[0].sequence_number, 1);
        assert_eq!(committed.stored[0].event_type, "rental.line.booked");

        let activated_on = line.rental_start();
        repo.commit(
            &mut line,
            RentalLineCommand::ActivateLine(ActivateLine {
                line_id,
                activated_on,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        // A second repository over the same store sees the same state.
        let other = LineRepository::new(store);
        let loaded = other.snapshot(line_id).unwrap();
        assert_eq!(loaded, line);
        assert_eq!(loaded.status(), RentalLineStatus::Active);
        assert_eq!(other.all().unwrap().len(), 1);
    }

    #[test]
    fn rejected_command_persists_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let repo = LineRepository::new(Arc::clone(&store));
        let line_id = LineId::new();
        let mut line = RentalLine::empty(line_id);

        let err = repo
            .commit(
                &mut line,
                RentalLineCommand::ActivateLine(ActivateLine {
                    line_id,
                    activated_on: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                    occurred_at: Utc::now(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::NotFound(_))));
        assert!(store.load_stream(line_id.into()).unwrap().is_empty());
        assert_eq!(line.version(), 0);
    }

    #[test]
    fn unknown_line_is_not_found() {
        let repo = LineRepository::new(InMemoryEventStore::new());
        let err = repo.handle(LineId::new()).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::NotFound(_))));
    }
}
