//! Inventory ledger: the source of truth for unit status and stock counts.
//!
//! Units are grouped into pools (one per item/location). Each pool sits behind
//! its own mutex together with its `StockLevel`, so counts and unit records are
//! updated under the same lock and never observed out of sync. Operations that
//! touch several pools lock them in `PoolKey` order.
//!
//! Every multi-unit operation is two-phase:
//! 1. decide every unit transition and the resulting counts on copies
//! 2. run the caller's commit closure (line events, idempotency record)
//! 3. apply the decided unit events and append the movements
//!
//! If anything fails before step 3 nothing changes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use rentflow_core::{
    Aggregate, AggregateRoot, DomainError, ExpectedVersion, ItemId, LocationId, MovementId,
    TransactionId, UnitId,
};
use rentflow_inventory::{
    Allocation, InventoryUnit, MovementReason, OnboardUnit, StockLevel, StockMovement,
    TransitionUnit, UnitCommand, UnitEvent, UnitStatus,
};

use crate::error::{EngineResult, poisoned};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolKey {
    pub item_id: ItemId,
    pub location_id: LocationId,
}

impl PoolKey {
    pub fn new(item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            item_id,
            location_id,
        }
    }
}

#[derive(Debug)]
struct StockPool {
    /// Ordered by unit id, which gives reservations a deterministic pick order.
    units: BTreeMap<UnitId, InventoryUnit>,
    level: StockLevel,
}

impl StockPool {
    fn new(key: PoolKey) -> Self {
        Self {
            units: BTreeMap::new(),
            level: StockLevel::empty(key.item_id, key.location_id),
        }
    }
}

/// One requested unit status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitChange {
    pub unit_id: UnitId,
    pub to: UnitStatus,
    pub reason: MovementReason,
    pub allocation: Option<Allocation>,
    pub expected_version: ExpectedVersion,
    /// Statuses the unit must currently be in. Stricter than the transition
    /// table for operations that only make sense from one state.
    pub allowed_from: &'static [UnitStatus],
}

impl UnitChange {
    pub fn new(unit_id: UnitId, to: UnitStatus, reason: MovementReason) -> Self {
        Self {
            unit_id,
            to,
            reason,
            allocation: None,
            expected_version: ExpectedVersion::Any,
            allowed_from: &[],
        }
    }

    pub fn for_line(mut self, allocation: Allocation) -> Self {
        self.allocation = Some(allocation);
        self
    }

    pub fn expecting(mut self, version: ExpectedVersion) -> Self {
        self.expected_version = version;
        self
    }

    pub fn from_only(mut self, statuses: &'static [UnitStatus]) -> Self {
        self.allowed_from = statuses;
        self
    }
}

/// Result of a committed multi-unit operation.
#[derive(Debug, Clone)]
pub struct UnitTransitionOutcome<T> {
    pub committed: T,
    pub movements: Vec<StockMovement>,
}

const FROM_RESERVED: &[UnitStatus] = &[UnitStatus::Reserved];
const FROM_RENTED: &[UnitStatus] = &[UnitStatus::Rented];
const FROM_SERVICEABLE: &[UnitStatus] = &[UnitStatus::Available, UnitStatus::Damaged];
const FROM_MAINTENANCE: &[UnitStatus] = &[UnitStatus::Maintenance];

#[derive(Debug, Default)]
pub struct InventoryLedger {
    pools: RwLock<HashMap<PoolKey, Arc<Mutex<StockPool>>>>,
    unit_index: RwLock<HashMap<UnitId, PoolKey>>,
    movements: RwLock<Vec<StockMovement>>,
}

type LockedPools<'a> = Vec<(PoolKey, MutexGuard<'a, StockPool>)>;

struct PlannedChange {
    pool_idx: usize,
    unit_id: UnitId,
    events: Vec<UnitEvent>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- commands -------------------------------------------------------

    /// Register a new AVAILABLE unit (catalog onboarding).
    pub fn onboard_unit(
        &self,
        unit_id: UnitId,
        item_id: ItemId,
        location_id: LocationId,
    ) -> EngineResult<StockMovement> {
        let key = PoolKey::new(item_id, location_id);
        let pool = self.pool_or_create(key)?;
        let mut pool = pool.lock().map_err(poisoned("stock pool"))?;

        // Claim the unit id under the index lock so two onboardings cannot race.
        {
            let mut index = self.unit_index.write().map_err(poisoned("unit index"))?;
            if index.contains_key(&unit_id) {
                return Err(DomainError::conflict(format!("unit {unit_id} already onboarded")).into());
            }
            index.insert(unit_id, key);
        }

        let mut unit = InventoryUnit::empty(unit_id, item_id, location_id);
        let events = match unit.handle(&UnitCommand::Onboard(OnboardUnit {
            unit_id,
            item_id,
            location_id,
            occurred_at: Utc::now(),
        })) {
            Ok(events) => events,
            Err(e) => {
                if let Ok(mut index) = self.unit_index.write() {
                    index.remove(&unit_id);
                }
                return Err(e.into());
            }
        };

        let mut movements = Vec::with_capacity(events.len());
        for e in &events {
            unit.apply(e);
            pool.level.record_onboarded();
            movements.push(StockMovement::from_event(e, MovementId::new(), unit.version(), None));
        }
        pool.units.insert(unit_id, unit);
        self.append_movements(&movements)?;

        tracing::info!(%unit_id, %item_id, %location_id, "unit onboarded");
        movements
            .pop()
            .ok_or_else(|| DomainError::invariant("onboarding produced no movement").into())
    }

    /// Reserve `quantity` AVAILABLE units of an item at a location for a line.
    ///
    /// All-or-nothing: fails with `InsufficientStock` and changes nothing when
    /// fewer units are available. `commit` receives the picked unit ids and
    /// runs under the pool lock before any unit changes.
    pub fn reserve<T>(
        &self,
        item_id: ItemId,
        location_id: LocationId,
        quantity: u32,
        allocation: Allocation,
        idempotency_key: Option<&str>,
        commit: impl FnOnce(&[UnitId]) -> EngineResult<T>,
    ) -> EngineResult<UnitTransitionOutcome<T>> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }
        let key = PoolKey::new(item_id, location_id);
        let insufficient = |available: u32| DomainError::InsufficientStock {
            item_id,
            location_id,
            requested: quantity,
            available,
        };

        let Some(pool) = self.pool(key)? else {
            return Err(insufficient(0).into());
        };
        let guard = pool.lock().map_err(poisoned("stock pool"))?;

        let picked: Vec<UnitId> = guard
            .units
            .values()
            .filter(|u| u.status() == UnitStatus::Available)
            .take(quantity as usize)
            .map(|u| u.id_typed())
            .collect();
        if picked.len() < quantity as usize {
            return Err(insufficient(guard.level.available).into());
        }

        let changes: Vec<UnitChange> = picked
            .iter()
            .map(|u| {
                UnitChange::new(*u, UnitStatus::Reserved, MovementReason::Reserved)
                    .for_line(allocation)
            })
            .collect();

        let mut locked: LockedPools<'_> = vec![(key, guard)];
        self.transition_locked(&mut locked, &changes, idempotency_key, |_| commit(&picked))
    }

    /// Apply a batch of unit transitions atomically, together with `commit`.
    pub fn transition_units<T>(
        &self,
        changes: &[UnitChange],
        idempotency_key: Option<&str>,
        commit: impl FnOnce(&[UnitEvent]) -> EngineResult<T>,
    ) -> EngineResult<UnitTransitionOutcome<T>> {
        let mut seen = BTreeSet::new();
        for c in changes {
            if !seen.insert(c.unit_id) {
                return Err(DomainError::validation(format!(
                    "unit {} listed more than once",
                    c.unit_id
                ))
                .into());
            }
        }

        let keys: BTreeSet<PoolKey> = {
            let index = self.unit_index.read().map_err(poisoned("unit index"))?;
            changes
                .iter()
                .map(|c| {
                    index
                        .get(&c.unit_id)
                        .copied()
                        .ok_or_else(|| DomainError::not_found(format!("unit {}", c.unit_id)))
                })
                .collect::<Result<_, _>>()?
        };

        // Lock pools in key order.
        let handles: Vec<(PoolKey, Arc<Mutex<StockPool>>)> = keys
            .into_iter()
            .map(|k| -> EngineResult<(PoolKey, Arc<Mutex<StockPool>>)> {
                let p = self.pool(k)?.ok_or_else(|| {
                    DomainError::invariant(format!("unit index points at missing pool {k:?}"))
                })?;
                Ok((k, p))
            })
            .collect::<EngineResult<_>>()?;
        let mut locked: LockedPools<'_> = Vec::with_capacity(handles.len());
        for (k, p) in &handles {
            locked.push((*k, p.lock().map_err(poisoned("stock pool"))?));
        }

        self.transition_locked(&mut locked, changes, idempotency_key, commit)
    }

    /// Move one unit out of RENTED into AVAILABLE, MAINTENANCE, DAMAGED or LOST.
    pub fn release(
        &self,
        unit_id: UnitId,
        new_status: UnitStatus,
        expected_version: ExpectedVersion,
    ) -> EngineResult<StockMovement> {
        if !new_status.is_release_target() {
            return Err(DomainError::InvalidUnitTransition {
                unit_id,
                from: UnitStatus::Rented.to_string(),
                to: new_status.to_string(),
            }
            .into());
        }
        let reason = match new_status {
            UnitStatus::Available => MovementReason::ReturnedGood,
            UnitStatus::Damaged => MovementReason::ReturnedDamaged,
            UnitStatus::Lost => MovementReason::ReturnedLost,
            _ => MovementReason::ReturnedToMaintenance,
        };
        self.single(
            UnitChange::new(unit_id, new_status, reason)
                .expecting(expected_version)
                .from_only(FROM_RENTED),
        )
    }

    /// Return reserved units to AVAILABLE (booking cancellation).
    pub fn cancel_reservation(&self, unit_ids: &[UnitId]) -> EngineResult<Vec<StockMovement>> {
        let changes: Vec<UnitChange> = unit_ids
            .iter()
            .map(|u| {
                UnitChange::new(*u, UnitStatus::Available, MovementReason::ReservationCancelled)
                    .from_only(FROM_RESERVED)
            })
            .collect();
        Ok(self.transition_units(&changes, None, |_| Ok(()))?.movements)
    }

    /// Move reserved units to RENTED at rental start.
    pub fn activate(&self, unit_ids: &[UnitId]) -> EngineResult<Vec<StockMovement>> {
        let changes = activation_changes(unit_ids, None);
        Ok(self.transition_units(&changes, None, |_| Ok(()))?.movements)
    }

    /// AVAILABLE or DAMAGED → MAINTENANCE.
    pub fn send_to_maintenance(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        self.single(
            UnitChange::new(unit_id, UnitStatus::Maintenance, MovementReason::SentToMaintenance)
                .from_only(FROM_SERVICEABLE),
        )
    }

    /// MAINTENANCE → AVAILABLE.
    pub fn complete_repair(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        self.single(
            UnitChange::new(unit_id, UnitStatus::Available, MovementReason::RepairCompleted)
                .from_only(FROM_MAINTENANCE),
        )
    }

    /// AVAILABLE, MAINTENANCE, DAMAGED or LOST → RETIRED (disposal).
    pub fn retire(&self, unit_id: UnitId) -> EngineResult<StockMovement> {
        self.single(UnitChange::new(unit_id, UnitStatus::Retired, MovementReason::Retired))
    }

    // ---- queries --------------------------------------------------------

    pub fn stock_level(&self, item_id: ItemId, location_id: LocationId) -> EngineResult<StockLevel> {
        let key = PoolKey::new(item_id, location_id);
        match self.pool(key)? {
            Some(p) => Ok(p.lock().map_err(poisoned("stock pool"))?.level.clone()),
            None => Ok(StockLevel::empty(item_id, location_id)),
        }
    }

    pub fn unit(&self, unit_id: UnitId) -> EngineResult<InventoryUnit> {
        let key = self
            .unit_index
            .read()
            .map_err(poisoned("unit index"))?
            .get(&unit_id)
            .copied()
            .ok_or_else(|| DomainError::not_found(format!("unit {unit_id}")))?;
        let pool = self
            .pool(key)?
            .ok_or_else(|| DomainError::invariant(format!("unit index points at missing pool {key:?}")))?;
        let guard = pool.lock().map_err(poisoned("stock pool"))?;
        guard
            .units
            .get(&unit_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found(format!("unit {unit_id}")).into())
    }

    /// Recount unit statuses and compare with the maintained counts.
    ///
    /// A mismatch is an integrity violation.
    pub fn verify_stock(&self, item_id: ItemId, location_id: LocationId) -> EngineResult<StockLevel> {
        let key = PoolKey::new(item_id, location_id);
        let Some(pool) = self.pool(key)? else {
            return Ok(StockLevel::empty(item_id, location_id));
        };
        let guard = pool.lock().map_err(poisoned("stock pool"))?;
        let recounted = StockLevel::recount(item_id, location_id, guard.units.values());

        if recounted != guard.level || !guard.level.is_conserved() {
            tracing::error!(
                %item_id,
                %location_id,
                maintained = ?guard.level,
                recounted = ?recounted,
                "stock level does not match unit statuses"
            );
            return Err(DomainError::invariant(format!(
                "stock level for item {item_id} at {location_id} does not match unit statuses"
            ))
            .into());
        }
        Ok(recounted)
    }

    pub fn movements(&self) -> EngineResult<Vec<StockMovement>> {
        Ok(self.movements.read().map_err(poisoned("movement log"))?.clone())
    }

    pub fn movements_for_unit(&self, unit_id: UnitId) -> EngineResult<Vec<StockMovement>> {
        self.movements_where(|m| m.unit_id == unit_id)
    }

    pub fn movements_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> EngineResult<Vec<StockMovement>> {
        self.movements_where(|m| m.transaction_id == Some(transaction_id))
    }

    pub fn movement_count(&self) -> EngineResult<usize> {
        Ok(self.movements.read().map_err(poisoned("movement log"))?.len())
    }

    // ---- internals ------------------------------------------------------

    fn movements_where(&self, f: impl Fn(&StockMovement) -> bool) -> EngineResult<Vec<StockMovement>> {
        Ok(self
            .movements
            .read()
            .map_err(poisoned("movement log"))?
            .iter()
            .filter(|m| f(m))
            .cloned()
            .collect())
    }

    fn pool(&self, key: PoolKey) -> EngineResult<Option<Arc<Mutex<StockPool>>>> {
        Ok(self
            .pools
            .read()
            .map_err(poisoned("pool map"))?
            .get(&key)
            .map(Arc::clone))
    }

    fn pool_or_create(&self, key: PoolKey) -> EngineResult<Arc<Mutex<StockPool>>> {
        if let Some(p) = self.pool(key)? {
            return Ok(p);
        }
        let mut pools = self.pools.write().map_err(poisoned("pool map"))?;
        Ok(Arc::clone(
            pools
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(StockPool::new(key)))),
        ))
    }

    fn single(&self, change: UnitChange) -> EngineResult<StockMovement> {
        let unit_id = change.unit_id;
        let mut outcome = self.transition_units(std::slice::from_ref(&change), None, |_| Ok(()))?;
        outcome
            .movements
            .pop()
            .ok_or_else(|| DomainError::invariant(format!("no movement recorded for unit {unit_id}")).into())
    }

    fn append_movements(&self, movements: &[StockMovement]) -> EngineResult<()> {
        self.movements
            .write()
            .map_err(poisoned("movement log"))?
            .extend_from_slice(movements);
        Ok(())
    }

    fn transition_locked<T>(
        &self,
        locked: &mut LockedPools<'_>,
        changes: &[UnitChange],
        idempotency_key: Option<&str>,
        commit: impl FnOnce(&[UnitEvent]) -> EngineResult<T>,
    ) -> EngineResult<UnitTransitionOutcome<T>> {
        // 1) Decide on copies.
        let mut levels: Vec<StockLevel> = locked.iter().map(|(_, g)| g.level.clone()).collect();
        let mut planned = Vec::with_capacity(changes.len());
        let now = Utc::now();

        for change in changes {
            let pool_idx = locked
                .iter()
                .position(|(_, g)| g.units.contains_key(&change.unit_id))
                .ok_or_else(|| DomainError::not_found(format!("unit {}", change.unit_id)))?;
            let unit = locked[pool_idx]
                .1
                .units
                .get(&change.unit_id)
                .ok_or_else(|| DomainError::not_found(format!("unit {}", change.unit_id)))?;

            if !change.allowed_from.is_empty() && !change.allowed_from.contains(&unit.status()) {
                return Err(DomainError::InvalidUnitTransition {
                    unit_id: change.unit_id,
                    from: unit.status().to_string(),
                    to: change.to.to_string(),
                }
                .into());
            }

            let events = unit.handle(&UnitCommand::Transition(TransitionUnit {
                unit_id: change.unit_id,
                to: change.to,
                reason: change.reason,
                allocation: change.allocation,
                expected_version: change.expected_version,
                occurred_at: now,
            }))?;
            for e in &events {
                levels[pool_idx].apply_event(e)?;
            }
            planned.push(PlannedChange {
                pool_idx,
                unit_id: change.unit_id,
                events,
            });
        }

        // 2) Commit the caller's side (line events, idempotency record).
        let all_events: Vec<UnitEvent> = planned.iter().flat_map(|p| p.events.iter().cloned()).collect();
        let committed = commit(&all_events)?;

        // 3) Apply. Nothing below can fail on domain grounds.
        let mut movements = Vec::with_capacity(all_events.len());
        for p in &planned {
            if let Some(unit) = locked[p.pool_idx].1.units.get_mut(&p.unit_id) {
                for e in &p.events {
                    unit.apply(e);
                    movements.push(StockMovement::from_event(
                        e,
                        MovementId::new(),
                        unit.version(),
                        idempotency_key.map(str::to_string),
                    ));
                }
            }
        }
        for ((_, guard), level) in locked.iter_mut().zip(levels) {
            guard.level = level;
        }
        self.append_movements(&movements)?;

        for m in &movements {
            tracing::debug!(
                unit_id = %m.unit_id,
                from = ?m.from_status,
                to = %m.to_status,
                reason = ?m.reason,
                "unit status changed"
            );
        }

        Ok(UnitTransitionOutcome {
            committed,
            movements,
        })
    }
}

/// RESERVED → RENTED changes for a line's units.
pub fn activation_changes(unit_ids: &[UnitId], allocation: Option<Allocation>) -> Vec<UnitChange> {
    unit_ids
        .iter()
        .map(|u| {
            let change = UnitChange::new(*u, UnitStatus::Rented, MovementReason::RentalStarted)
                .from_only(FROM_RESERVED);
            match allocation {
                Some(a) => change.for_line(a),
                None => change,
            }
        })
        .collect()
}

/// RESERVED → AVAILABLE changes for a cancelled line's units.
pub fn cancellation_changes(unit_ids: &[UnitId], allocation: Allocation) -> Vec<UnitChange> {
    unit_ids
        .iter()
        .map(|u| {
            UnitChange::new(*u, UnitStatus::Available, MovementReason::ReservationCancelled)
                .for_line(allocation)
                .from_only(FROM_RESERVED)
        })
        .collect()
}

/// RENTED → condition target changes for a return.
pub fn return_change(unit_id: UnitId, to: UnitStatus, reason: MovementReason, allocation: Allocation) -> UnitChange {
    UnitChange::new(unit_id, to, reason)
        .for_line(allocation)
        .from_only(FROM_RENTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentflow_core::LineId;
    use std::thread;

    fn ledger_with_units(n: usize) -> (InventoryLedger, ItemId, LocationId, Vec<UnitId>) {
        let ledger = InventoryLedger::new();
        let item = ItemId::new();
        let loc = LocationId::new();
        let units: Vec<UnitId> = (0..n)
            .map(|_| {
                let id = UnitId::new();
                ledger.onboard_unit(id, item, loc).unwrap();
                id
            })
            .collect();
        (ledger, item, loc, units)
    }

    fn allocation() -> Allocation {
        Allocation {
            transaction_id: TransactionId::new(),
            line_id: LineId::new(),
        }
    }

    #[test]
    fn onboarding_writes_a_movement_without_from_status() {
        let (ledger, item, loc, units) = ledger_with_units(2);
        let level = ledger.stock_level(item, loc).unwrap();
        assert_eq!(level.on_hand, 2);
        assert_eq!(level.available, 2);

        let m = ledger.movements_for_unit(units[0]).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].from_status, None);
        assert_eq!(m[0].reason, MovementReason::Onboarded);

        let err = ledger.onboard_unit(units[0], item, loc).unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));
    }

    #[test]
    fn reserve_picks_units_in_deterministic_order() {
        let (ledger, item, loc, units) = ledger_with_units(3);
        let out = ledger
            .reserve(item, loc, 2, allocation(), Some("book-1"), |picked| Ok(picked.to_vec()))
            .unwrap();

        let mut expected = units.clone();
        expected.sort();
        assert_eq!(out.committed, expected[..2].to_vec());
        assert_eq!(out.movements.len(), 2);
        assert!(out.movements.iter().all(|m| m.idempotency_key.as_deref() == Some("book-1")));

        let level = ledger.stock_level(item, loc).unwrap();
        assert_eq!((level.available, level.reserved), (1, 2));
    }

    #[test]
    fn insufficient_stock_changes_nothing() {
        let (ledger, item, loc, _) = ledger_with_units(2);
        let before = ledger.movement_count().unwrap();

        let err = ledger
            .reserve(item, loc, 3, allocation(), None, |_| Ok(()))
            .unwrap_err();
        assert_eq!(
            err.domain(),
            Some(&DomainError::InsufficientStock {
                item_id: item,
                location_id: loc,
                requested: 3,
                available: 2,
            })
        );
        assert_eq!(ledger.stock_level(item, loc).unwrap().available, 2);
        assert_eq!(ledger.movement_count().unwrap(), before);
    }

    #[test]
    fn failed_commit_rolls_back_unit_changes() {
        let (ledger, item, loc, _) = ledger_with_units(2);
        let before = ledger.movement_count().unwrap();

        let err = ledger
            .reserve(item, loc, 1, allocation(), None, |_| -> EngineResult<()> {
                Err(DomainError::validation("line rejected").into())
            })
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
        assert_eq!(ledger.stock_level(item, loc).unwrap().available, 2);
        assert_eq!(ledger.movement_count().unwrap(), before);
    }

    #[test]
    fn full_cycle_and_release_with_versions() {
        let (ledger, item, loc, _) = ledger_with_units(1);
        let alloc = allocation();
        let reserved = ledger
            .reserve(item, loc, 1, alloc, None, |picked| Ok(picked.to_vec()))
            .unwrap()
            .committed;
        ledger.activate(&reserved).unwrap();

        let unit = ledger.unit(reserved[0]).unwrap();
        assert_eq!(unit.status(), UnitStatus::Rented);
        assert!(unit.is_allocated_to(alloc.line_id));

        let stale = ledger
            .release(reserved[0], UnitStatus::Damaged, ExpectedVersion::Exact(unit.version() - 1))
            .unwrap_err();
        assert!(stale.is_retryable());

        ledger
            .release(reserved[0], UnitStatus::Damaged, ExpectedVersion::Exact(unit.version()))
            .unwrap();
        ledger.send_to_maintenance(reserved[0]).unwrap();
        ledger.complete_repair(reserved[0]).unwrap();
        ledger.retire(reserved[0]).unwrap();

        let level = ledger.verify_stock(item, loc).unwrap();
        assert_eq!(level.retired, 1);
        assert_eq!(level.on_hand, 1);
        assert_eq!(ledger.movements_for_unit(reserved[0]).unwrap().len(), 7);
        assert_eq!(ledger.movements_for_transaction(alloc.transaction_id).unwrap().len(), 3);
    }

    #[test]
    fn release_outside_rented_is_an_integrity_violation() {
        let (ledger, _, _, units) = ledger_with_units(1);
        let err = ledger
            .release(units[0], UnitStatus::Available, ExpectedVersion::Any)
            .unwrap_err();
        assert!(err.is_fatal());

        let err = ledger
            .release(units[0], UnitStatus::Retired, ExpectedVersion::Any)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn cancel_reservation_frees_units() {
        let (ledger, item, loc, _) = ledger_with_units(2);
        let picked = ledger
            .reserve(item, loc, 2, allocation(), None, |p| Ok(p.to_vec()))
            .unwrap()
            .committed;
        ledger.cancel_reservation(&picked).unwrap();
        let level = ledger.stock_level(item, loc).unwrap();
        assert_eq!((level.available, level.reserved), (2, 0));

        // Not reserved any more.
        assert!(ledger.cancel_reservation(&picked).unwrap_err().is_fatal());
    }

    #[test]
    fn maintenance_rules() {
        let (ledger, _, _, units) = ledger_with_units(1);
        assert!(ledger.complete_repair(units[0]).is_err());
        ledger.send_to_maintenance(units[0]).unwrap();
        assert!(ledger.send_to_maintenance(units[0]).is_err());
        ledger.retire(units[0]).unwrap();
        assert!(ledger.retire(units[0]).unwrap_err().is_fatal());
    }

    #[test]
    fn duplicate_unit_in_batch_is_rejected() {
        let (ledger, _, _, units) = ledger_with_units(1);
        let change = UnitChange::new(units[0], UnitStatus::Maintenance, MovementReason::SentToMaintenance);
        let err = ledger
            .transition_units(&[change.clone(), change], None, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
    }

    #[test]
    fn unknown_unit_is_not_found() {
        let ledger = InventoryLedger::new();
        let err = ledger.unit(UnitId::new()).unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::NotFound(_))));
    }

    #[test]
    fn concurrent_reservations_never_over_allocate() {
        let (ledger, item, loc, _) = ledger_with_units(5);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .reserve(item, loc, 1, allocation(), None, |p| Ok(p.to_vec()))
                        .map(|o| o.committed)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(ok.len(), 5);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e.domain(), Some(DomainError::InsufficientStock { .. }))));

        let mut all: Vec<UnitId> = ok.iter().flat_map(|v| v.iter().copied()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 5);

        let level = ledger.verify_stock(item, loc).unwrap();
        assert_eq!((level.available, level.reserved), (0, 5));
    }
}
