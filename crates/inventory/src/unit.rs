use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentflow_core::{
    Aggregate, AggregateRoot, DomainError, ExpectedVersion, ItemId, LineId, LocationId,
    TransactionId, UnitId,
};
use rentflow_events::Event;

/// Status of one physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Reserved,
    Rented,
    Maintenance,
    Damaged,
    Lost,
    Retired,
}

/// Every allowed unit status change. Anything else is an integrity violation.
pub const UNIT_TRANSITIONS: &[(UnitStatus, UnitStatus)] = &[
    (UnitStatus::Available, UnitStatus::Reserved),
    (UnitStatus::Reserved, UnitStatus::Rented),
    (UnitStatus::Reserved, UnitStatus::Available),
    (UnitStatus::Rented, UnitStatus::Available),
    (UnitStatus::Rented, UnitStatus::Maintenance),
    (UnitStatus::Rented, UnitStatus::Damaged),
    (UnitStatus::Rented, UnitStatus::Lost),
    (UnitStatus::Maintenance, UnitStatus::Available),
    (UnitStatus::Available, UnitStatus::Maintenance),
    (UnitStatus::Damaged, UnitStatus::Maintenance),
    (UnitStatus::Available, UnitStatus::Retired),
    (UnitStatus::Maintenance, UnitStatus::Retired),
    (UnitStatus::Damaged, UnitStatus::Retired),
    (UnitStatus::Lost, UnitStatus::Retired),
];

impl UnitStatus {
    pub const ALL: [UnitStatus; 7] = [
        UnitStatus::Available,
        UnitStatus::Reserved,
        UnitStatus::Rented,
        UnitStatus::Maintenance,
        UnitStatus::Damaged,
        UnitStatus::Lost,
        UnitStatus::Retired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Reserved => "reserved",
            UnitStatus::Rented => "rented",
            UnitStatus::Maintenance => "maintenance",
            UnitStatus::Damaged => "damaged",
            UnitStatus::Lost => "lost",
            UnitStatus::Retired => "retired",
        }
    }

    pub fn can_transition_to(self, to: UnitStatus) -> bool {
        UNIT_TRANSITIONS.contains(&(self, to))
    }

    /// Statuses a rented unit may be released into after a return.
    pub fn is_release_target(self) -> bool {
        UnitStatus::Rented.can_transition_to(self)
    }
}

impl core::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a unit changed status (recorded on every stock movement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    Onboarded,
    Reserved,
    ReservationCancelled,
    RentalStarted,
    ReturnedGood,
    ReturnedDamaged,
    ReturnedLost,
    ReturnedToMaintenance,
    SentToMaintenance,
    RepairCompleted,
    Retired,
}

/// The rental line a unit is held for while RESERVED or RENTED.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub transaction_id: TransactionId,
    pub line_id: LineId,
}

/// Aggregate root: InventoryUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    id: UnitId,
    item_id: ItemId,
    location_id: LocationId,
    status: UnitStatus,
    allocation: Option<Allocation>,
    version: u64,
    created: bool,
}

impl InventoryUnit {
    /// Create an empty, not-yet-onboarded aggregate instance for rehydration.
    pub fn empty(id: UnitId, item_id: ItemId, location_id: LocationId) -> Self {
        Self {
            id,
            item_id,
            location_id,
            status: UnitStatus::Available,
            allocation: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> UnitId {
        self.id
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn location_id(&self) -> LocationId {
        self.location_id
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.allocation
    }

    pub fn is_allocated_to(&self, line_id: LineId) -> bool {
        self.allocation.map(|a| a.line_id) == Some(line_id)
    }

    pub fn is_onboarded(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for InventoryUnit {
    type Id = UnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OnboardUnit (catalog onboarding).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardUnit {
    pub unit_id: UnitId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransitionUnit.
///
/// `allocation` is required when reserving, and when present on any other
/// transition it must match the unit's current allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionUnit {
    pub unit_id: UnitId,
    pub to: UnitStatus,
    pub reason: MovementReason,
    pub allocation: Option<Allocation>,
    pub expected_version: ExpectedVersion,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitCommand {
    Onboard(OnboardUnit),
    Transition(TransitionUnit),
}

/// Event: UnitOnboarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOnboarded {
    pub unit_id: UnitId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitStatusChanged.
///
/// `allocation` is the line the unit was held for by this transition (the new
/// allocation when reserving, the released one otherwise).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatusChanged {
    pub unit_id: UnitId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub reason: MovementReason,
    pub allocation: Option<Allocation>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitEvent {
    UnitOnboarded(UnitOnboarded),
    UnitStatusChanged(UnitStatusChanged),
}

impl Event for UnitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UnitEvent::UnitOnboarded(_) => "inventory.unit.onboarded",
            UnitEvent::UnitStatusChanged(_) => "inventory.unit.status_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UnitEvent::UnitOnboarded(e) => e.occurred_at,
            UnitEvent::UnitStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryUnit {
    type Command = UnitCommand;
    type Event = UnitEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UnitEvent::UnitOnboarded(e) => {
                self.id = e.unit_id;
                self.item_id = e.item_id;
                self.location_id = e.location_id;
                self.status = UnitStatus::Available;
                self.allocation = None;
                self.created = true;
            }
            UnitEvent::UnitStatusChanged(e) => {
                self.status = e.to;
                self.allocation = match e.to {
                    UnitStatus::Reserved | UnitStatus::Rented => e.allocation,
                    _ => None,
                };
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            UnitCommand::Onboard(cmd) => self.handle_onboard(cmd),
            UnitCommand::Transition(cmd) => self.handle_transition(cmd),
        }
    }
}

impl InventoryUnit {
    fn ensure_unit_id(&self, unit_id: UnitId) -> Result<(), DomainError> {
        if self.id != unit_id {
            return Err(DomainError::invariant("unit_id mismatch"));
        }
        Ok(())
    }

    fn handle_onboard(&self, cmd: &OnboardUnit) -> Result<Vec<UnitEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict(format!("unit {} already onboarded", cmd.unit_id)));
        }
        self.ensure_unit_id(cmd.unit_id)?;

        Ok(vec![UnitEvent::UnitOnboarded(UnitOnboarded {
            unit_id: cmd.unit_id,
            item_id: cmd.item_id,
            location_id: cmd.location_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionUnit) -> Result<Vec<UnitEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("unit {}", cmd.unit_id)));
        }
        self.ensure_unit_id(cmd.unit_id)?;

        if !cmd.expected_version.matches(self.version) {
            return Err(DomainError::StaleUnitVersion {
                unit_id: self.id,
                expected: match cmd.expected_version {
                    ExpectedVersion::Exact(v) => v,
                    ExpectedVersion::Any => self.version,
                },
                actual: self.version,
            });
        }

        if !self.status.can_transition_to(cmd.to) {
            return Err(DomainError::InvalidUnitTransition {
                unit_id: self.id,
                from: self.status.to_string(),
                to: cmd.to.to_string(),
            });
        }

        let allocation = if cmd.to == UnitStatus::Reserved {
            match cmd.allocation {
                Some(a) => Some(a),
                None => {
                    return Err(DomainError::validation(
                        "reserving a unit requires a line allocation",
                    ));
                }
            }
        } else {
            if let (Some(requested), Some(current)) = (cmd.allocation, self.allocation) {
                if requested.line_id != current.line_id {
                    return Err(DomainError::validation(format!(
                        "unit {} is allocated to line {}, not {}",
                        self.id, current.line_id, requested.line_id
                    )));
                }
            }
            self.allocation
        };

        Ok(vec![UnitEvent::UnitStatusChanged(UnitStatusChanged {
            unit_id: self.id,
            item_id: self.item_id,
            location_id: self.location_id,
            from: self.status,
            to: cmd.to,
            reason: cmd.reason,
            allocation,
            occurred_at: cmd.occurred_at,
        })])
    }
}
