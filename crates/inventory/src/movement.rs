use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rentflow_core::{Entity, ItemId, LineId, LocationId, MovementId, TransactionId, UnitId};

use crate::unit::{MovementReason, UnitEvent, UnitStatus};

/// Immutable audit record of one unit changing status.
///
/// Exactly one movement is written per accepted unit event; the log is
/// append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub movement_id: MovementId,
    pub unit_id: UnitId,
    pub item_id: ItemId,
    pub location_id: LocationId,
    /// `None` for onboarding.
    pub from_status: Option<UnitStatus>,
    pub to_status: UnitStatus,
    pub quantity: u32,
    pub reason: MovementReason,
    pub transaction_id: Option<TransactionId>,
    pub line_id: Option<LineId>,
    pub idempotency_key: Option<String>,
    /// Unit version after this movement; what an optimistic caller passes next.
    pub unit_version: u64,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn from_event(
        event: &UnitEvent,
        movement_id: MovementId,
        unit_version: u64,
        idempotency_key: Option<String>,
    ) -> Self {
        match event {
            UnitEvent::UnitOnboarded(e) => Self {
                movement_id,
                unit_id: e.unit_id,
                item_id: e.item_id,
                location_id: e.location_id,
                from_status: None,
                to_status: UnitStatus::Available,
                quantity: 1,
                reason: MovementReason::Onboarded,
                transaction_id: None,
                line_id: None,
                idempotency_key,
                unit_version,
                occurred_at: e.occurred_at,
            },
            UnitEvent::UnitStatusChanged(e) => Self {
                movement_id,
                unit_id: e.unit_id,
                item_id: e.item_id,
                location_id: e.location_id,
                from_status: Some(e.from),
                to_status: e.to,
                quantity: 1,
                reason: e.reason,
                transaction_id: e.allocation.map(|a| a.transaction_id),
                line_id: e.allocation.map(|a| a.line_id),
                idempotency_key,
                unit_version,
                occurred_at: e.occurred_at,
            },
        }
    }
}

impl Entity for StockMovement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.movement_id
    }
}
