//! Inventory domain module: serialized rental units and their stock counts.
//!
//! This crate contains business rules for unit status tracking, implemented
//! purely as deterministic domain logic (no IO, no locks, no storage). The
//! concurrent ledger that owns unit records lives in `rentflow-infra`.

pub mod movement;
pub mod stock;
pub mod unit;

pub use movement::StockMovement;
pub use stock::StockLevel;
pub use unit::{
    Allocation, InventoryUnit, MovementReason, OnboardUnit, TransitionUnit, UNIT_TRANSITIONS,
    UnitCommand, UnitEvent, UnitOnboarded, UnitStatus, UnitStatusChanged,
};
