//! `rentflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the inventory and
//! rental modules (no infrastructure concerns).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::{Entity, find_by_id};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, InspectionId, ItemId, LineId, LocationId, MovementId, PaymentId, ReturnId,
    ReturnLineId, TransactionId, UnitId,
};
pub use value_object::ValueObject;
