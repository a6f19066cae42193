//! Append-only event store boundary.
//!
//! Rental lines are event-sourced: every lifecycle change is appended to the
//! line's stream and the line is rehydrated from it. This module defines the
//! storage abstraction without making any storage assumptions.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
