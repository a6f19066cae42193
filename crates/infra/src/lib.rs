//! Infrastructure layer: shared state, locking, persistence and the engine facade.
//!
//! The domain crates decide; this crate owns every lock and every log.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_store;
pub mod idempotency;
pub mod inventory_ledger;
pub mod line_repository;
pub mod return_workflow;
pub mod settlement_ledger;

pub use config::{AppConfig, EngineConfig, ServerConfig};
pub use engine::{
    BookingOutcome, BookingRequest, EngineEnvelope, InMemoryRentalEngine, PaymentInput,
    PaymentOutcome, RentalEngine,
};
pub use error::{EngineError, EngineResult};
pub use return_workflow::ReturnOutcome;
