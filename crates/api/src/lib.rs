//! HTTP binding for the rental engine.

pub mod app;
