//! Observability setup for Nexum workers.

pub mod tracing_setup;
