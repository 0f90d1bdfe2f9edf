//! Infrastructure layer for Nexum.
//!
//! Adapters for the ports defined in `nexum-core`: worker configuration
//! loading (TOML file plus environment overrides) and a non-durable,
//! in-process coordinator used for local development and end-to-end tests.

pub mod config;
pub mod memory;
