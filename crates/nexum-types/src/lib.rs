//! Shared data model for the Nexum workflow client.
//!
//! This crate contains the types exchanged between the workflow builder, the
//! worker, and the remote coordinator: node kinds, the canonical IR that is
//! hashed into a workflow version, the coordinator request/response shapes,
//! and worker configuration.
//!
//! No infrastructure dependencies: serde, indexmap, uuid, chrono, thiserror.

pub mod coordinator;
pub mod error;
pub mod ir;
pub mod node;
pub mod task;
pub mod worker;
