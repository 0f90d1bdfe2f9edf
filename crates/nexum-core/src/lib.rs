//! Client-side execution engine for Nexum durable workflows.
//!
//! - [`workflow`]: declare a DAG of typed nodes with [`WorkflowBuilder`] and
//!   compile it into a hash-addressed [`BuiltWorkflow`].
//! - [`coordinator`]: the ports a remote coordinator implements.
//! - [`worker`]: the poll loop that claims tasks and runs the local half of
//!   each node kind's protocol.
//!
//! Infrastructure (config loading, the in-memory coordinator) lives in
//! `nexum-infra`.

pub mod coordinator;
pub mod worker;
pub mod workflow;

pub use workflow::builder::WorkflowBuilder;
pub use workflow::definition::BuiltWorkflow;
