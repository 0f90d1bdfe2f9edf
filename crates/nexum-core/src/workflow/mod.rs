//! Workflow declaration and compilation.

pub mod builder;
pub mod context;
pub mod contract;
pub mod dag;
pub mod definition;
pub mod hash;
