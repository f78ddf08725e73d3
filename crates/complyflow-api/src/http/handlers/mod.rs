//! REST API endpoint handlers.

pub mod execution;
pub mod workflow;
