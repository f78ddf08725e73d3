//! Shared domain types for ComplyFlow.
//!
//! This crate contains the data model used across the orchestration engine:
//! workflow definitions and their state graphs, execution records and
//! history events, the metrics snapshot, engine configuration, and the
//! repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;
