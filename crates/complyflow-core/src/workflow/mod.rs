//! Workflow engine core: definitions, evaluation, and execution lifecycle.
//!
//! - `definition` -- YAML parsing, structural validation, directory loading
//! - `graph` -- petgraph reachability checks over state graphs
//! - `registry` -- immutable catalog of workflow definitions
//! - `path` -- JSON path reads/writes and parameter templates
//! - `choice` -- Choice rule evaluation
//! - `retry` -- Retry/Catch matching and backoff
//! - `evaluator` -- the state machine interpreter
//! - `coordinator` -- start/stop/status/list over persisted executions
//! - `metrics` -- aggregate counters over execution records

pub mod choice;
pub mod coordinator;
pub mod definition;
pub mod evaluator;
pub mod graph;
pub mod metrics;
pub mod path;
pub mod registry;
pub mod retry;
