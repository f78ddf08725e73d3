//! Orchestration engine and repository trait definitions for ComplyFlow.
//!
//! This crate defines the "ports" (repository, task invoker, notification
//! channel) that the infrastructure layer implements, plus the engine itself:
//! definition registry, state machine evaluator, execution coordinator and
//! metrics. It depends only on `complyflow-types` -- never on
//! `complyflow-infra` or any database/IO crate.

pub mod notify;
pub mod repository;
pub mod task;
pub mod workflow;
