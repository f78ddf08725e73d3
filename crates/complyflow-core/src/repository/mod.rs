//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (complyflow-infra) implements. The in-memory implementation lives here
//! because it has no IO dependencies; it backs tests and ephemeral runs.

pub mod execution;
pub mod memory;
