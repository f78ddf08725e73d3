//! Infrastructure layer for ComplyFlow.
//!
//! Implements the ports defined in `complyflow-core`: SQLite execution
//! storage, the HTTP and simulated task backends, notification channels,
//! plus configuration loading and data-directory resolution.

pub mod config;
pub mod notify;
pub mod sqlite;
pub mod task;
