//! Task backend implementations of `TaskInvoker`.

pub mod http;
pub mod simulated;
