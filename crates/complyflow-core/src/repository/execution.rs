//! Execution repository trait definition.
//!
//! Stores execution records and their append-only transition history. The
//! coordinator is the only writer of records; status polling readers go
//! through this trait and must always see a whole record.

use complyflow_types::error::RepositoryError;
use complyflow_types::execution::{ExecutionEvent, ExecutionFilter, ExecutionRecord};
use uuid::Uuid;

/// Repository trait for execution persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id already exists.
    fn insert(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a record by execution id.
    fn get(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// Replace the stored record only while the stored copy is still RUNNING.
    ///
    /// Returns `true` if the record was replaced. This is the compare-and-set
    /// that guarantees exactly one terminal transition.
    fn replace_if_running(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Update `currentState` of a RUNNING record. Returns `false` if the
    /// record is missing or already terminal.
    fn set_current_state(
        &self,
        execution_id: &Uuid,
        state_name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// List records newest-start-first, up to `limit`.
    ///
    /// Implementations should apply `filter` but callers must not rely on it
    /// for tenant isolation.
    fn list(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;

    /// Append a history event. The repository assigns `sequence` (1-based,
    /// gap-free per execution) and returns it; the caller's value is ignored.
    fn append_event(
        &self,
        event: &ExecutionEvent,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// All history events for an execution in sequence order.
    fn list_events(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionEvent>, RepositoryError>> + Send;
}
