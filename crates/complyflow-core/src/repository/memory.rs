//! In-memory execution repository.
//!
//! Records are held as `Arc<ExecutionRecord>` and replaced whole on every
//! update (copy-on-write), so a reader holding a clone never sees a
//! half-applied change.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use complyflow_types::error::RepositoryError;
use complyflow_types::execution::{
    ExecutionEvent, ExecutionFilter, ExecutionRecord, ExecutionStatus,
};

use super::execution::ExecutionRepository;

/// DashMap-backed implementation of `ExecutionRepository`.
#[derive(Default)]
pub struct InMemoryExecutionRepository {
    records: DashMap<Uuid, Arc<ExecutionRecord>>,
    events: DashMap<Uuid, Vec<ExecutionEvent>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of a record, without cloning its contents.
    pub fn snapshot(&self, execution_id: &Uuid) -> Option<Arc<ExecutionRecord>> {
        self.records.get(execution_id).map(|r| Arc::clone(r.value()))
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        match self.records.entry(record.execution_id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                record.execution_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(record.clone()));
                Ok(())
            }
        }
    }

    async fn get(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.snapshot(execution_id).map(|r| (*r).clone()))
    }

    async fn replace_if_running(&self, record: &ExecutionRecord) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.records.get_mut(&record.execution_id) else {
            return Err(RepositoryError::NotFound);
        };
        if stored.status != ExecutionStatus::Running {
            return Ok(false);
        }
        *stored = Arc::new(record.clone());
        Ok(true)
    }

    async fn set_current_state(
        &self,
        execution_id: &Uuid,
        state_name: &str,
    ) -> Result<bool, RepositoryError> {
        let Some(mut stored) = self.records.get_mut(execution_id) else {
            return Ok(false);
        };
        if stored.status != ExecutionStatus::Running {
            return Ok(false);
        }
        let mut next = (**stored).clone();
        next.current_state = Some(state_name.to_string());
        *stored = Arc::new(next);
        Ok(true)
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut out: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| (**r.value()).clone())
            .collect();
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        out.truncate(limit);
        Ok(out)
    }

    async fn append_event(&self, event: &ExecutionEvent) -> Result<u64, RepositoryError> {
        let mut history = self.events.entry(event.execution_id).or_default();
        let sequence = history.len() as u64 + 1;
        history.push(ExecutionEvent {
            sequence,
            ..event.clone()
        });
        Ok(sequence)
    }

    async fn list_events(&self, execution_id: &Uuid) -> Result<Vec<ExecutionEvent>, RepositoryError> {
        Ok(self
            .events
            .get(execution_id)
            .map(|h| h.value().clone())
            .unwrap_or_default())
    }
}
