//! Execution coordinator: the lifecycle owner of every execution record.
//!
//! `start` validates the request, persists a RUNNING record and spawns a
//! tokio task that drives the evaluator; it returns without waiting. The
//! driver applies the execution ceiling and writes the single terminal
//! status. `stop` is cooperative: it writes ABORTED and cancels the run's
//! token. Both terminal writes go through `replace_if_running`, so whichever
//! lands first wins and the other is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use complyflow_types::config::ExecutionLimits;
use complyflow_types::error::RepositoryError;
use complyflow_types::execution::{
    ExecutionEvent, ExecutionEventKind, ExecutionFilter, ExecutionRecord, ExecutionStatus,
    StartWorkflowRequest, StopOutcome, WorkflowMetricsSnapshot,
};
use complyflow_types::workflow::{WorkflowDefinition, WorkflowSummary};
use futures_util::future::BoxFuture;

use super::evaluator::{
    EvalError, ExecutionEnv, StateMachineEvaluator, StateTransition, TransitionObserver,
};
use super::metrics::summarize;
use super::registry::WorkflowRegistry;
use crate::notify::NotificationChannel;
use crate::repository::execution::ExecutionRepository;
use crate::task::error_class;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned to callers of the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("workflow type not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Starts, stops and tracks executions over an `ExecutionRepository`.
pub struct ExecutionCoordinator<R> {
    repo: Arc<R>,
    evaluator: StateMachineEvaluator,
    limits: ExecutionLimits,
    notifier: Option<Arc<dyn NotificationChannel>>,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<R> Clone for ExecutionCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            evaluator: self.evaluator.clone(),
            limits: self.limits.clone(),
            notifier: self.notifier.clone(),
            running: Arc::clone(&self.running),
        }
    }
}

impl<R: ExecutionRepository + 'static> ExecutionCoordinator<R> {
    pub fn new(repo: Arc<R>, evaluator: StateMachineEvaluator, limits: ExecutionLimits) -> Self {
        Self {
            repo,
            evaluator,
            limits,
            notifier: None,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Publish terminal-status messages for definitions that declare a topic.
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        self.evaluator.registry()
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    /// Executions with a live driver in this process.
    pub fn active_executions(&self) -> usize {
        self.running.len()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    pub fn definitions(&self) -> Vec<WorkflowSummary> {
        self.registry().summaries()
    }

    pub fn definition(
        &self,
        workflow_type: &str,
    ) -> Result<Arc<WorkflowDefinition>, CoordinatorError> {
        self.registry()
            .get(workflow_type)
            .map_err(|_| CoordinatorError::WorkflowNotFound(workflow_type.to_string()))
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Start an execution and return its RUNNING record immediately.
    pub async fn start(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<ExecutionRecord, CoordinatorError> {
        let (record, _driver) = self.launch(request).await?;
        Ok(record)
    }

    /// Start an execution and wait for its driver to finish.
    pub async fn run_to_completion(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<ExecutionRecord, CoordinatorError> {
        let (record, driver) = self.launch(request).await?;
        if let Err(e) = driver.await {
            tracing::error!(execution_id = %record.execution_id, error = %e, "execution driver panicked");
        }
        self.status(&record.execution_id).await
    }

    async fn launch(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<(ExecutionRecord, JoinHandle<()>), CoordinatorError> {
        let def = self.definition(&request.workflow_type)?;

        let tenant_id = request.tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return Err(CoordinatorError::Validation(
                "tenantId must not be empty".to_string(),
            ));
        }
        let Value::Object(mut params) = request.parameters else {
            return Err(CoordinatorError::Validation(
                "parameters must be a JSON object".to_string(),
            ));
        };
        params.insert("tenantId".to_string(), Value::String(tenant_id.clone()));

        let missing: Vec<&str> = def
            .required_parameters
            .iter()
            .filter(|p| params.get(p.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(CoordinatorError::Validation(format!(
                "missing required parameters for '{}': {}",
                def.workflow_type,
                missing.join(", ")
            )));
        }

        let execution_id = Uuid::now_v7();
        params.insert(
            "executionId".to_string(),
            Value::String(execution_id.to_string()),
        );

        let correlation_id = request
            .metadata
            .as_ref()
            .and_then(|m| m.get("correlationId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let record = ExecutionRecord {
            execution_id,
            workflow_type: def.workflow_type.clone(),
            tenant_id,
            correlation_id,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            stop_time: None,
            input: Value::Object(params),
            output: None,
            error: None,
            cause: None,
            current_state: Some(def.graph.entry_state.clone()),
            started_by: request.started_by,
            metadata: request.metadata,
        };
        self.repo.insert(&record).await?;

        let cancel = CancellationToken::new();
        self.running.insert(execution_id, cancel.clone());

        tracing::info!(
            execution_id = %execution_id,
            workflow_type = record.workflow_type.as_str(),
            tenant_id = record.tenant_id.as_str(),
            correlation_id = record.correlation_id.as_str(),
            "execution started"
        );

        let driver = self.clone();
        let started = record.clone();
        let handle = tokio::spawn(async move { driver.drive(def, started, cancel).await });
        Ok((record, handle))
    }

    /// Request a cooperative stop.
    ///
    /// The record is marked ABORTED immediately; in-flight task calls finish
    /// in the background and their results are discarded.
    pub async fn stop(&self, execution_id: &Uuid) -> Result<StopOutcome, CoordinatorError> {
        let record = self
            .repo
            .get(execution_id)
            .await?
            .ok_or(CoordinatorError::ExecutionNotFound(*execution_id))?;

        if record.status.is_terminal() {
            return Ok(StopOutcome {
                stopped: false,
                message: format!("execution is already {}", record.status),
            });
        }

        let aborted = record.finished(
            ExecutionStatus::Aborted,
            None,
            Some(error_class::ABORTED.to_string()),
            Some("execution stopped by request".to_string()),
        );
        if !self.repo.replace_if_running(&aborted).await? {
            return Ok(StopOutcome {
                stopped: false,
                message: "execution finished before the stop was applied".to_string(),
            });
        }

        if let Some((_, token)) = self.running.remove(execution_id) {
            token.cancel();
        }
        self.record_terminal(&aborted).await;

        Ok(StopOutcome {
            stopped: true,
            message: "execution stopped".to_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self, execution_id: &Uuid) -> Result<ExecutionRecord, CoordinatorError> {
        self.repo
            .get(execution_id)
            .await?
            .ok_or(CoordinatorError::ExecutionNotFound(*execution_id))
    }

    /// List executions newest first.
    ///
    /// The filter is re-applied here so a repository that over-returns can
    /// never leak another tenant's records.
    pub async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, CoordinatorError> {
        let max = self.limits.max_list_limit.max(1);
        let limit = limit.unwrap_or(self.limits.default_list_limit).clamp(1, max);
        let mut records = self.repo.list(filter, limit).await?;
        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records.truncate(limit);
        Ok(records)
    }

    pub async fn history(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<ExecutionEvent>, CoordinatorError> {
        self.status(execution_id).await?;
        Ok(self.repo.list_events(execution_id).await?)
    }

    pub async fn metrics(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<WorkflowMetricsSnapshot, CoordinatorError> {
        let mut records = self.repo.list(filter, usize::MAX).await?;
        records.retain(|r| filter.matches(r));
        Ok(summarize(&records))
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn drive(
        self,
        def: Arc<WorkflowDefinition>,
        record: ExecutionRecord,
        cancel: CancellationToken,
    ) {
        let execution_id = record.execution_id;
        let env = ExecutionEnv {
            execution_id,
            workflow_type: record.workflow_type.clone(),
            tenant_id: record.tenant_id.clone(),
            start_time: record.start_time,
            cancel: cancel.clone(),
            observer: Arc::new(RecordObserver {
                repo: Arc::clone(&self.repo),
                execution_id,
            }),
        };
        let ceiling_secs = def
            .timeout_seconds
            .unwrap_or(self.limits.execution_timeout_secs);

        // The evaluator runs in its own task so a panic surfaces here as a
        // JoinError instead of taking the driver down with it.
        let evaluator = self.evaluator.clone();
        let graph = Arc::new(def.graph.clone());
        let input = record.input.clone();
        let evaluation = tokio::spawn(async move { evaluator.run(graph, input, env).await });
        let outcome = tokio::time::timeout(Duration::from_secs(ceiling_secs), evaluation).await;
        self.running.remove(&execution_id);

        let (status, output, error, cause) = match outcome {
            Ok(Ok(Ok(output))) => (ExecutionStatus::Succeeded, Some(output), None, None),
            Ok(Ok(Err(EvalError::Failed(err)))) => (
                ExecutionStatus::Failed,
                None,
                Some(err.error_class),
                Some(err.cause),
            ),
            Ok(Ok(Err(EvalError::Cancelled))) => {
                tracing::debug!(execution_id = %execution_id, "driver observed stop");
                return;
            }
            Ok(Err(join_err)) => {
                tracing::error!(execution_id = %execution_id, error = %join_err, "execution driver panicked");
                (
                    ExecutionStatus::Failed,
                    None,
                    Some(error_class::RUNTIME.to_string()),
                    Some("execution driver panicked".to_string()),
                )
            }
            Err(_) => {
                // The detached evaluation observes the token and winds down
                // after its in-flight calls return.
                cancel.cancel();
                (
                    ExecutionStatus::TimedOut,
                    None,
                    Some(error_class::TIMEOUT.to_string()),
                    Some(format!("execution exceeded its ceiling of {ceiling_secs}s")),
                )
            }
        };

        if let Err(e) = self.finish(execution_id, status, output, error, cause).await {
            tracing::error!(execution_id = %execution_id, error = %e, "failed to record terminal status");
        }
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
        cause: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let current = self.status(&execution_id).await?;
        if current.status.is_terminal() {
            return Ok(());
        }
        let finished = current.finished(status, output, error, cause);
        if !self.repo.replace_if_running(&finished).await? {
            tracing::debug!(execution_id = %execution_id, "terminal status already recorded");
            return Ok(());
        }
        self.record_terminal(&finished).await;
        Ok(())
    }

    /// Log, append the terminal history event, and publish a notification.
    async fn record_terminal(&self, record: &ExecutionRecord) {
        tracing::info!(
            execution_id = %record.execution_id,
            workflow_type = record.workflow_type.as_str(),
            status = %record.status,
            duration_ms = record.duration_ms().unwrap_or_default(),
            error = record.error.as_deref().unwrap_or(""),
            "execution finished"
        );

        if let Some(kind) = ExecutionEventKind::for_status(record.status) {
            let detail = record
                .error
                .as_ref()
                .map(|error| json!({ "error": error, "cause": record.cause }));
            let event = ExecutionEvent {
                execution_id: record.execution_id,
                sequence: 0,
                timestamp: record.stop_time.unwrap_or_else(Utc::now),
                kind,
                state_name: record.current_state.clone(),
                scope: String::new(),
                detail,
            };
            if let Err(e) = self.repo.append_event(&event).await {
                tracing::warn!(execution_id = %record.execution_id, error = %e, "failed to append terminal event");
            }
        }

        self.publish(record);
    }

    fn publish(&self, record: &ExecutionRecord) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let Ok(def) = self.registry().get(&record.workflow_type) else {
            return;
        };
        let Some(config) = &def.notifications else {
            return;
        };
        let wanted = match record.status {
            ExecutionStatus::Succeeded => config.on_success,
            ExecutionStatus::Running => false,
            _ => config.on_failure,
        };
        if !wanted {
            return;
        }

        let message = json!({
            "executionId": record.execution_id,
            "workflowType": record.workflow_type,
            "tenantId": record.tenant_id,
            "status": record.status,
            "error": record.error,
            "cause": record.cause,
            "stopTime": record.stop_time,
        });
        let topic = config.topic.clone();
        let notifier = Arc::clone(notifier);
        let execution_id = record.execution_id;
        tokio::spawn(async move {
            if let Err(e) = notifier.publish(&topic, message).await {
                tracing::warn!(execution_id = %execution_id, topic = topic.as_str(), error = %e, "notification not delivered");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Transition observer
// ---------------------------------------------------------------------------

/// Persists transitions: top-level entries update `currentState`, every
/// transition is appended to history.
struct RecordObserver<R> {
    repo: Arc<R>,
    execution_id: Uuid,
}

impl<R: ExecutionRepository> TransitionObserver for RecordObserver<R> {
    fn on_transition(&self, transition: StateTransition) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if transition.kind == ExecutionEventKind::StateEntered && transition.scope.is_empty() {
                if let Err(e) = self
                    .repo
                    .set_current_state(&self.execution_id, &transition.state_name)
                    .await
                {
                    tracing::warn!(execution_id = %self.execution_id, error = %e, "failed to update current state");
                }
            }
            let event = ExecutionEvent {
                execution_id: self.execution_id,
                sequence: 0,
                timestamp: Utc::now(),
                kind: transition.kind,
                state_name: Some(transition.state_name),
                scope: transition.scope,
                detail: transition.detail,
            };
            if let Err(e) = self.repo.append_event(&event).await {
                tracing::warn!(execution_id = %self.execution_id, error = %e, "failed to append event");
            }
        })
    }
}
