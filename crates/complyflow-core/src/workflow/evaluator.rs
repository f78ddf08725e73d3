//! State machine evaluator: interprets a `StateGraph` one state at a time.
//!
//! The evaluator threads a JSON context through the graph starting at
//! `entryState`. Task states are dispatched through the injected
//! [`TaskInvoker`]; Parallel branches and Map iterations run as separate
//! tokio tasks in a `JoinSet`. Every state entry/exit, retry and caught error
//! is reported to a [`TransitionObserver`] so the coordinator can keep
//! `currentState` and the execution history current.
//!
//! Stop is cooperative: the shared `CancellationToken` is checked before
//! each state and interrupts Wait states and retry back-offs. In-flight task
//! invocations are allowed to finish; their results are discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use complyflow_types::config::ExecutionLimits;
use complyflow_types::execution::ExecutionEventKind;
use complyflow_types::workflow::{
    ChoiceState, InvocationMode, MapState, ParallelState, PassState, StateGraph, StateNode,
    TaskState, WaitState,
};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::choice::evaluate_choice;
use super::path::{JsonPath, PathError, render_template, write_result};
use super::registry::{SUB_WORKFLOW_PREFIX, WorkflowRegistry};
use super::retry::{RetryTracker, find_catch};
use crate::task::{TaskError, TaskInvoker, error_class};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum nesting depth for `workflow:<type>` task resources.
pub const MAX_SUB_WORKFLOW_DEPTH: u32 = 5;

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// One reported transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub kind: ExecutionEventKind,
    pub state_name: String,
    /// Nesting path (`Parallel#0`, `Map#3`, `Task>sub-type`); empty at top level.
    pub scope: String,
    pub detail: Option<Value>,
}

/// Receives every transition of an execution, in order per scope.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, transition: StateTransition) -> BoxFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// Errors / environment
// ---------------------------------------------------------------------------

/// Why a graph did not complete.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// An unrecovered error reached the top of the graph.
    #[error("{0}")]
    Failed(TaskError),

    /// The execution was stopped.
    #[error("execution cancelled")]
    Cancelled,
}

fn runtime(cause: impl Into<String>) -> EvalError {
    EvalError::Failed(TaskError::runtime(cause))
}

fn path_failure(err: PathError) -> EvalError {
    runtime(err.to_string())
}

fn join_failure(err: JoinError) -> EvalError {
    runtime(format!("branch task failed: {err}"))
}

/// Per-execution identity and control handles.
#[derive(Clone)]
pub struct ExecutionEnv {
    pub execution_id: Uuid,
    pub workflow_type: String,
    pub tenant_id: String,
    pub start_time: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn TransitionObserver>,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Interprets state graphs against a task backend.
#[derive(Clone)]
pub struct StateMachineEvaluator {
    invoker: Arc<dyn TaskInvoker>,
    registry: Arc<WorkflowRegistry>,
    limits: ExecutionLimits,
}

impl StateMachineEvaluator {
    pub fn new(
        invoker: Arc<dyn TaskInvoker>,
        registry: Arc<WorkflowRegistry>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            invoker,
            registry,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Run `graph` to completion with `input` as the initial context.
    ///
    /// Returns the final context on success.
    pub async fn run(
        &self,
        graph: Arc<StateGraph>,
        input: Value,
        env: ExecutionEnv,
    ) -> Result<Value, EvalError> {
        let run = Arc::new(RunContext {
            evaluator: self.clone(),
            env,
            transitions: AtomicU64::new(0),
        });
        run_graph(run, graph, input, Frame::root()).await
    }
}

/// Shared state of one execution, across all of its branches.
struct RunContext {
    evaluator: StateMachineEvaluator,
    env: ExecutionEnv,
    transitions: AtomicU64,
}

/// Position of a graph within the execution.
#[derive(Debug, Clone)]
struct Frame {
    scope: String,
    depth: u32,
    map_item: Option<(usize, Value)>,
}

impl Frame {
    fn root() -> Self {
        Self {
            scope: String::new(),
            depth: 0,
            map_item: None,
        }
    }

    fn child(&self, segment: &str) -> Self {
        let scope = if self.scope.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{segment}", self.scope)
        };
        Self {
            scope,
            ..self.clone()
        }
    }
}

enum Step {
    Next(String, Value),
    End(Value),
}

fn advance(node: &StateNode, context: Value) -> Step {
    match node.transition() {
        Some((Some(next), _)) => Step::Next(next.to_string(), context),
        _ => Step::End(context),
    }
}

fn run_graph(
    run: Arc<RunContext>,
    graph: Arc<StateGraph>,
    input: Value,
    frame: Frame,
) -> BoxFuture<'static, Result<Value, EvalError>> {
    Box::pin(async move { run.drive(&graph, input, &frame).await })
}

impl RunContext {
    async fn drive(
        self: &Arc<Self>,
        graph: &StateGraph,
        input: Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let mut context = input;
        let mut current = graph.entry_state.clone();

        loop {
            if self.env.cancel.is_cancelled() {
                return Err(EvalError::Cancelled);
            }

            let count = self.transitions.fetch_add(1, Ordering::Relaxed) + 1;
            let budget = self.evaluator.limits.max_transitions;
            if count > budget {
                return Err(runtime(format!(
                    "execution exceeded the transition budget of {budget} states"
                )));
            }

            let node = graph
                .states
                .get(&current)
                .ok_or_else(|| runtime(format!("state '{current}' is not declared")))?;

            tracing::debug!(
                execution_id = %self.env.execution_id,
                state = current.as_str(),
                kind = node.kind(),
                scope = frame.scope.as_str(),
                "entering state"
            );
            self.notify(ExecutionEventKind::StateEntered, &current, frame, None)
                .await;

            let step = self.execute_state(&current, node, context, frame).await?;

            self.notify(ExecutionEventKind::StateExited, &current, frame, None)
                .await;

            match step {
                Step::Next(next, ctx) => {
                    context = ctx;
                    current = next;
                }
                Step::End(ctx) => return Ok(ctx),
            }
        }
    }

    async fn execute_state(
        self: &Arc<Self>,
        name: &str,
        node: &StateNode,
        context: Value,
        frame: &Frame,
    ) -> Result<Step, EvalError> {
        match node {
            StateNode::Task(task) => {
                let outcome = self.run_task(name, task, &context, frame).await;
                self.settle(name, node, context, task.result_path.as_deref(), outcome, frame)
                    .await
            }
            StateNode::Parallel(parallel) => {
                let outcome = self.run_parallel(name, parallel, &context, frame).await;
                self.settle(name, node, context, parallel.result_path.as_deref(), outcome, frame)
                    .await
            }
            StateNode::Map(map) => {
                let outcome = self.run_map(name, map, &context, frame).await;
                self.settle(name, node, context, map.result_path.as_deref(), outcome, frame)
                    .await
            }
            StateNode::Choice(choice) => self.run_choice(name, choice, context),
            StateNode::Wait(wait) => {
                let delay = wait_duration(name, wait, &context)?;
                self.sleep(delay).await?;
                Ok(advance(node, context))
            }
            StateNode::Pass(pass) => {
                let context = self.run_pass(name, pass, context, frame)?;
                Ok(advance(node, context))
            }
            StateNode::Fail(fail) => Err(EvalError::Failed(TaskError::new(
                fail.error.clone(),
                fail.cause.clone(),
            ))),
            StateNode::Succeed(_) => Ok(Step::End(context)),
        }
    }

    /// Apply a Task/Parallel/Map outcome: write the result, or route a
    /// matching error through `catch`.
    async fn settle(
        &self,
        name: &str,
        node: &StateNode,
        mut context: Value,
        result_path: Option<&str>,
        outcome: Result<Value, EvalError>,
        frame: &Frame,
    ) -> Result<Step, EvalError> {
        match outcome {
            Ok(result) => {
                write_result(&mut context, result_path, result).map_err(path_failure)?;
                Ok(advance(node, context))
            }
            Err(EvalError::Failed(err)) => {
                let Some(rule) = find_catch(node.catch_rules(), &err.error_class) else {
                    return Err(EvalError::Failed(err));
                };
                tracing::info!(
                    execution_id = %self.env.execution_id,
                    state = name,
                    error = err.error_class.as_str(),
                    next = rule.next.as_str(),
                    "error caught"
                );
                let error_output = json!({ "Error": err.error_class, "Cause": err.cause });
                write_result(&mut context, rule.result_path.as_deref(), error_output)
                    .map_err(path_failure)?;
                self.notify(
                    ExecutionEventKind::ErrorCaught,
                    name,
                    frame,
                    Some(json!({
                        "error": err.error_class,
                        "cause": err.cause,
                        "next": rule.next,
                    })),
                )
                .await;
                Ok(Step::Next(rule.next.clone(), context))
            }
            Err(EvalError::Cancelled) => Err(EvalError::Cancelled),
        }
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn run_task(
        self: &Arc<Self>,
        name: &str,
        task: &TaskState,
        context: &Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let payload = match &task.parameters {
            Some(template) => {
                render_template(template, context, &self.context_object(name, frame))
                    .map_err(path_failure)?
            }
            None => context.clone(),
        };

        let mut tracker = RetryTracker::new(&task.retry);
        let mut attempt: u32 = 1;
        loop {
            let err = match self.invoke_once(name, task, payload.clone(), frame).await {
                Ok(result) => return Ok(result),
                Err(EvalError::Failed(err)) => err,
                Err(EvalError::Cancelled) => return Err(EvalError::Cancelled),
            };

            let Some(delay) = tracker.next_delay(&task.retry, &err.error_class) else {
                return Err(EvalError::Failed(err));
            };
            attempt += 1;
            tracing::warn!(
                execution_id = %self.env.execution_id,
                state = name,
                resource = task.resource.as_str(),
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "task failed, retrying"
            );
            self.notify(
                ExecutionEventKind::TaskRetry,
                name,
                frame,
                Some(json!({
                    "attempt": attempt,
                    "error": err.error_class,
                    "cause": err.cause,
                    "delayMillis": delay.as_millis() as u64,
                })),
            )
            .await;
            self.sleep(delay).await?;
        }
    }

    async fn invoke_once(
        self: &Arc<Self>,
        name: &str,
        task: &TaskState,
        payload: Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        if let Some(workflow_type) = task.resource.strip_prefix(SUB_WORKFLOW_PREFIX) {
            let nested = self.run_sub_workflow(name, workflow_type, payload, frame);
            return match task.timeout_seconds {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), nested)
                    .await
                    .unwrap_or_else(|_| {
                        Err(EvalError::Failed(TaskError::timeout(format!(
                            "sub-workflow '{workflow_type}' did not complete within {secs}s"
                        ))))
                    }),
                None => nested.await,
            };
        }

        let secs = task
            .timeout_seconds
            .unwrap_or(self.evaluator.limits.task_timeout_secs);
        let call = self
            .evaluator
            .invoker
            .invoke(&task.resource, payload, task.mode);
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(result) => {
                if result.is_ok() && task.mode == InvocationMode::Async {
                    tracing::debug!(resource = task.resource.as_str(), "async task dispatched");
                }
                result.map_err(EvalError::Failed)
            }
            Err(_) => Err(EvalError::Failed(TaskError::timeout(format!(
                "task '{}' did not complete within {secs}s",
                task.resource
            )))),
        }
    }

    async fn run_sub_workflow(
        self: &Arc<Self>,
        name: &str,
        workflow_type: &str,
        input: Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let depth = frame.depth + 1;
        if depth > MAX_SUB_WORKFLOW_DEPTH {
            return Err(runtime(format!(
                "sub-workflow depth {depth} exceeds maximum {MAX_SUB_WORKFLOW_DEPTH}"
            )));
        }
        let def = self
            .evaluator
            .registry
            .get(workflow_type)
            .map_err(|e| runtime(e.to_string()))?;

        if !input.is_object() {
            return Err(runtime(format!(
                "input to sub-workflow '{workflow_type}' must be an object"
            )));
        }
        let missing: Vec<&str> = def
            .required_parameters
            .iter()
            .filter(|p| input.get(p.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(runtime(format!(
                "sub-workflow '{workflow_type}' is missing required parameters: {}",
                missing.join(", ")
            )));
        }

        let child = Frame {
            depth,
            map_item: None,
            ..frame.child(&format!("{name}>{workflow_type}"))
        };
        run_graph(Arc::clone(self), Arc::new(def.graph.clone()), input, child).await
    }

    // -----------------------------------------------------------------------
    // Parallel / Map
    // -----------------------------------------------------------------------

    async fn run_parallel(
        self: &Arc<Self>,
        name: &str,
        state: &ParallelState,
        context: &Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let mut join_set = JoinSet::new();
        for (idx, branch) in state.branches.iter().enumerate() {
            let branch_run = run_graph(
                Arc::clone(self),
                Arc::new(branch.clone()),
                context.clone(),
                frame.child(&format!("{name}#{idx}")),
            );
            join_set.spawn(async move { (idx, branch_run.await) });
        }

        let mut results = vec![Value::Null; state.branches.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(output))) => results[idx] = output,
                Ok((idx, Err(EvalError::Cancelled))) => {
                    // Siblings observe the same token; let in-flight calls finish.
                    tracing::debug!(state = name, branch = idx, "branch stopped, draining siblings");
                    while join_set.join_next().await.is_some() {}
                    return Err(EvalError::Cancelled);
                }
                Ok((idx, Err(err))) => {
                    tracing::debug!(state = name, branch = idx, "branch failed, aborting siblings");
                    join_set.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    join_set.abort_all();
                    return Err(join_failure(err));
                }
            }
        }
        Ok(Value::Array(results))
    }

    async fn run_map(
        self: &Arc<Self>,
        name: &str,
        state: &MapState,
        context: &Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let items = match JsonPath::parse(&state.items_path)
            .map_err(path_failure)?
            .read(context)
        {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(runtime(format!(
                    "itemsPath '{}' of map '{name}' is not an array",
                    state.items_path
                )));
            }
            None => {
                return Err(runtime(format!(
                    "itemsPath '{}' of map '{name}' did not resolve",
                    state.items_path
                )));
            }
        };

        let limit = state.max_concurrency.max(1) as usize;
        let iterator = Arc::new(state.iterator.clone());
        let mut results = vec![Value::Null; items.len()];
        let mut pending = items.into_iter().enumerate();
        let mut join_set = JoinSet::new();
        let mut first_error: Option<EvalError> = None;

        loop {
            // After the first failure nothing new is dispatched; in-flight
            // iterations are drained.
            while first_error.is_none() && join_set.len() < limit {
                let Some((idx, item)) = pending.next() else {
                    break;
                };
                let item_frame = Frame {
                    map_item: Some((idx, item.clone())),
                    ..frame.child(&format!("{name}#{idx}"))
                };
                let input = match &state.item_selector {
                    Some(selector) => {
                        match render_template(
                            selector,
                            context,
                            &self.context_object(name, &item_frame),
                        ) {
                            Ok(input) => input,
                            Err(e) => {
                                first_error = Some(path_failure(e));
                                break;
                            }
                        }
                    }
                    None => item,
                };
                let iteration = run_graph(Arc::clone(self), Arc::clone(&iterator), input, item_frame);
                join_set.spawn(async move { (idx, iteration.await) });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((idx, Ok(output))) => results[idx] = output,
                Ok((idx, Err(err))) => {
                    tracing::debug!(state = name, item = idx, "map iteration failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(join_failure(err));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(Value::Array(results)),
        }
    }

    // -----------------------------------------------------------------------
    // Choice / Pass / Wait helpers
    // -----------------------------------------------------------------------

    fn run_choice(&self, name: &str, choice: &ChoiceState, context: Value) -> Result<Step, EvalError> {
        match evaluate_choice(choice, &context).map_err(path_failure)? {
            Some(next) => Ok(Step::Next(next.to_string(), context)),
            None => Err(EvalError::Failed(TaskError::new(
                error_class::NO_CHOICE_MATCHED,
                format!("no rule of choice state '{name}' matched and no default is declared"),
            ))),
        }
    }

    fn run_pass(
        &self,
        name: &str,
        pass: &PassState,
        mut context: Value,
        frame: &Frame,
    ) -> Result<Value, EvalError> {
        let value = match (&pass.result, &pass.parameters) {
            (Some(result), _) => result.clone(),
            (None, Some(template)) => {
                render_template(template, &context, &self.context_object(name, frame))
                    .map_err(path_failure)?
            }
            (None, None) => context.clone(),
        };
        write_result(&mut context, pass.result_path.as_deref(), value).map_err(path_failure)?;
        Ok(context)
    }

    async fn sleep(&self, delay: Duration) -> Result<(), EvalError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.env.cancel.cancelled() => Err(EvalError::Cancelled),
        }
    }

    /// The `$$` document visible to templates.
    fn context_object(&self, state_name: &str, frame: &Frame) -> Value {
        let mut object = json!({
            "Execution": {
                "Id": self.env.execution_id.to_string(),
                "StartTime": self.env.start_time.to_rfc3339(),
                "TenantId": self.env.tenant_id,
                "WorkflowType": self.env.workflow_type,
            },
            "State": { "Name": state_name },
        });
        if let Some((index, value)) = &frame.map_item {
            object["Map"] = json!({ "Item": { "Index": index, "Value": value } });
        }
        object
    }

    async fn notify(
        &self,
        kind: ExecutionEventKind,
        state_name: &str,
        frame: &Frame,
        detail: Option<Value>,
    ) {
        self.env
            .observer
            .on_transition(StateTransition {
                kind,
                state_name: state_name.to_string(),
                scope: frame.scope.clone(),
                detail,
            })
            .await;
    }
}

fn wait_duration(name: &str, wait: &WaitState, context: &Value) -> Result<Duration, EvalError> {
    if let Some(secs) = wait.seconds {
        return Ok(Duration::from_secs(secs));
    }
    let Some(path) = &wait.seconds_path else {
        return Err(runtime(format!("wait '{name}' declares no duration")));
    };
    let Some(value) = JsonPath::parse(path).map_err(path_failure)?.read(context) else {
        return Err(runtime(format!(
            "secondsPath '{path}' of wait '{name}' did not resolve"
        )));
    };
    if let Some(secs) = value.as_u64() {
        return Ok(Duration::from_secs(secs));
    }
    let Some(secs) = value.as_f64() else {
        return Err(runtime(format!(
            "secondsPath '{path}' of wait '{name}' is not a non-negative number"
        )));
    };
    Duration::try_from_secs_f64(secs).map_err(|e| {
        runtime(format!(
            "secondsPath '{path}' of wait '{name}' is not a usable duration ({secs}): {e}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use complyflow_types::workflow::WorkflowDefinition;

    use crate::task::testing::ScriptedInvoker;
    use crate::workflow::definition::parse_workflow_yaml;

    #[derive(Default)]
    struct RecordingObserver {
        transitions: Mutex<Vec<StateTransition>>,
    }

    impl RecordingObserver {
        fn kinds_for(&self, state: &str) -> Vec<ExecutionEventKind> {
            self.transitions
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.state_name == state)
                .map(|t| t.kind)
                .collect()
        }
    }

    impl TransitionObserver for RecordingObserver {
        fn on_transition(&self, transition: StateTransition) -> BoxFuture<'_, ()> {
            self.transitions.lock().unwrap().push(transition);
            Box::pin(async {})
        }
    }

    fn graph(yaml: &str) -> Arc<StateGraph> {
        Arc::new(serde_yaml_ng::from_str(yaml).unwrap())
    }

    fn env(observer: Arc<RecordingObserver>) -> ExecutionEnv {
        ExecutionEnv {
            execution_id: Uuid::now_v7(),
            workflow_type: "test-flow".into(),
            tenant_id: "tenant-a".into(),
            start_time: Utc::now(),
            cancel: CancellationToken::new(),
            observer,
        }
    }

    fn evaluator(invoker: Arc<ScriptedInvoker>) -> StateMachineEvaluator {
        StateMachineEvaluator::new(
            invoker,
            Arc::new(WorkflowRegistry::default()),
            ExecutionLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_sequence_with_templates_and_result_paths() {
        let invoker = Arc::new(ScriptedInvoker::new().on("initialize-scan", |payload, _| {
            Ok(json!({ "scanId": "scan-1", "echo": payload }))
        }));
        let observer = Arc::new(RecordingObserver::default());
        let env = env(Arc::clone(&observer));
        let execution_id = env.execution_id.to_string();

        let g = graph(
            r#"
entryState: Init
states:
  Init:
    type: task
    resource: initialize-scan
    parameters:
      tenantId.$: $.tenantId
      executionId.$: $$.Execution.Id
      fixed: 7
    resultPath: $.scanContext
    next: Tag
  Tag:
    type: pass
    result: done
    resultPath: $.stage
    next: Done
  Done:
    type: succeed
"#,
        );
        let output = evaluator(Arc::clone(&invoker))
            .run(g, json!({ "tenantId": "tenant-a" }), env)
            .await
            .unwrap();

        assert_eq!(output["scanContext"]["scanId"], "scan-1");
        assert_eq!(
            output["scanContext"]["echo"],
            json!({ "tenantId": "tenant-a", "executionId": execution_id, "fixed": 7 })
        );
        assert_eq!(output["stage"], "done");
        assert_eq!(
            observer.kinds_for("Init"),
            vec![ExecutionEventKind::StateEntered, ExecutionEventKind::StateExited]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_preserves_declaration_order() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .delay("slow", Duration::from_secs(5))
                .delay("fast", Duration::from_secs(1)),
        );
        let g = graph(
            r#"
entryState: Fan
states:
  Fan:
    type: parallel
    resultPath: $.results
    end: true
    branches:
      - entryState: A
        states:
          A: { type: task, resource: slow, end: true }
      - entryState: B
        states:
          B: { type: task, resource: fast, end: true }
"#,
        );
        let output = evaluator(Arc::clone(&invoker))
            .run(g, json!({}), env(Arc::default()))
            .await
            .unwrap();

        assert_eq!(
            output["results"],
            json!([{ "resource": "slow" }, { "resource": "fast" }])
        );
        let slow = invoker.calls_to("slow");
        let fast = invoker.calls_to("fast");
        assert_eq!(slow.len(), 1);
        assert_eq!(fast.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_fails_state() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .delay("slow", Duration::from_secs(10))
                .on("broken", |_, _| Err(TaskError::task_failed("boom"))),
        );
        let g = graph(
            r#"
entryState: Fan
states:
  Fan:
    type: parallel
    end: true
    catch:
      - errorEquals: [States.TaskFailed]
        next: Recovered
        resultPath: $.failure
    branches:
      - entryState: A
        states:
          A: { type: task, resource: slow, end: true }
      - entryState: B
        states:
          B: { type: task, resource: broken, end: true }
  Recovered:
    type: succeed
"#,
        );
        let output = evaluator(invoker)
            .run(g, json!({}), env(Arc::default()))
            .await
            .unwrap();
        assert_eq!(
            output["failure"],
            json!({ "Error": "States.TaskFailed", "Cause": "boom" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_respects_max_concurrency_and_order() {
        let g = graph(
            r#"
entryState: Apply
states:
  Apply:
    type: map
    itemsPath: $.findingIds
    maxConcurrency: 2
    itemSelector:
      findingId.$: $$.Map.Item.Value
      index.$: $$.Map.Item.Index
      tenantId.$: $.tenantId
    resultPath: $.results
    end: true
    iterator:
      entryState: Fix
      states:
        Fix: { type: task, resource: apply-remediation, end: true }
"#,
        );

        for size in [2usize, 3, 5, 8] {
            let invoker = Arc::new(
                ScriptedInvoker::new()
                    .on("apply-remediation", |payload, _| {
                        Ok(json!({ "fixed": payload["findingId"] }))
                    })
                    .delay("apply-remediation", Duration::from_secs(2)),
            );
            let ids: Vec<String> = (1..=size).map(|i| format!("f{i}")).collect();
            let input = json!({ "tenantId": "t", "findingIds": ids });
            let output = evaluator(Arc::clone(&invoker))
                .run(Arc::clone(&g), input, env(Arc::default()))
                .await
                .unwrap();

            let expected: Vec<Value> = ids.iter().map(|id| json!({ "fixed": id })).collect();
            assert_eq!(output["results"], Value::Array(expected), "size {size}");
            let peak = invoker.max_in_flight.load(Ordering::SeqCst);
            assert!(peak <= 2, "size {size}: peak concurrency {peak}");
            assert_eq!(peak, 2, "size {size}: map should use its full concurrency");

            let calls = invoker.calls_to("apply-remediation");
            assert_eq!(calls.len(), size);
            let first = calls
                .iter()
                .find(|c| c.payload["findingId"] == "f1")
                .unwrap();
            assert_eq!(first.payload["tenantId"], "t");
            assert_eq!(first.payload["index"], 0);
        }
    }

    #[tokio::test]
    async fn test_map_stops_dispatching_after_failure() {
        let invoker = Arc::new(ScriptedInvoker::new().on("assess-control", |payload, _| {
            if payload == &json!("c2") {
                Err(TaskError::task_failed("control unreadable"))
            } else {
                Ok(json!("ok"))
            }
        }));
        let g = graph(
            r#"
entryState: Assess
states:
  Assess:
    type: map
    itemsPath: $.controls
    end: true
    iterator:
      entryState: One
      states:
        One: { type: task, resource: assess-control, end: true }
"#,
        );
        let input = json!({ "controls": ["c1", "c2", "c3", "c4"] });
        let err = evaluator(Arc::clone(&invoker))
            .run(g, input, env(Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::Failed(TaskError::task_failed("control unreadable"))
        );
        assert_eq!(invoker.calls_to("assess-control").len(), 2);
    }

    #[tokio::test]
    async fn test_map_requires_array() {
        let g = graph(
            r#"
entryState: M
states:
  M:
    type: map
    itemsPath: $.items
    end: true
    iterator:
      entryState: X
      states:
        X: { type: succeed }
"#,
        );
        let err = evaluator(Arc::new(ScriptedInvoker::new()))
            .run(g, json!({ "items": "nope" }), env(Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(e) if e.error_class == error_class::RUNTIME));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timing_then_failure() {
        let invoker = Arc::new(
            ScriptedInvoker::new().on("store-findings", |_, _| Err(TaskError::task_failed("db down"))),
        );
        let observer = Arc::new(RecordingObserver::default());
        let g = graph(
            r#"
entryState: Store
states:
  Store:
    type: task
    resource: store-findings
    end: true
    retry:
      - errorEquals: [States.TaskFailed]
        intervalSeconds: 1
        maxAttempts: 3
        backoffRate: 2
"#,
        );
        let start = tokio::time::Instant::now();
        let err = evaluator(Arc::clone(&invoker))
            .run(g, json!({}), env(Arc::clone(&observer)))
            .await
            .unwrap_err();

        assert_eq!(err, EvalError::Failed(TaskError::task_failed("db down")));
        let offsets: Vec<u64> = invoker
            .calls_to("store-findings")
            .iter()
            .map(|c| (c.at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3]);
        assert_eq!(
            observer
                .kinds_for("Store")
                .iter()
                .filter(|k| **k == ExecutionEventKind::TaskRetry)
                .count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_is_catchable() {
        let invoker = Arc::new(ScriptedInvoker::new().delay("slow", Duration::from_secs(60)));
        let g = graph(
            r#"
entryState: Slow
states:
  Slow:
    type: task
    resource: slow
    timeoutSeconds: 5
    end: true
    catch:
      - errorEquals: [States.Timeout]
        next: Handle
  Handle:
    type: succeed
"#,
        );
        let output = evaluator(invoker)
            .run(g, json!({ "keep": 1 }), env(Arc::default()))
            .await
            .unwrap();
        // No resultPath on the catch: the error replaces the context.
        assert_eq!(output["Error"], error_class::TIMEOUT);
    }

    #[tokio::test]
    async fn test_choice_without_match_is_fatal() {
        let g = graph(
            r#"
entryState: Decide
states:
  Decide:
    type: choice
    choices:
      - variable: $.approved
        booleanEquals: true
        next: Done
  Done:
    type: succeed
"#,
        );
        let err = evaluator(Arc::new(ScriptedInvoker::new()))
            .run(g, json!({}), env(Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(e) if e.error_class == error_class::NO_CHOICE_MATCHED));
    }

    #[tokio::test]
    async fn test_fail_state_surfaces_error_and_cause() {
        let g = graph(
            r#"
entryState: Stop
states:
  Stop:
    type: fail
    error: RemediationRejected
    cause: rejected by approver
"#,
        );
        let err = evaluator(Arc::new(ScriptedInvoker::new()))
            .run(g, json!({}), env(Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EvalError::Failed(TaskError::new("RemediationRejected", "rejected by approver"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_cancel() {
        let g = graph(
            r#"
entryState: Pause
states:
  Pause:
    type: wait
    secondsPath: $.interval
    end: true
"#,
        );
        let env = env(Arc::default());
        let cancel = env.cancel.clone();
        let handle = tokio::spawn({
            let evaluator = evaluator(Arc::new(ScriptedInvoker::new()));
            async move { evaluator.run(g, json!({ "interval": 3600 }), env).await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Err(EvalError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_wait_fails_with_runtime_error() {
        let g = graph(
            r#"
entryState: Pause
states:
  Pause:
    type: wait
    secondsPath: $.interval
    end: true
"#,
        );
        let ev = evaluator(Arc::new(ScriptedInvoker::new()));
        for interval in [json!(1e20), json!(-5)] {
            let err = ev
                .run(Arc::clone(&g), json!({ "interval": interval }), env(Arc::default()))
                .await
                .unwrap_err();
            match err {
                EvalError::Failed(e) => {
                    assert_eq!(e.error_class, error_class::RUNTIME);
                    assert!(e.cause.contains("secondsPath"), "got: {}", e.cause);
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_parallel_lets_in_flight_task_finish() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .on("collect-evidence", move |_, _| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(json!({ "evidence": 1 }))
                })
                .delay("collect-evidence", Duration::from_secs(10)),
        );
        let g = graph(
            r#"
entryState: Gather
states:
  Gather:
    type: parallel
    resultPath: $.branches
    end: true
    branches:
      - entryState: Collect
        states:
          Collect: { type: task, resource: collect-evidence, end: true }
      - entryState: Hold
        states:
          Hold: { type: wait, seconds: 100, end: true }
"#,
        );
        let env = env(Arc::default());
        let cancel = env.cancel.clone();
        let handle = tokio::spawn({
            let evaluator = evaluator(Arc::clone(&invoker));
            async move { evaluator.run(g, json!({}), env).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), Err(EvalError::Cancelled));
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(invoker.calls_to("collect-evidence").len(), 1);
    }

    #[tokio::test]
    async fn test_transition_budget() {
        let g = graph(
            r#"
entryState: A
states:
  A:
    type: pass
    next: Check
  Check:
    type: choice
    choices:
      - variable: $.stop
        booleanEquals: true
        next: Done
    default: A
  Done:
    type: succeed
"#,
        );
        let limits = ExecutionLimits {
            max_transitions: 10,
            ..ExecutionLimits::default()
        };
        let evaluator = StateMachineEvaluator::new(
            Arc::new(ScriptedInvoker::new()),
            Arc::new(WorkflowRegistry::default()),
            limits,
        );
        let err = evaluator
            .run(g, json!({}), env(Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Failed(e) if e.error_class == error_class::RUNTIME));
    }

    fn chain_registry(len: usize) -> WorkflowRegistry {
        let defs: Vec<WorkflowDefinition> = (0..len)
            .map(|i| {
                let resource = if i + 1 < len {
                    format!("workflow:w{}", i + 1)
                } else {
                    "leaf".to_string()
                };
                parse_workflow_yaml(&format!(
                    r#"
workflowType: w{i}
name: W{i}
version: "1"
graph:
  entryState: Call
  states:
    Call:
      type: task
      resource: "{resource}"
      parameters:
        tenantId.$: $.tenantId
      resultPath: $.inner
      end: true
"#
                ))
                .unwrap()
            })
            .collect();
        WorkflowRegistry::from_definitions(defs).unwrap()
    }

    #[tokio::test]
    async fn test_sub_workflow_depth_limit() {
        let registry = Arc::new(chain_registry(7));
        let evaluator = StateMachineEvaluator::new(
            Arc::new(ScriptedInvoker::new()),
            Arc::clone(&registry),
            ExecutionLimits::default(),
        );
        let input = json!({ "tenantId": "t" });

        // w1 -> ... -> w6 nests five levels deep.
        let ok = evaluator
            .run(
                Arc::new(registry.get("w1").unwrap().graph.clone()),
                input.clone(),
                env(Arc::default()),
            )
            .await
            .unwrap();
        assert_eq!(
            ok["inner"]["inner"]["inner"]["inner"]["inner"]["inner"],
            json!({ "resource": "leaf" })
        );

        let err = evaluator
            .run(
                Arc::new(registry.get("w0").unwrap().graph.clone()),
                input,
                env(Arc::default()),
            )
            .await
            .unwrap_err();
        match err {
            EvalError::Failed(e) => {
                assert_eq!(e.error_class, error_class::RUNTIME);
                assert!(e.cause.contains("depth 6"), "got: {}", e.cause);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nested_scopes_are_reported() {
        let observer = Arc::new(RecordingObserver::default());
        let g = graph(
            r#"
entryState: Fan
states:
  Fan:
    type: parallel
    end: true
    branches:
      - entryState: Inner
        states:
          Inner: { type: succeed }
"#,
        );
        evaluator(Arc::new(ScriptedInvoker::new()))
            .run(g, json!({}), env(Arc::clone(&observer)))
            .await
            .unwrap();
        let transitions = observer.transitions.lock().unwrap();
        let inner = transitions.iter().find(|t| t.state_name == "Inner").unwrap();
        assert_eq!(inner.scope, "Fan#0");
        let fan = transitions.iter().find(|t| t.state_name == "Fan").unwrap();
        assert_eq!(fan.scope, "");
    }
}
