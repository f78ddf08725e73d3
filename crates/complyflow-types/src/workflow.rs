//! Workflow definition types for ComplyFlow.
//!
//! A `WorkflowDefinition` is an immutable template: metadata about the
//! business process plus a `StateGraph` of typed states. Definitions are
//! authored as YAML (camelCase keys) and interpreted at runtime by the
//! state machine evaluator in `complyflow-core`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A registered workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique key (e.g. "compliance-scan").
    pub workflow_type: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    /// Parameters that must be present in the start request.
    #[serde(default)]
    pub required_parameters: BTreeSet<String>,
    /// Parameters the workflow understands but does not require.
    #[serde(default)]
    pub optional_parameters: BTreeSet<String>,
    /// Advisory duration estimate (e.g. "5-15 minutes").
    #[serde(default)]
    pub estimated_duration: String,
    /// Execution ceiling in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Where to publish terminal-status notifications, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,
    /// The state graph interpreted at runtime.
    pub graph: StateGraph,
}

/// Metadata-only view of a definition, for simple callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub workflow_type: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub required_parameters: BTreeSet<String>,
    pub optional_parameters: BTreeSet<String>,
    pub estimated_duration: String,
    pub state_count: usize,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            workflow_type: def.workflow_type.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            version: def.version.clone(),
            required_parameters: def.required_parameters.clone(),
            optional_parameters: def.optional_parameters.clone(),
            estimated_duration: def.estimated_duration.clone(),
            state_count: def.graph.states.len(),
        }
    }
}

/// Terminal-status notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub topic: String,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// State graph
// ---------------------------------------------------------------------------

/// A graph of named states with a single entry point.
///
/// Parallel branches and Map iterators are themselves `StateGraph`s with
/// their own state namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateGraph {
    pub entry_state: String,
    pub states: BTreeMap<String, StateNode>,
}

/// One node in a state graph, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StateNode {
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Parallel(ParallelState),
    Map(MapState),
    Pass(PassState),
    Fail(FailState),
    Succeed(SucceedState),
}

impl StateNode {
    /// Lowercase kind name, matching the YAML `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            StateNode::Task(_) => "task",
            StateNode::Choice(_) => "choice",
            StateNode::Wait(_) => "wait",
            StateNode::Parallel(_) => "parallel",
            StateNode::Map(_) => "map",
            StateNode::Pass(_) => "pass",
            StateNode::Fail(_) => "fail",
            StateNode::Succeed(_) => "succeed",
        }
    }

    /// The `next`/`end` pair for states that use one. `None` for Choice,
    /// Fail and Succeed.
    pub fn transition(&self) -> Option<(Option<&str>, bool)> {
        match self {
            StateNode::Task(s) => Some((s.next.as_deref(), s.end)),
            StateNode::Wait(s) => Some((s.next.as_deref(), s.end)),
            StateNode::Parallel(s) => Some((s.next.as_deref(), s.end)),
            StateNode::Map(s) => Some((s.next.as_deref(), s.end)),
            StateNode::Pass(s) => Some((s.next.as_deref(), s.end)),
            StateNode::Choice(_) | StateNode::Fail(_) | StateNode::Succeed(_) => None,
        }
    }

    /// Catch rules declared on this state (empty for kinds without catch).
    pub fn catch_rules(&self) -> &[CatchRule] {
        match self {
            StateNode::Task(s) => &s.catch,
            StateNode::Parallel(s) => &s.catch,
            StateNode::Map(s) => &s.catch,
            _ => &[],
        }
    }

    /// Whether reaching this state ends the graph.
    pub fn is_terminal(&self) -> bool {
        match self {
            StateNode::Fail(_) | StateNode::Succeed(_) => true,
            other => other.transition().is_some_and(|(_, end)| end),
        }
    }
}

/// How a Task waits on the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    /// Wait for the handler's result.
    #[default]
    Sync,
    /// Fire-and-forget; the result is only a dispatch acknowledgement.
    Async,
}

impl std::fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationMode::Sync => write!(f, "sync"),
            InvocationMode::Async => write!(f, "async"),
        }
    }
}

/// Invoke an external task handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    /// Handler name, or `workflow:<type>` for a nested sub-workflow.
    pub resource: String,
    /// Payload template. Keys ending in `.$` are resolved as paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    /// Where the result is written (default: replaces the context).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub mode: InvocationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Branch on the first matching rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceState {
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Suspend the execution for a fixed or context-derived number of seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Run every branch concurrently against a copy of the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelState {
    pub branches: Vec<StateGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Run `iterator` once per item of the array at `itemsPath`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapState {
    pub items_path: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    pub iterator: StateGraph,
    /// Per-item input template; defaults to the item itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Assign a literal or rendered value without any external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailState {
    pub error: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Terminal success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Retry / Catch / Choice rules
// ---------------------------------------------------------------------------

/// Retry a failed Task in place when its error class matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRule {
    #[serde(alias = "errorClasses")]
    pub error_equals: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    /// Total invocations allowed for errors matching this rule, including
    /// the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

fn default_interval_seconds() -> f64 {
    1.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

/// Route a failure to a recovery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchRule {
    #[serde(alias = "errorClasses")]
    pub error_equals: Vec<String>,
    pub next: String,
    /// Where `{error, cause}` is written (default: replaces the context).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

/// One Choice rule: a path, exactly one comparison, and a target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceRule {
    pub variable: String,
    pub next: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_equals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_equals: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_less_than: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_less_than_equals: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_greater_than: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_greater_than_equals: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean_equals: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_present: Option<bool>,
}

/// The comparison carried by a `ChoiceRule`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceTest<'a> {
    StringEquals(&'a str),
    NumericEquals(f64),
    NumericLessThan(f64),
    NumericLessThanEquals(f64),
    NumericGreaterThan(f64),
    NumericGreaterThanEquals(f64),
    BooleanEquals(bool),
    IsPresent(bool),
}

impl ChoiceRule {
    /// Every comparison set on this rule. A well-formed rule has exactly one.
    pub fn tests(&self) -> Vec<ChoiceTest<'_>> {
        let mut tests = Vec::with_capacity(1);
        if let Some(v) = &self.string_equals {
            tests.push(ChoiceTest::StringEquals(v));
        }
        if let Some(v) = self.numeric_equals {
            tests.push(ChoiceTest::NumericEquals(v));
        }
        if let Some(v) = self.numeric_less_than {
            tests.push(ChoiceTest::NumericLessThan(v));
        }
        if let Some(v) = self.numeric_less_than_equals {
            tests.push(ChoiceTest::NumericLessThanEquals(v));
        }
        if let Some(v) = self.numeric_greater_than {
            tests.push(ChoiceTest::NumericGreaterThan(v));
        }
        if let Some(v) = self.numeric_greater_than_equals {
            tests.push(ChoiceTest::NumericGreaterThanEquals(v));
        }
        if let Some(v) = self.boolean_equals {
            tests.push(ChoiceTest::BooleanEquals(v));
        }
        if let Some(v) = self.is_present {
            tests.push(ChoiceTest::IsPresent(v));
        }
        tests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workflowType: sample
name: Sample
version: "1.0.0"
requiredParameters: [tenantId]
estimatedDuration: "1 minute"
graph:
  entryState: Check
  states:
    Check:
      type: choice
      choices:
        - variable: $.dryRun
          booleanEquals: true
          next: Done
      default: Work
    Work:
      type: task
      resource: scan-resources
      resultPath: $.scan
      retry:
        - errorClasses: [States.TaskFailed]
          maxAttempts: 2
      next: Done
    Done:
      type: succeed
"#;

    #[test]
    fn test_deserialize_tagged_states() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(def.workflow_type, "sample");
        assert!(def.required_parameters.contains("tenantId"));
        assert_eq!(def.graph.states.len(), 3);

        match &def.graph.states["Work"] {
            StateNode::Task(task) => {
                assert_eq!(task.resource, "scan-resources");
                assert_eq!(task.mode, InvocationMode::Sync);
                assert_eq!(task.retry[0].error_equals, vec!["States.TaskFailed"]);
                assert_eq!(task.retry[0].max_attempts, 2);
                assert_eq!(task.retry[0].backoff_rate, 2.0);
            }
            other => panic!("expected task, got {}", other.kind()),
        }
        assert!(def.graph.states["Done"].is_terminal());
        assert!(!def.graph.states["Work"].is_terminal());
    }

    #[test]
    fn test_choice_rule_tests() {
        let rule = ChoiceRule {
            variable: "$.severity".to_string(),
            next: "Escalate".to_string(),
            string_equals: Some("CRITICAL".to_string()),
            ..Default::default()
        };
        assert_eq!(rule.tests(), vec![ChoiceTest::StringEquals("CRITICAL")]);
    }

    #[test]
    fn test_summary_omits_graph() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE).unwrap();
        let summary = WorkflowSummary::from(&def);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["workflowType"], "sample");
        assert_eq!(json["stateCount"], 3);
        assert!(json.get("graph").is_none());
    }
}
