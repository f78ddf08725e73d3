//! Workflow definition parsing, validation, and filesystem loading.
//!
//! Converts YAML documents into `WorkflowDefinition`s and validates the
//! structural constraints the evaluator relies on: every transition target
//! exists, every state declares exactly one of `next`/`end`, rules are
//! well-formed, and templates reference parseable paths.

use std::collections::HashSet;
use std::path::Path;

use complyflow_types::workflow::{
    CatchRule, RetryRule, StateGraph, StateNode, WorkflowDefinition,
};
use thiserror::Error;

use super::graph::check_reachability;
use super::path::{JsonPath, validate_template};
use crate::task::error_class;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or registering definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// No definition registered under this workflow type.
    #[error("workflow type not found: {0}")]
    NotFound(String),

    /// Two definitions share a workflow type.
    #[error("duplicate workflow type: {0}")]
    Duplicate(String),
}

fn invalid(message: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - `workflowType` is non-empty, alphanumeric plus hyphens
/// - name and version are non-empty
/// - no parameter is both required and optional
/// - `timeoutSeconds` > 0 if set, notification topic non-empty if set
/// - every graph (including Parallel branches and Map iterators) is well
///   formed and every state can reach a terminal state
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.workflow_type.is_empty() {
        return Err(invalid("workflowType must not be empty"));
    }
    if !def
        .workflow_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(invalid(format!(
            "workflowType '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.workflow_type
        )));
    }
    if def.name.trim().is_empty() {
        return Err(invalid(format!("workflow '{}' has an empty name", def.workflow_type)));
    }
    if def.version.trim().is_empty() {
        return Err(invalid(format!("workflow '{}' has an empty version", def.workflow_type)));
    }

    if let Some(both) = def
        .required_parameters
        .intersection(&def.optional_parameters)
        .next()
    {
        return Err(invalid(format!(
            "parameter '{both}' is listed as both required and optional"
        )));
    }

    if def.timeout_seconds == Some(0) {
        return Err(invalid("timeoutSeconds must be > 0"));
    }

    if let Some(n) = &def.notifications {
        if n.topic.trim().is_empty() {
            return Err(invalid("notifications.topic must not be empty"));
        }
    }

    validate_graph(&def.graph, &def.workflow_type)
}

/// Validate one state graph and, recursively, its nested graphs.
///
/// `scope` names the graph in error messages (e.g. `compliance-scan/DiscoverResources#1`).
fn validate_graph(graph: &StateGraph, scope: &str) -> Result<(), WorkflowError> {
    if graph.states.is_empty() {
        return Err(invalid(format!("{scope}: graph has no states")));
    }
    if !graph.states.contains_key(&graph.entry_state) {
        return Err(invalid(format!(
            "{scope}: entryState '{}' is not a declared state",
            graph.entry_state
        )));
    }

    let names: HashSet<&str> = graph.states.keys().map(String::as_str).collect();
    let target_exists = |state: &str, target: &str| -> Result<(), WorkflowError> {
        if names.contains(target) {
            Ok(())
        } else {
            Err(invalid(format!(
                "{scope}: state '{state}' references unknown state '{target}'"
            )))
        }
    };

    for (name, node) in &graph.states {
        if name.trim().is_empty() {
            return Err(invalid(format!("{scope}: state names must not be empty")));
        }

        if let Some((next, end)) = node.transition() {
            match (next, end) {
                (Some(target), false) => target_exists(name, target)?,
                (None, true) => {}
                (Some(_), true) => {
                    return Err(invalid(format!(
                        "{scope}: state '{name}' declares both next and end"
                    )));
                }
                (None, false) => {
                    return Err(invalid(format!(
                        "{scope}: state '{name}' declares neither next nor end"
                    )));
                }
            }
        }

        for rule in node.catch_rules() {
            validate_catch(scope, name, rule)?;
            target_exists(name, &rule.next)?;
        }
        check_all_last(
            scope,
            name,
            node.catch_rules().iter().map(|r| r.error_equals.as_slice()),
        )?;

        match node {
            StateNode::Task(task) => {
                if task.resource.trim().is_empty() {
                    return Err(invalid(format!("{scope}: task '{name}' has no resource")));
                }
                if task.timeout_seconds == Some(0) {
                    return Err(invalid(format!(
                        "{scope}: task '{name}' timeoutSeconds must be > 0"
                    )));
                }
                if let Some(params) = &task.parameters {
                    check_template(scope, name, params)?;
                }
                check_path(scope, name, task.result_path.as_deref())?;
                for rule in &task.retry {
                    validate_retry(scope, name, rule)?;
                }
                check_all_last(
                    scope,
                    name,
                    task.retry.iter().map(|r| r.error_equals.as_slice()),
                )?;
            }
            StateNode::Choice(choice) => {
                if choice.choices.is_empty() {
                    return Err(invalid(format!(
                        "{scope}: choice '{name}' must declare at least one rule"
                    )));
                }
                for (idx, rule) in choice.choices.iter().enumerate() {
                    let tests = rule.tests().len();
                    if tests != 1 {
                        return Err(invalid(format!(
                            "{scope}: choice '{name}' rule {idx} must declare exactly one comparison (found {tests})"
                        )));
                    }
                    JsonPath::parse(&rule.variable).map_err(|e| {
                        invalid(format!("{scope}: choice '{name}' rule {idx}: {e}"))
                    })?;
                    target_exists(name, &rule.next)?;
                }
                if let Some(default) = &choice.default {
                    target_exists(name, default)?;
                }
            }
            StateNode::Wait(wait) => match (&wait.seconds, &wait.seconds_path) {
                (Some(_), None) => {}
                (None, Some(path)) => check_path(scope, name, Some(path))?,
                _ => {
                    return Err(invalid(format!(
                        "{scope}: wait '{name}' must declare exactly one of seconds or secondsPath"
                    )));
                }
            },
            StateNode::Parallel(parallel) => {
                if parallel.branches.is_empty() {
                    return Err(invalid(format!(
                        "{scope}: parallel '{name}' must declare at least one branch"
                    )));
                }
                check_path(scope, name, parallel.result_path.as_deref())?;
                for (idx, branch) in parallel.branches.iter().enumerate() {
                    validate_graph(branch, &format!("{scope}/{name}#{idx}"))?;
                }
            }
            StateNode::Map(map) => {
                if map.max_concurrency < 1 {
                    return Err(invalid(format!(
                        "{scope}: map '{name}' maxConcurrency must be >= 1"
                    )));
                }
                check_path(scope, name, Some(&map.items_path))?;
                check_path(scope, name, map.result_path.as_deref())?;
                if let Some(selector) = &map.item_selector {
                    check_template(scope, name, selector)?;
                }
                validate_graph(&map.iterator, &format!("{scope}/{name}"))?;
            }
            StateNode::Pass(pass) => {
                if pass.result.is_some() && pass.parameters.is_some() {
                    return Err(invalid(format!(
                        "{scope}: pass '{name}' cannot declare both result and parameters"
                    )));
                }
                if let Some(params) = &pass.parameters {
                    check_template(scope, name, params)?;
                }
                check_path(scope, name, pass.result_path.as_deref())?;
            }
            StateNode::Fail(fail) => {
                if fail.error.trim().is_empty() {
                    return Err(invalid(format!("{scope}: fail '{name}' must name an error")));
                }
            }
            StateNode::Succeed(_) => {}
        }
    }

    check_reachability(graph, scope)
}

fn validate_retry(scope: &str, state: &str, rule: &RetryRule) -> Result<(), WorkflowError> {
    if rule.error_equals.is_empty() {
        return Err(invalid(format!(
            "{scope}: retry on '{state}' must list at least one error class"
        )));
    }
    if rule.max_attempts < 1 {
        return Err(invalid(format!(
            "{scope}: retry on '{state}' maxAttempts must be >= 1"
        )));
    }
    if rule.backoff_rate.is_nan() || rule.backoff_rate < 1.0 {
        return Err(invalid(format!(
            "{scope}: retry on '{state}' backoffRate must be >= 1.0"
        )));
    }
    if !rule.interval_seconds.is_finite() || rule.interval_seconds < 0.0 {
        return Err(invalid(format!(
            "{scope}: retry on '{state}' intervalSeconds must be >= 0"
        )));
    }
    Ok(())
}

fn validate_catch(scope: &str, state: &str, rule: &CatchRule) -> Result<(), WorkflowError> {
    if rule.error_equals.is_empty() {
        return Err(invalid(format!(
            "{scope}: catch on '{state}' must list at least one error class"
        )));
    }
    check_path(scope, state, rule.result_path.as_deref())
}

/// `States.ALL` must stand alone in its rule and the rule must come last.
fn check_all_last<'a>(
    scope: &str,
    state: &str,
    rules: impl ExactSizeIterator<Item = &'a [String]>,
) -> Result<(), WorkflowError> {
    let count = rules.len();
    for (idx, classes) in rules.enumerate() {
        if classes.iter().any(|c| c == error_class::ALL)
            && (classes.len() != 1 || idx + 1 != count)
        {
            return Err(invalid(format!(
                "{scope}: '{}' on '{state}' must appear alone in the last rule",
                error_class::ALL
            )));
        }
    }
    Ok(())
}

fn check_path(scope: &str, state: &str, path: Option<&str>) -> Result<(), WorkflowError> {
    match path {
        Some(path) => JsonPath::parse(path)
            .map(|_| ())
            .map_err(|e| invalid(format!("{scope}: state '{state}': {e}"))),
        None => Ok(()),
    }
}

fn check_template(
    scope: &str,
    state: &str,
    template: &serde_json::Value,
) -> Result<(), WorkflowError> {
    validate_template(template).map_err(|e| invalid(format!("{scope}: state '{state}': {e}")))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content).map_err(|e| match e {
        WorkflowError::ParseError(msg) => {
            WorkflowError::ParseError(format!("{}: {msg}", path.display()))
        }
        WorkflowError::ValidationError(msg) => {
            WorkflowError::ValidationError(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Load every `.yaml`/`.yml` file directly under `dir`, in file name order.
///
/// Unlike discovery of optional files, an invalid definition here is an
/// error: an operator-supplied directory must be entirely valid.
pub fn load_definitions_dir(dir: &Path) -> Result<Vec<WorkflowDefinition>, WorkflowError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut defs = Vec::with_capacity(paths.len());
    for path in paths {
        tracing::debug!(?path, "loading workflow definition");
        defs.push(load_workflow_file(&path)?);
    }
    Ok(defs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
workflowType: sample-flow
name: Sample Flow
version: "1.0"
requiredParameters: [tenantId]
graph:
  entryState: Start
  states:
    Start:
      type: task
      resource: initialize-scan
      resultPath: $.init
      next: Done
      catch:
        - errorEquals: [States.ALL]
          next: Failed
    Done:
      type: succeed
    Failed:
      type: fail
      error: SampleFailed
"#;

    fn parse_with(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
        parse_workflow_yaml(yaml)
    }

    #[test]
    fn test_parse_minimal() {
        let def = parse_with(MINIMAL).expect("should parse");
        assert_eq!(def.workflow_type, "sample-flow");
        assert_eq!(def.graph.states.len(), 3);
    }

    #[test]
    fn test_rejects_invalid_workflow_type() {
        let yaml = MINIMAL.replace("sample-flow", "sample flow!");
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("invalid characters"), "got: {msg}");
    }

    #[test]
    fn test_rejects_unknown_next() {
        let yaml = MINIMAL.replace("next: Done", "next: Nowhere");
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("unknown state 'Nowhere'"), "got: {msg}");
    }

    #[test]
    fn test_rejects_missing_entry() {
        let yaml = MINIMAL.replace("entryState: Start", "entryState: Begin");
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("entryState 'Begin'"), "got: {msg}");
    }

    #[test]
    fn test_rejects_next_and_end() {
        let yaml = MINIMAL.replace("next: Done\n", "next: Done\n      end: true\n");
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("both next and end"), "got: {msg}");
    }

    #[test]
    fn test_rejects_neither_next_nor_end() {
        let yaml = MINIMAL.replace("      next: Done\n", "");
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("neither next nor end"), "got: {msg}");
    }

    #[test]
    fn test_rejects_required_and_optional_overlap() {
        let yaml = MINIMAL.replace(
            "requiredParameters: [tenantId]",
            "requiredParameters: [tenantId]\noptionalParameters: [tenantId]",
        );
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("both required and optional"), "got: {msg}");
    }

    #[test]
    fn test_rejects_all_not_last() {
        let yaml = MINIMAL.replace(
            "      catch:\n        - errorEquals: [States.ALL]\n          next: Failed\n",
            "      catch:\n        - errorEquals: [States.ALL]\n          next: Failed\n        - errorEquals: [States.Timeout]\n          next: Failed\n",
        );
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("alone in the last rule"), "got: {msg}");
    }

    #[test]
    fn test_rejects_choice_with_two_comparisons() {
        let yaml = r#"
workflowType: choice-flow
name: Choice
version: "1"
graph:
  entryState: Decide
  states:
    Decide:
      type: choice
      choices:
        - variable: $.x
          stringEquals: a
          booleanEquals: true
          next: Done
      default: Done
    Done:
      type: succeed
"#;
        let msg = parse_with(yaml).unwrap_err().to_string();
        assert!(msg.contains("exactly one comparison"), "got: {msg}");
    }

    #[test]
    fn test_rejects_wait_without_duration() {
        let yaml = r#"
workflowType: wait-flow
name: Wait
version: "1"
graph:
  entryState: Pause
  states:
    Pause:
      type: wait
      end: true
"#;
        let msg = parse_with(yaml).unwrap_err().to_string();
        assert!(msg.contains("seconds or secondsPath"), "got: {msg}");
    }

    #[test]
    fn test_validates_nested_branches() {
        let yaml = r#"
workflowType: parallel-flow
name: Parallel
version: "1"
graph:
  entryState: Fan
  states:
    Fan:
      type: parallel
      end: true
      branches:
        - entryState: A
          states:
            A:
              type: task
              resource: a
              next: Missing
"#;
        let msg = parse_with(yaml).unwrap_err().to_string();
        assert!(msg.contains("parallel-flow/Fan#0"), "got: {msg}");
        assert!(msg.contains("unknown state 'Missing'"), "got: {msg}");
    }

    #[test]
    fn test_rejects_bad_template_path() {
        let yaml = MINIMAL.replace(
            "resource: initialize-scan\n",
            "resource: initialize-scan\n      parameters:\n        tenantId.$: tenantId\n",
        );
        let msg = parse_with(&yaml).unwrap_err().to_string();
        assert!(msg.contains("must start with '$'"), "got: {msg}");
    }

    #[test]
    fn test_parse_error_on_unknown_state_type() {
        let yaml = MINIMAL.replace("type: succeed", "type: sleep");
        assert!(matches!(parse_with(&yaml), Err(WorkflowError::ParseError(_))));
    }

    #[test]
    fn test_load_definitions_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), MINIMAL.replace("sample-flow", "b-flow")).unwrap();
        std::fs::write(dir.path().join("a.yml"), MINIMAL.replace("sample-flow", "a-flow")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let defs = load_definitions_dir(dir.path()).unwrap();
        let types: Vec<_> = defs.iter().map(|d| d.workflow_type.as_str()).collect();
        assert_eq!(types, vec!["a-flow", "b-flow"]);
    }

    #[test]
    fn test_load_definitions_dir_reports_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "workflowType: [").unwrap();
        let msg = load_definitions_dir(dir.path()).unwrap_err().to_string();
        assert!(msg.contains("broken.yaml"), "got: {msg}");
    }
}
