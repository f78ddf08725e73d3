//! Immutable catalog of workflow definitions.
//!
//! Built once at startup from the embedded templates plus an optional
//! directory of operator-supplied YAML, then shared by `Arc`. Any invalid
//! definition, duplicate `workflowType`, dangling sub-workflow reference or
//! sub-workflow cycle aborts construction.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use complyflow_types::workflow::{StateGraph, StateNode, WorkflowDefinition, WorkflowSummary};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::{WorkflowError, load_definitions_dir, parse_workflow_yaml};

/// Task resources with this prefix run another registered workflow inline.
pub const SUB_WORKFLOW_PREFIX: &str = "workflow:";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        "compliance-scan",
        include_str!("../../templates/compliance-scan.yaml"),
    ),
    ("remediation", include_str!("../../templates/remediation.yaml")),
    (
        "compliance-assessment",
        include_str!("../../templates/compliance-assessment.yaml"),
    ),
    (
        "incident-response",
        include_str!("../../templates/incident-response.yaml"),
    ),
    (
        "audit-pack-generation",
        include_str!("../../templates/audit-pack-generation.yaml"),
    ),
    (
        "continuous-monitoring",
        include_str!("../../templates/continuous-monitoring.yaml"),
    ),
];

/// Read-only lookup of definitions by workflow type.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    /// The six built-in compliance workflows.
    pub fn builtin() -> Result<Self, WorkflowError> {
        Self::from_definitions(builtin_definitions()?)
    }

    /// Built-in workflows plus every definition found in `dir`.
    pub fn with_directory(dir: &Path) -> Result<Self, WorkflowError> {
        let mut defs = builtin_definitions()?;
        let custom = load_definitions_dir(dir)?;
        tracing::info!(
            dir = %dir.display(),
            count = custom.len(),
            "loaded custom workflow definitions"
        );
        defs.extend(custom);
        Self::from_definitions(defs)
    }

    /// Build a registry from already-validated definitions, checking
    /// uniqueness and sub-workflow references.
    pub fn from_definitions(defs: Vec<WorkflowDefinition>) -> Result<Self, WorkflowError> {
        let mut definitions = BTreeMap::new();
        for def in defs {
            if definitions.contains_key(&def.workflow_type) {
                return Err(WorkflowError::Duplicate(def.workflow_type));
            }
            definitions.insert(def.workflow_type.clone(), Arc::new(def));
        }
        let registry = Self { definitions };
        registry.check_sub_workflows()?;
        Ok(registry)
    }

    /// Get a definition by workflow type.
    pub fn get(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.definitions
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_type.to_string()))
    }

    /// All definitions, ordered by workflow type.
    pub fn list_all(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.definitions.values().cloned().collect()
    }

    /// Metadata-only views, ordered by workflow type.
    pub fn summaries(&self) -> Vec<WorkflowSummary> {
        self.definitions
            .values()
            .map(|d| WorkflowSummary::from(d.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Every `workflow:<type>` must name a registered workflow, and the
    /// workflow -> sub-workflow graph must be acyclic.
    fn check_sub_workflows(&self) -> Result<(), WorkflowError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, _> = self
            .definitions
            .keys()
            .map(|k| (k.as_str(), graph.add_node(k.as_str())))
            .collect();

        for (workflow_type, def) in &self.definitions {
            let mut refs = Vec::new();
            collect_sub_workflow_refs(&def.graph, &mut refs);
            for target in refs {
                let Some(&to) = index.get(target) else {
                    return Err(WorkflowError::ValidationError(format!(
                        "workflow '{workflow_type}' references unknown sub-workflow '{target}'"
                    )));
                };
                graph.add_edge(index[workflow_type.as_str()], to, ());
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            WorkflowError::ValidationError(format!(
                "sub-workflow cycle involving '{}'",
                graph[cycle.node_id()]
            ))
        })?;
        Ok(())
    }
}

fn builtin_definitions() -> Result<Vec<WorkflowDefinition>, WorkflowError> {
    BUILTIN_TEMPLATES
        .iter()
        .map(|(name, yaml)| {
            parse_workflow_yaml(yaml).map_err(|e| {
                WorkflowError::ValidationError(format!("built-in template '{name}': {e}"))
            })
        })
        .collect()
}

/// Collect `workflow:<type>` targets from a graph and its nested graphs.
fn collect_sub_workflow_refs<'a>(graph: &'a StateGraph, out: &mut Vec<&'a str>) {
    for node in graph.states.values() {
        match node {
            StateNode::Task(task) => {
                if let Some(target) = task.resource.strip_prefix(SUB_WORKFLOW_PREFIX) {
                    out.push(target);
                }
            }
            StateNode::Parallel(parallel) => {
                for branch in &parallel.branches {
                    collect_sub_workflow_refs(branch, out);
                }
            }
            StateNode::Map(map) => collect_sub_workflow_refs(&map.iterator, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(workflow_type: &str, resource: &str) -> WorkflowDefinition {
        let yaml = format!(
            r#"
workflowType: {workflow_type}
name: Test
version: "1"
graph:
  entryState: Run
  states:
    Run:
      type: task
      resource: "{resource}"
      end: true
"#
        );
        parse_workflow_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_builtin_templates_are_valid() {
        let registry = WorkflowRegistry::builtin().expect("built-ins must validate");
        assert_eq!(registry.len(), 6);
        for name in [
            "compliance-scan",
            "remediation",
            "compliance-assessment",
            "incident-response",
            "audit-pack-generation",
            "continuous-monitoring",
        ] {
            let def = registry.get(name).unwrap();
            assert_eq!(def.workflow_type, name);
            assert!(def.required_parameters.contains("tenantId"), "{name}");
        }
    }

    #[test]
    fn test_builtin_shapes() {
        let registry = WorkflowRegistry::builtin().unwrap();
        let scan = registry.get("compliance-scan").unwrap();
        match &scan.graph.states["DiscoverResources"] {
            StateNode::Parallel(p) => assert_eq!(p.branches.len(), 3),
            other => panic!("expected parallel, got {}", other.kind()),
        }
        let remediation = registry.get("remediation").unwrap();
        match &remediation.graph.states["ApplyRemediations"] {
            StateNode::Map(m) => {
                assert_eq!(m.max_concurrency, 5);
                assert_eq!(m.items_path, "$.findingIds");
            }
            other => panic!("expected map, got {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let registry = WorkflowRegistry::builtin().unwrap();
        assert!(matches!(
            registry.get("vendor-review"),
            Err(WorkflowError::NotFound(t)) if t == "vendor-review"
        ));
    }

    #[test]
    fn test_summaries_are_sorted() {
        let registry = WorkflowRegistry::builtin().unwrap();
        let types: Vec<_> = registry
            .summaries()
            .into_iter()
            .map(|s| s.workflow_type)
            .collect();
        let mut sorted = types.clone();
        sorted.sort();
        assert_eq!(types, sorted);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = WorkflowRegistry::from_definitions(vec![simple("a", "x"), simple("a", "y")])
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Duplicate(t) if t == "a"));
    }

    #[test]
    fn test_dangling_sub_workflow_rejected() {
        let err = WorkflowRegistry::from_definitions(vec![simple("a", "workflow:missing")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown sub-workflow 'missing'"));
    }

    #[test]
    fn test_sub_workflow_cycle_rejected() {
        let err = WorkflowRegistry::from_definitions(vec![
            simple("a", "workflow:b"),
            simple("b", "workflow:a"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_with_directory_adds_custom() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vendor.yaml"),
            r#"
workflowType: vendor-review
name: Vendor Review
version: "1"
requiredParameters: [tenantId]
graph:
  entryState: Assess
  states:
    Assess:
      type: task
      resource: "workflow:compliance-assessment"
      end: true
"#,
        )
        .unwrap();
        let registry = WorkflowRegistry::with_directory(dir.path()).unwrap();
        assert_eq!(registry.len(), 7);
        assert!(registry.get("vendor-review").is_ok());
    }
}
