//! Reachability analysis over a state graph.
//!
//! Uses `petgraph` to model transitions as a directed graph with a virtual
//! sink node that every terminal state points at. A graph is rejected when
//! the entry cannot reach the sink, or when a reachable state has no path to
//! it (it could only loop forever). Unreachable states are tolerated but
//! logged.

use std::collections::HashMap;

use complyflow_types::workflow::{StateGraph, StateNode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};

use super::definition::WorkflowError;

/// All states a node can transition to: `next`, Choice targets and Catch
/// targets.
pub fn successors(node: &StateNode) -> Vec<&str> {
    let mut out = Vec::new();
    if let Some((Some(next), _)) = node.transition() {
        out.push(next);
    }
    if let StateNode::Choice(choice) = node {
        out.extend(choice.choices.iter().map(|r| r.next.as_str()));
        if let Some(default) = &choice.default {
            out.push(default.as_str());
        }
    }
    out.extend(node.catch_rules().iter().map(|c| c.next.as_str()));
    out
}

/// Check that the entry reaches a terminal state and that every reachable
/// state can still finish.
///
/// Assumes transition targets were already validated to exist; unknown
/// targets are skipped here.
pub fn check_reachability(graph: &StateGraph, scope: &str) -> Result<(), WorkflowError> {
    let mut dag = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = graph
        .states
        .keys()
        .map(|name| (name.as_str(), dag.add_node(name.as_str())))
        .collect();
    let sink = dag.add_node("$end");

    for (name, node) in &graph.states {
        let from = index[name.as_str()];
        if node.is_terminal() {
            dag.add_edge(from, sink, ());
        }
        for target in successors(node) {
            if let Some(&to) = index.get(target) {
                dag.add_edge(from, to, ());
            }
        }
    }

    let Some(&entry) = index.get(graph.entry_state.as_str()) else {
        return Err(WorkflowError::ValidationError(format!(
            "{scope}: entryState '{}' is not a declared state",
            graph.entry_state
        )));
    };

    let mut reachable = vec![false; dag.node_count()];
    let mut bfs = Bfs::new(&dag, entry);
    while let Some(nx) = bfs.next(&dag) {
        reachable[nx.index()] = true;
    }
    if !reachable[sink.index()] {
        return Err(WorkflowError::ValidationError(format!(
            "{scope}: no terminal state is reachable from '{}'",
            graph.entry_state
        )));
    }

    let reversed = Reversed(&dag);
    let mut can_finish = vec![false; dag.node_count()];
    let mut bfs = Bfs::new(reversed, sink);
    while let Some(nx) = bfs.next(reversed) {
        can_finish[nx.index()] = true;
    }

    for (name, &nx) in &index {
        match (reachable[nx.index()], can_finish[nx.index()]) {
            (true, false) => {
                return Err(WorkflowError::ValidationError(format!(
                    "{scope}: state '{name}' cannot reach a terminal state"
                )));
            }
            (false, _) => {
                tracing::warn!(scope, state = *name, "state is unreachable from the entry state");
            }
            (true, true) => {}
        }
    }

    Ok(())
}
