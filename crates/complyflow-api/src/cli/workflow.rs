//! `cflow definitions`: list registered workflows or show one.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use complyflow_types::workflow::WorkflowDefinition;

use crate::state::AppState;

/// Print every registered workflow definition.
pub fn list_definitions(state: &AppState, json: bool) -> Result<()> {
    let defs = state.coordinator.definitions();

    if json {
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflow definitions registered.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Type").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("States"),
            Cell::new("Required"),
            Cell::new("Duration"),
        ]);

    for d in &defs {
        let required = d
            .required_parameters
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(&d.workflow_type),
            Cell::new(&d.name),
            Cell::new(&d.version),
            Cell::new(d.state_count),
            Cell::new(if required.is_empty() { "-".to_string() } else { required }),
            Cell::new(&d.estimated_duration),
        ]);
    }

    println!();
    println!("{table}");
    println!(
        "  {}",
        style("Show one with: cflow definitions <type>").dim()
    );
    println!();
    Ok(())
}

/// Print a single definition with its state graph.
pub fn show_definition(state: &AppState, workflow_type: &str, json: bool) -> Result<()> {
    let def = state
        .coordinator
        .definition(workflow_type)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(def.as_ref())?);
        return Ok(());
    }

    print_definition(&def);
    Ok(())
}

fn print_definition(def: &WorkflowDefinition) {
    println!();
    println!(
        "  {} {} {}",
        style("Workflow:").bold(),
        style(&def.workflow_type).cyan(),
        style(format!("v{}", def.version)).dim()
    );
    println!("  Name: {}", def.name);
    if !def.description.is_empty() {
        println!("  Description: {}", def.description);
    }
    if !def.estimated_duration.is_empty() {
        println!("  Estimated duration: {}", def.estimated_duration);
    }
    if let Some(secs) = def.timeout_seconds {
        println!("  Timeout: {secs}s");
    }
    let join = |set: &std::collections::BTreeSet<String>| {
        if set.is_empty() {
            "-".to_string()
        } else {
            set.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    };
    println!("  Required parameters: {}", join(&def.required_parameters));
    println!("  Optional parameters: {}", join(&def.optional_parameters));
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("State").fg(Color::Cyan), Cell::new("Kind")]);

    for (name, node) in &def.graph.states {
        let name_cell = if *name == def.graph.entry_state {
            Cell::new(format!("{name} (entry)")).fg(Color::Green)
        } else {
            Cell::new(name)
        };
        table.add_row(vec![name_cell, Cell::new(node.kind())]);
    }

    println!("{table}");
    println!();
}
