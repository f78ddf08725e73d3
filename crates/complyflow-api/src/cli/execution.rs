//! Execution subcommands: run, status, stop, history, list and metrics.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use complyflow_types::execution::{
    ExecutionFilter, ExecutionRecord, ExecutionStatus, StartWorkflowRequest,
};

use crate::state::AppState;

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("'{raw}' is not a valid execution id"))
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn format_status(status: ExecutionStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        ExecutionStatus::Running => cell.fg(Color::Cyan),
        ExecutionStatus::Succeeded => cell.fg(Color::Green),
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => cell.fg(Color::Red),
        ExecutionStatus::Aborted => cell.fg(Color::Yellow),
    }
}

fn styled_status(status: ExecutionStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        ExecutionStatus::Running => s.cyan(),
        ExecutionStatus::Succeeded => s.green(),
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => s.red(),
        ExecutionStatus::Aborted => s.yellow(),
    }
}

fn format_duration(record: &ExecutionRecord) -> String {
    match record.duration_ms() {
        Some(ms) if ms >= 1000 => format!("{:.1}s", ms as f64 / 1000.0),
        Some(ms) => format!("{ms}ms"),
        None => "-".to_string(),
    }
}

fn print_record(record: &ExecutionRecord) -> Result<()> {
    println!();
    println!(
        "  {} {}",
        style("Execution:").bold(),
        style(record.execution_id).cyan()
    );
    println!("  Workflow: {}", style(&record.workflow_type).cyan());
    println!("  Tenant: {}", record.tenant_id);
    println!("  Status: {}", styled_status(record.status));
    println!("  Correlation: {}", record.correlation_id);
    if let Some(ref current) = record.current_state {
        println!("  Current state: {current}");
    }
    println!("  Started: {}", record.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(stop) = record.stop_time {
        println!("  Stopped: {}", stop.format("%Y-%m-%d %H:%M:%S"));
        println!("  Duration: {}", format_duration(record));
    }
    if let Some(ref err) = record.error {
        println!("  Error: {}", style(err).red());
    }
    if let Some(ref cause) = record.cause {
        println!("  Cause: {}", style(cause).dim());
    }
    if let Some(ref output) = record.output {
        println!("  Output:");
        for line in serde_json::to_string_pretty(output)?.lines() {
            println!("    {line}");
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Start an execution and block until it reaches a terminal status.
pub async fn run_workflow(
    state: &AppState,
    request: StartWorkflowRequest,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let spinner = if json || quiet {
        ProgressBar::hidden()
    } else {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.set_message(format!(
            "Running {} for tenant {}...",
            request.workflow_type, request.tenant_id
        ));
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner
    };

    let result = state.coordinator.run_to_completion(request).await;
    spinner.finish_and_clear();
    let record = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    if quiet {
        println!("{}", record.execution_id);
        return Ok(());
    }

    let marker = if record.status == ExecutionStatus::Succeeded {
        style("*").green().bold()
    } else {
        style("!").red().bold()
    };
    println!();
    println!(
        "  {} Execution {} finished {}",
        marker,
        style(short_id(&record.execution_id)).cyan(),
        styled_status(record.status)
    );
    print_record(&record)
}

// ---------------------------------------------------------------------------
// Status / stop / history
// ---------------------------------------------------------------------------

pub async fn show_status(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let id = parse_id(execution_id)?;
    let record = state.coordinator.status(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    print_record(&record)
}

pub async fn stop_execution(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let id = parse_id(execution_id)?;
    let outcome = state.coordinator.stop(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let marker = if outcome.stopped {
        style("*").green().bold()
    } else {
        style("-").yellow().bold()
    };
    println!();
    println!(
        "  {} {} {}",
        marker,
        style(short_id(&id)).cyan(),
        outcome.message
    );
    println!();
    Ok(())
}

pub async fn show_history(state: &AppState, execution_id: &str, json: bool) -> Result<()> {
    let id = parse_id(execution_id)?;
    let events = state.coordinator.history(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!("  No history recorded for {}.", style(short_id(&id)).cyan());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Time"),
            Cell::new("Event"),
            Cell::new("State"),
            Cell::new("Scope"),
            Cell::new("Detail"),
        ]);

    for event in &events {
        let detail = event
            .detail
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(event.sequence),
            Cell::new(event.timestamp.format("%H:%M:%S%.3f")),
            Cell::new(event.kind.as_str()),
            Cell::new(event.state_name.as_deref().unwrap_or("-")),
            Cell::new(if event.scope.is_empty() { "-" } else { event.scope.as_str() }),
            Cell::new(detail),
        ]);
    }

    println!();
    println!(
        "  {} History for {}",
        style("Execution:").bold(),
        style(short_id(&id)).cyan()
    );
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List / metrics
// ---------------------------------------------------------------------------

pub async fn list_executions(
    state: &AppState,
    filter: ExecutionFilter,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let records = state.coordinator.list(&filter, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No executions found.");
        println!(
            "  Start one with: {}",
            style("cflow run <type> --tenant <id>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Tenant"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
        ]);

    for r in &records {
        table.add_row(vec![
            Cell::new(short_id(&r.execution_id)),
            Cell::new(&r.workflow_type),
            Cell::new(&r.tenant_id),
            format_status(r.status),
            Cell::new(r.start_time.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(format_duration(r)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn show_metrics(state: &AppState, filter: ExecutionFilter, json: bool) -> Result<()> {
    let snapshot = state.coordinator.metrics(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let scope = match (&filter.tenant_id, &filter.workflow_type) {
        (Some(t), Some(w)) => format!("tenant {t}, workflow {w}"),
        (Some(t), None) => format!("tenant {t}"),
        (None, Some(w)) => format!("workflow {w}"),
        (None, None) => "all executions".to_string(),
    };

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Metric").fg(Color::Cyan), Cell::new("Value")]);
    table.add_row(vec![Cell::new("Total"), Cell::new(snapshot.total_executions)]);
    table.add_row(vec![format_status(ExecutionStatus::Running), Cell::new(snapshot.running)]);
    table.add_row(vec![format_status(ExecutionStatus::Succeeded), Cell::new(snapshot.succeeded)]);
    table.add_row(vec![format_status(ExecutionStatus::Failed), Cell::new(snapshot.failed)]);
    table.add_row(vec![format_status(ExecutionStatus::TimedOut), Cell::new(snapshot.timed_out)]);
    table.add_row(vec![format_status(ExecutionStatus::Aborted), Cell::new(snapshot.aborted)]);
    table.add_row(vec![
        Cell::new("Average duration"),
        Cell::new(format!("{}ms", snapshot.average_execution_time_millis)),
    ]);

    println!();
    println!("  {} {}", style("Metrics:").bold(), style(scope).cyan());
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_id_rejects_garbage() {
        let err = parse_id("abc").unwrap_err();
        assert!(err.to_string().contains("not a valid execution id"), "got: {err}");
        assert!(parse_id(&Uuid::now_v7().to_string()).is_ok());
    }

    #[tokio::test]
    async fn test_run_then_inspect_execution() {
        let state = AppState::for_tests().await;
        let request = StartWorkflowRequest {
            workflow_type: "compliance-scan".to_string(),
            tenant_id: "tenant-cli".to_string(),
            parameters: json!({}),
            started_by: Some("cli".to_string()),
            metadata: None,
        };
        run_workflow(&state, request, true, false).await.unwrap();

        let records = state
            .coordinator
            .list(&ExecutionFilter::for_tenant("tenant-cli"), None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let id = records[0].execution_id.to_string();

        show_status(&state, &id, true).await.unwrap();
        show_history(&state, &id, false).await.unwrap();
        stop_execution(&state, &id, true).await.unwrap();
        show_metrics(&state, ExecutionFilter::for_tenant("tenant-cli"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_workflow_fails_run() {
        let state = AppState::for_tests().await;
        let request = StartWorkflowRequest {
            workflow_type: "vendor-review".to_string(),
            tenant_id: "tenant-cli".to_string(),
            parameters: json!({}),
            started_by: None,
            metadata: None,
        };
        let err = run_workflow(&state, request, true, false).await.unwrap_err();
        assert!(err.to_string().contains("vendor-review"), "got: {err}");
    }
}
