//! CLI command definitions for the `cflow` binary.
//!
//! Uses clap derive macros. Every command except `serve` and `completions`
//! drives the same coordinator the REST API uses.

pub mod execution;
pub mod workflow;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};

/// Run and inspect multi-tenant compliance workflows.
#[derive(Parser)]
#[command(name = "cflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use the in-process simulated task backend instead of HTTP.
    #[arg(long, global = true, env = "COMPLYFLOW_SIMULATE")]
    pub simulate: bool,

    /// Emit log lines as JSON objects.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server.
    Serve {
        /// Port to listen on (defaults to `server.port` in config.toml).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to `server.host` in config.toml).
        #[arg(long)]
        host: Option<String>,
    },

    /// List workflow definitions, or show one in detail.
    #[command(alias = "defs")]
    Definitions {
        /// Workflow type to show (omit to list all).
        workflow_type: Option<String>,
    },

    /// Run a workflow to completion and print the final record.
    Run {
        /// Workflow type, e.g. `compliance-scan`.
        workflow_type: String,

        /// Tenant the execution belongs to.
        #[arg(long)]
        tenant: String,

        /// Parameter as `key=value`; the value is parsed as JSON when possible.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Parameters as a JSON object, merged under any `--param` values.
        #[arg(long = "params", value_name = "JSON")]
        params_json: Option<String>,
    },

    /// Show the status of an execution.
    Status {
        /// Execution UUID.
        execution_id: String,
    },

    /// Stop a running execution.
    Stop {
        /// Execution UUID.
        execution_id: String,
    },

    /// Show the transition history of an execution.
    History {
        /// Execution UUID.
        execution_id: String,
    },

    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Filter by tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Filter by workflow type.
        #[arg(long = "type")]
        workflow_type: Option<String>,

        /// Filter by status (RUNNING, SUCCEEDED, FAILED, TIMED_OUT, ABORTED).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of executions to show.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Aggregate execution counts and average duration.
    Metrics {
        /// Filter by tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Filter by workflow type.
        #[arg(long = "type")]
        workflow_type: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Build the `parameters` object for `cflow run`.
///
/// `--params` supplies the base object; each `--param key=value` is applied
/// on top. Values that parse as JSON keep their type, anything else is a string.
pub fn parse_parameters(pairs: &[String], json: Option<&str>) -> Result<Value> {
    let mut params = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--params is not valid JSON")? {
            Value::Object(map) => map,
            _ => bail!("--params must be a JSON object"),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid --param '{pair}': expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --param '{pair}': empty key");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }

    Ok(Value::Object(params))
}
