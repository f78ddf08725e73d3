//! ComplyFlow CLI and REST API entry point.
//!
//! Binary name: `cflow`
//!
//! Parses CLI arguments, sets up tracing, wires the execution coordinator,
//! then dispatches to a command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use anyhow::anyhow;
use clap::Parser;
use clap_complete::generate;

use complyflow_observe::tracing_setup::{
    TracingOptions, directive_for_verbosity, init_tracing, shutdown_tracing,
};
use complyflow_types::execution::{ExecutionFilter, ExecutionStatus, StartWorkflowRequest};

use cli::{Cli, Commands};
use state::{AppState, StartupOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cflow", &mut std::io::stdout());
        return Ok(());
    }

    // A server is expected to log request activity by default
    let directive = match cli.command {
        Commands::Serve { .. } if cli.verbose == 0 && !cli.quiet => "info",
        _ => directive_for_verbosity(cli.verbose, cli.quiet),
    };
    init_tracing(&TracingOptions {
        default_directive: directive.to_string(),
        json: cli.log_json,
        enable_otel: cli.otel,
    })
    .map_err(|e| anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(StartupOptions {
        simulate: cli.simulate,
    })
    .await?;

    match cli.command {
        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            if !cli.quiet {
                println!(
                    "  {} ComplyFlow API listening on {}",
                    console::style("*").green().bold(),
                    console::style(format!("http://{addr}")).cyan()
                );
                println!("  {}", console::style("Press Ctrl+C to stop").dim());
            }
            tracing::info!(%addr, data_dir = %state.data_dir.display(), "server started");

            let router = http::router::build_router(state);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if !cli.quiet {
                println!("\n  Server stopped.");
            }
        }

        Commands::Definitions { workflow_type } => match workflow_type {
            Some(t) => cli::workflow::show_definition(&state, &t, cli.json)?,
            None => cli::workflow::list_definitions(&state, cli.json)?,
        },

        Commands::Run {
            workflow_type,
            tenant,
            params,
            params_json,
        } => {
            let parameters = cli::parse_parameters(&params, params_json.as_deref())?;
            let request = StartWorkflowRequest {
                workflow_type,
                tenant_id: tenant,
                parameters,
                started_by: Some("cli".to_string()),
                metadata: None,
            };
            cli::execution::run_workflow(&state, request, cli.json, cli.quiet).await?;
        }

        Commands::Status { execution_id } => {
            cli::execution::show_status(&state, &execution_id, cli.json).await?;
        }

        Commands::Stop { execution_id } => {
            cli::execution::stop_execution(&state, &execution_id, cli.json).await?;
        }

        Commands::History { execution_id } => {
            cli::execution::show_history(&state, &execution_id, cli.json).await?;
        }

        Commands::List {
            tenant,
            workflow_type,
            status,
            limit,
        } => {
            let status = status
                .map(|s| s.parse::<ExecutionStatus>())
                .transpose()
                .map_err(|e| anyhow!(e))?;
            let filter = ExecutionFilter {
                tenant_id: tenant,
                workflow_type,
                status,
            };
            cli::execution::list_executions(&state, filter, limit, cli.json).await?;
        }

        Commands::Metrics {
            tenant,
            workflow_type,
        } => {
            let filter = ExecutionFilter {
                tenant_id: tenant,
                workflow_type,
                status: None,
            };
            cli::execution::show_metrics(&state, filter, cli.json).await?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
