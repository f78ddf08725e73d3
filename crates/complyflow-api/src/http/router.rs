//! Axum router configuration with middleware.
//!
//! All engine routes are under `/api/v1/`; `/health` sits at the root.
//! Middleware: CORS, request tracing.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Executions
        .route("/start-workflow", post(handlers::execution::start_workflow))
        .route(
            "/execution-status/{execution_id}",
            get(handlers::execution::execution_status),
        )
        .route(
            "/execution-stop/{execution_id}",
            post(handlers::execution::stop_execution),
        )
        .route(
            "/execution-history/{execution_id}",
            get(handlers::execution::execution_history),
        )
        .route("/list-executions", get(handlers::execution::list_executions))
        .route("/workflow-metrics", get(handlers::execution::workflow_metrics))
        // Definitions
        .route(
            "/workflow-definitions",
            get(handlers::workflow::list_definitions),
        )
        .route(
            "/workflow-definitions/{workflow_type}",
            get(handlers::workflow::get_definition),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness plus backend circuit state.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "definitions": state.coordinator.registry().len(),
        "activeExecutions": state.coordinator.active_executions(),
        "backend": if state.config.backend.simulate { "simulated" } else { "http" },
        "circuits": state.circuit_statuses(),
    }))
}
