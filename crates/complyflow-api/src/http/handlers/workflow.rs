//! Workflow definition handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use complyflow_types::workflow::{WorkflowDefinition, WorkflowSummary};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/workflow-definitions - Metadata for every registered workflow.
pub async fn list_definitions(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowSummary>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let defs = state.coordinator.definitions();

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(defs, request_id, elapsed)
        .with_link("self", "/api/v1/workflow-definitions");
    Ok(Json(resp))
}

/// GET /api/v1/workflow-definitions/{workflow_type} - Full definition with graph.
pub async fn get_definition(
    State(state): State<AppState>,
    Path(workflow_type): Path<String>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state
        .coordinator
        .definition(&workflow_type)
        .map_err(|_| AppError::NotFound(format!("Workflow type '{workflow_type}' not found")))?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(def.as_ref().clone(), request_id, elapsed)
        .with_link(
            "self",
            &format!("/api/v1/workflow-definitions/{workflow_type}"),
        )
        .with_link(
            "executions",
            &format!("/api/v1/list-executions?workflowType={workflow_type}"),
        );
    Ok(Json(resp))
}
