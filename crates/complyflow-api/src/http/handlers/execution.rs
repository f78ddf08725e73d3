//! Execution handlers: start, status, stop, list, history and metrics.

use std::time::Instant;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use complyflow_types::execution::{
    ExecutionEvent, ExecutionFilter, ExecutionHandle, ExecutionRecord, ExecutionStatus,
    StartWorkflowRequest, StopOutcome, WorkflowMetricsSnapshot,
};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters / bodies
// ---------------------------------------------------------------------------

/// Query parameters for `list-executions`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsQuery {
    pub tenant_id: Option<String>,
    pub workflow_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Query parameters for `workflow-metrics`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    pub tenant_id: Option<String>,
    pub workflow_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionList {
    pub executions: Vec<ExecutionRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistory {
    pub execution_id: Uuid,
    pub events: Vec<ExecutionEvent>,
}

/// Unparseable ids cannot name an execution, so they are reported as missing.
fn parse_execution_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse::<Uuid>()
        .map_err(|_| AppError::NotFound(format!("Execution {raw} not found")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/start-workflow - Start an execution and return immediately.
pub async fn start_workflow(
    State(state): State<AppState>,
    payload: Result<Json<StartWorkflowRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<ExecutionHandle>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let record = state.coordinator.start(request).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(ExecutionHandle::from(&record), request_id, elapsed)
        .with_link(
            "status",
            &format!("/api/v1/execution-status/{}", record.execution_id),
        )
        .with_link(
            "stop",
            &format!("/api/v1/execution-stop/{}", record.execution_id),
        );
    Ok(Json(resp))
}

/// GET /api/v1/execution-status/{execution_id}
pub async fn execution_status(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ApiResponse<ExecutionRecord>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let id = parse_execution_id(&execution_id)?;
    let record = state.coordinator.status(&id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(record, request_id, elapsed)
        .with_link("history", &format!("/api/v1/execution-history/{id}"));
    Ok(Json(resp))
}

/// POST /api/v1/execution-stop/{execution_id}
pub async fn stop_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ApiResponse<StopOutcome>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let id = parse_execution_id(&execution_id)?;
    let outcome = state.coordinator.stop(&id).await?;
    tracing::info!(execution_id = %id, stopped = outcome.stopped, "stop requested via API");

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(outcome, request_id, elapsed)))
}

/// GET /api/v1/list-executions?tenantId&workflowType&status&limit
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<ExecutionList>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let status = non_empty(query.status)
        .map(|s| s.parse::<ExecutionStatus>())
        .transpose()
        .map_err(AppError::Validation)?;
    let filter = ExecutionFilter {
        tenant_id: non_empty(query.tenant_id),
        workflow_type: non_empty(query.workflow_type),
        status,
    };
    let executions = state.coordinator.list(&filter, query.limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let count = executions.len();
    let resp = ApiResponse::success(ExecutionList { executions, count }, request_id, elapsed)
        .with_link("self", "/api/v1/list-executions");
    Ok(Json(resp))
}

/// GET /api/v1/execution-history/{execution_id}
pub async fn execution_history(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<ApiResponse<ExecutionHistory>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let id = parse_execution_id(&execution_id)?;
    let events = state.coordinator.history(&id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        ExecutionHistory {
            execution_id: id,
            events,
        },
        request_id,
        elapsed,
    )
    .with_link("status", &format!("/api/v1/execution-status/{id}"));
    Ok(Json(resp))
}

/// GET /api/v1/workflow-metrics?tenantId&workflowType
pub async fn workflow_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<ApiResponse<WorkflowMetricsSnapshot>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let filter = ExecutionFilter {
        tenant_id: non_empty(query.tenant_id),
        workflow_type: non_empty(query.workflow_type),
        status: None,
    };
    let snapshot = state.coordinator.metrics(&filter).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(snapshot, request_id, elapsed)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use serde_json::json;

    fn request(workflow_type: &str, tenant: &str, parameters: serde_json::Value) -> StartWorkflowRequest {
        StartWorkflowRequest {
            workflow_type: workflow_type.to_string(),
            tenant_id: tenant.to_string(),
            parameters,
            started_by: Some("api-test".to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_start_returns_running_handle() {
        let state = AppState::for_tests().await;
        let Json(resp) = start_workflow(
            State(state.clone()),
            Ok(Json(request("compliance-scan", "tenant-a", json!({})))),
        )
        .await
        .unwrap();
        let handle = resp.data.unwrap();
        assert_eq!(handle.status, ExecutionStatus::Running);
        assert!(resp.links.contains_key("status"));

        let Json(status) = execution_status(State(state), Path(handle.execution_id.to_string()))
            .await
            .unwrap();
        assert_eq!(status.data.unwrap().execution_id, handle.execution_id);
    }

    #[tokio::test]
    async fn test_start_validation_errors_are_400() {
        let state = AppState::for_tests().await;

        let err = start_workflow(
            State(state.clone()),
            Ok(Json(request("remediation", "tenant-a", json!({})))),
        )
        .await
        .unwrap_err();
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "VALIDATION_ERROR");
        assert!(message.contains("findingIds"), "got: {message}");

        let err = start_workflow(
            State(state),
            Ok(Json(request("vendor-review", "tenant-a", json!({})))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_404() {
        let state = AppState::for_tests().await;
        for id in [Uuid::now_v7().to_string(), "not-a-uuid".to_string()] {
            let err = execution_status(State(state.clone()), Path(id.clone()))
                .await
                .unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

            let err = stop_execution(State(state.clone()), Path(id)).await.unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_stop_finished_execution_reports_not_stopped() {
        let state = AppState::for_tests().await;
        let record = state
            .coordinator
            .run_to_completion(request("compliance-scan", "tenant-a", json!({})))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);

        let Json(resp) = stop_execution(State(state.clone()), Path(record.execution_id.to_string()))
            .await
            .unwrap();
        assert!(!resp.data.unwrap().stopped);

        let Json(history) =
            execution_history(State(state), Path(record.execution_id.to_string()))
                .await
                .unwrap();
        let events = history.data.unwrap().events;
        assert!(!events.is_empty());
        assert_eq!(events[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_list_and_metrics_filter_by_tenant() {
        let state = AppState::for_tests().await;
        for tenant in ["tenant-a", "tenant-b", "tenant-a"] {
            state
                .coordinator
                .run_to_completion(request("compliance-scan", tenant, json!({})))
                .await
                .unwrap();
        }

        let Json(resp) = list_executions(
            State(state.clone()),
            Query(ListExecutionsQuery {
                tenant_id: Some("tenant-a".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        let list = resp.data.unwrap();
        assert_eq!(list.count, 2);
        assert!(list.executions.iter().all(|r| r.tenant_id == "tenant-a"));

        let Json(resp) = workflow_metrics(
            State(state.clone()),
            Query(MetricsQuery {
                tenant_id: Some("tenant-b".to_string()),
                workflow_type: None,
            }),
        )
        .await
        .unwrap();
        let metrics = resp.data.unwrap();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.succeeded, 1);

        let err = list_executions(
            State(state),
            Query(ListExecutionsQuery {
                status: Some("PAUSED".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
