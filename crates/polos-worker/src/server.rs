//! Push-dispatch HTTP server: the orchestrator POSTs an `ExecutionContext`
//! to this worker's registered `push_endpoint_url` (spec.md §4.7 startup
//! sequence) instead of the worker polling for work. Built with axum and
//! tower-http's `TraceLayer`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use polos_contracts::ExecutionContext;

use crate::runner::Runner;

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub workflow_id: String,
    pub execution: ExecutionContext,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn build_router(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/dispatch", post(dispatch))
        .route("/executions/:execution_id/cancel", post(cancel))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

async fn healthz(State(runner): State<Arc<Runner>>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "load": runner.current_load() }))
}

async fn dispatch(
    State(runner): State<Arc<Runner>>,
    Json(request): Json<DispatchRequest>,
) -> impl IntoResponse {
    match runner
        .dispatch(request.workflow_id, request.execution, request.payload)
        .await
    {
        Ok(()) => (StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": true }))).into_response(),
        Err(crate::error::WorkerError::Saturated(limit)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: format!("worker saturated ({limit} concurrent executions)"),
            }),
        )
            .into_response(),
        Err(crate::error::WorkerError::ShuttingDown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "worker is shutting down".to_string(),
            }),
        )
            .into_response(),
        Err(crate::error::WorkerError::UnknownWorkflow(id)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown workflow id '{id}'"),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}

async fn cancel(
    State(runner): State<Arc<Runner>>,
    Path(execution_id): Path<Uuid>,
) -> impl IntoResponse {
    if runner.cancel(execution_id).await {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
