use axum::extract::{rejection::JsonRejection, Extension, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult, AuthUser};
use crate::services::workflow_service::{GeneratedWorkflow, WorkflowGeneration};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Workflow to refine instead of starting from scratch
    pub existing: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// POST /api/ai/workflows - Synthesize a workflow from a prompt
pub async fn workflows_post(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> ApiResult<GeneratedWorkflow> {
    let Json(request) = payload?;
    let generated = state
        .workflows
        .generate(auth.user_id, &request.prompt, request.existing.as_ref())
        .await?;
    Ok(ApiResponse::created(generated))
}

/// GET /api/ai/workflows - Past generations, newest first
pub async fn workflows_get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<WorkflowGeneration>> {
    let generations = state.workflows.list(auth.user_id, query.limit.unwrap_or(20)).await?;
    Ok(ApiResponse::success(generations))
}
