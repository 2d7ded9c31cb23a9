use super::ProcessingNode;
use super::protocol::*;
use crate::processing::types::TaskId;

use axum::{Extension, Json, extract::Path, http::StatusCode};
use std::sync::Arc;

pub async fn handle_submit_task(
    Extension(node): Extension<Arc<ProcessingNode>>,
    Json(req): Json<SubmitTaskRequest>,
) -> (StatusCode, Json<SubmitTaskResponse>) {
    match node.submit_task(req.task_id, req.subtasks).await {
        Ok(task_id) => {
            tracing::info!("Task submitted successfully: {}", task_id);
            (
                StatusCode::OK,
                Json(SubmitTaskResponse {
                    task_id: Some(task_id),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Failed to submit task: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(SubmitTaskResponse {
                    task_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_get_task_status(
    Extension(node): Extension<Arc<ProcessingNode>>,
    Path(task_id_str): Path<String>,
) -> (StatusCode, Json<Option<TaskStatusResponse>>) {
    let task_id = TaskId(task_id_str);

    match node.task_status(&task_id) {
        Some(status) => {
            tracing::debug!("Task status query: {} -> {:?}", task_id, status.finalization);
            (StatusCode::OK, Json(Some(status)))
        }
        None => {
            tracing::debug!("Task not found: {}", task_id);
            (StatusCode::NOT_FOUND, Json(None))
        }
    }
}

pub async fn handle_get_task_result(
    Extension(node): Extension<Arc<ProcessingNode>>,
    Path(task_id_str): Path<String>,
) -> (StatusCode, Json<Option<TaskResultResponse>>) {
    let task_id = TaskId(task_id_str);

    match node.task_result(&task_id) {
        Some(result) => (StatusCode::OK, Json(Some(result))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

pub async fn handle_get_cluster_nodes(
    Extension(node): Extension<Arc<ProcessingNode>>,
) -> Json<ClusterNodesResponse> {
    Json(ClusterNodesResponse {
        local: node.node_id().clone(),
        nodes: node.cluster_nodes(),
    })
}
