//! Generation task routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/api/tasks` | Submit a task for a resource |
//! | GET | `/api/tasks` | List active tasks, optionally for one resource |
//! | GET | `/api/tasks/{id}` | Task status |
//! | DELETE | `/api/tasks/{id}` | Delete a terminal task |
//! | GET | `/api/tasks/{id}/logs` | Chronological log entries |
//! | POST | `/api/tasks/{id}/cancel` | Request cooperative cancellation |

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    ListTasksQuery, SubmitTaskRequest, SubmitTaskResponse, TaskLogsResponse, TaskResponse,
};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_active_tasks).post(submit_task))
        .route("/{id}", get(get_task).delete(delete_task))
        .route("/{id}/logs", get(get_task_logs))
        .route("/{id}/cancel", post(cancel_task))
}

async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let task = state
        .tasks
        .submit(&request.resource_ref, request.task_type)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            task_id: task.task_id,
        }),
    ))
}

async fn list_active_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<TaskResponse>>> {
    let resource_ref = query.resource_ref.as_deref().filter(|r| !r.is_empty());
    Ok(Json(state.tasks.list_active(resource_ref).await?))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    Ok(Json(state.tasks.get(&id).await?))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.tasks.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_task_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskLogsResponse>> {
    let entries = state.tasks.logs(&id).await?;
    Ok(Json(TaskLogsResponse {
        task_id: id,
        entries,
    }))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    Ok(Json(state.tasks.cancel(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, header};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::database::repositories::{SqlxTaskRepository, TaskRepository};
    use crate::database::{init_pool, run_migrations};
    use crate::domain::{Task, TaskStatus};
    use crate::orchestrator::{ExecutionRegistry, TaskService};

    async fn test_app() -> (TempDir, Arc<SqlxTaskRepository>, Router) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("api.db");
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy().replace('\\', "/"));
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let repo = Arc::new(SqlxTaskRepository::new(pool));
        let service = TaskService::new(repo.clone(), Arc::new(ExecutionRegistry::new()));
        let app = Router::new()
            .nest("/api/tasks", super::router())
            .with_state(AppState::new(service));
        (dir, repo, app)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_created_then_conflict() {
        let (_dir, _repo, app) = test_app().await;
        let body = serde_json::json!({"resource_ref": "phys.p1.1", "task_type": "full_generation"});

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/tasks", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let task_id = created["task_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(json_request("POST", "/api/tasks", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error = body_json(response).await;
        assert_eq!(error["code"], "CONFLICT");
        assert_eq!(error["details"]["active_task_id"], task_id.as_str());
    }

    #[tokio::test]
    async fn submit_rejects_unknown_task_type_and_blank_resource() {
        let (_dir, _repo, app) = test_app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                serde_json::json!({"resource_ref": "bio.1", "task_type": "video_only"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                serde_json::json!({"resource_ref": "  ", "task_type": "quiz_only"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn get_unknown_task_is_not_found() {
        let (_dir, _repo, app) = test_app().await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/tasks/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");

        let response = app
            .oneshot(empty_request("GET", "/api/tasks/missing/logs"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_pending_task_and_read_logs() {
        let (_dir, repo, app) = test_app().await;
        let task = repo
            .submit("chem.3.2", crate::domain::TaskType::QuizOnly)
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/api/tasks/{}/cancel", task.task_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cancelled: Task = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.cancel_requested);
        assert!(cancelled.started_at.is_none());

        let response = app
            .oneshot(empty_request(
                "GET",
                &format!("/api/tasks/{}/logs", task.task_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let logs = body_json(response).await;
        let entries = logs["entries"].as_array().unwrap();
        assert!(entries.len() >= 2);
        assert_eq!(entries[0]["level"], "info");
    }

    #[tokio::test]
    async fn list_active_filters_by_resource() {
        let (_dir, repo, app) = test_app().await;
        repo.submit("r1", crate::domain::TaskType::SvgOnly)
            .await
            .unwrap();
        repo.submit("r2", crate::domain::TaskType::ImagesOnly)
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/tasks"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);

        let response = app
            .oneshot(empty_request("GET", "/api/tasks?resource_ref=r2"))
            .await
            .unwrap();
        let tasks = body_json(response).await;
        let tasks = tasks.as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["task_type"], "images_only");
    }

    #[tokio::test]
    async fn delete_only_terminal_tasks() {
        let (_dir, repo, app) = test_app().await;
        let task = repo
            .submit("math.9", crate::domain::TaskType::FlashcardsOnly)
            .await
            .unwrap();
        let uri = format!("/api/tasks/{}", task.task_id);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "INVALID_STATE");

        repo.request_cancel(&task.task_id).await.unwrap();
        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &uri))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(empty_request("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
