//! Kanban board endpoints for development projects.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::auth::{AuthUser, ClientInfo};
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Path};
use super::routes::AppState;
use crate::db::{NewActivity, NewTask, TaskUpdate};
use crate::models::{Project, ProjectType, Task, TaskComment, TaskPriority, TaskStatus};
use crate::notifications::NotificationKind;
use crate::rbac::{ResourceAction, TaskAction};

/// Routes nested under `/api/projects`.
pub fn project_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/board", get(get_board))
        .route("/:id/tasks", post(create_task))
}

/// Routes nested under `/api/tasks`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_task).put(update_task).delete(delete_task))
        .route("/:id/move", post(move_task))
        .route("/:id/comments", get(list_comments).post(add_comment))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub labels: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: TaskPriority,
    #[serde(default)]
    pub labels: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MoveTaskRequest {
    pub status: TaskStatus,
    pub position: i64,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

/// A project's tasks split into columns, each ordered by position.
#[derive(Debug, Default, Serialize)]
pub struct Board {
    pub todo: Vec<Task>,
    pub in_progress: Vec<Task>,
    pub done: Vec<Task>,
}

impl Board {
    fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut board = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Todo => board.todo.push(task),
                TaskStatus::InProgress => board.in_progress.push(task),
                TaskStatus::Done => board.done.push(task),
            }
        }
        board
    }
}

#[derive(Debug, Serialize)]
pub struct BoardResponse {
    pub project: Project,
    pub columns: Board,
}

fn require_title(title: &str) -> ApiResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("Task title is required"));
    }
    Ok(title.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_development(project: &Project) -> ApiResult<()> {
    if project.project_type == ProjectType::Development {
        Ok(())
    } else {
        Err(ApiError::validation("Tasks belong to development projects only"))
    }
}

fn load_task(state: &AppState, id: i64) -> ApiResult<Task> {
    state
        .db
        .tasks()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("task {}", id)))
}

fn authorize_task(state: &AppState, caller: &AuthUser, action: TaskAction, id: i64) -> ApiResult<()> {
    state
        .evaluator()
        .authorize_resource(caller.role, ResourceAction::Task(action), Some(id), caller.id)?;
    Ok(())
}

fn check_assignment(state: &AppState, caller: &AuthUser, project_id: i64) -> ApiResult<()> {
    if state
        .evaluator()
        .can_assign_task(caller.role, project_id, caller.id)
    {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "You cannot assign tasks in this project".to_string(),
        ))
    }
}

fn notify_assignee(state: &AppState, caller: &AuthUser, task: &Task, project_name: &str) {
    match task.assigned_to {
        Some(assignee) if assignee != caller.id => state.notify(
            assignee,
            "New Task Assigned",
            format!("You have been assigned '{}' in {}", task.title, project_name),
            NotificationKind::Info,
            Some(task.project_id),
        ),
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/projects/:id/board
async fn get_board(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<BoardResponse>> {
    let project = state.project_for(&caller, ResourceAction::Task(TaskAction::View), project_id)?;
    let tasks = state.db.tasks().board(project_id)?;
    Ok(Json(BoardResponse {
        project,
        columns: Board::from_tasks(tasks),
    }))
}

/// POST /api/projects/:id/tasks - appends to the bottom of its column.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let project = state.project_for(&caller, ResourceAction::Task(TaskAction::Create), project_id)?;
    require_development(&project)?;
    let title = require_title(&req.title)?;
    if req.assigned_to.is_some() {
        check_assignment(&state, &caller, project_id)?;
    }

    let task = state.db.tasks().create(&NewTask {
        project_id,
        title,
        description: optional(req.description),
        status: req.status,
        priority: req.priority,
        labels: optional(req.labels),
        due_date: req.due_date,
        created_by: caller.id,
        assigned_to: req.assigned_to,
    })?;

    notify_assignee(&state, &caller, &task, &project.name);
    state.log_activity(
        NewActivity::new(caller.id, "create_task", format!("Created task: {}", task.title))
            .entity("task", task.id)
            .client(client.ip_address, client.user_agent),
    );

    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks/:id
async fn get_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    authorize_task(&state, &caller, TaskAction::View, id)?;
    Ok(Json(load_task(&state, id)?))
}

/// PUT /api/tasks/:id - edits everything but column and position.
async fn update_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Json<Task>> {
    authorize_task(&state, &caller, TaskAction::Edit, id)?;
    let existing = load_task(&state, id)?;
    let reassigned = req.assigned_to.is_some() && req.assigned_to != existing.assigned_to;
    if reassigned {
        check_assignment(&state, &caller, existing.project_id)?;
    }

    let task = state.db.tasks().update(
        id,
        &TaskUpdate {
            title: require_title(&req.title)?,
            description: optional(req.description),
            priority: req.priority,
            labels: optional(req.labels),
            due_date: req.due_date,
            assigned_to: req.assigned_to,
        },
    )?;

    if reassigned {
        match state.db.projects().get(task.project_id) {
            Ok(Some(project)) => notify_assignee(&state, &caller, &task, &project.name),
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping assignment notice for task {}: {}", task.id, e),
        }
    }
    state.log_activity(
        NewActivity::new(caller.id, "edit_task", format!("Modified task: {}", task.title))
            .entity("task", id)
            .client(client.ip_address, client.user_agent),
    );

    Ok(Json(task))
}

/// DELETE /api/tasks/:id
async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    authorize_task(&state, &caller, TaskAction::Delete, id)?;
    let task = state
        .db
        .tasks()
        .delete(id)?
        .ok_or_else(|| ApiError::not_found(format!("task {}", id)))?;

    state.log_activity(
        NewActivity::new(caller.id, "delete_task", format!("Deleted task: {}", task.title))
            .entity("task", id)
            .client(client.ip_address, client.user_agent),
    );

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/:id/move
///
/// Positions outside the target column are clamped to its ends.
async fn move_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<MoveTaskRequest>,
) -> ApiResult<Json<Task>> {
    authorize_task(&state, &caller, TaskAction::Edit, id)?;
    let moved = state
        .db
        .call(move |db| db.tasks().move_task(id, req.status, req.position))
        .await?;

    if moved.from.status != moved.task.status || moved.from.position != moved.task.position {
        state.log_activity(
            NewActivity::new(
                caller.id,
                "move_task",
                format!(
                    "Moved task '{}' from {} to {}",
                    moved.task.title, moved.from.status, moved.task.status
                ),
            )
            .entity("task", id)
            .client(client.ip_address, client.user_agent),
        );
    }

    Ok(Json(moved.task))
}

/// GET /api/tasks/:id/comments - oldest first.
async fn list_comments(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<TaskComment>>> {
    authorize_task(&state, &caller, TaskAction::View, id)?;
    load_task(&state, id)?;
    Ok(Json(state.db.tasks().comments(id)?))
}

/// POST /api/tasks/:id/comments
async fn add_comment(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<TaskComment>)> {
    authorize_task(&state, &caller, TaskAction::View, id)?;
    let content = req.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("Comment cannot be empty"));
    }
    let comment = state.db.tasks().add_comment(id, caller.id, content)?;

    state.log_activity(
        NewActivity::new(caller.id, "comment_task", format!("Commented on task {}", id))
            .entity("task", id)
            .client(client.ip_address, client.user_agent),
    );

    Ok((StatusCode::CREATED, Json(comment)))
}
