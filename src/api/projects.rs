//! Project endpoints and team management.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::auth::{AuthUser, ClientInfo};
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Path, Query};
use super::routes::AppState;
use crate::db::{FindingStats, NewActivity, NewProject, ProjectFilter, ProjectUpdate, TaskStats};
use crate::models::{
    MembershipRole, Project, ProjectMembership, ProjectStatus, ProjectType, User,
};
use crate::notifications::NotificationKind;
use crate::rbac::{self, ProjectAction, ResourceAction};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route(
            "/:id",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route(
            "/:id/members",
            get(list_members).put(set_members).post(add_member),
        )
        .route("/:id/members/:user_id", delete(remove_member))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListProjectsQuery {
    #[serde(rename = "type")]
    pub project_type: Option<ProjectType>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub project_type: ProjectType,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    pub status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
pub struct SetMembersRequest {
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
    #[serde(default = "default_membership_role")]
    pub role_in_project: MembershipRole,
}

fn default_membership_role() -> MembershipRole {
    MembershipRole::Member
}

/// A user together with their membership in one project.
#[derive(Debug, Serialize)]
pub struct TeamMember {
    #[serde(flatten)]
    pub user: User,
    pub role_in_project: MembershipRole,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub team: Vec<TeamMember>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<FindingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskStats>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Project name is required"));
    }
    Ok(name.to_string())
}

fn load_project(state: &AppState, id: i64) -> ApiResult<Project> {
    state
        .db
        .projects()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("project {}", id)))
}

fn load_team(state: &AppState, project_id: i64) -> ApiResult<Vec<TeamMember>> {
    let projects = state.db.projects();
    let mut users: HashMap<i64, User> = projects
        .team(project_id)?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();
    Ok(projects
        .memberships(project_id)?
        .into_iter()
        .filter_map(|m| {
            users.remove(&m.user_id).map(|user| TeamMember {
                user,
                role_in_project: m.role_in_project,
                assigned_at: m.assigned_at,
            })
        })
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/projects - projects the caller can see.
async fn list_projects(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<ListProjectsQuery>,
) -> ApiResult<Json<Vec<Project>>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::View),
        None,
        caller.id,
    )?;
    let projects = rbac::accessible_projects(
        &state.db,
        caller.role,
        caller.id,
        ProjectFilter {
            project_type: query.project_type,
            status: query.status,
            member_id: None,
        },
    )?;
    Ok(Json(projects))
}

/// POST /api/projects
///
/// Pentesters and developers become lead of the project they open.
async fn create_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    if !state
        .evaluator()
        .can_create_project(caller.role, req.project_type)
    {
        return Err(ApiError::Forbidden(format!(
            "You don't have permission to create {} projects",
            req.project_type
        )));
    }
    let name = require_name(&req.name)?;
    let lead = (!caller.role.is_privileged()).then_some(caller.id);

    let project = state.db.projects().create(
        &NewProject {
            name,
            description: clean(req.description),
            client_name: clean(req.client_name),
            project_type: req.project_type,
            created_by: caller.id,
        },
        lead,
    )?;

    state.log_activity(
        NewActivity::new(
            caller.id,
            "create_project",
            format!("Created {} project: {}", project.project_type, project.name),
        )
        .entity("project", project.id)
        .client(client.ip_address, client.user_agent),
    );
    tracing::info!("{} created {} project {}", caller.username, project.project_type, project.name);

    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects/:id
async fn get_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectDetail>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::View),
        Some(id),
        caller.id,
    )?;
    let project = load_project(&state, id)?;
    let team = load_team(&state, id)?;
    let (findings, tasks) = match project.project_type {
        ProjectType::Pentest => (Some(state.db.findings().stats(id)?), None),
        ProjectType::Development => (None, Some(state.db.tasks().stats(id)?)),
    };
    Ok(Json(ProjectDetail {
        project,
        team,
        findings,
        tasks,
    }))
}

/// PUT /api/projects/:id
async fn update_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Project>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::Edit),
        Some(id),
        caller.id,
    )?;
    let project = state.db.projects().update(
        id,
        &ProjectUpdate {
            name: require_name(&req.name)?,
            description: clean(req.description),
            client_name: clean(req.client_name),
            status: req.status,
        },
    )?;

    state.log_activity(
        NewActivity::new(caller.id, "edit_project", format!("Modified project {}", project.name))
            .entity("project", id)
            .client(client.ip_address, client.user_agent),
    );

    Ok(Json(project))
}

/// DELETE /api/projects/:id - removes findings, tasks and memberships too.
async fn delete_project(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::Delete),
        Some(id),
        caller.id,
    )?;
    let project = load_project(&state, id)?;
    state.db.projects().delete(id)?;

    state.log_activity(
        NewActivity::new(caller.id, "delete_project", format!("Deleted project {}", project.name))
            .entity("project", id)
            .client(client.ip_address, client.user_agent),
    );
    tracing::info!("{} deleted project {}", caller.username, project.name);

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/:id/members
async fn list_members(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<TeamMember>>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::View),
        Some(id),
        caller.id,
    )?;
    load_project(&state, id)?;
    Ok(Json(load_team(&state, id)?))
}

/// PUT /api/projects/:id/members - replace the whole team.
async fn set_members(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<SetMembersRequest>,
) -> ApiResult<Json<Vec<TeamMember>>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::AssignUsers),
        Some(id),
        caller.id,
    )?;
    let project = load_project(&state, id)?;
    let before: HashSet<i64> = state
        .db
        .projects()
        .memberships(id)?
        .into_iter()
        .map(|m| m.user_id)
        .collect();

    let memberships = state.db.projects().set_members(id, &req.user_ids)?;

    for membership in memberships.iter().filter(|m| !before.contains(&m.user_id)) {
        state.notify(
            membership.user_id,
            "Project Assignment",
            format!("You have been assigned to project: {}", project.name),
            NotificationKind::Info,
            Some(id),
        );
    }
    state.log_activity(
        NewActivity::new(
            caller.id,
            "assign_project",
            format!("Assigned {} users to project {}", memberships.len(), project.name),
        )
        .entity("project", id)
        .client(client.ip_address, client.user_agent),
    );

    Ok(Json(load_team(&state, id)?))
}

/// POST /api/projects/:id/members - enroll one user.
async fn add_member(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<ProjectMembership>)> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::AssignUsers),
        Some(id),
        caller.id,
    )?;
    let project = load_project(&state, id)?;
    let membership = state
        .db
        .projects()
        .add_member(id, req.user_id, req.role_in_project)?;

    state.notify(
        req.user_id,
        "Project Assignment",
        format!("You have been assigned to project: {}", project.name),
        NotificationKind::Info,
        Some(id),
    );
    state.log_activity(
        NewActivity::new(
            caller.id,
            "assign_project",
            format!(
                "Added user {} to project {} as {}",
                req.user_id, project.name, membership.role_in_project
            ),
        )
        .entity("project", id)
        .client(client.ip_address, client.user_agent),
    );

    Ok((StatusCode::CREATED, Json(membership)))
}

/// DELETE /api/projects/:id/members/:user_id
async fn remove_member(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path((id, user_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Project(ProjectAction::AssignUsers),
        Some(id),
        caller.id,
    )?;
    if !state.db.projects().remove_member(id, user_id)? {
        return Err(ApiError::not_found(format!(
            "membership of user {} in project {}",
            user_id, id
        )));
    }

    state.log_activity(
        NewActivity::new(
            caller.id,
            "unassign_project",
            format!("Removed user {} from project {}", user_id, id),
        )
        .entity("project", id)
        .client(client.ip_address, client.user_agent),
    );

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::routes::testing::TestApp;
    use crate::models::Role;

    fn project(name: &str, project_type: &str) -> serde_json::Value {
        json!({
            "name": name,
            "description": "Quarterly engagement",
            "client_name": "Acme",
            "project_type": project_type
        })
    }

    #[tokio::test]
    async fn test_creation_rules_by_role() {
        let app = TestApp::new();
        let (pen, pen_token) = app.user("pen", Role::Pentester);
        let (_, client_token) = app.user("cli", Role::Client);
        let (_, admin_token) = app.user("admin", Role::Admin);

        let (status, body) = app
            .post("/api/projects", &pen_token, project("Portal", "development"))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "You don't have permission to create development projects");

        let (status, _) = app
            .post("/api/projects", &client_token, project("Audit", "pentest"))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) = app
            .post("/api/projects", &pen_token, project("Audit", "pentest"))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "active");
        let id = created["id"].as_i64().unwrap();
        let members = app.db().projects().memberships(id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, pen.id);
        assert_eq!(members[0].role_in_project.as_str(), "lead");

        let (status, created) = app
            .post("/api/projects", &admin_token, project("Portal", "development"))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_i64().unwrap();
        assert!(app.db().projects().memberships(id).unwrap().is_empty());

        let (status, body) = app
            .post("/api/projects", &admin_token, project("  ", "pentest"))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Project name is required");
    }

    #[tokio::test]
    async fn test_listing_and_detail_are_scoped() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (_, dev) = app.user("dev", Role::Developer);
        let (_, other) = app.user("other", Role::Developer);

        let (_, mine) = app.post("/api/projects", &dev, project("Portal", "development")).await;
        app.post("/api/projects", &admin, project("Audit", "pentest")).await;
        let uri = format!("/api/projects/{}", mine["id"]);

        let (_, listed) = app.get("/api/projects", &dev).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        let (_, listed) = app.get("/api/projects", &admin).await;
        assert_eq!(listed.as_array().unwrap().len(), 2);
        let (_, listed) = app.get("/api/projects?type=pentest", &admin).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["name"], "Audit");

        let (status, detail) = app.get(&uri, &dev).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["team"][0]["username"], "dev");
        assert_eq!(detail["team"][0]["role_in_project"], "lead");
        assert_eq!(detail["tasks"]["todo"], 0);
        assert!(detail.get("findings").is_none());

        let (status, _) = app.get(&uri, &other).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app.get("/api/projects/999", &admin).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_edit_and_delete_rights() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (_, root) = app.user("root", Role::SuperAdmin);
        let (_, dev) = app.user("dev", Role::Developer);
        let (_, created) = app.post("/api/projects", &dev, project("Portal", "development")).await;
        let uri = format!("/api/projects/{}", created["id"]);
        let edit = json!({"name": "Portal v2", "status": "completed"});

        let (status, _) = app.put(&uri, &dev, edit.clone()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = app.put(&uri, &admin, edit).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Portal v2");
        assert_eq!(body["status"], "completed");
        assert!(body["client_name"].is_null());

        let (status, _) = app.delete(&uri, &admin).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app.delete(&uri, &root).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.get(&uri, &root).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_team_assignment_notifies_new_members() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (dev, dev_token) = app.user("dev", Role::Developer);
        let (qa, _) = app.user("qa", Role::Developer);
        let (_, created) = app.post("/api/projects", &admin, project("Portal", "development")).await;
        let id = created["id"].as_i64().unwrap();
        let uri = format!("/api/projects/{}/members", id);

        let (status, _) = app.put(&uri, &dev_token, json!({"user_ids": [dev.id]})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, team) = app
            .put(&uri, &admin, json!({"user_ids": [dev.id, qa.id, dev.id]}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(team.as_array().unwrap().len(), 2);

        let inbox = app.notifications(dev.id).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].title, "Project Assignment");
        assert_eq!(inbox[0].project_id, Some(id));

        // Members kept across a reassignment are not notified again.
        app.put(&uri, &admin, json!({"user_ids": [dev.id]})).await;
        assert_eq!(app.notifications(dev.id).await.len(), 1);

        let (status, team) = app.get(&uri, &dev_token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(team.as_array().unwrap().len(), 1);

        let (status, body) = app.put(&uri, &admin, json!({"user_ids": [9999]})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "user 9999 not found");
    }

    #[tokio::test]
    async fn test_add_and_remove_single_member() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (client, client_token) = app.user("cli", Role::Client);
        let (_, created) = app.post("/api/projects", &admin, project("Audit", "pentest")).await;
        let uri = format!("/api/projects/{}/members", created["id"]);

        let body = json!({"user_id": client.id, "role_in_project": "viewer"});
        let (status, membership) = app.post(&uri, &admin, body.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(membership["role_in_project"], "viewer");
        let (status, _) = app.post(&uri, &admin, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app.get(&format!("/api/projects/{}", created["id"]), &client_token).await;
        assert_eq!(status, StatusCode::OK);

        let member_uri = format!("{}/{}", uri, client.id);
        let (status, _) = app.delete(&member_uri, &admin).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.delete(&member_uri, &admin).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
