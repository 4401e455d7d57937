//! Security findings on pentest projects.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::Deserialize;

use super::auth::{AuthUser, ClientInfo};
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Path, Query};
use super::routes::AppState;
use crate::db::{FindingFilter, FindingSort, FindingUpdate, NewActivity, NewFinding};
use crate::models::{Finding, FindingStatus, Project, ProjectType, Severity};
use crate::notifications::NotificationKind;
use crate::rbac::{FindingAction, ResourceAction};

/// Routes nested under `/api/projects`.
pub fn project_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/findings", get(list_findings).post(create_finding))
}

/// Routes nested under `/api/findings`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/:id",
        get(get_finding).put(update_finding).delete(delete_finding),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListFindingsQuery {
    pub severity: Option<Severity>,
    pub status: Option<FindingStatus>,
    #[serde(default)]
    pub sort: FindingSort,
}

#[derive(Debug, Deserialize)]
pub struct CreateFindingRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub remediation: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub cvss_score: Option<f64>,
    #[serde(default)]
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub affected_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFindingRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub remediation: Option<String>,
    pub severity: Severity,
    pub status: FindingStatus,
    #[serde(default)]
    pub cvss_score: Option<f64>,
    #[serde(default)]
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub affected_url: Option<String>,
}

/// Trimmed title and description, both required.
fn validate_text(title: &str, description: &str) -> ApiResult<(String, String)> {
    let title = title.trim();
    let description = description.trim();
    if title.is_empty() {
        return Err(ApiError::validation("Finding title is required"));
    }
    if description.is_empty() {
        return Err(ApiError::validation("Finding description is required"));
    }
    Ok((title.to_string(), description.to_string()))
}

fn validate_cvss(score: Option<f64>) -> ApiResult<Option<f64>> {
    match score {
        Some(s) if !(0.0..=10.0).contains(&s) => {
            Err(ApiError::validation("CVSS score must be between 0.0 and 10.0"))
        }
        other => Ok(other),
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_pentest(project: &Project) -> ApiResult<()> {
    if project.project_type == ProjectType::Pentest {
        Ok(())
    } else {
        Err(ApiError::validation("Findings belong to pentest projects only"))
    }
}

fn load_finding(state: &AppState, id: i64) -> ApiResult<Finding> {
    state
        .db
        .findings()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("finding {}", id)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/projects/:id/findings
async fn list_findings(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(project_id): Path<i64>,
    Query(query): Query<ListFindingsQuery>,
) -> ApiResult<Json<Vec<Finding>>> {
    state.project_for(&caller, ResourceAction::Finding(FindingAction::View), project_id)?;
    let findings = state.db.findings().list(
        project_id,
        FindingFilter {
            severity: query.severity,
            status: query.status,
        },
        query.sort,
    )?;
    Ok(Json(findings))
}

/// Tell the rest of the team about a new finding. The finding is already
/// stored, so a failed member lookup is only logged.
fn notify_team(state: &AppState, caller: &AuthUser, finding: &Finding, project_name: &str) {
    let members = match state.db.projects().memberships(finding.project_id) {
        Ok(members) => members,
        Err(e) => {
            tracing::warn!(
                "Skipping notifications for finding {}: member lookup failed: {}",
                finding.id,
                e
            );
            return;
        }
    };
    let kind = match finding.severity {
        Severity::Critical | Severity::High => NotificationKind::Warning,
        _ => NotificationKind::Info,
    };
    for member in members.iter().filter(|m| m.user_id != caller.id) {
        state.notify(
            member.user_id,
            format!("New {} Finding", finding.severity),
            format!("{} reported '{}' in {}", caller.username, finding.title, project_name),
            kind,
            Some(finding.project_id),
        );
    }
}

/// POST /api/projects/:id/findings
///
/// The rest of the project team is notified.
async fn create_finding(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateFindingRequest>,
) -> ApiResult<(StatusCode, Json<Finding>)> {
    let project = state.project_for(
        &caller,
        ResourceAction::Finding(FindingAction::Create),
        project_id,
    )?;
    require_pentest(&project)?;
    let (title, description) = validate_text(&req.title, &req.description)?;

    let finding = state.db.findings().create(&NewFinding {
        project_id,
        title,
        description,
        remediation: optional(req.remediation),
        severity: req.severity,
        cvss_score: validate_cvss(req.cvss_score)?,
        cwe_id: optional(req.cwe_id),
        affected_url: optional(req.affected_url),
        created_by: caller.id,
    })?;

    notify_team(&state, &caller, &finding, &project.name);
    state.log_activity(
        NewActivity::new(
            caller.id,
            "create_finding",
            format!("Created {} finding: {}", finding.severity, finding.title),
        )
        .entity("finding", finding.id)
        .client(client.ip_address, client.user_agent),
    );

    Ok((StatusCode::CREATED, Json(finding)))
}

/// GET /api/findings/:id
async fn get_finding(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Finding>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Finding(FindingAction::View),
        Some(id),
        caller.id,
    )?;
    Ok(Json(load_finding(&state, id)?))
}

/// PUT /api/findings/:id - full replacement. Any status may follow any other.
async fn update_finding(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFindingRequest>,
) -> ApiResult<Json<Finding>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Finding(FindingAction::Edit),
        Some(id),
        caller.id,
    )?;
    let (title, description) = validate_text(&req.title, &req.description)?;
    let finding = state.db.findings().update(
        id,
        &FindingUpdate {
            title,
            description,
            remediation: optional(req.remediation),
            severity: req.severity,
            status: req.status,
            cvss_score: validate_cvss(req.cvss_score)?,
            cwe_id: optional(req.cwe_id),
            affected_url: optional(req.affected_url),
        },
    )?;

    state.log_activity(
        NewActivity::new(
            caller.id,
            "edit_finding",
            format!("Modified finding {} ({})", finding.title, finding.status),
        )
        .entity("finding", id)
        .client(client.ip_address, client.user_agent),
    );

    Ok(Json(finding))
}

/// DELETE /api/findings/:id
async fn delete_finding(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::Finding(FindingAction::Delete),
        Some(id),
        caller.id,
    )?;
    let finding = state
        .db
        .findings()
        .delete(id)?
        .ok_or_else(|| ApiError::not_found(format!("finding {}", id)))?;

    state.log_activity(
        NewActivity::new(caller.id, "delete_finding", format!("Deleted finding {}", finding.title))
            .entity("finding", id)
            .client(client.ip_address, client.user_agent),
    );

    Ok(StatusCode::NO_CONTENT)
}
