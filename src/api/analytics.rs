//! Security, development and portfolio metrics over the projects the caller
//! can see.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    routing::get,
    Router,
};
use chrono::{Duration, Utc};

use super::auth::AuthUser;
use super::error::ApiResult;
use super::extract::Json;
use super::routes::AppState;
use crate::db::{Database, DbResult, DevelopmentMetrics, ProjectFilter, ProjectOverview, SecurityMetrics};
use crate::models::ProjectType;
use crate::rbac::{self, AnalyticsAction, Permission};

const VELOCITY_WEEKS: i64 = 12;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/security", get(security_metrics))
        .route("/development", get(development_metrics))
        .route("/projects", get(project_overview))
}

fn scope(db: &Database, caller: &AuthUser, project_type: Option<ProjectType>) -> DbResult<Vec<i64>> {
    let filter = ProjectFilter {
        project_type,
        ..Default::default()
    };
    Ok(rbac::accessible_projects(db, caller.role, caller.id, filter)?
        .into_iter()
        .map(|p| p.id)
        .collect())
}

/// GET /api/analytics/security
async fn security_metrics(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
) -> ApiResult<Json<SecurityMetrics>> {
    state.evaluator().authorize_any(
        caller.role,
        &[
            Permission::Analytics(AnalyticsAction::ViewSecurityAnalytics),
            Permission::Analytics(AnalyticsAction::ViewAllAnalytics),
        ],
    )?;
    let metrics = state
        .db
        .call(move |db| {
            let ids = scope(&db, &caller, Some(ProjectType::Pentest))?;
            db.analytics().security_metrics(&ids)
        })
        .await?;
    Ok(Json(metrics))
}

/// GET /api/analytics/development - velocity covers the last twelve weeks.
async fn development_metrics(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
) -> ApiResult<Json<DevelopmentMetrics>> {
    state.evaluator().authorize_any(
        caller.role,
        &[
            Permission::Analytics(AnalyticsAction::ViewDevelopmentAnalytics),
            Permission::Analytics(AnalyticsAction::ViewAllAnalytics),
        ],
    )?;
    let since = (Utc::now() - Duration::weeks(VELOCITY_WEEKS)).date_naive();
    let metrics = state
        .db
        .call(move |db| {
            let ids = scope(&db, &caller, Some(ProjectType::Development))?;
            db.analytics().development_metrics(&ids, since)
        })
        .await?;
    Ok(Json(metrics))
}

/// GET /api/analytics/projects
async fn project_overview(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
) -> ApiResult<Json<ProjectOverview>> {
    state
        .evaluator()
        .authorize(caller.role, Permission::Analytics(AnalyticsAction::ViewAllAnalytics))?;
    let overview = state
        .db
        .call(move |db| {
            let ids = scope(&db, &caller, None)?;
            db.analytics().project_overview(&ids)
        })
        .await?;
    Ok(Json(overview))
}
