//! Activity log browsing for administrators.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    routing::get,
    Router,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Query};
use super::routes::AppState;
use super::Page;
use crate::db::{ActivityFilter, ActivityStats};
use crate::models::ActivityLog;
use crate::rbac::{AdminAction, Permission};

const ACTIVITY_PER_PAGE: u32 = 50;
const STATS_WINDOW_DAYS: i64 = 30;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_activity))
        .route("/stats", get(activity_stats))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub action: Option<String>,
    pub user: Option<String>,
    /// `YYYY-MM-DD`
    pub date: Option<String>,
    pub page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ActivityPage {
    #[serde(flatten)]
    pub page: Page<ActivityLog>,
    /// Every action name seen so far, for filter menus.
    pub actions: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_date(value: Option<String>) -> ApiResult<Option<NaiveDate>> {
    match non_empty(value) {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::validation(format!("Invalid date '{}', expected YYYY-MM-DD", raw))),
        None => Ok(None),
    }
}

fn require_admin_view(state: &AppState, caller: &AuthUser) -> ApiResult<()> {
    state
        .evaluator()
        .authorize(caller.role, Permission::Admin(AdminAction::ViewUsers))?;
    Ok(())
}

/// GET /api/activity
async fn list_activity(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<ActivityPage>> {
    require_admin_view(&state, &caller)?;

    let filter = ActivityFilter {
        action: non_empty(query.action),
        user: non_empty(query.user),
        date: parse_date(query.date)?,
    };
    let page = query.page.unwrap_or(1).max(1);
    let activity = state.db.activity();
    let (items, total) = activity.list(&filter, page, ACTIVITY_PER_PAGE)?;

    Ok(Json(ActivityPage {
        page: Page {
            items,
            total,
            page,
            per_page: ACTIVITY_PER_PAGE,
        },
        actions: activity.distinct_actions()?,
    }))
}

/// GET /api/activity/stats - the last thirty days.
async fn activity_stats(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
) -> ApiResult<Json<ActivityStats>> {
    require_admin_view(&state, &caller)?;
    let since = Utc::now() - Duration::days(STATS_WINDOW_DAYS);
    Ok(Json(state.db.activity().stats(since)?))
}
