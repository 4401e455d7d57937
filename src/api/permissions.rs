//! Permission introspection for the caller, used by clients to show or hide
//! controls.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Query};
use super::routes::AppState;
use crate::models::Role;
use crate::rbac::{Module, Permission, ResourceAction};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(my_permissions))
        .route("/check", get(check_permission))
}

#[derive(Debug, Serialize)]
pub struct PermissionsResponse {
    pub role: Role,
    pub modules: BTreeMap<Module, Vec<&'static str>>,
    /// Resource actions the role may perform, as `resource.action`.
    pub resource_actions: Vec<String>,
}

/// Either `module` or `resource_type`, plus `action`. `resource_id` only
/// applies to resource checks.
#[derive(Debug, Default, Deserialize)]
pub struct CheckQuery {
    pub module: Option<String>,
    pub resource_type: Option<String>,
    pub action: String,
    pub resource_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub permission: String,
    pub granted: bool,
}

/// GET /api/permissions
async fn my_permissions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
) -> Json<PermissionsResponse> {
    let resource_actions = ResourceAction::all()
        .into_iter()
        .filter(|action| state.permissions.role_may(caller.role, *action))
        .map(|action| action.to_string())
        .collect();
    Json(PermissionsResponse {
        role: caller.role,
        modules: state.permissions.grants_for(caller.role),
        resource_actions,
    })
}

/// GET /api/permissions/check
async fn check_permission(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<CheckResponse>> {
    let evaluator = state.evaluator();
    let response = match (query.module.as_deref(), query.resource_type.as_deref()) {
        (Some(module), None) => {
            let permission = Permission::parse(module, &query.action)?;
            CheckResponse {
                permission: permission.to_string(),
                granted: evaluator.has_permission(caller.role, permission),
            }
        }
        (None, Some(resource_type)) => {
            let action = ResourceAction::parse(resource_type, &query.action)?;
            CheckResponse {
                permission: action.to_string(),
                granted: evaluator.has_resource_permission(
                    caller.role,
                    action,
                    query.resource_id,
                    Some(caller.id),
                ),
            }
        }
        _ => {
            return Err(ApiError::validation(
                "Specify exactly one of module or resource_type",
            ))
        }
    };
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::routes::testing::TestApp;
    use crate::config::test_config;
    use crate::db::projects::sample_project;
    use crate::models::{ProjectType, Role};

    #[tokio::test]
    async fn test_lists_own_grants() {
        let app = TestApp::new();
        let (_, pen) = app.user("pen", Role::Pentester);
        let (_, root) = app.user("root", Role::SuperAdmin);

        let (status, body) = app.get("/api/permissions", &pen).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "pentester");
        assert_eq!(
            body["modules"]["analytics"],
            json!(["view_security_analytics"])
        );
        assert!(body["modules"].get("admin").is_none());
        let actions = body["resource_actions"].as_array().unwrap();
        assert!(actions.contains(&json!("finding.delete")));
        assert!(!actions.contains(&json!("task.view")));

        let (_, body) = app.get("/api/permissions", &root).await;
        assert_eq!(body["modules"]["reports"], json!(["*"]));
        assert_eq!(body["resource_actions"].as_array().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_check_module_and_resource() {
        let app = TestApp::new();
        let (dev_user, dev) = app.user("dev", Role::Developer);
        let projects = app.db().projects();
        let mine = projects
            .create(&sample_project("Portal", ProjectType::Development, dev_user.id), Some(dev_user.id))
            .unwrap();
        let other = projects
            .create(&sample_project("Other", ProjectType::Development, dev_user.id), None)
            .unwrap();

        let (_, body) = app
            .get("/api/permissions/check?module=flow&action=update_task_status", &dev)
            .await;
        assert_eq!(body, json!({"permission": "flow.update_task_status", "granted": true}));

        let (_, body) = app
            .get("/api/permissions/check?module=admin&action=view_users", &dev)
            .await;
        assert_eq!(body["granted"], false);

        let uri = |id: i64| {
            format!(
                "/api/permissions/check?resource_type=project&action=view&resource_id={}",
                id
            )
        };
        let (_, body) = app.get(&uri(mine.id), &dev).await;
        assert_eq!(body["granted"], true);
        let (_, body) = app.get(&uri(other.id), &dev).await;
        assert_eq!(body["granted"], false);
    }

    #[tokio::test]
    async fn test_check_rejects_bad_input() {
        let app = TestApp::new();
        let (_, dev) = app.user("dev", Role::Developer);

        let (status, _) = app
            .get("/api/permissions/check?module=secure&action=create_task", &dev)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app
            .get("/api/permissions/check?module=flow&resource_type=task&action=view", &dev)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app.get("/api/permissions/check?action=view", &dev).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_audited_checks_are_logged() {
        let mut config = test_config();
        config.audit_permission_checks = true;
        let app = TestApp::with_config(config);
        let (_, dev) = app.user("dev", Role::Developer);

        app.get(
            "/api/permissions/check?resource_type=task&action=edit&resource_id=77",
            &dev,
        )
        .await;
        let entry = &app.db().activity().recent(1).unwrap()[0];
        assert_eq!(entry.action, "permission_check_edit_task");
        let details: serde_json::Value =
            serde_json::from_str(entry.description.as_deref().unwrap()).unwrap();
        assert_eq!(details["resource_id"], 77);
        assert_eq!(details["granted"], false);
    }
}
