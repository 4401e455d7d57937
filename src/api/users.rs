//! User management endpoints.
//!
//! Admins manage accounts; only a super admin may create or promote admins,
//! edit a super admin, or delete accounts.

use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::Deserialize;

use super::auth::{validate_identity, validate_new_account, validate_password, AuthUser, ClientInfo};
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Path, Query};
use super::routes::AppState;
use super::Page;
use crate::db::{NewActivity, NewUser, UserUpdate};
use crate::models::{Role, User};
use crate::rbac::{ResourceAction, UserAction};

const USERS_PER_PAGE: u32 = 20;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/:id", get(get_user).put(update_user).delete(delete_user))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    pub search: Option<String>,
    pub role: Option<Role>,
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    /// New password; unchanged when absent.
    #[serde(default)]
    pub password: Option<String>,
}

fn require_super_admin(caller: &AuthUser, message: &str) -> ApiResult<()> {
    if caller.role == Role::SuperAdmin {
        Ok(())
    } else {
        Err(ApiError::Forbidden(message.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/users
async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Query(query): Query<ListUsersQuery>,
) -> ApiResult<Json<Page<User>>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::User(UserAction::View),
        None,
        caller.id,
    )?;

    let page = query.page.unwrap_or(1).max(1);
    let search = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let (items, total) = state
        .db
        .users()
        .list(search, query.role, page, USERS_PER_PAGE)?;
    Ok(Json(Page {
        items,
        total,
        page,
        per_page: USERS_PER_PAGE,
    }))
}

/// POST /api/users
async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::User(UserAction::Create),
        None,
        caller.id,
    )?;
    if req.role.is_privileged() {
        require_super_admin(&caller, "Only Super Admin can create Admin users")?;
    }
    validate_new_account(&req.username, &req.email, &req.password)?;

    let new_user = NewUser {
        username: req.username.trim().to_string(),
        email: req.email.trim().to_string(),
        password_hash: state.hash_password(&req.password).await?,
        role: req.role,
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
    };
    let user = state.db.call(move |db| db.users().create(&new_user)).await?;

    state.log_activity(
        NewActivity::new(
            caller.id,
            "create_user",
            format!("Created user {} with role {}", user.username, user.role),
        )
        .entity("user", user.id)
        .client(client.ip_address, client.user_agent),
    );
    tracing::info!("{} created user {} ({})", caller.username, user.username, user.role);

    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /api/users/:id
async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<User>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::User(UserAction::View),
        Some(id),
        caller.id,
    )?;
    let user = state
        .db
        .users()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("user {}", id)))?;
    Ok(Json(user))
}

/// PUT /api/users/:id
async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<User>> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::User(UserAction::Edit),
        Some(id),
        caller.id,
    )?;
    let existing = state
        .db
        .users()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("user {}", id)))?;

    if existing.role == Role::SuperAdmin {
        require_super_admin(&caller, "Only Super Admin can edit Super Admin users")?;
    }
    if req.role.is_privileged() && req.role != existing.role {
        require_super_admin(&caller, "Only Super Admin can assign Admin roles")?;
    }
    validate_identity(&req.username, &req.email)?;
    let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            validate_password(password)?;
            Some(state.hash_password(password).await?)
        }
        None => None,
    };

    let user = state.db.users().update(
        id,
        &UserUpdate {
            username: req.username.trim().to_string(),
            email: req.email.trim().to_string(),
            first_name: req.first_name.trim().to_string(),
            last_name: req.last_name.trim().to_string(),
            role: req.role,
            is_active: req.is_active,
            password_hash,
        },
    )?;

    state.log_activity(
        NewActivity::new(caller.id, "edit_user", format!("Modified user {}", user.username))
            .entity("user", user.id)
            .client(client.ip_address, client.user_agent),
    );

    Ok(Json(user))
}

/// DELETE /api/users/:id
async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthUser>,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.evaluator().authorize_resource(
        caller.role,
        ResourceAction::User(UserAction::Delete),
        Some(id),
        caller.id,
    )?;
    if id == caller.id {
        return Err(ApiError::validation("You cannot delete your own account"));
    }
    let user = state
        .db
        .users()
        .get(id)?
        .ok_or_else(|| ApiError::not_found(format!("user {}", id)))?;
    state.db.users().delete(id)?;

    state.log_activity(
        NewActivity::new(caller.id, "delete_user", format!("Deleted user {}", user.username))
            .entity("user", id)
            .client(client.ip_address, client.user_agent),
    );
    tracing::info!("{} deleted user {}", caller.username, user.username);

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::routes::testing::{TestApp, PASSWORD};
    use crate::models::Role;

    fn new_user(username: &str, role: &str) -> serde_json::Value {
        json!({
            "username": username,
            "email": format!("{}@nexus.test", username),
            "password": PASSWORD,
            "first_name": username,
            "last_name": "New",
            "role": role
        })
    }

    #[tokio::test]
    async fn test_only_super_admin_creates_admins() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (_, root) = app.user("root", Role::SuperAdmin);

        let (status, body) = app.post("/api/users", &admin, new_user("boss", "admin")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Only Super Admin can create Admin users");

        let (status, _) = app.post("/api/users", &admin, new_user("pen", "pentester")).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = app.post("/api/users", &root, new_user("boss", "admin")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["role"], "admin");
    }

    #[tokio::test]
    async fn test_non_admins_cannot_manage_users() {
        let app = TestApp::new();
        let (_, dev) = app.user("dev", Role::Developer);
        let (status, _) = app.get("/api/users", &dev).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app.post("/api/users", &dev, new_user("x", "client")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_list_search_and_paging() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        app.user("alpha", Role::Developer);
        app.user("beta", Role::Client);

        let (status, body) = app.get("/api/users?search=alp", &admin).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["username"], "alpha");

        let (_, body) = app.get("/api/users?role=client", &admin).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["per_page"], 20);
    }

    #[tokio::test]
    async fn test_edit_rules() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (root_user, root) = app.user("root", Role::SuperAdmin);
        let (dev_user, _) = app.user("dev", Role::Developer);

        let edit = |role: &str, active: bool| {
            json!({
                "username": "dev",
                "email": "dev@nexus.test",
                "first_name": "Dev",
                "last_name": "Eloper",
                "role": role,
                "is_active": active
            })
        };

        let uri = format!("/api/users/{}", dev_user.id);
        let (status, body) = app.put(&uri, &admin, edit("pentester", false)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "pentester");
        assert_eq!(body["is_active"], false);

        let (status, body) = app.put(&uri, &admin, edit("admin", true)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Only Super Admin can assign Admin roles");

        let root_uri = format!("/api/users/{}", root_user.id);
        let (status, body) = app
            .put(
                &root_uri,
                &admin,
                json!({
                    "username": "root", "email": "root@nexus.test", "first_name": "R",
                    "last_name": "T", "role": "super_admin", "is_active": true
                }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Only Super Admin can edit Super Admin users");

        let (status, _) = app.put(&uri, &root, edit("admin", true)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_password_reset_through_edit() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (dev_user, _) = app.user("dev", Role::Developer);
        let uri = format!("/api/users/{}", dev_user.id);
        let mut body = json!({
            "username": "dev", "email": "dev@nexus.test", "first_name": "Dev",
            "last_name": "Eloper", "role": "developer", "is_active": true, "password": "short"
        });

        let (status, _) = app.put(&uri, &admin, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // a rejected edit leaves the old password in place
        body["password"] = json!("a-much-longer-one");
        body["username"] = json!("admin");
        let (status, _) = app.put(&uri, &admin, body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app
            .send(
                axum::http::Method::POST,
                "/api/auth/login",
                None,
                Some(json!({"email": "dev@nexus.test", "password": PASSWORD})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        body["username"] = json!("dev");
        let (status, _) = app.put(&uri, &admin, body).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .send(
                axum::http::Method::POST,
                "/api/auth/login",
                None,
                Some(json!({"email": "dev@nexus.test", "password": "a-much-longer-one"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let app = TestApp::new();
        let (_, admin) = app.user("admin", Role::Admin);
        let (root_user, root) = app.user("root", Role::SuperAdmin);
        let (dev_user, _) = app.user("dev", Role::Developer);
        let uri = format!("/api/users/{}", dev_user.id);

        let (status, _) = app.delete(&uri, &admin).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app.delete(&format!("/api/users/{}", root_user.id), &root).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "You cannot delete your own account");

        let (status, _) = app.delete(&uri, &root).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.delete(&uri, &root).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(app.db().activity().recent(1).unwrap()[0].action, "delete_user");
    }
}
