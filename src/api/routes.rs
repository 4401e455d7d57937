//! HTTP server setup and the handlers that do not belong to a resource.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{Extension, State},
    routing::{get, post},
    Router,
};
use rand::RngCore;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::{Database, DbResult, FindingStats, NewActivity, ProjectFilter, TaskStats};
use crate::models::{ActivityLog, FindingStatus, Project, ProjectStatus, ProjectType, Role, Severity, TaskStatus};
use crate::notifications::{NotificationHub, NotificationKind, SharedNotificationHub};
use crate::rbac::{self, PermissionEvaluator, PermissionTable, ResourceAction};

use super::activity as activity_api;
use super::analytics as analytics_api;
use super::auth::{self, AuthUser};
use super::error::{ApiError, ApiResult};
use super::extract::Json;
use super::findings as findings_api;
use super::notifications as notifications_api;
use super::permissions as permissions_api;
use super::projects as projects_api;
use super::tasks as tasks_api;
use super::users as users_api;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    /// Role tables, built once
    pub permissions: Arc<PermissionTable>,
    /// Per-user notification history and live feed
    pub notifications: SharedNotificationHub,
    /// PBKDF2 rounds for newly hashed passwords
    pub password_rounds: u32,
    /// Verified against on logins for unknown emails
    login_decoy_hash: String,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Self {
        Self::with_password_rounds(config, db, auth::PBKDF2_ROUNDS)
    }

    pub fn with_password_rounds(config: Config, db: Database, password_rounds: u32) -> Self {
        let mut decoy = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut decoy);
        Self {
            config,
            db,
            permissions: Arc::new(PermissionTable::standard()),
            notifications: Arc::new(NotificationHub::new()),
            password_rounds,
            login_decoy_hash: auth::hash_password_with(&hex::encode(decoy), password_rounds),
        }
    }

    /// A well-formed hash at [`Self::password_rounds`] that no password
    /// matches in practice.
    pub fn login_decoy_hash(&self) -> &str {
        &self.login_decoy_hash
    }

    /// Evaluator for one request. Audits decisions when enabled in config.
    pub fn evaluator(&self) -> PermissionEvaluator<'_> {
        let evaluator = PermissionEvaluator::new(&self.permissions, &self.db);
        if self.config.audit_permission_checks {
            evaluator.with_audit(&self.db)
        } else {
            evaluator
        }
    }

    pub async fn hash_password(&self, password: &str) -> ApiResult<String> {
        auth::hash_password_blocking(password.to_string(), self.password_rounds).await
    }

    /// Append to the activity log. A failed write is logged, not returned.
    pub fn log_activity(&self, entry: NewActivity) {
        if let Err(e) = self.db.activity().record(&entry) {
            tracing::warn!("Failed to record activity '{}': {}", entry.action, e);
        }
    }

    /// Authorize `action` inside `project_id` and load the project. Non-admins
    /// must be members.
    pub fn project_for(
        &self,
        caller: &AuthUser,
        action: ResourceAction,
        project_id: i64,
    ) -> ApiResult<Project> {
        let evaluator = self.evaluator();
        evaluator.authorize_resource(caller.role, action, None, caller.id)?;
        if !evaluator.can_access_project(caller.role, project_id, caller.id) {
            return Err(ApiError::Forbidden(format!(
                "not allowed to {} in project #{}",
                action, project_id
            )));
        }
        self.db
            .projects()
            .get(project_id)?
            .ok_or_else(|| ApiError::not_found(format!("project {}", project_id)))
    }

    /// Queue a notification without waiting for it.
    pub fn notify(
        &self,
        user_id: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        project_id: Option<i64>,
    ) {
        self.notifications
            .dispatch(user_id, title, message, kind, project_id);
    }
}

/// Build the full router.
pub fn app(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/register", post(auth::register));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/dashboard", get(dashboard))
        .nest("/api/users", users_api::routes())
        .nest(
            "/api/projects",
            projects_api::routes()
                .merge(findings_api::project_routes())
                .merge(tasks_api::project_routes()),
        )
        .nest("/api/findings", findings_api::routes())
        .nest("/api/tasks", tasks_api::routes())
        .nest("/api/activity", activity_api::routes())
        .nest("/api/analytics", analytics_api::routes())
        .nest("/api/permissions", permissions_api::routes())
        .nest("/api/notifications", notifications_api::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config, db: Database) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, db));
    let app = app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dev_mode: bool,
    pub auth_required: bool,
    pub schema_version: Option<i32>,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: state.config.auth.auth_required(state.config.dev_mode),
        schema_version: state.db.schema_version().ok(),
    })
}

#[derive(Debug, Serialize)]
pub struct ProjectSummary {
    #[serde(flatten)]
    pub project: Project,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<FindingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskStats>,
}

#[derive(Debug, Default, Serialize)]
pub struct DashboardTotals {
    pub total_projects: usize,
    pub active_projects: usize,
    pub total_findings: i64,
    pub critical_findings: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
}

#[derive(Debug, Serialize)]
pub struct PlatformOverview {
    pub total_users: i64,
    pub total_projects: i64,
    pub active_pentest_projects: i64,
    pub active_dev_projects: i64,
    pub total_findings: i64,
    pub critical_findings: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub user_roles: Vec<(Role, i64)>,
    pub recent_activities: Vec<ActivityLog>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub role: Role,
    pub projects: Vec<ProjectSummary>,
    pub totals: DashboardTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformOverview>,
}

/// GET /api/dashboard - the caller's projects with their stats. Admins also
/// get platform-wide counts.
async fn dashboard(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<DashboardResponse>> {
    let dashboard = state
        .db
        .call(move |db| build_dashboard(&db, &user))
        .await?;
    Ok(Json(dashboard))
}

fn build_dashboard(db: &Database, user: &AuthUser) -> DbResult<DashboardResponse> {
    let projects = rbac::accessible_projects(db, user.role, user.id, ProjectFilter::default())?;

    let mut totals = DashboardTotals {
        total_projects: projects.len(),
        active_projects: projects
            .iter()
            .filter(|p| p.status == ProjectStatus::Active)
            .count(),
        ..Default::default()
    };

    let mut summaries = Vec::with_capacity(projects.len());
    for project in projects {
        let (findings, tasks) = match project.project_type {
            ProjectType::Pentest => {
                let stats = db.findings().stats(project.id)?;
                totals.total_findings += stats.critical + stats.high + stats.medium + stats.low + stats.informational;
                totals.critical_findings += stats.critical_open;
                (Some(stats), None)
            }
            ProjectType::Development => {
                let stats = db.tasks().stats(project.id)?;
                totals.total_tasks += stats.total();
                totals.completed_tasks += stats.done;
                (None, Some(stats))
            }
        };
        summaries.push(ProjectSummary {
            project,
            findings,
            tasks,
        });
    }

    let platform = if user.role.is_privileged() {
        let projects = db.projects();
        let findings = db.findings();
        let tasks = db.tasks();
        Some(PlatformOverview {
            total_users: db.users().count()?,
            total_projects: projects.count(None, None)?,
            active_pentest_projects: projects.count(Some(ProjectType::Pentest), Some(ProjectStatus::Active))?,
            active_dev_projects: projects.count(Some(ProjectType::Development), Some(ProjectStatus::Active))?,
            total_findings: findings.count(None, None)?,
            critical_findings: findings.count(Some(Severity::Critical), Some(FindingStatus::Open))?,
            total_tasks: tasks.count(None)?,
            completed_tasks: tasks.count(Some(TaskStatus::Done))?,
            user_roles: db.users().count_by_role()?,
            recent_activities: db.activity().recent(10)?,
        })
    } else {
        None
    };

    Ok(DashboardResponse {
        role: user.role,
        projects: summaries,
        totals,
        platform,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::test_config;
    use crate::db::NewUser;
    use crate::models::User;
    use crate::notifications::Notification;

    pub(crate) const PASSWORD: &str = "password123";

    pub(crate) struct TestApp {
        pub state: Arc<AppState>,
        pub router: Router,
    }

    impl TestApp {
        pub fn new() -> Self {
            Self::with_config(test_config())
        }

        pub fn with_config(config: Config) -> Self {
            Self::with_rounds(config, 1_000)
        }

        pub fn with_rounds(config: Config, password_rounds: u32) -> Self {
            let db = Database::open_in_memory().unwrap();
            let state = Arc::new(AppState::with_password_rounds(config, db, password_rounds));
            let router = app(Arc::clone(&state));
            Self { state, router }
        }

        pub fn db(&self) -> &Database {
            &self.state.db
        }

        /// Create a user with [`PASSWORD`] and return it with a valid token.
        pub fn user(&self, username: &str, role: Role) -> (User, String) {
            let user = self
                .state
                .db
                .users()
                .create(&NewUser {
                    username: username.to_string(),
                    email: format!("{}@nexus.test", username),
                    password_hash: auth::hash_password_with(PASSWORD, self.state.password_rounds),
                    role,
                    first_name: username.to_string(),
                    last_name: "Tester".to_string(),
                })
                .unwrap();
            let (token, _) = auth::issue_jwt("test-secret", 1, &AuthUser::from(&user)).unwrap();
            (user, token)
        }

        pub async fn send(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }

        /// Notifications delivered to `user_id` once queued dispatches have run.
        pub async fn notifications(&self, user_id: i64) -> Vec<Notification> {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            self.state.notifications.recent(user_id, 100).await
        }

        pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
            self.send(Method::GET, uri, Some(token), None).await
        }

        pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            self.send(Method::POST, uri, Some(token), Some(body)).await
        }

        pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            self.send(Method::PUT, uri, Some(token), Some(body)).await
        }

        pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
            self.send(Method::DELETE, uri, Some(token), None).await
        }
    }
}
