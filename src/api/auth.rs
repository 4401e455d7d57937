//! Account auth for the API.
//!
//! - Clients submit email and password to `/api/auth/login`
//! - Server returns a JWT whose subject is the user id
//! - Every protected request re-reads the user, so role changes and
//!   deactivation apply immediately
//! - When `DEV_MODE=true`, requests without a token act as the oldest
//!   active super admin

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::error::{ApiError, ApiResult};
use super::extract::Json;
use super::routes::AppState;
use crate::config::BootstrapAdmin;
use crate::db::{Database, DbResult, NewActivity, NewUser};
use crate::models::{Role, User};
use crate::rbac::Module;

const PASSWORD_SCHEME: &str = "pbkdf2_sha256";
pub const PBKDF2_ROUNDS: u32 = 100_000;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id
    sub: String,
    /// Username (for display/auditing)
    #[serde(default)]
    usr: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

/// The authenticated caller, as loaded from the store for this request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }
}

/// Caller address and user agent, for the activity log.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let ip_address = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header("x-real-ip"))
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            });
        Ok(Self {
            ip_address,
            user_agent: header("user-agent"),
        })
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// Hash a password as `pbkdf2_sha256$<rounds>$<salt hex>$<hash hex>`.
pub(crate) fn hash_password_with(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hash = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut hash);
    format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        rounds,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// [`hash_password_with`] on the blocking pool. PBKDF2 at production rounds
/// would otherwise stall an async worker for tens of milliseconds.
pub(crate) async fn hash_password_blocking(password: String, rounds: u32) -> ApiResult<String> {
    tokio::task::spawn_blocking(move || hash_password_with(&password, rounds))
        .await
        .map_err(|e| ApiError::Internal(format!("password hashing task failed: {}", e)))
}

pub(crate) async fn verify_password_blocking(password: String, stored: String) -> ApiResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(|e| ApiError::Internal(format!("password check task failed: {}", e)))
}

/// Malformed stored hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(rounds), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let (Ok(rounds), Ok(salt)) = (rounds.parse::<u32>(), hex::decode(salt)) else {
        return false;
    };
    if rounds == 0 {
        return false;
    }
    let mut hash = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, rounds, &mut hash);
    constant_time_eq(&hex::encode(hash), expected)
}

pub(crate) fn issue_jwt(secret: &str, ttl_days: i64, user: &AuthUser) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = Duration::try_days(ttl_days.max(1))
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl_days))?;
    let claims = Claims {
        sub: user.id.to_string(),
        usr: user.username.clone(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

/// Create the configured super admin unless one already exists. The username
/// is the local part of the email.
pub fn bootstrap_super_admin(
    db: &Database,
    admin: &BootstrapAdmin,
    rounds: u32,
) -> DbResult<Option<User>> {
    if db.users().exists_with_role(Role::SuperAdmin)? {
        return Ok(None);
    }
    let email = admin.email.trim();
    let username = email.split('@').next().unwrap_or(email);
    let user = db.users().create(&NewUser {
        username: username.to_string(),
        email: email.to_string(),
        password_hash: hash_password_with(&admin.password, rounds),
        role: Role::SuperAdmin,
        first_name: "Super".to_string(),
        last_name: "Admin".to_string(),
    })?;
    Ok(Some(user))
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub exp: i64,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub permissions: std::collections::BTreeMap<Module, Vec<&'static str>>,
}

pub(crate) fn validate_identity(username: &str, email: &str) -> ApiResult<()> {
    if username.trim().is_empty() {
        return Err(ApiError::validation("Username is required"));
    }
    if !email.contains('@') {
        return Err(ApiError::validation("A valid email is required"));
    }
    Ok(())
}

pub(crate) fn validate_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Shared checks for new accounts, used by registration and user management.
pub(crate) fn validate_new_account(username: &str, email: &str, password: &str) -> ApiResult<()> {
    validate_identity(username, email)?;
    validate_password(password)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let email = req.email.trim().to_string();
    let user = state.db.call(move |db| db.users().find_by_email(&email)).await?;

    // Unknown emails are checked against the decoy hash so both paths run
    // the full PBKDF2 work. Same message for unknown email and wrong password.
    let stored = user
        .as_ref()
        .map_or_else(|| state.login_decoy_hash().to_string(), |u| u.password_hash.clone());
    let valid = verify_password_blocking(req.password, stored).await?;
    let user = match user {
        Some(user) if valid => user,
        _ => {
            return Err(ApiError::Unauthenticated(
                "Invalid email or password".to_string(),
            ))
        }
    };

    if !user.is_active {
        return Err(ApiError::Forbidden(
            "Your account has been deactivated. Please contact an administrator.".to_string(),
        ));
    }

    let secret = state
        .config
        .auth
        .jwt_secret
        .as_deref()
        .ok_or_else(|| ApiError::Internal("JWT_SECRET not configured".to_string()))?;
    let (token, exp) = issue_jwt(secret, state.config.auth.jwt_ttl_days, &AuthUser::from(&user))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let user_id = user.id;
    let refreshed = state
        .db
        .call(move |db| {
            db.users().record_login(user_id)?;
            db.users().get(user_id)
        })
        .await?;
    state.log_activity(
        NewActivity::new(user.id, "login", format!("User {} logged in", user.username))
            .client(client.ip_address, client.user_agent),
    );
    tracing::info!("User {} logged in", user.username);

    let user = refreshed.unwrap_or(user);
    Ok(Json(LoginResponse { token, exp, user }))
}

/// POST /api/auth/register - self-service signup for non-privileged roles.
pub async fn register(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let role = req.role.unwrap_or(Role::Developer);
    if role.is_privileged() {
        return Err(ApiError::validation(format!(
            "Role {} cannot be self-assigned",
            role
        )));
    }
    validate_new_account(&req.username, &req.email, &req.password)?;

    let new_user = NewUser {
        username: req.username.trim().to_string(),
        email: req.email.trim().to_string(),
        password_hash: state.hash_password(&req.password).await?,
        role,
        first_name: req.first_name.trim().to_string(),
        last_name: req.last_name.trim().to_string(),
    };
    let user = state.db.call(move |db| db.users().create(&new_user)).await?;

    state.log_activity(
        NewActivity::new(user.id, "register", format!("New user {} registered", user.username))
            .client(client.ip_address, client.user_agent),
    );
    tracing::info!("Registered user {} as {}", user.username, user.role);

    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/auth/logout - tokens are stateless; this only records the event.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    client: ClientInfo,
) -> StatusCode {
    state.log_activity(
        NewActivity::new(user.id, "logout", format!("User {} logged out", user.username))
            .client(client.ip_address, client.user_agent),
    );
    StatusCode::NO_CONTENT
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<MeResponse>> {
    let user = state
        .db
        .users()
        .get(auth.id)?
        .ok_or_else(|| ApiError::not_found(format!("user {}", auth.id)))?;
    Ok(Json(MeResponse {
        permissions: state.permissions.grants_for(user.role),
        user,
    }))
}

fn bearer_token(req: &Request<Body>) -> &str {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("")
        .trim()
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = bearer_token(&req).to_string();

    let user = if token.is_empty() {
        if !state.config.dev_mode {
            return ApiError::Unauthenticated("Missing Authorization header".to_string())
                .into_response();
        }
        // Dev mode => act as the first super admin.
        match state
            .db
            .call(|db| db.users().first_with_role(Role::SuperAdmin))
            .await
        {
            Ok(Some(user)) => user,
            Ok(None) => {
                return ApiError::Unauthenticated("No super admin to act as in dev mode".to_string())
                    .into_response();
            }
            Err(e) => return ApiError::from(e).into_response(),
        }
    } else {
        let Some(secret) = state.config.auth.jwt_secret.as_deref() else {
            return ApiError::Internal("JWT_SECRET not configured".to_string()).into_response();
        };
        let user_id = match verify_jwt(&token, secret).map(|c| c.sub.parse::<i64>()) {
            Ok(Ok(id)) => id,
            _ => {
                return ApiError::Unauthenticated("Invalid or expired token".to_string())
                    .into_response();
            }
        };
        match state.db.call(move |db| db.users().get(user_id)).await {
            Ok(Some(user)) if user.is_active => user,
            Ok(_) => {
                return ApiError::Unauthenticated("Invalid user".to_string()).into_response();
            }
            Err(e) => return ApiError::from(e).into_response(),
        }
    };

    req.extensions_mut().insert(AuthUser::from(&user));
    next.run(req).await
}
