//! API error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::db::DbError;
use crate::models::UnknownLabel;
use crate::rbac::Denied;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// Logged server side; clients only see a generic message.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} not found", what))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match self {
            Self::Internal(detail) => {
                tracing::error!("Request failed: {}", detail);
                "Internal server error".to_string()
            }
            Self::Unauthenticated(m) | Self::Forbidden(m) | Self::NotFound(m) | Self::Validation(m) => m,
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Duplicate(_) => Self::Validation(err.to_string()),
            DbError::NotFound(_) => Self::NotFound(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<Denied> for ApiError {
    fn from(err: Denied) -> Self {
        Self::Forbidden(err.to_string())
    }
}

impl From<UnknownLabel> for ApiError {
    fn from(err: UnknownLabel) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{Permission, ReportsAction};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::Unauthenticated("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("task 3").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::validation("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_conversions() {
        assert!(matches!(
            ApiError::from(DbError::Duplicate("email".into())),
            ApiError::Validation(m) if m == "email already exists"
        ));
        assert!(matches!(
            ApiError::from(DbError::NotFound("task 4".into())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(ApiError::from(DbError::LockPoisoned), ApiError::Internal(_)));
        assert!(matches!(
            ApiError::from(Denied::Permission(Permission::Reports(ReportsAction::ViewReports))),
            ApiError::Forbidden(m) if m == "missing permission reports.view_reports"
        ));
    }

    #[tokio::test]
    async fn test_internal_details_are_not_returned() {
        let response = ApiError::Internal("disk I/O error at /var/lib/nexus.db".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_body_shape() {
        let body = body_json(ApiError::validation("Password must be at least 8 characters").into_response()).await;
        assert_eq!(body, serde_json::json!({"error": "Password must be at least 8 characters"}));
    }
}
