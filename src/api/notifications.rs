//! The caller's notifications: history, read markers and a live SSE feed.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::extract::{Json, Path, Query};
use super::routes::AppState;
use crate::notifications::{Notification, DEFAULT_RECENT, HISTORY_LIMIT};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/stream", get(stream_notifications))
        .route("/:id/read", post(mark_read))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
    pub unread: usize,
}

/// GET /api/notifications - newest first.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Json<NotificationList> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT).clamp(1, HISTORY_LIMIT);
    Json(NotificationList {
        notifications: state.notifications.recent(user.id, limit).await,
        unread: state.notifications.unread_count(user.id).await,
    })
}

/// POST /api/notifications/:id/read
async fn mark_read(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.notifications.mark_read(user.id, id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("notification {}", id)))
    }
}

/// GET /api/notifications/stream - live notifications for the caller only.
async fn stream_notifications(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.notifications.subscribe();
    let user_id = user.id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(notification) if notification.user_id == user_id => {
                    match Event::default().event("notification").json_data(&notification) {
                        Ok(event) => yield Ok(event),
                        Err(e) => tracing::warn!("Failed to encode notification {}: {}", notification.id, e),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notification stream for user {} skipped {} messages", user_id, skipped);
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
