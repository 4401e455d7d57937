//! In-process notification hub.
//!
//! Each user keeps a bounded history (newest first) and every new
//! notification is also pushed on a broadcast channel that the SSE endpoint
//! filters per user.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Notifications kept per user.
pub const HISTORY_LIMIT: usize = 100;
/// Default page size for [`NotificationHub::recent`].
pub const DEFAULT_RECENT: usize = 50;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub project_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

pub type SharedNotificationHub = Arc<NotificationHub>;

pub struct NotificationHub {
    history: RwLock<HashMap<i64, VecDeque<Notification>>>,
    live: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Store a notification and push it to live subscribers.
    pub async fn send(
        &self,
        user_id: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        project_id: Option<i64>,
    ) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            project_id,
            timestamp: Utc::now(),
            read: false,
        };

        {
            let mut history = self.history.write().await;
            let entries = history.entry(user_id).or_default();
            entries.push_front(notification.clone());
            entries.truncate(HISTORY_LIMIT);
        }

        // no receivers is fine
        let _ = self.live.send(notification.clone());
        tracing::debug!(
            "Notification {} for user {}: {}",
            notification.id,
            user_id,
            notification.title
        );
        notification
    }

    /// Fire-and-forget variant of [`send`](Self::send) for request handlers.
    pub fn dispatch(
        self: &Arc<Self>,
        user_id: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
        project_id: Option<i64>,
    ) {
        let hub = Arc::clone(self);
        let title = title.into();
        let message = message.into();
        tokio::spawn(async move {
            hub.send(user_id, title, message, kind, project_id).await;
        });
    }

    /// Up to `limit` most recent notifications, newest first.
    pub async fn recent(&self, user_id: i64, limit: usize) -> Vec<Notification> {
        let history = self.history.read().await;
        history
            .get(&user_id)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn unread_count(&self, user_id: i64) -> usize {
        let history = self.history.read().await;
        history
            .get(&user_id)
            .map(|entries| entries.iter().filter(|n| !n.read).count())
            .unwrap_or(0)
    }

    /// Returns false when the user has no such notification.
    pub async fn mark_read(&self, user_id: i64, id: Uuid) -> bool {
        let mut history = self.history.write().await;
        match history
            .get_mut(&user_id)
            .and_then(|entries| entries.iter_mut().find(|n| n.id == id))
        {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.live.subscribe()
    }
}
