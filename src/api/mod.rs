//! HTTP API.
//!
//! Every route under `/api` except health, login and register requires a
//! bearer token. Handlers check permissions through
//! [`AppState::evaluator`] before touching the store.

pub mod activity;
pub mod analytics;
pub mod auth;
pub mod error;
pub mod extract;
pub mod findings;
pub mod notifications;
pub mod permissions;
pub mod projects;
pub mod routes;
pub mod tasks;
pub mod users;

use serde::Serialize;

pub use routes::{app, serve, AppState};

/// One page of a paginated listing.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}
