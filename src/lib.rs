//! # Nexus
//!
//! Penetration testing and project management service.
//!
//! Users hold one role. Projects are either pentests, which collect
//! security findings, or development projects, which carry a kanban board
//! of tasks. Every change is recorded in an append-only activity log, and
//! team members get live notifications for assignments and new findings.
//!
//! ## Modules
//! - `api`: HTTP routes, auth and error mapping
//! - `rbac`: role tables and the permission evaluator
//! - `board`: task ordering within kanban columns
//! - `db`: SQLite store and repositories
//! - `notifications`: per-user history and live feed

pub mod api;
pub mod board;
pub mod config;
pub mod db;
pub mod models;
pub mod notifications;
pub mod rbac;

pub use config::Config;
