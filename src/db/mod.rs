//! SQLite persistence.
//!
//! One connection behind a mutex, shared by every request. Repositories are
//! thin structs over a cloned [`Database`] handle, one per entity. Writes that
//! touch more than one row go through [`Database::with_transaction`], which
//! opens an immediate transaction so concurrent writers queue instead of
//! interleaving.

mod schema;

pub mod activity;
pub mod analytics;
pub mod findings;
pub mod projects;
pub mod tasks;
pub mod users;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

pub use activity::{ActivityFilter, ActivityRepository, ActivityStats, NewActivity};
pub use analytics::{AnalyticsRepository, DevelopmentMetrics, ProjectOverview, SecurityMetrics};
pub use findings::{FindingFilter, FindingRepository, FindingSort, FindingStats, FindingUpdate, NewFinding};
pub use projects::{NewProject, ProjectFilter, ProjectRepository, ProjectUpdate};
pub use tasks::{NewTask, TaskRepository, TaskStats, TaskUpdate};
pub use users::{NewUser, UserRepository, UserUpdate};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("database task failed: {0}")]
    Task(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// True when `err` is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Map a UNIQUE violation to [`DbError::Duplicate`] naming `what`.
pub(crate) fn duplicate_as(what: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> DbError {
    let what = what.into();
    move |e| {
        if is_unique_violation(&e) {
            DbError::Duplicate(what)
        } else {
            DbError::Sqlite(e)
        }
    }
}

/// Thread-safe database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=5000;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database, used by tests and `DEV_MODE` without a path.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> DbResult<Self> {
        schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run `f` against the shared connection.
    pub fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction. Commits on `Ok`, rolls back
    /// on `Err` (the transaction is dropped uncommitted).
    pub fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` on the blocking pool with its own handle, so SQLite work and
    /// lock waits stay off the async workers.
    pub async fn call<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(Database) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| DbError::Task(e.to_string()))?
    }

    pub fn schema_version(&self) -> DbResult<i32> {
        self.with_connection(schema::get_version)
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.clone())
    }

    pub fn projects(&self) -> ProjectRepository {
        ProjectRepository::new(self.clone())
    }

    pub fn findings(&self) -> FindingRepository {
        FindingRepository::new(self.clone())
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.clone())
    }

    pub fn activity(&self) -> ActivityRepository {
        ActivityRepository::new(self.clone())
    }

    pub fn analytics(&self) -> AnalyticsRepository {
        AnalyticsRepository::new(self.clone())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}
