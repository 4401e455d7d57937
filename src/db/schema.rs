//! Table definitions and migrations.

use rusqlite::{params, Connection};

use super::DbResult;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

struct Migration {
    version: i32,
    description: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema",
    up: r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'developer'
                CHECK(role IN ('super_admin', 'admin', 'pentester', 'developer', 'client')),
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_login TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        );

        -- created_by is a weak reference: projects outlive their creator.
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT,
            client_name TEXT,
            project_type TEXT NOT NULL CHECK(project_type IN ('pentest', 'development')),
            status TEXT NOT NULL DEFAULT 'active'
                CHECK(status IN ('active', 'completed', 'archived')),
            created_by INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_projects_type ON projects(project_type, status);

        CREATE TABLE IF NOT EXISTS project_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            role_in_project TEXT NOT NULL DEFAULT 'member'
                CHECK(role_in_project IN ('lead', 'member', 'viewer')),
            assigned_at TEXT NOT NULL,
            UNIQUE(user_id, project_id)
        );
        CREATE INDEX IF NOT EXISTS idx_project_members_project ON project_members(project_id);

        CREATE TABLE IF NOT EXISTS findings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            remediation TEXT,
            severity TEXT NOT NULL
                CHECK(severity IN ('critical', 'high', 'medium', 'low', 'informational')),
            status TEXT NOT NULL DEFAULT 'open'
                CHECK(status IN ('open', 'in_progress', 'closed', 'risk_accepted')),
            cvss_score REAL,
            cwe_id TEXT,
            affected_url TEXT,
            created_by INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_findings_project ON findings(project_id);

        -- position has no unique index: range shifts pass through transient
        -- duplicates inside the move transaction.
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'todo'
                CHECK(status IN ('todo', 'in_progress', 'done')),
            priority TEXT NOT NULL DEFAULT 'medium'
                CHECK(priority IN ('low', 'medium', 'high', 'urgent')),
            labels TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            due_date TEXT,
            created_by INTEGER NOT NULL,
            assigned_to INTEGER REFERENCES users(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_bucket ON tasks(project_id, status, position);

        CREATE TABLE IF NOT EXISTS task_comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_comments_task ON task_comments(task_id);

        -- Append-only; rows survive deletion of the acting user.
        CREATE TABLE IF NOT EXISTS activity_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            action TEXT NOT NULL,
            description TEXT,
            entity_type TEXT,
            entity_id INTEGER,
            ip_address TEXT,
            user_agent TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_logs_created ON activity_logs(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_activity_logs_action ON activity_logs(action);
    "#,
}];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DbResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            description TEXT
        )
        "#,
        [],
    )?;

    let current_version = get_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Running migration v{}: {}",
                migration.version,
                migration.description
            );

            conn.execute_batch(migration.up)?;
            conn.execute(
                "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
                params![migration.version, migration.description],
            )?;
        }
    }

    Ok(())
}

pub fn get_version(conn: &Connection) -> DbResult<i32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

pub fn table_exists(conn: &Connection, table_name: &str) -> DbResult<bool> {
    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        params![table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
