//! Projects and project membership.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{duplicate_as, Database, DbError, DbResult};
use crate::models::{MembershipRole, Project, ProjectMembership, ProjectStatus, ProjectType, User};

const PROJECT_COLUMNS: &str = "p.id, p.name, p.description, p.client_name, p.project_type, p.status, \
                               p.created_by, p.created_at, p.updated_at";

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub client_name: Option<String>,
    pub project_type: ProjectType,
    pub created_by: i64,
}

#[derive(Debug, Clone)]
pub struct ProjectUpdate {
    pub name: String,
    pub description: Option<String>,
    pub client_name: Option<String>,
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub project_type: Option<ProjectType>,
    pub status: Option<ProjectStatus>,
    /// Restrict to projects this user is a member of.
    pub member_id: Option<i64>,
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        client_name: row.get(3)?,
        project_type: row.get(4)?,
        status: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectMembership> {
    Ok(ProjectMembership {
        id: row.get(0)?,
        user_id: row.get(1)?,
        project_id: row.get(2)?,
        role_in_project: row.get(3)?,
        assigned_at: row.get(4)?,
    })
}

fn get_project(conn: &Connection, id: i64) -> DbResult<Option<Project>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects p WHERE p.id = ?1"),
            params![id],
            project_from_row,
        )
        .optional()?)
}

fn require_row(conn: &Connection, table: &str, id: i64, what: &str) -> DbResult<()> {
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(DbError::NotFound(format!("{} {}", what, id)))
    }
}

fn insert_membership(
    conn: &Connection,
    project_id: i64,
    user_id: i64,
    role: MembershipRole,
) -> DbResult<ProjectMembership> {
    conn.execute(
        r#"
        INSERT INTO project_members (user_id, project_id, role_in_project, assigned_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![user_id, project_id, role, Utc::now()],
    )
    .map_err(duplicate_as(format!(
        "membership of user {} in project {}",
        user_id, project_id
    )))?;
    let id = conn.last_insert_rowid();
    Ok(conn.query_row(
        "SELECT id, user_id, project_id, role_in_project, assigned_at FROM project_members WHERE id = ?1",
        params![id],
        membership_from_row,
    )?)
}

pub struct ProjectRepository {
    db: Database,
}

impl ProjectRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a project. When `lead` is given that user is enrolled as the
    /// project lead in the same transaction.
    pub fn create(&self, project: &NewProject, lead: Option<i64>) -> DbResult<Project> {
        self.db.with_transaction(|conn| {
            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO projects (name, description, client_name, project_type, status, created_by, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
                params![
                    project.name,
                    project.description,
                    project.client_name,
                    project.project_type,
                    ProjectStatus::Active,
                    project.created_by,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            if let Some(user_id) = lead {
                insert_membership(conn, id, user_id, MembershipRole::Lead)?;
            }
            get_project(conn, id)?.ok_or_else(|| DbError::NotFound(format!("project {}", id)))
        })
    }

    pub fn get(&self, id: i64) -> DbResult<Option<Project>> {
        self.db.with_connection(|conn| get_project(conn, id))
    }

    /// Projects matching `filter`, newest first.
    pub fn list(&self, filter: &ProjectFilter) -> DbResult<Vec<Project>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {PROJECT_COLUMNS} FROM projects p
                WHERE (?1 IS NULL OR p.project_type = ?1)
                  AND (?2 IS NULL OR p.status = ?2)
                  AND (?3 IS NULL OR EXISTS(
                        SELECT 1 FROM project_members m
                        WHERE m.project_id = p.id AND m.user_id = ?3))
                ORDER BY p.created_at DESC, p.id DESC
                "#
            ))?;
            let projects = stmt
                .query_map(
                    params![filter.project_type, filter.status, filter.member_id],
                    project_from_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
    }

    pub fn update(&self, id: i64, update: &ProjectUpdate) -> DbResult<Project> {
        self.db.with_transaction(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE projects
                SET name = ?1, description = ?2, client_name = ?3, status = ?4, updated_at = ?5
                WHERE id = ?6
                "#,
                params![
                    update.name,
                    update.description,
                    update.client_name,
                    update.status,
                    Utc::now(),
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("project {}", id)));
            }
            get_project(conn, id)?.ok_or_else(|| DbError::NotFound(format!("project {}", id)))
        })
    }

    /// Hard delete. Memberships, findings, tasks and comments cascade.
    pub fn delete(&self, id: i64) -> DbResult<bool> {
        self.db.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM projects WHERE id = ?1", params![id])? > 0)
        })
    }

    pub fn count(&self, project_type: Option<ProjectType>, status: Option<ProjectStatus>) -> DbResult<i64> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM projects WHERE (?1 IS NULL OR project_type = ?1) AND (?2 IS NULL OR status = ?2)",
                params![project_type, status],
                |row| row.get(0),
            )?)
        })
    }

    /// Enroll a single user. A second enrollment of the same pair fails with
    /// [`DbError::Duplicate`].
    pub fn add_member(
        &self,
        project_id: i64,
        user_id: i64,
        role: MembershipRole,
    ) -> DbResult<ProjectMembership> {
        self.db.with_transaction(|conn| {
            require_row(conn, "projects", project_id, "project")?;
            require_row(conn, "users", user_id, "user")?;
            insert_membership(conn, project_id, user_id, role)
        })
    }

    /// Replace the whole member set with `user_ids`, all enrolled as plain
    /// members. Repeated ids are enrolled once.
    pub fn set_members(&self, project_id: i64, user_ids: &[i64]) -> DbResult<Vec<ProjectMembership>> {
        let mut ids = user_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        self.db.with_transaction(|conn| {
            require_row(conn, "projects", project_id, "project")?;
            for user_id in &ids {
                require_row(conn, "users", *user_id, "user")?;
            }
            conn.execute(
                "DELETE FROM project_members WHERE project_id = ?1",
                params![project_id],
            )?;
            ids.iter()
                .map(|user_id| insert_membership(conn, project_id, *user_id, MembershipRole::Member))
                .collect()
        })
    }

    pub fn remove_member(&self, project_id: i64, user_id: i64) -> DbResult<bool> {
        self.db.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )? > 0)
        })
    }

    pub fn is_member(&self, user_id: i64, project_id: i64) -> DbResult<bool> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM project_members WHERE user_id = ?1 AND project_id = ?2)",
                params![user_id, project_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn memberships(&self, project_id: i64) -> DbResult<Vec<ProjectMembership>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, user_id, project_id, role_in_project, assigned_at
                FROM project_members WHERE project_id = ?1 ORDER BY assigned_at, id
                "#,
            )?;
            let rows = stmt
                .query_map(params![project_id], membership_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Users enrolled in the project.
    pub fn team(&self, project_id: i64) -> DbResult<Vec<User>> {
        let ids: Vec<i64> = self
            .memberships(project_id)?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        self.db.with_connection(|conn| {
            let mut team = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(user) = super::users::get_user(conn, id)? {
                    team.push(user);
                }
            }
            Ok(team)
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_project(name: &str, project_type: ProjectType, created_by: i64) -> NewProject {
    NewProject {
        name: name.to_string(),
        description: None,
        client_name: Some("ACME".to_string()),
        project_type,
        created_by,
    }
}
