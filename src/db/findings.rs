//! Security findings recorded against pentest projects.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{Database, DbError, DbResult};
use crate::models::{Finding, FindingStatus, Severity};

const FINDING_COLUMNS: &str = "id, project_id, title, description, remediation, severity, status, \
                               cvss_score, cwe_id, affected_url, created_by, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewFinding {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub remediation: Option<String>,
    pub severity: Severity,
    pub cvss_score: Option<f64>,
    pub cwe_id: Option<String>,
    pub affected_url: Option<String>,
    pub created_by: i64,
}

#[derive(Debug, Clone)]
pub struct FindingUpdate {
    pub title: String,
    pub description: String,
    pub remediation: Option<String>,
    pub severity: Severity,
    pub status: FindingStatus,
    pub cvss_score: Option<f64>,
    pub cwe_id: Option<String>,
    pub affected_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FindingFilter {
    pub severity: Option<Severity>,
    pub status: Option<FindingStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSort {
    /// Newest first.
    #[default]
    CreatedAt,
    /// Critical first.
    Severity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FindingStats {
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub informational: i64,
    pub open: i64,
    pub closed: i64,
    /// Critical findings still open.
    pub critical_open: i64,
}

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<Finding> {
    Ok(Finding {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        remediation: row.get(4)?,
        severity: row.get(5)?,
        status: row.get(6)?,
        cvss_score: row.get(7)?,
        cwe_id: row.get(8)?,
        affected_url: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn get_finding(conn: &Connection, id: i64) -> DbResult<Option<Finding>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FINDING_COLUMNS} FROM findings WHERE id = ?1"),
            params![id],
            finding_from_row,
        )
        .optional()?)
}

pub struct FindingRepository {
    db: Database,
}

impl FindingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, finding: &NewFinding) -> DbResult<Finding> {
        self.db.with_transaction(|conn| {
            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO findings (project_id, title, description, remediation, severity, status,
                                      cvss_score, cwe_id, affected_url, created_by, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                "#,
                params![
                    finding.project_id,
                    finding.title,
                    finding.description,
                    finding.remediation,
                    finding.severity,
                    FindingStatus::Open,
                    finding.cvss_score,
                    finding.cwe_id,
                    finding.affected_url,
                    finding.created_by,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            get_finding(conn, id)?.ok_or_else(|| DbError::NotFound(format!("finding {}", id)))
        })
    }

    pub fn get(&self, id: i64) -> DbResult<Option<Finding>> {
        self.db.with_connection(|conn| get_finding(conn, id))
    }

    pub fn project_of(&self, id: i64) -> DbResult<Option<i64>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT project_id FROM findings WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn list(&self, project_id: i64, filter: FindingFilter, sort: FindingSort) -> DbResult<Vec<Finding>> {
        let order = match sort {
            FindingSort::CreatedAt => "created_at DESC, id DESC",
            FindingSort::Severity => {
                "CASE severity WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 \
                 WHEN 'low' THEN 3 ELSE 4 END, created_at DESC, id DESC"
            }
        };
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {FINDING_COLUMNS} FROM findings
                WHERE project_id = ?1
                  AND (?2 IS NULL OR severity = ?2)
                  AND (?3 IS NULL OR status = ?3)
                ORDER BY {order}
                "#
            ))?;
            let findings = stmt
                .query_map(params![project_id, filter.severity, filter.status], finding_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(findings)
        })
    }

    pub fn update(&self, id: i64, update: &FindingUpdate) -> DbResult<Finding> {
        self.db.with_transaction(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE findings
                SET title = ?1, description = ?2, remediation = ?3, severity = ?4, status = ?5,
                    cvss_score = ?6, cwe_id = ?7, affected_url = ?8, updated_at = ?9
                WHERE id = ?10
                "#,
                params![
                    update.title,
                    update.description,
                    update.remediation,
                    update.severity,
                    update.status,
                    update.cvss_score,
                    update.cwe_id,
                    update.affected_url,
                    Utc::now(),
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("finding {}", id)));
            }
            get_finding(conn, id)?.ok_or_else(|| DbError::NotFound(format!("finding {}", id)))
        })
    }

    pub fn delete(&self, id: i64) -> DbResult<Option<Finding>> {
        self.db.with_transaction(|conn| {
            let finding = get_finding(conn, id)?;
            if finding.is_some() {
                conn.execute("DELETE FROM findings WHERE id = ?1", params![id])?;
            }
            Ok(finding)
        })
    }

    pub fn stats(&self, project_id: i64) -> DbResult<FindingStats> {
        self.db.with_connection(|conn| {
            let mut stats = FindingStats::default();
            let mut stmt = conn.prepare("SELECT severity, status FROM findings WHERE project_id = ?1")?;
            let rows = stmt.query_map(params![project_id], |row| {
                Ok((row.get::<_, Severity>(0)?, row.get::<_, FindingStatus>(1)?))
            })?;
            for row in rows {
                let (severity, status) = row?;
                if severity == Severity::Critical && status == FindingStatus::Open {
                    stats.critical_open += 1;
                }
                match severity {
                    Severity::Critical => stats.critical += 1,
                    Severity::High => stats.high += 1,
                    Severity::Medium => stats.medium += 1,
                    Severity::Low => stats.low += 1,
                    Severity::Informational => stats.informational += 1,
                }
                match status {
                    FindingStatus::Open => stats.open += 1,
                    FindingStatus::Closed => stats.closed += 1,
                    FindingStatus::InProgress | FindingStatus::RiskAccepted => {}
                }
            }
            Ok(stats)
        })
    }

    pub fn count(&self, severity: Option<Severity>, status: Option<FindingStatus>) -> DbResult<i64> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM findings WHERE (?1 IS NULL OR severity = ?1) AND (?2 IS NULL OR status = ?2)",
                params![severity, status],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_finding(project_id: i64, title: &str, severity: Severity, created_by: i64) -> NewFinding {
    NewFinding {
        project_id,
        title: title.to_string(),
        description: format!("{} description", title),
        remediation: None,
        severity,
        cvss_score: Some(5.0),
        cwe_id: Some("CWE-79".to_string()),
        affected_url: None,
        created_by,
    }
}
