//! Cross-project aggregates behind the analytics views.
//!
//! Every query takes the ids of the projects the caller may see, so
//! visibility is decided by the caller. An empty scope yields empty metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params_from_iter, types::Value};
use serde::Serialize;

use super::activity::DailyCount;
use super::{Database, DbResult};
use crate::models::{ProjectStatus, ProjectType, Severity, TaskStatus};

const TOP_VULNERABILITIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleCount {
    pub title: String,
    pub count: i64,
}

/// Severity-weighted finding total for one pentest project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRisk {
    pub project_id: i64,
    pub name: String,
    pub findings: i64,
    pub score: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityMetrics {
    /// Findings reported per day, by severity.
    pub severity_trend: BTreeMap<Severity, Vec<DailyCount>>,
    pub top_vulnerabilities: Vec<TitleCount>,
    /// Highest score first.
    pub project_risks: Vec<ProjectRisk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTrend {
    pub status: TaskStatus,
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCompletions {
    pub username: String,
    pub completed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyVelocity {
    /// Monday of the week, `YYYY-MM-DD`.
    pub week: String,
    pub completed: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DevelopmentMetrics {
    /// Tasks per column, by day of their last change.
    pub task_trends: Vec<StatusTrend>,
    pub team_productivity: Vec<UserCompletions>,
    pub sprint_velocity: Vec<WeeklyVelocity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: ProjectStatus,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub project_type: ProjectType,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedProject {
    pub project_id: i64,
    pub name: String,
    /// Creation to last update.
    pub duration_days: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectOverview {
    pub status_distribution: Vec<StatusCount>,
    pub type_distribution: Vec<TypeCount>,
    pub completed_projects: Vec<CompletedProject>,
}

/// `?, ?, ...` for an `IN` list of `n` values.
fn in_list(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct AnalyticsRepository {
    db: Database,
}

impl AnalyticsRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn security_metrics(&self, project_ids: &[i64]) -> DbResult<SecurityMetrics> {
        if project_ids.is_empty() {
            return Ok(SecurityMetrics::default());
        }
        let scope = in_list(project_ids.len());

        self.db.with_connection(|conn| {
            let mut severity_trend: BTreeMap<Severity, Vec<DailyCount>> = BTreeMap::new();
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT severity, substr(created_at, 1, 10) AS day, COUNT(*) FROM findings
                WHERE project_id IN ({scope}) GROUP BY severity, day ORDER BY day
                "#
            ))?;
            let rows = stmt.query_map(params_from_iter(project_ids), |row| {
                Ok((
                    row.get::<_, Severity>(0)?,
                    DailyCount {
                        date: row.get(1)?,
                        count: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (severity, day) = row?;
                severity_trend.entry(severity).or_default().push(day);
            }

            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT title, COUNT(*) AS n FROM findings
                WHERE project_id IN ({scope}) GROUP BY title ORDER BY n DESC, title LIMIT {TOP_VULNERABILITIES}
                "#
            ))?;
            let top_vulnerabilities = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    Ok(TitleCount {
                        title: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut risks: BTreeMap<i64, ProjectRisk> = BTreeMap::new();
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT p.id, p.name, f.severity FROM projects p
                LEFT JOIN findings f ON f.project_id = p.id
                WHERE p.id IN ({scope})
                "#
            ))?;
            let rows = stmt.query_map(params_from_iter(project_ids), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<Severity>>(2)?,
                ))
            })?;
            for row in rows {
                let (project_id, name, severity) = row?;
                let risk = risks.entry(project_id).or_insert_with(|| ProjectRisk {
                    project_id,
                    name,
                    findings: 0,
                    score: 0,
                });
                if let Some(severity) = severity {
                    risk.findings += 1;
                    risk.score += severity.risk_weight();
                }
            }
            let mut project_risks: Vec<ProjectRisk> = risks.into_values().collect();
            project_risks.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));

            Ok(SecurityMetrics {
                severity_trend,
                top_vulnerabilities,
                project_risks,
            })
        })
    }

    /// Velocity counts tasks finished on or after `since`.
    pub fn development_metrics(&self, project_ids: &[i64], since: NaiveDate) -> DbResult<DevelopmentMetrics> {
        if project_ids.is_empty() {
            return Ok(DevelopmentMetrics::default());
        }
        let scope = in_list(project_ids.len());

        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT status, substr(updated_at, 1, 10) AS day, COUNT(*) FROM tasks
                WHERE project_id IN ({scope}) GROUP BY status, day ORDER BY day, status
                "#
            ))?;
            let task_trends = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    Ok(StatusTrend {
                        status: row.get(0)?,
                        date: row.get(1)?,
                        count: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT u.username, COUNT(*) AS n FROM tasks t
                JOIN users u ON u.id = t.assigned_to
                WHERE t.status = 'done' AND t.project_id IN ({scope})
                GROUP BY u.id ORDER BY n DESC, u.username
                "#
            ))?;
            let team_productivity = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    Ok(UserCompletions {
                        username: row.get(0)?,
                        completed: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            // '-6 days' then 'weekday 1' lands on the Monday on or before the day
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT date(substr(updated_at, 1, 10), '-6 days', 'weekday 1') AS week, COUNT(*) FROM tasks
                WHERE status = 'done' AND substr(updated_at, 1, 10) >= ? AND project_id IN ({scope})
                GROUP BY week ORDER BY week
                "#
            ))?;
            let params = std::iter::once(Value::from(since.format("%Y-%m-%d").to_string()))
                .chain(project_ids.iter().map(|id| Value::from(*id)));
            let sprint_velocity = stmt
                .query_map(params_from_iter(params), |row| {
                    Ok(WeeklyVelocity {
                        week: row.get(0)?,
                        completed: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(DevelopmentMetrics {
                task_trends,
                team_productivity,
                sprint_velocity,
            })
        })
    }

    pub fn project_overview(&self, project_ids: &[i64]) -> DbResult<ProjectOverview> {
        if project_ids.is_empty() {
            return Ok(ProjectOverview::default());
        }
        let scope = in_list(project_ids.len());

        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT status, COUNT(*) FROM projects WHERE id IN ({scope}) GROUP BY status ORDER BY status"
            ))?;
            let status_distribution = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    Ok(StatusCount {
                        status: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                "SELECT project_type, COUNT(*) FROM projects WHERE id IN ({scope}) \
                 GROUP BY project_type ORDER BY project_type"
            ))?;
            let type_distribution = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    Ok(TypeCount {
                        project_type: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT id, name, created_at, updated_at FROM projects
                WHERE status = 'completed' AND id IN ({scope}) ORDER BY updated_at DESC
                "#
            ))?;
            let completed_projects = stmt
                .query_map(params_from_iter(project_ids), |row| {
                    let created: DateTime<Utc> = row.get(2)?;
                    let updated: DateTime<Utc> = row.get(3)?;
                    Ok(CompletedProject {
                        project_id: row.get(0)?,
                        name: row.get(1)?,
                        duration_days: (updated - created).num_seconds() as f64 / 86_400.0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ProjectOverview {
                status_distribution,
                type_distribution,
                completed_projects,
            })
        })
    }
}
