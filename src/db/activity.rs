//! Append-only activity log.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Row};
use serde::Serialize;

use super::{Database, DbError, DbResult};
use crate::models::ActivityLog;

const ACTIVITY_COLUMNS: &str = "a.id, a.user_id, a.action, a.description, a.entity_type, a.entity_id, \
                                a.ip_address, a.user_agent, a.created_at";

#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub user_id: i64,
    pub action: String,
    pub description: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewActivity {
    pub fn new(user_id: i64, action: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user_id,
            action: action.into(),
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn entity(mut self, entity_type: &str, entity_id: i64) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(entity_id);
        self
    }

    pub fn client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    /// Substring of the action name.
    pub action: Option<String>,
    /// Substring of the actor's username or names.
    pub user: Option<String>,
    /// Calendar day (UTC).
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionCount {
    pub action: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserCount {
    pub username: String,
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityStats {
    pub daily_stats: Vec<DailyCount>,
    pub action_stats: Vec<ActionCount>,
    pub user_stats: Vec<UserCount>,
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityLog> {
    Ok(ActivityLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action: row.get(2)?,
        description: row.get(3)?,
        entity_type: row.get(4)?,
        entity_id: row.get(5)?,
        ip_address: row.get(6)?,
        user_agent: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn day_bounds(date: Option<NaiveDate>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match date.and_then(|d| d.and_hms_opt(0, 0, 0)) {
        Some(start) => {
            let start = start.and_utc();
            (Some(start), Some(start + Duration::days(1)))
        }
        None => (None, None),
    }
}

pub struct ActivityRepository {
    db: Database,
}

impl ActivityRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(&self, entry: &NewActivity) -> DbResult<ActivityLog> {
        self.db.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO activity_logs (user_id, action, description, entity_type, entity_id,
                                           ip_address, user_agent, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    entry.user_id,
                    entry.action,
                    entry.description,
                    entry.entity_type,
                    entry.entity_id,
                    entry.ip_address,
                    entry.user_agent,
                    Utc::now(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activity_logs a WHERE a.id = ?1"),
                params![id],
                activity_from_row,
            )
            .map_err(DbError::from)
        })
    }

    /// Filtered page of entries, newest first, plus the total match count.
    pub fn list(&self, filter: &ActivityFilter, page: u32, per_page: u32) -> DbResult<(Vec<ActivityLog>, i64)> {
        let action = filter.action.as_ref().map(|a| format!("%{}%", a));
        let user = filter.user.as_ref().map(|u| format!("%{}%", u));
        let (from, until) = day_bounds(filter.date);
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);

        self.db.with_connection(|conn| {
            let clause = r#"
                FROM activity_logs a LEFT JOIN users u ON u.id = a.user_id
                WHERE (?1 IS NULL OR a.action LIKE ?1)
                  AND (?2 IS NULL OR u.username LIKE ?2 OR u.first_name LIKE ?2 OR u.last_name LIKE ?2)
                  AND (?3 IS NULL OR a.created_at >= ?3)
                  AND (?4 IS NULL OR a.created_at < ?4)
            "#;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACTIVITY_COLUMNS} {clause} ORDER BY a.created_at DESC, a.id DESC LIMIT ?5 OFFSET ?6"
            ))?;
            let entries = stmt
                .query_map(params![action, user, from, until, per_page, offset], activity_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) {clause}"),
                params![action, user, from, until],
                |row| row.get(0),
            )?;
            Ok((entries, total))
        })
    }

    pub fn recent(&self, limit: u32) -> DbResult<Vec<ActivityLog>> {
        Ok(self.list(&ActivityFilter::default(), 1, limit)?.0)
    }

    pub fn distinct_actions(&self) -> DbResult<Vec<String>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT action FROM activity_logs ORDER BY action")?;
            let actions = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(actions)
        })
    }

    /// Daily counts, top ten actions and top ten actors since `since`.
    pub fn stats(&self, since: DateTime<Utc>) -> DbResult<ActivityStats> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT substr(created_at, 1, 10) AS day, COUNT(*) FROM activity_logs
                WHERE created_at >= ?1 GROUP BY day ORDER BY day
                "#,
            )?;
            let daily_stats = stmt
                .query_map(params![since], |row| {
                    Ok(DailyCount {
                        date: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                r#"
                SELECT action, COUNT(*) AS n FROM activity_logs
                WHERE created_at >= ?1 GROUP BY action ORDER BY n DESC, action LIMIT 10
                "#,
            )?;
            let action_stats = stmt
                .query_map(params![since], |row| {
                    Ok(ActionCount {
                        action: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                r#"
                SELECT u.username, u.first_name || ' ' || u.last_name, COUNT(*) AS n
                FROM activity_logs a JOIN users u ON u.id = a.user_id
                WHERE a.created_at >= ?1 GROUP BY u.id ORDER BY n DESC, u.username LIMIT 10
                "#,
            )?;
            let user_stats = stmt
                .query_map(params![since], |row| {
                    Ok(UserCount {
                        username: row.get(0)?,
                        name: row.get(1)?,
                        count: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ActivityStats {
                daily_stats,
                action_stats,
                user_stats,
            })
        })
    }
}
