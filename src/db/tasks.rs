//! Kanban tasks and their comments.
//!
//! Every write that changes a bucket's membership (create, move, delete) runs
//! in one immediate transaction so positions stay dense per (project, status).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Database, DbError, DbResult};
use crate::board::{self, Slot};
use crate::models::{Task, TaskComment, TaskPriority, TaskStatus};

const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, labels, position, \
                            due_date, created_by, assigned_to, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub labels: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub created_by: i64,
    pub assigned_to: Option<i64>,
}

/// Editable fields. Status and position only change through moves.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub labels: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub assigned_to: Option<i64>,
}

/// Task count per column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub todo: i64,
    pub in_progress: i64,
    pub done: i64,
}

impl TaskStats {
    pub fn total(&self) -> i64 {
        self.todo + self.in_progress + self.done
    }
}

/// Result of a move: the task after the move and where it came from.
#[derive(Debug, Clone)]
pub struct MovedTask {
    pub task: Task,
    pub from: Slot,
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        labels: row.get(6)?,
        position: row.get(7)?,
        due_date: row.get(8)?,
        created_by: row.get(9)?,
        assigned_to: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn get_task(conn: &Connection, id: i64) -> DbResult<Option<Task>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?)
}

fn bucket_len(conn: &Connection, project_id: i64, status: TaskStatus) -> DbResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = ?2",
        params![project_id, status],
        |row| row.get(0),
    )?)
}

fn require_assignee(conn: &Connection, assigned_to: Option<i64>) -> DbResult<()> {
    let Some(user_id) = assigned_to else {
        return Ok(());
    };
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        params![user_id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(DbError::NotFound(format!("user {}", user_id)))
    }
}

pub struct TaskRepository {
    db: Database,
}

impl TaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert at the bottom of the task's column.
    pub fn create(&self, task: &NewTask) -> DbResult<Task> {
        self.db.with_transaction(|conn| {
            require_assignee(conn, task.assigned_to)?;
            let position = bucket_len(conn, task.project_id, task.status)?;
            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO tasks (project_id, title, description, status, priority, labels, position,
                                   due_date, created_by, assigned_to, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                "#,
                params![
                    task.project_id,
                    task.title,
                    task.description,
                    task.status,
                    task.priority,
                    task.labels,
                    position,
                    task.due_date,
                    task.created_by,
                    task.assigned_to,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            get_task(conn, id)?.ok_or_else(|| DbError::NotFound(format!("task {}", id)))
        })
    }

    pub fn get(&self, id: i64) -> DbResult<Option<Task>> {
        self.db.with_connection(|conn| get_task(conn, id))
    }

    pub fn project_of(&self, id: i64) -> DbResult<Option<i64>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT project_id FROM tasks WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// All tasks of a project ordered by column then position.
    pub fn board(&self, project_id: i64) -> DbResult<Vec<Task>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1
                ORDER BY CASE status WHEN 'todo' THEN 0 WHEN 'in_progress' THEN 1 ELSE 2 END, position
                "#
            ))?;
            let tasks = stmt
                .query_map(params![project_id], task_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    pub fn update(&self, id: i64, update: &TaskUpdate) -> DbResult<Task> {
        self.db.with_transaction(|conn| {
            require_assignee(conn, update.assigned_to)?;
            let changed = conn.execute(
                r#"
                UPDATE tasks
                SET title = ?1, description = ?2, priority = ?3, labels = ?4, due_date = ?5,
                    assigned_to = ?6, updated_at = ?7
                WHERE id = ?8
                "#,
                params![
                    update.title,
                    update.description,
                    update.priority,
                    update.labels,
                    update.due_date,
                    update.assigned_to,
                    Utc::now(),
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("task {}", id)));
            }
            get_task(conn, id)?.ok_or_else(|| DbError::NotFound(format!("task {}", id)))
        })
    }

    /// Move a task to `new_status` at `new_position`, re-sequencing both
    /// affected columns. A missing task fails before anything is written.
    pub fn move_task(&self, id: i64, new_status: TaskStatus, new_position: i64) -> DbResult<MovedTask> {
        self.db.with_transaction(|conn| {
            let task = get_task(conn, id)?.ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
            let from = Slot::new(task.status, task.position);
            let target_len = bucket_len(conn, task.project_id, new_status)?;
            let plan = board::plan_move(from, Slot::new(new_status, new_position), target_len);

            if plan.is_noop(from) {
                return Ok(MovedTask { task, from });
            }

            for shift in &plan.shifts {
                conn.execute(
                    r#"
                    UPDATE tasks SET position = position + ?1
                    WHERE project_id = ?2 AND status = ?3 AND position >= ?4
                      AND (?5 IS NULL OR position <= ?5) AND id != ?6
                    "#,
                    params![shift.delta, task.project_id, shift.status, shift.from, shift.to, id],
                )?;
            }
            conn.execute(
                "UPDATE tasks SET status = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
                params![plan.target.status, plan.target.position, Utc::now(), id],
            )?;

            let task = get_task(conn, id)?.ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
            Ok(MovedTask { task, from })
        })
    }

    /// Hard delete and close the gap left in the column.
    pub fn delete(&self, id: i64) -> DbResult<Option<Task>> {
        self.db.with_transaction(|conn| {
            let Some(task) = get_task(conn, id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            conn.execute(
                r#"
                UPDATE tasks SET position = position - 1
                WHERE project_id = ?1 AND status = ?2 AND position > ?3
                "#,
                params![task.project_id, task.status, task.position],
            )?;
            Ok(Some(task))
        })
    }

    pub fn stats(&self, project_id: i64) -> DbResult<TaskStats> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM tasks WHERE project_id = ?1 GROUP BY status",
            )?;
            let mut stats = TaskStats::default();
            let rows = stmt.query_map(params![project_id], |row| {
                Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status {
                    TaskStatus::Todo => stats.todo = count,
                    TaskStatus::InProgress => stats.in_progress = count,
                    TaskStatus::Done => stats.done = count,
                }
            }
            Ok(stats)
        })
    }

    pub fn count(&self, status: Option<TaskStatus>) -> DbResult<i64> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE (?1 IS NULL OR status = ?1)",
                params![status],
                |row| row.get(0),
            )?)
        })
    }

    pub fn add_comment(&self, task_id: i64, user_id: i64, content: &str) -> DbResult<TaskComment> {
        self.db.with_transaction(|conn| {
            if get_task(conn, task_id)?.is_none() {
                return Err(DbError::NotFound(format!("task {}", task_id)));
            }
            conn.execute(
                "INSERT INTO task_comments (task_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, user_id, content, Utc::now()],
            )?;
            let id = conn.last_insert_rowid();
            Ok(conn.query_row(
                "SELECT id, task_id, user_id, content, created_at FROM task_comments WHERE id = ?1",
                params![id],
                comment_from_row,
            )?)
        })
    }

    pub fn comments(&self, task_id: i64) -> DbResult<Vec<TaskComment>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, task_id, user_id, content, created_at
                FROM task_comments WHERE task_id = ?1 ORDER BY created_at, id
                "#,
            )?;
            let comments = stmt
                .query_map(params![task_id], comment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(comments)
        })
    }
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<TaskComment> {
    Ok(TaskComment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
pub(crate) fn sample_task(project_id: i64, title: &str, created_by: i64) -> NewTask {
    NewTask {
        project_id,
        title: title.to_string(),
        description: None,
        status: TaskStatus::Todo,
        priority: TaskPriority::Medium,
        labels: None,
        due_date: None,
        created_by,
        assigned_to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::projects::sample_project;
    use crate::db::users::sample_user;
    use crate::models::{ProjectType, Role};

    struct Fixture {
        db: Database,
        project_id: i64,
        user_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let user = db.users().create(&sample_user("dev", Role::Developer)).unwrap();
        let project = db
            .projects()
            .create(&sample_project("Board", ProjectType::Development, user.id), Some(user.id))
            .unwrap();
        Fixture {
            db,
            project_id: project.id,
            user_id: user.id,
        }
    }

    impl Fixture {
        fn task(&self, title: &str, status: TaskStatus) -> Task {
            self.db
                .tasks()
                .create(&NewTask {
                    project_id: self.project_id,
                    title: title.to_string(),
                    description: None,
                    status,
                    priority: TaskPriority::Medium,
                    labels: None,
                    due_date: None,
                    created_by: self.user_id,
                    assigned_to: None,
                })
                .unwrap()
        }

        fn slot(&self, id: i64) -> (TaskStatus, i64) {
            let task = self.db.tasks().get(id).unwrap().unwrap();
            (task.status, task.position)
        }

        fn assert_dense(&self) {
            let tasks = self.db.tasks().board(self.project_id).unwrap();
            for status in TaskStatus::ALL {
                let positions: Vec<i64> = tasks
                    .iter()
                    .filter(|t| t.status == *status)
                    .map(|t| t.position)
                    .collect();
                let expected: Vec<i64> = (0..positions.len() as i64).collect();
                assert_eq!(positions, expected, "bucket {status} is not dense");
            }
        }
    }

    #[test]
    fn test_create_appends_to_column() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        let b = fx.task("B", TaskStatus::Todo);
        let c = fx.task("C", TaskStatus::Done);

        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
        assert_eq!(c.position, 0);
        fx.assert_dense();
    }

    #[test]
    fn test_move_within_column() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        let b = fx.task("B", TaskStatus::Todo);
        let c = fx.task("C", TaskStatus::Todo);

        let moved = fx.db.tasks().move_task(c.id, TaskStatus::Todo, 0).unwrap();
        assert_eq!(moved.from, Slot::new(TaskStatus::Todo, 2));

        assert_eq!(fx.slot(a.id), (TaskStatus::Todo, 1));
        assert_eq!(fx.slot(b.id), (TaskStatus::Todo, 2));
        assert_eq!(fx.slot(c.id), (TaskStatus::Todo, 0));
    }

    #[test]
    fn test_move_across_columns() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        let b = fx.task("B", TaskStatus::Todo);
        let c = fx.task("C", TaskStatus::Todo);

        fx.db.tasks().move_task(b.id, TaskStatus::Done, 0).unwrap();

        assert_eq!(fx.slot(a.id), (TaskStatus::Todo, 0));
        assert_eq!(fx.slot(c.id), (TaskStatus::Todo, 1));
        assert_eq!(fx.slot(b.id), (TaskStatus::Done, 0));
        fx.assert_dense();
    }

    #[test]
    fn test_move_to_own_slot_changes_nothing() {
        let fx = fixture();
        fx.task("A", TaskStatus::Todo);
        let b = fx.task("B", TaskStatus::Todo);
        fx.task("C", TaskStatus::Todo);
        let before = fx.db.tasks().board(fx.project_id).unwrap();

        fx.db.tasks().move_task(b.id, TaskStatus::Todo, 1).unwrap();

        let after = fx.db.tasks().board(fx.project_id).unwrap();
        let positions = |tasks: &[Task]| -> Vec<(i64, TaskStatus, i64)> {
            tasks.iter().map(|t| (t.id, t.status, t.position)).collect()
        };
        assert_eq!(positions(&before), positions(&after));
    }

    #[test]
    fn test_move_missing_task_writes_nothing() {
        let fx = fixture();
        fx.task("A", TaskStatus::Todo);

        let err = fx.db.tasks().move_task(999, TaskStatus::Done, 0).unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        fx.assert_dense();
    }

    #[test]
    fn test_move_clamps_out_of_range_position() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        fx.task("B", TaskStatus::InProgress);

        let moved = fx.db.tasks().move_task(a.id, TaskStatus::InProgress, 40).unwrap();
        assert_eq!(moved.task.position, 1);
        fx.assert_dense();
    }

    #[test]
    fn test_buckets_stay_dense_under_many_moves() {
        let fx = fixture();
        let ids: Vec<i64> = (0..9)
            .map(|i| fx.task(&format!("T{i}"), TaskStatus::ALL[i % 3]).id)
            .collect();

        let moves = [
            (0, TaskStatus::Done, 0),
            (4, TaskStatus::Todo, 5),
            (8, TaskStatus::Todo, 0),
            (1, TaskStatus::InProgress, 1),
            (3, TaskStatus::Done, 2),
            (0, TaskStatus::Done, 3),
            (5, TaskStatus::Todo, -1),
        ];
        for (idx, status, position) in moves {
            fx.db.tasks().move_task(ids[idx], status, position).unwrap();
            fx.assert_dense();
        }
        assert_eq!(fx.db.tasks().stats(fx.project_id).unwrap().total(), 9);
    }

    #[test]
    fn test_delete_closes_gap() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        let b = fx.task("B", TaskStatus::Todo);
        let c = fx.task("C", TaskStatus::Todo);

        let deleted = fx.db.tasks().delete(a.id).unwrap().unwrap();
        assert_eq!(deleted.title, "A");
        assert_eq!(fx.slot(b.id), (TaskStatus::Todo, 0));
        assert_eq!(fx.slot(c.id), (TaskStatus::Todo, 1));
        assert!(fx.db.tasks().delete(a.id).unwrap().is_none());
    }

    #[test]
    fn test_comments_and_stats() {
        let fx = fixture();
        let a = fx.task("A", TaskStatus::Todo);
        fx.task("B", TaskStatus::Done);

        fx.db.tasks().add_comment(a.id, fx.user_id, "first").unwrap();
        fx.db.tasks().add_comment(a.id, fx.user_id, "second").unwrap();
        let comments = fx.db.tasks().comments(a.id).unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].content, "first");

        let stats = fx.db.tasks().stats(fx.project_id).unwrap();
        assert_eq!(stats, TaskStats { todo: 1, in_progress: 0, done: 1 });
        assert_eq!(fx.db.tasks().project_of(a.id).unwrap(), Some(fx.project_id));
    }

    #[test]
    fn test_unknown_assignee_rejected() {
        let fx = fixture();
        let err = fx
            .db
            .tasks()
            .create(&NewTask {
                project_id: fx.project_id,
                title: "Orphan".to_string(),
                description: None,
                status: TaskStatus::Todo,
                priority: TaskPriority::Low,
                labels: None,
                due_date: None,
                created_by: fx.user_id,
                assigned_to: Some(404),
            })
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(ref what) if what == "user 404"));
    }
}
