//! User accounts.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{duplicate_as, Database, DbError, DbResult};
use crate::models::{Role, User};

const USER_COLUMNS: &str = "id, username, email, password_hash, role, first_name, last_name, \
                            created_at, last_login, is_active";

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub is_active: bool,
    /// Replaces the stored hash when set.
    pub password_hash: Option<String>,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        role: row.get(4)?,
        first_name: row.get(5)?,
        last_name: row.get(6)?,
        created_at: row.get(7)?,
        last_login: row.get(8)?,
        is_active: row.get(9)?,
    })
}

/// Reject an email or username already held by another account.
fn ensure_unique(conn: &Connection, username: &str, email: &str, except: Option<i64>) -> DbResult<()> {
    let except = except.unwrap_or(-1);
    let email_taken: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1 AND id != ?2)",
        params![email, except],
        |row| row.get(0),
    )?;
    if email_taken {
        return Err(DbError::Duplicate("email".to_string()));
    }
    let username_taken: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 AND id != ?2)",
        params![username, except],
        |row| row.get(0),
    )?;
    if username_taken {
        return Err(DbError::Duplicate("username".to_string()));
    }
    Ok(())
}

pub struct UserRepository {
    db: Database,
}

impl UserRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, user: &NewUser) -> DbResult<User> {
        self.db.with_transaction(|conn| {
            ensure_unique(conn, &user.username, &user.email, None)?;
            conn.execute(
                r#"
                INSERT INTO users (username, email, password_hash, role, first_name, last_name, created_at, is_active)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
                "#,
                params![
                    user.username,
                    user.email,
                    user.password_hash,
                    user.role,
                    user.first_name,
                    user.last_name,
                    Utc::now(),
                ],
            )
            .map_err(duplicate_as("user"))?;
            let id = conn.last_insert_rowid();
            get_user(conn, id)?.ok_or_else(|| DbError::NotFound(format!("user {}", id)))
        })
    }

    pub fn get(&self, id: i64) -> DbResult<Option<User>> {
        self.db.with_connection(|conn| get_user(conn, id))
    }

    pub fn find_by_email(&self, email: &str) -> DbResult<Option<User>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                    params![email],
                    user_from_row,
                )
                .optional()?)
        })
    }

    /// Page through users, newest first. `search` matches username, email or
    /// either name part.
    pub fn list(
        &self,
        search: Option<&str>,
        role: Option<Role>,
        page: u32,
        per_page: u32,
    ) -> DbResult<(Vec<User>, i64)> {
        let pattern = search.map(|s| format!("%{}%", s));
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);

        self.db.with_connection(|conn| {
            let filter = r#"
                WHERE (?1 IS NULL OR username LIKE ?1 OR email LIKE ?1
                       OR first_name LIKE ?1 OR last_name LIKE ?1)
                  AND (?2 IS NULL OR role = ?2)
            "#;

            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users {filter} ORDER BY created_at DESC, id DESC LIMIT ?3 OFFSET ?4"
            ))?;
            let users = stmt
                .query_map(params![pattern, role, per_page, offset], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM users {filter}"),
                params![pattern, role],
                |row| row.get(0),
            )?;
            Ok((users, total))
        })
    }

    pub fn update(&self, id: i64, update: &UserUpdate) -> DbResult<User> {
        self.db.with_transaction(|conn| {
            ensure_unique(conn, &update.username, &update.email, Some(id))?;
            let changed = conn
                .execute(
                    r#"
                    UPDATE users
                    SET username = ?1, email = ?2, first_name = ?3, last_name = ?4, role = ?5,
                        is_active = ?6, password_hash = COALESCE(?7, password_hash)
                    WHERE id = ?8
                    "#,
                    params![
                        update.username,
                        update.email,
                        update.first_name,
                        update.last_name,
                        update.role,
                        update.is_active,
                        update.password_hash,
                        id,
                    ],
                )
                .map_err(duplicate_as("user"))?;
            if changed == 0 {
                return Err(DbError::NotFound(format!("user {}", id)));
            }
            get_user(conn, id)?.ok_or_else(|| DbError::NotFound(format!("user {}", id)))
        })
    }

    /// Hard delete. Memberships and comments cascade.
    pub fn delete(&self, id: i64) -> DbResult<bool> {
        self.db.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM users WHERE id = ?1", params![id])? > 0)
        })
    }

    pub fn record_login(&self, id: i64) -> DbResult<()> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE users SET last_login = ?1 WHERE id = ?2",
                params![Utc::now(), id],
            )?;
            Ok(())
        })
    }

    /// Oldest active user holding `role`.
    pub fn first_with_role(&self, role: Role) -> DbResult<Option<User>> {
        self.db.with_connection(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {USER_COLUMNS} FROM users WHERE role = ?1 AND is_active = 1 ORDER BY id LIMIT 1"
                    ),
                    params![role],
                    user_from_row,
                )
                .optional()?)
        })
    }

    pub fn exists_with_role(&self, role: Role) -> DbResult<bool> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE role = ?1)",
                params![role],
                |row| row.get(0),
            )?)
        })
    }

    pub fn count(&self) -> DbResult<i64> {
        self.db.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
        })
    }

    /// Number of users per role, roles without users omitted.
    pub fn count_by_role(&self) -> DbResult<Vec<(Role, i64)>> {
        self.db.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT role, COUNT(*) FROM users GROUP BY role ORDER BY role")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn get_user(conn: &Connection, id: i64) -> DbResult<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()?)
}

#[cfg(test)]
pub(crate) fn sample_user(username: &str, role: Role) -> NewUser {
    NewUser {
        username: username.to_string(),
        email: format!("{}@nexus.test", username),
        password_hash: "x".to_string(),
        role,
        first_name: username.to_string(),
        last_name: "Tester".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();

        let alice = users.create(&sample_user("alice", Role::Pentester)).unwrap();
        assert!(alice.is_active);
        assert_eq!(alice.role, Role::Pentester);
        assert_eq!(alice.full_name(), "alice Tester");

        let found = users.find_by_email("alice@nexus.test").unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert!(users.get(alice.id + 100).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_and_username_rejected() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();
        users.create(&sample_user("alice", Role::Developer)).unwrap();

        let err = users.create(&sample_user("alice", Role::Developer)).unwrap_err();
        assert!(matches!(err, DbError::Duplicate(ref what) if what == "email"));

        let mut other = sample_user("alice", Role::Developer);
        other.email = "other@nexus.test".to_string();
        let err = users.create(&other).unwrap_err();
        assert!(matches!(err, DbError::Duplicate(ref what) if what == "username"));
        assert_eq!(users.count().unwrap(), 1);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();
        for name in ["ann", "bob", "cat"] {
            users.create(&sample_user(name, Role::Developer)).unwrap();
        }
        users.create(&sample_user("dan", Role::Client)).unwrap();

        let (page, total) = users.list(None, Some(Role::Developer), 1, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (found, total) = users.list(Some("bo"), None, 1, 20).unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].username, "bob");

        let by_role = users.count_by_role().unwrap();
        assert!(by_role.contains(&(Role::Client, 1)));
        assert!(by_role.contains(&(Role::Developer, 3)));
    }

    #[test]
    fn test_update_role_and_deactivate() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();
        let bob = users.create(&sample_user("bob", Role::Developer)).unwrap();

        let updated = users
            .update(
                bob.id,
                &UserUpdate {
                    username: "bobby".to_string(),
                    email: bob.email.clone(),
                    first_name: bob.first_name.clone(),
                    last_name: bob.last_name.clone(),
                    role: Role::Pentester,
                    is_active: false,
                    password_hash: None,
                },
            )
            .unwrap();
        assert_eq!(updated.username, "bobby");
        assert_eq!(updated.role, Role::Pentester);
        assert!(!updated.is_active);

        assert!(users.delete(bob.id).unwrap());
        assert!(!users.delete(bob.id).unwrap());
    }

    #[test]
    fn test_first_with_role_skips_inactive() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();
        assert!(users.first_with_role(Role::SuperAdmin).unwrap().is_none());

        let old = users.create(&sample_user("old", Role::SuperAdmin)).unwrap();
        let new = users.create(&sample_user("new", Role::SuperAdmin)).unwrap();
        assert_eq!(users.first_with_role(Role::SuperAdmin).unwrap().unwrap().id, old.id);

        users
            .update(
                old.id,
                &UserUpdate {
                    username: old.username.clone(),
                    email: old.email.clone(),
                    first_name: old.first_name.clone(),
                    last_name: old.last_name.clone(),
                    role: old.role,
                    is_active: false,
                    password_hash: None,
                },
            )
            .unwrap();
        assert_eq!(users.first_with_role(Role::SuperAdmin).unwrap().unwrap().id, new.id);

    }

    #[test]
    fn test_password_changes_with_the_rest_of_the_edit() {
        let db = Database::open_in_memory().unwrap();
        let users = db.users();
        let bob = users.create(&sample_user("bob", Role::Developer)).unwrap();
        let eve = users.create(&sample_user("eve", Role::Developer)).unwrap();
        let edit = |username: &str, password_hash: Option<&str>| UserUpdate {
            username: username.to_string(),
            email: bob.email.clone(),
            first_name: bob.first_name.clone(),
            last_name: bob.last_name.clone(),
            role: bob.role,
            is_active: true,
            password_hash: password_hash.map(str::to_string),
        };

        // duplicate username: nothing is written, password included
        let err = users.update(bob.id, &edit(&eve.username, Some("changed"))).unwrap_err();
        assert!(matches!(err, DbError::Duplicate(_)));
        assert_eq!(users.get(bob.id).unwrap().unwrap().password_hash, bob.password_hash);

        let updated = users.update(bob.id, &edit("bobby", Some("changed"))).unwrap();
        assert_eq!(updated.password_hash, "changed");

        // no new hash keeps the stored one
        let updated = users.update(bob.id, &edit("bob", None)).unwrap();
        assert_eq!(updated.password_hash, "changed");
        assert!(matches!(
            users.update(999, &edit("ghost", Some("x"))),
            Err(DbError::NotFound(_))
        ));
    }
}
