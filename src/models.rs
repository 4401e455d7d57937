//! Domain records and their closed label sets.
//!
//! Every label column in the store (role, project type, severity, ...) is a
//! closed enumeration here. Labels are persisted as their snake_case string
//! form and parsed back on read, so an unknown label in the database surfaces
//! as a row conversion error instead of leaking into the permission checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A label string that does not belong to the expected set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! label_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::models::UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok(Self::$variant), )+
                    other => Err($crate::models::UnknownLabel {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ::rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl ::rusqlite::types::FromSql for $name {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                value.as_str()?.parse().map_err(|e: $crate::models::UnknownLabel| {
                    ::rusqlite::types::FromSqlError::Other(Box::new(e))
                })
            }
        }
    };
}

pub(crate) use label_enum;

label_enum! {
    /// The single role a user holds across the whole platform.
    Role as "role" {
        SuperAdmin => "super_admin",
        Admin => "admin",
        Pentester => "pentester",
        Developer => "developer",
        Client => "client",
    }
}

impl Role {
    /// Roles that bypass project membership checks.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::SuperAdmin | Self::Admin)
    }
}

label_enum! {
    ProjectType as "project type" {
        Pentest => "pentest",
        Development => "development",
    }
}

label_enum! {
    ProjectStatus as "project status" {
        Active => "active",
        Completed => "completed",
        Archived => "archived",
    }
}

label_enum! {
    /// Informational label on a membership. Never consulted for access.
    MembershipRole as "membership role" {
        Lead => "lead",
        Member => "member",
        Viewer => "viewer",
    }
}

label_enum! {
    /// Ordered from most to least severe.
    Severity as "severity" {
        Critical => "critical",
        High => "high",
        Medium => "medium",
        Low => "low",
        Informational => "informational",
    }
}

impl Severity {
    /// Contribution of one finding to a project's risk score.
    pub fn risk_weight(&self) -> i64 {
        match self {
            Self::Critical => 10,
            Self::High => 7,
            Self::Medium => 4,
            Self::Low => 1,
            Self::Informational => 0,
        }
    }
}

label_enum! {
    FindingStatus as "finding status" {
        Open => "open",
        InProgress => "in_progress",
        Closed => "closed",
        RiskAccepted => "risk_accepted",
    }
}

label_enum! {
    /// Kanban column of a task.
    TaskStatus as "task status" {
        Todo => "todo",
        InProgress => "in_progress",
        Done => "done",
    }
}

label_enum! {
    TaskPriority as "task priority" {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl Default for FindingStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub client_name: Option<String>,
    pub project_type: ProjectType,
    pub status: ProjectStatus,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMembership {
    pub id: i64,
    pub user_id: i64,
    pub project_id: i64,
    pub role_in_project: MembershipRole,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub remediation: Option<String>,
    pub severity: Severity,
    pub status: FindingStatus,
    pub cvss_score: Option<f64>,
    pub cwe_id: Option<String>,
    pub affected_url: Option<String>,
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub labels: Option<String>,
    /// Dense index within the (project, status) bucket.
    pub position: i64,
    pub due_date: Option<DateTime<Utc>>,
    pub created_by: i64,
    pub assigned_to: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: i64,
    pub task_id: i64,
    pub user_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: i64,
    pub user_id: i64,
    pub action: String,
    pub description: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}
