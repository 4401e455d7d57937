//! Role-based access control.
//!
//! Two layers of checks:
//! - module permissions (`admin.view_users`, `flow.create_task`, ...) decided
//!   purely from the role table
//! - resource actions (`task.edit`, `project.assign_users`, ...) decided from
//!   the role table and, for non-admins, membership of the owning project

mod evaluator;
mod permissions;
mod table;

pub use evaluator::{AccessLookup, AuditSink, Denied, PermissionEvaluator};
pub use permissions::{
    AdminAction, AnalyticsAction, ClientAction, FindingAction, FlowAction, Module, Permission,
    ProjectAction, ReportsAction, ResourceAction, ResourceType, SecureAction, TaskAction,
    UserAction,
};
pub use table::{Grant, PermissionTable};

use crate::db::{Database, DbResult, ProjectFilter};
use crate::models::{Project, Role};

/// Projects `user_id` may see: everything for admins, member projects
/// otherwise. `filter.member_id` is overridden for non-admins.
pub fn accessible_projects(
    db: &Database,
    role: Role,
    user_id: i64,
    mut filter: ProjectFilter,
) -> DbResult<Vec<Project>> {
    if !role.is_privileged() {
        filter.member_id = Some(user_id);
    }
    db.projects().list(&filter)
}
