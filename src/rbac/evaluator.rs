//! Permission decisions against the role tables and project membership.

use chrono::Utc;

use super::permissions::{Permission, ResourceAction, ResourceType};
use super::table::PermissionTable;
use crate::db::{Database, DbResult, NewActivity};
use crate::models::Role;

/// Membership and ownership lookups the evaluator needs from the store.
pub trait AccessLookup: Send + Sync {
    fn is_member(&self, user_id: i64, project_id: i64) -> DbResult<bool>;

    /// Owning project of a resource, `None` when the resource does not exist
    /// or has no owning project.
    fn project_of(&self, resource_type: ResourceType, resource_id: i64) -> DbResult<Option<i64>>;
}

impl AccessLookup for Database {
    fn is_member(&self, user_id: i64, project_id: i64) -> DbResult<bool> {
        self.projects().is_member(user_id, project_id)
    }

    fn project_of(&self, resource_type: ResourceType, resource_id: i64) -> DbResult<Option<i64>> {
        match resource_type {
            ResourceType::Project => Ok(self.projects().get(resource_id)?.map(|p| p.id)),
            ResourceType::Finding => self.findings().project_of(resource_id),
            ResourceType::Task => self.tasks().project_of(resource_id),
            ResourceType::User => Ok(None),
        }
    }
}

/// Receives every resource decision made on behalf of a known user.
pub trait AuditSink: Send + Sync {
    fn record_decision(
        &self,
        user_id: i64,
        action: ResourceAction,
        resource_id: Option<i64>,
        granted: bool,
    ) -> DbResult<()>;
}

impl AuditSink for Database {
    fn record_decision(
        &self,
        user_id: i64,
        action: ResourceAction,
        resource_id: Option<i64>,
        granted: bool,
    ) -> DbResult<()> {
        let details = serde_json::json!({
            "resource_id": resource_id,
            "granted": granted,
            "timestamp": Utc::now(),
        });
        let mut entry = NewActivity::new(
            user_id,
            format!("permission_check_{}_{}", action.action(), action.resource_type()),
            details.to_string(),
        );
        if let Some(id) = resource_id {
            entry = entry.entity(action.resource_type().as_str(), id);
        }
        self.activity().record(&entry)?;
        Ok(())
    }
}

fn target(resource_id: &Option<i64>) -> String {
    match resource_id {
        Some(id) => format!(" on #{}", id),
        None => String::new(),
    }
}

/// A refused permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denied {
    #[error("missing permission {0}")]
    Permission(Permission),
    #[error("not allowed to {action}{}", target(.resource_id))]
    Resource {
        action: ResourceAction,
        resource_id: Option<i64>,
    },
}

/// Evaluates checks for one request. Holds only borrows, so building one per
/// handler costs nothing and every check re-reads the current membership.
pub struct PermissionEvaluator<'a> {
    table: &'a PermissionTable,
    lookup: &'a dyn AccessLookup,
    audit: Option<&'a dyn AuditSink>,
}

impl<'a> PermissionEvaluator<'a> {
    pub fn new(table: &'a PermissionTable, lookup: &'a dyn AccessLookup) -> Self {
        Self {
            table,
            lookup,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: &'a dyn AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn has_permission(&self, role: Role, permission: Permission) -> bool {
        self.table.allows(role, permission)
    }

    /// Role check for `action`, plus resource access when both ids are given.
    pub fn has_resource_permission(
        &self,
        role: Role,
        action: ResourceAction,
        resource_id: Option<i64>,
        user_id: Option<i64>,
    ) -> bool {
        let granted = self.table.role_may(role, action)
            && match (resource_id, user_id) {
                (Some(resource_id), Some(user_id)) => {
                    self.check_resource_access(role, action.resource_type(), resource_id, user_id)
                }
                _ => true,
            };

        if let (Some(sink), Some(user_id)) = (self.audit, user_id) {
            if let Err(e) = sink.record_decision(user_id, action, resource_id, granted) {
                tracing::warn!("Failed to record permission check {}: {}", action, e);
            }
        }

        granted
    }

    /// Admins pass; everyone else needs a membership in the owning project.
    /// Missing resources and lookup failures deny.
    pub fn check_resource_access(
        &self,
        role: Role,
        resource_type: ResourceType,
        resource_id: i64,
        user_id: i64,
    ) -> bool {
        if role.is_privileged() {
            return true;
        }
        let project_id = match resource_type {
            ResourceType::Project => resource_id,
            ResourceType::Finding | ResourceType::Task => {
                match self.lookup.project_of(resource_type, resource_id) {
                    Ok(Some(project_id)) => project_id,
                    Ok(None) => return false,
                    Err(e) => {
                        tracing::warn!(
                            "Ownership lookup for {} {} failed: {}",
                            resource_type,
                            resource_id,
                            e
                        );
                        return false;
                    }
                }
            }
            ResourceType::User => return false,
        };
        self.member_of(user_id, project_id)
    }

    pub fn can_access_project(&self, role: Role, project_id: i64, user_id: i64) -> bool {
        self.check_resource_access(role, ResourceType::Project, project_id, user_id)
    }

    /// Admins, or developers on the project's team.
    pub fn can_assign_task(&self, role: Role, project_id: i64, user_id: i64) -> bool {
        match role {
            Role::SuperAdmin | Role::Admin => true,
            Role::Developer => self.member_of(user_id, project_id),
            _ => false,
        }
    }

    pub fn can_create_project(&self, role: Role, project_type: crate::models::ProjectType) -> bool {
        self.table.can_create_project(role, project_type)
    }

    pub fn authorize(&self, role: Role, permission: Permission) -> Result<(), Denied> {
        if self.has_permission(role, permission) {
            Ok(())
        } else {
            Err(Denied::Permission(permission))
        }
    }

    /// Passes when the role holds any of `permissions`. A refusal names the
    /// first one.
    pub fn authorize_any(&self, role: Role, permissions: &[Permission]) -> Result<(), Denied> {
        match permissions.first() {
            Some(first) if !permissions.iter().any(|p| self.has_permission(role, *p)) => {
                Err(Denied::Permission(*first))
            }
            _ => Ok(()),
        }
    }

    pub fn authorize_resource(
        &self,
        role: Role,
        action: ResourceAction,
        resource_id: Option<i64>,
        user_id: i64,
    ) -> Result<(), Denied> {
        if self.has_resource_permission(role, action, resource_id, Some(user_id)) {
            Ok(())
        } else {
            Err(Denied::Resource { action, resource_id })
        }
    }

    /// Authorize `action` on every id, failing on the first refused one.
    pub fn validate_bulk(
        &self,
        role: Role,
        action: ResourceAction,
        resource_ids: &[i64],
        user_id: i64,
    ) -> Result<(), Denied> {
        resource_ids
            .iter()
            .try_for_each(|id| self.authorize_resource(role, action, Some(*id), user_id))
    }

    fn member_of(&self, user_id: i64, project_id: i64) -> bool {
        match self.lookup.is_member(user_id, project_id) {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(
                    "Membership lookup for user {} in project {} failed: {}",
                    user_id,
                    project_id,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;
    use crate::db::projects::sample_project;
    use crate::db::tasks::sample_task;
    use crate::db::users::sample_user;
    use crate::db::DbError;
    use crate::models::ProjectType;
    use crate::rbac::permissions::{
        AdminAction, AnalyticsAction, FindingAction, FlowAction, ProjectAction, SecureAction, TaskAction,
        UserAction,
    };

    #[derive(Default)]
    struct FakeLookup {
        members: HashSet<(i64, i64)>,
        owners: HashMap<(ResourceType, i64), i64>,
        broken: bool,
    }

    impl AccessLookup for FakeLookup {
        fn is_member(&self, user_id: i64, project_id: i64) -> DbResult<bool> {
            if self.broken {
                return Err(DbError::LockPoisoned);
            }
            Ok(self.members.contains(&(user_id, project_id)))
        }

        fn project_of(&self, resource_type: ResourceType, resource_id: i64) -> DbResult<Option<i64>> {
            if self.broken {
                return Err(DbError::LockPoisoned);
            }
            Ok(self.owners.get(&(resource_type, resource_id)).copied())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        decisions: Mutex<Vec<(i64, String, Option<i64>, bool)>>,
        fail: bool,
    }

    impl AuditSink for RecordingSink {
        fn record_decision(
            &self,
            user_id: i64,
            action: ResourceAction,
            resource_id: Option<i64>,
            granted: bool,
        ) -> DbResult<()> {
            if self.fail {
                return Err(DbError::LockPoisoned);
            }
            self.decisions
                .lock()
                .unwrap()
                .push((user_id, action.to_string(), resource_id, granted));
            Ok(())
        }
    }

    const TASK_EDIT: ResourceAction = ResourceAction::Task(TaskAction::Edit);

    #[test]
    fn test_module_permissions() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        assert!(evaluator.has_permission(Role::SuperAdmin, Permission::Admin(AdminAction::DeleteUser)));
        assert!(evaluator.has_permission(Role::Developer, Permission::Flow(FlowAction::UpdateTaskStatus)));
        assert!(!evaluator.has_permission(Role::Admin, Permission::Flow(FlowAction::UpdateTaskStatus)));
        assert!(!evaluator.has_permission(Role::Client, Permission::Secure(SecureAction::ViewFindings)));
        assert_eq!(
            evaluator.authorize(Role::Pentester, Permission::Flow(FlowAction::ViewTasks)),
            Err(Denied::Permission(Permission::Flow(FlowAction::ViewTasks)))
        );
    }

    #[test]
    fn test_authorize_any() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup);
        let security = [
            Permission::Analytics(AnalyticsAction::ViewSecurityAnalytics),
            Permission::Analytics(AnalyticsAction::ViewAllAnalytics),
        ];

        assert!(evaluator.authorize_any(Role::Pentester, &security).is_ok());
        assert!(evaluator.authorize_any(Role::Admin, &security).is_ok());
        assert_eq!(
            evaluator.authorize_any(Role::Developer, &security),
            Err(Denied::Permission(security[0]))
        );
    }

    #[test]
    fn test_developer_needs_membership_of_task_project() {
        let table = PermissionTable::standard();
        let mut lookup = FakeLookup::default();
        lookup.owners.insert((ResourceType::Task, 42), 7);
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        assert!(!evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(42), Some(3)));

        lookup.members.insert((3, 7));
        let evaluator = PermissionEvaluator::new(&table, &lookup);
        assert!(evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(42), Some(3)));
    }

    #[test]
    fn test_admins_bypass_membership() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        for role in [Role::SuperAdmin, Role::Admin] {
            assert!(evaluator.has_resource_permission(role, TASK_EDIT, Some(999), Some(1)));
            assert!(evaluator.can_access_project(role, 5, 1));
        }
        // admin is still outside the delete role set
        assert!(!evaluator.has_resource_permission(
            Role::Admin,
            ResourceAction::Project(ProjectAction::Delete),
            Some(1),
            Some(1)
        ));
    }

    #[test]
    fn test_admins_reach_every_resource_without_membership() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup {
            broken: true,
            ..Default::default()
        };
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        for role in [Role::SuperAdmin, Role::Admin] {
            for action in ResourceAction::all() {
                assert!(
                    evaluator.check_resource_access(role, action.resource_type(), 999, 1),
                    "{} denied {}",
                    role,
                    action
                );
            }
        }
    }

    #[test]
    fn test_role_set_checked_before_membership() {
        let table = PermissionTable::standard();
        let mut lookup = FakeLookup::default();
        lookup.members.insert((3, 7));
        lookup.owners.insert((ResourceType::Finding, 10), 7);
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        let view = ResourceAction::Finding(FindingAction::View);
        assert!(!evaluator.has_resource_permission(Role::Developer, view, Some(10), Some(3)));
        assert!(evaluator.has_resource_permission(Role::Client, view, Some(10), Some(3)));
        assert!(!evaluator.has_resource_permission(
            Role::Client,
            ResourceAction::Finding(FindingAction::Edit),
            Some(10),
            Some(3)
        ));
    }

    #[test]
    fn test_role_only_check_without_ids() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        assert!(evaluator.has_resource_permission(Role::Developer, TASK_EDIT, None, None));
        assert!(evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(42), None));
        assert!(!evaluator.has_resource_permission(
            Role::Developer,
            ResourceAction::User(UserAction::View),
            None,
            None
        ));
    }

    #[test]
    fn test_missing_resource_and_lookup_failure_deny() {
        let table = PermissionTable::standard();
        let mut lookup = FakeLookup::default();
        lookup.members.insert((3, 7));
        let evaluator = PermissionEvaluator::new(&table, &lookup);
        assert!(!evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(404), Some(3)));

        let broken = FakeLookup {
            broken: true,
            ..Default::default()
        };
        let evaluator = PermissionEvaluator::new(&table, &broken);
        assert!(!evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(42), Some(3)));
        assert!(!evaluator.can_access_project(Role::Client, 7, 3));
    }

    #[test]
    fn test_user_resources_require_privileged_role() {
        let table = PermissionTable::standard();
        let lookup = FakeLookup::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup);
        assert!(!evaluator.check_resource_access(Role::Developer, ResourceType::User, 3, 3));
        assert!(evaluator.check_resource_access(Role::Admin, ResourceType::User, 3, 1));
    }

    #[test]
    fn test_assign_task_and_bulk() {
        let table = PermissionTable::standard();
        let mut lookup = FakeLookup::default();
        lookup.members.insert((3, 7));
        lookup.owners.insert((ResourceType::Task, 1), 7);
        lookup.owners.insert((ResourceType::Task, 2), 7);
        lookup.owners.insert((ResourceType::Task, 3), 8);
        let evaluator = PermissionEvaluator::new(&table, &lookup);

        assert!(evaluator.can_assign_task(Role::Developer, 7, 3));
        assert!(!evaluator.can_assign_task(Role::Developer, 8, 3));
        assert!(!evaluator.can_assign_task(Role::Pentester, 7, 3));
        assert!(evaluator.can_assign_task(Role::Admin, 8, 3));

        assert!(evaluator.validate_bulk(Role::Developer, TASK_EDIT, &[1, 2], 3).is_ok());
        assert_eq!(
            evaluator.validate_bulk(Role::Developer, TASK_EDIT, &[1, 3, 2], 3),
            Err(Denied::Resource {
                action: TASK_EDIT,
                resource_id: Some(3)
            })
        );
        assert_eq!(
            Denied::Resource {
                action: TASK_EDIT,
                resource_id: Some(3)
            }
            .to_string(),
            "not allowed to task.edit on #3"
        );
    }

    #[test]
    fn test_audit_records_decisions_and_failures_are_swallowed() {
        let table = PermissionTable::standard();
        let mut lookup = FakeLookup::default();
        lookup.owners.insert((ResourceType::Task, 42), 7);
        let sink = RecordingSink::default();
        let evaluator = PermissionEvaluator::new(&table, &lookup).with_audit(&sink);

        assert!(!evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(42), Some(3)));
        assert!(evaluator.has_resource_permission(Role::Developer, TASK_EDIT, None, None));
        assert_eq!(
            *sink.decisions.lock().unwrap(),
            vec![(3, "task.edit".to_string(), Some(42), false)]
        );

        let failing = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let evaluator = PermissionEvaluator::new(&table, &lookup).with_audit(&failing);
        assert!(evaluator.has_resource_permission(Role::Admin, TASK_EDIT, Some(42), Some(1)));
    }

    #[test]
    fn test_database_lookup_and_audit() {
        let db = Database::open_in_memory().unwrap();
        let lead = db.users().create(&sample_user("lead", Role::Developer)).unwrap();
        let outsider = db.users().create(&sample_user("outsider", Role::Developer)).unwrap();
        let project = db
            .projects()
            .create(&sample_project("Portal", ProjectType::Development, lead.id), Some(lead.id))
            .unwrap();
        let task = db.tasks().create(&sample_task(project.id, "Login form", lead.id)).unwrap();

        let table = PermissionTable::standard();
        let evaluator = PermissionEvaluator::new(&table, &db).with_audit(&db);

        assert!(evaluator.has_resource_permission(Role::Developer, TASK_EDIT, Some(task.id), Some(lead.id)));
        assert!(!evaluator.has_resource_permission(
            Role::Developer,
            TASK_EDIT,
            Some(task.id),
            Some(outsider.id)
        ));

        let (entries, total) = db
            .activity()
            .list(
                &crate::db::ActivityFilter {
                    action: Some("permission_check_edit_task".to_string()),
                    ..Default::default()
                },
                1,
                50,
            )
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(entries[0].entity_id, Some(task.id));
        assert!(entries[0].description.as_deref().unwrap().contains("\"granted\":false"));
    }
}
