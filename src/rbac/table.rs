//! Static role tables.
//!
//! Built once at startup and shared behind an `Arc`; nothing mutates it after
//! construction.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::permissions::{
    AdminAction, AnalyticsAction, ClientAction, FindingAction, FlowAction, Module, Permission,
    ProjectAction, ReportsAction, ResourceAction, SecureAction, TaskAction, UserAction,
};
use crate::models::{ProjectType, Role};

/// What a role holds inside one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Every action of the module.
    All,
    Only(BTreeSet<Permission>),
}

impl Grant {
    fn covers(&self, permission: &Permission) -> bool {
        match self {
            Grant::All => true,
            Grant::Only(set) => set.contains(permission),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionTable {
    modules: HashMap<Role, HashMap<Module, Grant>>,
    resources: HashMap<ResourceAction, HashSet<Role>>,
}

fn only<I: IntoIterator<Item = Permission>>(permissions: I) -> Grant {
    Grant::Only(permissions.into_iter().collect())
}

impl PermissionTable {
    /// The platform's role matrix.
    pub fn standard() -> Self {
        use Role::*;

        let mut modules: HashMap<Role, HashMap<Module, Grant>> = HashMap::new();

        modules.insert(
            SuperAdmin,
            Module::ALL.iter().map(|m| (*m, Grant::All)).collect(),
        );

        modules.insert(
            Admin,
            HashMap::from([
                (
                    Module::Admin,
                    only(AdminAction::ALL.iter().copied().map(Permission::Admin)),
                ),
                (
                    Module::Secure,
                    only([
                        Permission::Secure(SecureAction::ViewAllProjects),
                        Permission::Secure(SecureAction::ViewFindings),
                        Permission::Secure(SecureAction::CreateFinding),
                        Permission::Secure(SecureAction::EditFinding),
                    ]),
                ),
                (
                    Module::Flow,
                    only([
                        Permission::Flow(FlowAction::ViewAllProjects),
                        Permission::Flow(FlowAction::ViewTasks),
                        Permission::Flow(FlowAction::CreateTask),
                        Permission::Flow(FlowAction::EditTask),
                    ]),
                ),
                (
                    Module::Client,
                    only([Permission::Client(ClientAction::ViewAssignedProjects)]),
                ),
                (
                    Module::Analytics,
                    only([
                        Permission::Analytics(AnalyticsAction::ViewAllAnalytics),
                        Permission::Analytics(AnalyticsAction::ExportReports),
                    ]),
                ),
                (
                    Module::Reports,
                    only([
                        Permission::Reports(ReportsAction::GenerateReports),
                        Permission::Reports(ReportsAction::ViewReports),
                    ]),
                ),
            ]),
        );

        modules.insert(
            Pentester,
            HashMap::from([
                (
                    Module::Secure,
                    only([
                        Permission::Secure(SecureAction::ViewAssignedProjects),
                        Permission::Secure(SecureAction::ViewFindings),
                        Permission::Secure(SecureAction::CreateFinding),
                        Permission::Secure(SecureAction::EditFinding),
                        Permission::Secure(SecureAction::DeleteFinding),
                    ]),
                ),
                (
                    Module::Reports,
                    only([
                        Permission::Reports(ReportsAction::GenerateSecurityReports),
                        Permission::Reports(ReportsAction::ViewSecurityReports),
                    ]),
                ),
                (
                    Module::Analytics,
                    only([Permission::Analytics(AnalyticsAction::ViewSecurityAnalytics)]),
                ),
            ]),
        );

        modules.insert(
            Developer,
            HashMap::from([
                (
                    Module::Flow,
                    only([
                        Permission::Flow(FlowAction::ViewAssignedProjects),
                        Permission::Flow(FlowAction::ViewTasks),
                        Permission::Flow(FlowAction::CreateTask),
                        Permission::Flow(FlowAction::EditTask),
                        Permission::Flow(FlowAction::UpdateTaskStatus),
                    ]),
                ),
                (
                    Module::Analytics,
                    only([Permission::Analytics(AnalyticsAction::ViewDevelopmentAnalytics)]),
                ),
            ]),
        );

        modules.insert(
            Client,
            HashMap::from([
                (
                    Module::Client,
                    only([
                        Permission::Client(ClientAction::ViewAssignedProjects),
                        Permission::Client(ClientAction::ViewProjectStatus),
                    ]),
                ),
                (
                    Module::Reports,
                    only([Permission::Reports(ReportsAction::ViewClientReports)]),
                ),
            ]),
        );

        let roles = |list: &[Role]| list.iter().copied().collect::<HashSet<Role>>();
        let admins = [SuperAdmin, Admin];
        let security = [SuperAdmin, Admin, Pentester];
        let engineering = [SuperAdmin, Admin, Developer];

        let resources = HashMap::from([
            (
                ResourceAction::Project(ProjectAction::View),
                roles(&[SuperAdmin, Admin, Pentester, Developer, Client]),
            ),
            (ResourceAction::Project(ProjectAction::Edit), roles(&admins)),
            (ResourceAction::Project(ProjectAction::Delete), roles(&[SuperAdmin])),
            (ResourceAction::Project(ProjectAction::AssignUsers), roles(&admins)),
            (
                ResourceAction::Finding(FindingAction::View),
                roles(&[SuperAdmin, Admin, Pentester, Client]),
            ),
            (ResourceAction::Finding(FindingAction::Create), roles(&security)),
            (ResourceAction::Finding(FindingAction::Edit), roles(&security)),
            (ResourceAction::Finding(FindingAction::Delete), roles(&security)),
            (ResourceAction::Task(TaskAction::View), roles(&engineering)),
            (ResourceAction::Task(TaskAction::Create), roles(&engineering)),
            (ResourceAction::Task(TaskAction::Edit), roles(&engineering)),
            (ResourceAction::Task(TaskAction::Delete), roles(&admins)),
            (ResourceAction::User(UserAction::View), roles(&admins)),
            (ResourceAction::User(UserAction::Create), roles(&admins)),
            (ResourceAction::User(UserAction::Edit), roles(&admins)),
            (ResourceAction::User(UserAction::Delete), roles(&[SuperAdmin])),
        ]);

        Self { modules, resources }
    }

    /// Whether `role` holds `permission` through an explicit or wildcard grant.
    pub fn allows(&self, role: Role, permission: Permission) -> bool {
        self.modules
            .get(&role)
            .and_then(|grants| grants.get(&permission.module()))
            .map(|grant| grant.covers(&permission))
            .unwrap_or(false)
    }

    /// Whether `role` is in the role set of `action`.
    pub fn role_may(&self, role: Role, action: ResourceAction) -> bool {
        self.resources
            .get(&action)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }

    /// Roles allowed to perform `action`, in declaration order.
    pub fn roles_for(&self, action: ResourceAction) -> Vec<Role> {
        Role::ALL
            .iter()
            .copied()
            .filter(|role| self.role_may(*role, action))
            .collect()
    }

    /// Module grants of `role` as action names; a wildcard is reported as `*`.
    pub fn grants_for(&self, role: Role) -> BTreeMap<Module, Vec<&'static str>> {
        let Some(grants) = self.modules.get(&role) else {
            return BTreeMap::new();
        };
        grants
            .iter()
            .map(|(module, grant)| {
                let actions = match grant {
                    Grant::All => vec!["*"],
                    Grant::Only(set) => set.iter().map(|p| p.action()).collect(),
                };
                (*module, actions)
            })
            .collect()
    }

    /// Admins may open any kind of project; pentesters and developers only
    /// the kind they work on.
    pub fn can_create_project(&self, role: Role, project_type: ProjectType) -> bool {
        match role {
            Role::SuperAdmin | Role::Admin => true,
            Role::Pentester => project_type == ProjectType::Pentest,
            Role::Developer => project_type == ProjectType::Development,
            Role::Client => false,
        }
    }
}
