//! Module permissions and resource actions as closed enumerations.
//!
//! A [`Permission`] pairs a dashboard module with one of that module's own
//! actions, and a [`ResourceAction`] pairs a resource type with one of its own
//! actions, so an action can never be attached to a module or resource it
//! does not belong to.

use serde::{Serialize, Serializer};

use crate::models::{label_enum, UnknownLabel};

label_enum! {
    /// Dashboard areas with their own permission sets.
    Module as "module" {
        Admin => "admin",
        Secure => "secure",
        Flow => "flow",
        Client => "client",
        Analytics => "analytics",
        Reports => "reports",
    }
}

label_enum! {
    AdminAction as "admin action" {
        ViewUsers => "view_users",
        CreateUser => "create_user",
        EditUser => "edit_user",
        DeleteUser => "delete_user",
        ViewProjects => "view_projects",
        CreateProject => "create_project",
        EditProject => "edit_project",
        AssignUsers => "assign_users",
    }
}

label_enum! {
    SecureAction as "secure action" {
        ViewAllProjects => "view_all_projects",
        ViewAssignedProjects => "view_assigned_projects",
        ViewFindings => "view_findings",
        CreateFinding => "create_finding",
        EditFinding => "edit_finding",
        DeleteFinding => "delete_finding",
    }
}

label_enum! {
    FlowAction as "flow action" {
        ViewAllProjects => "view_all_projects",
        ViewAssignedProjects => "view_assigned_projects",
        ViewTasks => "view_tasks",
        CreateTask => "create_task",
        EditTask => "edit_task",
        UpdateTaskStatus => "update_task_status",
    }
}

label_enum! {
    ClientAction as "client action" {
        ViewAssignedProjects => "view_assigned_projects",
        ViewProjectStatus => "view_project_status",
    }
}

label_enum! {
    AnalyticsAction as "analytics action" {
        ViewAllAnalytics => "view_all_analytics",
        ExportReports => "export_reports",
        ViewSecurityAnalytics => "view_security_analytics",
        ViewDevelopmentAnalytics => "view_development_analytics",
    }
}

label_enum! {
    ReportsAction as "reports action" {
        GenerateReports => "generate_reports",
        ViewReports => "view_reports",
        GenerateSecurityReports => "generate_security_reports",
        ViewSecurityReports => "view_security_reports",
        ViewClientReports => "view_client_reports",
    }
}

/// A module-scoped action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    Admin(AdminAction),
    Secure(SecureAction),
    Flow(FlowAction),
    Client(ClientAction),
    Analytics(AnalyticsAction),
    Reports(ReportsAction),
}

impl Permission {
    pub fn module(&self) -> Module {
        match self {
            Self::Admin(_) => Module::Admin,
            Self::Secure(_) => Module::Secure,
            Self::Flow(_) => Module::Flow,
            Self::Client(_) => Module::Client,
            Self::Analytics(_) => Module::Analytics,
            Self::Reports(_) => Module::Reports,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Admin(a) => a.as_str(),
            Self::Secure(a) => a.as_str(),
            Self::Flow(a) => a.as_str(),
            Self::Client(a) => a.as_str(),
            Self::Analytics(a) => a.as_str(),
            Self::Reports(a) => a.as_str(),
        }
    }

    /// Parse a (module, action) pair; the action must belong to the module.
    pub fn parse(module: &str, action: &str) -> Result<Self, UnknownLabel> {
        Ok(match module.parse::<Module>()? {
            Module::Admin => Self::Admin(action.parse()?),
            Module::Secure => Self::Secure(action.parse()?),
            Module::Flow => Self::Flow(action.parse()?),
            Module::Client => Self::Client(action.parse()?),
            Module::Analytics => Self::Analytics(action.parse()?),
            Module::Reports => Self::Reports(action.parse()?),
        })
    }

    /// Every action of `module`.
    pub fn all_in(module: Module) -> Vec<Permission> {
        match module {
            Module::Admin => AdminAction::ALL.iter().copied().map(Self::Admin).collect(),
            Module::Secure => SecureAction::ALL.iter().copied().map(Self::Secure).collect(),
            Module::Flow => FlowAction::ALL.iter().copied().map(Self::Flow).collect(),
            Module::Client => ClientAction::ALL.iter().copied().map(Self::Client).collect(),
            Module::Analytics => AnalyticsAction::ALL.iter().copied().map(Self::Analytics).collect(),
            Module::Reports => ReportsAction::ALL.iter().copied().map(Self::Reports).collect(),
        }
    }

    pub fn all() -> Vec<Permission> {
        Module::ALL.iter().flat_map(|m| Self::all_in(*m)).collect()
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module(), self.action())
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

label_enum! {
    /// Entities with resource-level permissions.
    ResourceType as "resource type" {
        Project => "project",
        Finding => "finding",
        Task => "task",
        User => "user",
    }
}

label_enum! {
    ProjectAction as "project action" {
        View => "view",
        Edit => "edit",
        Delete => "delete",
        AssignUsers => "assign_users",
    }
}

label_enum! {
    FindingAction as "finding action" {
        View => "view",
        Create => "create",
        Edit => "edit",
        Delete => "delete",
    }
}

label_enum! {
    TaskAction as "task action" {
        View => "view",
        Create => "create",
        Edit => "edit",
        Delete => "delete",
    }
}

label_enum! {
    UserAction as "user action" {
        View => "view",
        Create => "create",
        Edit => "edit",
        Delete => "delete",
    }
}

/// An action on a specific kind of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceAction {
    Project(ProjectAction),
    Finding(FindingAction),
    Task(TaskAction),
    User(UserAction),
}

impl ResourceAction {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Project(_) => ResourceType::Project,
            Self::Finding(_) => ResourceType::Finding,
            Self::Task(_) => ResourceType::Task,
            Self::User(_) => ResourceType::User,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Project(a) => a.as_str(),
            Self::Finding(a) => a.as_str(),
            Self::Task(a) => a.as_str(),
            Self::User(a) => a.as_str(),
        }
    }

    pub fn parse(resource_type: &str, action: &str) -> Result<Self, UnknownLabel> {
        Ok(match resource_type.parse::<ResourceType>()? {
            ResourceType::Project => Self::Project(action.parse()?),
            ResourceType::Finding => Self::Finding(action.parse()?),
            ResourceType::Task => Self::Task(action.parse()?),
            ResourceType::User => Self::User(action.parse()?),
        })
    }

    pub fn all() -> Vec<ResourceAction> {
        let mut all: Vec<ResourceAction> = ProjectAction::ALL.iter().copied().map(Self::Project).collect();
        all.extend(FindingAction::ALL.iter().copied().map(Self::Finding));
        all.extend(TaskAction::ALL.iter().copied().map(Self::Task));
        all.extend(UserAction::ALL.iter().copied().map(Self::User));
        all
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type(), self.action())
    }
}
