//! Permissions of the two organization custom roles.

use crate::config::RoleLayout;
use crate::vars::{self, VariableMap};
use serde_json::Value;

/// Manages the root structure: folders, projects, IAM and tags of the organization.
pub const EXECUTIVE_PERMISSIONS: &[&str] = &[
    "billing.accounts.get",
    "billing.accounts.getIamPolicy",
    "billing.accounts.list",
    "billing.resourceAssociations.create",
    "iam.roles.get",
    "iam.roles.list",
    "iam.serviceAccounts.get",
    "iam.serviceAccounts.getIamPolicy",
    "iam.serviceAccounts.list",
    "iam.workloadIdentityPoolProviders.get",
    "iam.workloadIdentityPoolProviders.list",
    "iam.workloadIdentityPools.get",
    "iam.workloadIdentityPools.list",
    "resourcemanager.folders.get",
    "resourcemanager.folders.getIamPolicy",
    "resourcemanager.folders.list",
    "resourcemanager.organizations.get",
    "resourcemanager.organizations.getIamPolicy",
    "resourcemanager.projects.get",
    "resourcemanager.projects.getIamPolicy",
    "resourcemanager.projects.list",
    "resourcemanager.tagKeys.get",
    "resourcemanager.tagKeys.list",
    "resourcemanager.tagValues.get",
    "resourcemanager.tagValues.list",
    "serviceusage.services.get",
    "serviceusage.services.list",
];

/// Granted to the builder account on the workspaces folder.
pub const BUILDER_PERMISSIONS: &[&str] = &[
    "billing.resourceAssociations.create",
    "iam.serviceAccounts.create",
    "iam.serviceAccounts.get",
    "iam.serviceAccounts.getIamPolicy",
    "iam.serviceAccounts.list",
    "iam.serviceAccounts.setIamPolicy",
    "iam.serviceAccounts.update",
    "resourcemanager.folders.create",
    "resourcemanager.folders.get",
    "resourcemanager.folders.getIamPolicy",
    "resourcemanager.folders.list",
    "resourcemanager.folders.setIamPolicy",
    "resourcemanager.folders.update",
    "resourcemanager.hierarchyNodes.createTagBinding",
    "resourcemanager.hierarchyNodes.listTagBindings",
    "resourcemanager.projects.create",
    "resourcemanager.projects.get",
    "resourcemanager.projects.getIamPolicy",
    "resourcemanager.projects.list",
    "resourcemanager.projects.setIamPolicy",
    "resourcemanager.projects.update",
    "resourcemanager.tagValueBindings.create",
    "resourcemanager.tagValues.get",
    "resourcemanager.tagValues.list",
    "serviceusage.services.enable",
    "serviceusage.services.get",
    "serviceusage.services.list",
];

/// `organizations/<id>/roles/<role id>`.
pub fn role_name(organization: &str, role_id: &str) -> String {
    format!("{}/roles/{}", organization, role_id)
}

/// Variables rendering the `role` template for one role.
pub fn role_variables(base: &VariableMap, layout: &RoleLayout, permissions: &[&str]) -> VariableMap {
    let permissions: Vec<Value> = permissions.iter().map(|p| Value::String((*p).to_string())).collect();
    base.clone()
        .with(vars::ROLE_ID, layout.id.clone())
        .with(vars::ROLE_TITLE, layout.title.clone())
        .with(vars::ROLE_DESCRIPTION, layout.description.clone())
        .with(vars::ROLE_STAGE, layout.stage.clone())
        .with(vars::ROLE_PERMISSIONS, Value::Array(permissions))
}
