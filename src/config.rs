use crate::error::{Result, SetupError};
use crate::roles;
use crate::vars::{self, VariableMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LAYOUT: &str = include_str!("../templates/defaults.yaml");
pub const DEFAULT_TOOL_CONFIG: &str = "rootstrap.toml";

/// Settings of the tool itself, read from `rootstrap.toml`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ToolConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_operation_period")]
    pub operation_period_secs: u64,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Directory holding `<template>.yaml` files that replace the built-in ones.
    #[serde(default)]
    pub template_dir: Option<String>,
    #[serde(default = "default_setup_file")]
    pub setup_file: String,
}

fn default_request_timeout() -> u64 { 30 }
fn default_operation_period() -> u64 { 5 }
fn default_operation_timeout() -> u64 { 60 }
fn default_setup_file() -> String { "setup.yaml".to_string() }

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            operation_period_secs: default_operation_period(),
            operation_timeout_secs: default_operation_timeout(),
            template_dir: None,
            setup_file: default_setup_file(),
        }
    }
}

impl ToolConfig {
    /// Reads `path` when given (it must exist), else `rootstrap.toml` in the
    /// current directory when present, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_TOOL_CONFIG);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = fs::read_to_string(&path)
            .map_err(|e| SetupError::Config(format!("failed to read config file '{}': {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| SetupError::Config(format!("invalid config file '{}': {}", path.display(), e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_period(&self) -> Duration {
        Duration::from_secs(self.operation_period_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// The organization-specific input, read from the setup YAML file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Setup {
    /// Numeric id, with or without the `organizations/` prefix.
    pub organization: String,
    pub billing_account: String,
    pub ext_admin_user: String,
    pub groups: Groups,
    #[serde(default)]
    pub terraform_organization: Option<String>,
    #[serde(default)]
    pub terraform_workspace_project: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Groups {
    pub finops_group: String,
    pub admins_group: String,
    pub policy_group: String,
    pub executive_group: String,
}

pub type SetupParseError = serde_path_to_error::Error<serde_yaml::Error>;

impl Setup {
    /// Parses setup YAML; the error carries the path of the offending field.
    pub fn parse(content: &str) -> std::result::Result<Self, SetupParseError> {
        let deserializer = serde_yaml::Deserializer::from_str(content);
        serde_path_to_error::deserialize(deserializer)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SetupError::Config(format!("failed to read setup file '{}': {}", path.display(), e)))?;
        Self::parse(&content).map_err(|e| setup_error(path, &e))
    }

    /// Numeric organization id.
    pub fn organization_id(&self) -> &str {
        self.organization.trim_start_matches("organizations/")
    }

    /// `organizations/<id>`.
    pub fn organization_name(&self) -> String {
        format!("organizations/{}", self.organization_id())
    }
}

pub fn setup_error(path: &Path, error: &SetupParseError) -> SetupError {
    let at = error.path().to_string();
    if at.is_empty() || at == "." {
        SetupError::Config(format!("{}: {}", path.display(), error.inner()))
    } else {
        SetupError::Config(format!("{}: at '{}': {}", path.display(), at, error.inner()))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub root_project: RootProjectLayout,
    pub organization_pool: PoolLayout,
    pub terraform_provider: ProviderLayout,
    pub builder_account: AccountLayout,
    pub workspace_folder: FolderLayout,
    pub root_tag: TagLayout,
    pub credentials_variable_set: VariableSetLayout,
    pub organization_variable_set: VariableSetLayout,
    pub executive_role: RoleLayout,
    pub builder_role: RoleLayout,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RootProjectLayout {
    pub display_name: String,
    /// Project id to create; empty means [`root_project_id`].
    #[serde(default)]
    pub id: String,
    pub services: Vec<String>,
}

impl RootProjectLayout {
    pub fn project_id(&self, organization: &str) -> String {
        match self.id.trim() {
            "" => root_project_id(&self.display_name, organization),
            id => id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolLayout {
    pub id: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLayout {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub issuer_uri: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountLayout {
    pub id: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FolderLayout {
    pub display_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagLayout {
    pub key: String,
    pub description: String,
    pub value: String,
    pub value_description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableSetLayout {
    pub name: String,
    pub description: String,
    /// Google Cloud region handed to the workspaces.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleLayout {
    pub id: String,
    pub title: String,
    pub description: String,
    pub stage: String,
}

impl Layout {
    /// Built-in layout, overridden key by key from `overrides` when given.
    pub fn load(overrides: Option<&Path>) -> Result<Self> {
        let mut layout: serde_yaml::Value = serde_yaml::from_str(DEFAULT_LAYOUT)?;
        if let Some(path) = overrides {
            let content = fs::read_to_string(path).map_err(|e| {
                SetupError::Config(format!("failed to read overrides file '{}': {}", path.display(), e))
            })?;
            let update: serde_yaml::Value = serde_yaml::from_str(&content)
                .map_err(|e| SetupError::Config(format!("{}: {}", path.display(), e)))?;
            override_values(&mut layout, &update);
        }
        serde_path_to_error::deserialize(layout)
            .map_err(|e: serde_path_to_error::Error<serde_yaml::Error>| {
                SetupError::Config(format!("invalid layout at '{}': {}", e.path(), e.inner()))
            })
    }
}

/// Replaces entries of `base` by those of `update`, mapping by mapping.
/// Keys unknown to `base` are ignored.
pub fn override_values(base: &mut serde_yaml::Value, update: &serde_yaml::Value) {
    let (Some(base), Some(update)) = (base.as_mapping_mut(), update.as_mapping()) else {
        return;
    };
    for (key, value) in base.iter_mut() {
        let Some(replacement) = update.get(key) else {
            continue;
        };
        if value.is_mapping() && replacement.is_mapping() {
            override_values(value, replacement);
        } else {
            *value = replacement.clone();
        }
    }
}

/// `<display name>-<first 6 hex digits of sha256(organization)>`, stable
/// for a given organization.
pub fn root_project_id(display_name: &str, organization: &str) -> String {
    let digest = Sha256::digest(organization.as_bytes());
    let hex = hex::encode(digest);
    format!("{}-{}", display_name, &hex[..6])
}

/// Values that must come from the environment, a flag or the setup file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prerequisites {
    pub organization_domain: Option<String>,
    pub tfc_organization: Option<String>,
    pub tfc_workspace_project: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPrerequisites {
    pub organization_domain: String,
    pub tfc_organization: String,
    pub tfc_workspace_project: String,
}

impl Prerequisites {
    /// Fills the Terraform values from the setup file where unset, then fails
    /// with every name still missing.
    pub fn resolve(self, setup: &Setup) -> Result<ResolvedPrerequisites> {
        fn present(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        let domain = present(self.organization_domain);
        let tfc_org = present(self.tfc_organization).or_else(|| present(setup.terraform_organization.clone()));
        let tfc_project =
            present(self.tfc_workspace_project).or_else(|| present(setup.terraform_workspace_project.clone()));

        let mut missing = Vec::new();
        if domain.is_none() {
            missing.push(vars::ORGANIZATION_DOMAIN.to_string());
        }
        if tfc_org.is_none() {
            missing.push(vars::TFC_ORGANIZATION.to_string());
        }
        if tfc_project.is_none() {
            missing.push(vars::TFC_WORKSPACE_PROJECT.to_string());
        }
        match (domain, tfc_org, tfc_project) {
            (Some(organization_domain), Some(tfc_organization), Some(tfc_workspace_project)) => {
                Ok(ResolvedPrerequisites { organization_domain, tfc_organization, tfc_workspace_project })
            }
            _ => Err(SetupError::MissingPrerequisite { names: missing }),
        }
    }
}

/// Initial variables of a run, before any step output.
pub fn variables(setup: &Setup, layout: &Layout, prerequisites: &ResolvedPrerequisites) -> VariableMap {
    let org = setup.organization_name();
    let services: Vec<Value> = layout.root_project.services.iter().cloned().map(Value::String).collect();
    VariableMap::new()
        .with(vars::ORGANIZATION, org.clone())
        .with(vars::ORGANIZATION_ID, setup.organization_id())
        .with(vars::ORGANIZATION_DOMAIN, prerequisites.organization_domain.clone())
        .with(vars::BILLING_ACCOUNT, setup.billing_account.trim_start_matches("billingAccounts/"))
        .with(vars::EXT_ADMIN_USER, setup.ext_admin_user.clone())
        .with(vars::FINOPS_GROUP, setup.groups.finops_group.clone())
        .with(vars::ADMINS_GROUP, setup.groups.admins_group.clone())
        .with(vars::POLICY_GROUP, setup.groups.policy_group.clone())
        .with(vars::EXECUTIVE_GROUP, setup.groups.executive_group.clone())
        .with(vars::TFC_ORGANIZATION, prerequisites.tfc_organization.clone())
        .with(vars::TFC_WORKSPACE_PROJECT, prerequisites.tfc_workspace_project.clone())
        .with(vars::ROOT_PROJECT_NAME, layout.root_project.display_name.clone())
        .with(vars::ROOT_PROJECT_ID, layout.root_project.project_id(&org))
        .with(vars::ROOT_SERVICES, Value::Array(services))
        .with(vars::POOL_ID, layout.organization_pool.id.clone())
        .with(vars::POOL_DISPLAY_NAME, layout.organization_pool.display_name.clone())
        .with(vars::POOL_DESCRIPTION, layout.organization_pool.description.clone())
        .with(vars::PROVIDER_ID, layout.terraform_provider.id.clone())
        .with(vars::PROVIDER_DISPLAY_NAME, layout.terraform_provider.display_name.clone())
        .with(vars::PROVIDER_DESCRIPTION, layout.terraform_provider.description.clone())
        .with(vars::PROVIDER_ISSUER, layout.terraform_provider.issuer_uri.clone())
        .with(vars::BUILDER_ACCOUNT_ID, layout.builder_account.id.clone())
        .with(vars::BUILDER_DISPLAY_NAME, layout.builder_account.display_name.clone())
        .with(vars::BUILDER_DESCRIPTION, layout.builder_account.description.clone())
        .with(vars::FOLDER_DISPLAY_NAME, layout.workspace_folder.display_name.clone())
        .with(vars::ROOT_TAG_KEY, layout.root_tag.key.clone())
        .with(vars::ROOT_TAG_DESCRIPTION, layout.root_tag.description.clone())
        .with(vars::ROOT_TAG_VALUE, layout.root_tag.value.clone())
        .with(vars::ROOT_TAG_VALUE_DESCRIPTION, layout.root_tag.value_description.clone())
        .with(vars::EXECUTIVE_ROLE, roles::role_name(&org, &layout.executive_role.id))
        .with(vars::BUILDER_ROLE, roles::role_name(&org, &layout.builder_role.id))
        .with(vars::TFC_REGION, layout.organization_variable_set.region.clone().unwrap_or_default())
}
