//! Terraform Cloud variable sets handing the root structure to the workspaces.

use crate::config::VariableSetLayout;
use crate::error::{Result, SetupError};
use crate::vars::{self, VariableMap};
use serde_json::Value;

/// Where the value of a variable comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A run variable, such as a step output.
    Variable(&'static str),
    Literal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableSpec {
    pub key: &'static str,
    /// `terraform` or `env`.
    pub category: &'static str,
    pub sensitive: bool,
    pub source: Source,
    pub description: &'static str,
}

/// Dynamic provider credentials, attached to the workspaces project.
pub const CREDENTIAL_VARIABLES: &[VariableSpec] = &[
    VariableSpec {
        key: "project",
        category: "terraform",
        sensitive: true,
        source: Source::Variable(vars::PROJECT_ID),
        description: "The ID of the root project for the organization. Used to create workspaces.",
    },
    VariableSpec {
        key: "TFC_GCP_WORKLOAD_PROVIDER_NAME",
        category: "env",
        sensitive: false,
        source: Source::Variable(vars::WRK_ID_PROVIDER),
        description: "The canonical name of the workload identity provider.",
    },
    VariableSpec {
        key: "TFC_GCP_WORKLOAD_IDENTITY_AUDIENCE",
        category: "env",
        sensitive: false,
        source: Source::Variable(vars::PROVIDER_AUDIENCE),
        description: "Will be used as the aud claim for the identity token.",
    },
    VariableSpec {
        key: "TFC_GCP_PROVIDER_AUTH",
        category: "env",
        sensitive: false,
        source: Source::Literal("true"),
        description: "Must be present and set to true, or Terraform Cloud will not attempt to use dynamic credentials to authenticate to GCP.",
    },
    VariableSpec {
        key: "TFC_GCP_RUN_SERVICE_ACCOUNT_EMAIL",
        category: "env",
        sensitive: true,
        source: Source::Variable(vars::BUILDER_EMAIL),
        description: "The service account email Terraform Cloud will use when authenticating to GCP.",
    },
];

/// Organization-wide values, applied to every workspace.
pub const ORGANIZATION_VARIABLES: &[VariableSpec] = &[
    VariableSpec {
        key: "billing_account",
        category: "terraform",
        sensitive: true,
        source: Source::Variable(vars::BILLING_ACCOUNT),
        description: "The ID of the billing account used for the workspaces.",
    },
    VariableSpec {
        key: "organization",
        category: "terraform",
        sensitive: false,
        source: Source::Variable(vars::ORGANIZATION_DOMAIN),
        description: "Name or domain of the organization hosting the workspace.",
    },
    VariableSpec {
        key: "region",
        category: "terraform",
        sensitive: false,
        source: Source::Variable(vars::TFC_REGION),
        description: "Geographical region for Google Cloud Platform.",
    },
    VariableSpec {
        key: "workspaces_folder",
        category: "terraform",
        sensitive: false,
        source: Source::Variable(vars::FOLDER_ID),
        description: "The ID of the workspaces folder that contains all subsequent workspaces.",
    },
];

/// Variables rendering the `variable_set` template.
pub fn set_variables(base: &VariableMap, layout: &VariableSetLayout, global: bool, projects: Vec<String>) -> VariableMap {
    let projects: Vec<Value> = projects.into_iter().map(Value::String).collect();
    base.clone()
        .with(vars::VARIABLE_SET_NAME, layout.name.clone())
        .with(vars::VARIABLE_SET_DESCRIPTION, layout.description.clone())
        .with(vars::VARIABLE_SET_GLOBAL, global)
        .with(vars::VARIABLE_SET_PROJECTS, Value::Array(projects))
}

/// Variables rendering the `variable` template for one entry of `set`.
pub fn variable_variables(base: &VariableMap, set: &str, spec: &VariableSpec) -> Result<VariableMap> {
    let value = match spec.source {
        Source::Literal(text) => text.to_string(),
        Source::Variable(name) => base.get_str(name).filter(|v| !v.is_empty()).ok_or_else(|| {
            SetupError::MissingVariable {
                template: format!("variable {}", spec.key),
                name: name.to_string(),
            }
        })?,
    };
    Ok(base
        .clone()
        .with(vars::VARIABLE_SET, set.to_string())
        .with(vars::VARIABLE_KEY, spec.key)
        .with(vars::VARIABLE_VALUE, value)
        .with(vars::VARIABLE_CATEGORY, spec.category)
        .with(vars::VARIABLE_SENSITIVE, spec.sensitive)
        .with(vars::VARIABLE_DESCRIPTION, spec.description))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn keys_are_unique_per_set() {
        for set in [CREDENTIAL_VARIABLES, ORGANIZATION_VARIABLES] {
            let keys: BTreeSet<&str> = set.iter().map(|s| s.key).collect();
            assert_eq!(keys.len(), set.len());
            assert!(set.iter().all(|s| s.category == "env" || s.category == "terraform"));
        }
    }

    #[test]
    fn values_come_from_run_variables_or_literals() {
        let base = VariableMap::new().with(vars::BUILDER_EMAIL, "builder@root-1.iam.gserviceaccount.com");
        let email = CREDENTIAL_VARIABLES.iter().find(|s| s.key == "TFC_GCP_RUN_SERVICE_ACCOUNT_EMAIL").unwrap();
        let rendered = variable_variables(&base, "varsets/varset-1", email).unwrap();
        assert_eq!(rendered.get_str(vars::VARIABLE_VALUE).as_deref(), Some("builder@root-1.iam.gserviceaccount.com"));
        assert_eq!(rendered.get(vars::VARIABLE_SENSITIVE), Some(&Value::Bool(true)));
        assert_eq!(rendered.get_str(vars::VARIABLE_SET).as_deref(), Some("varsets/varset-1"));

        let auth = CREDENTIAL_VARIABLES.iter().find(|s| s.key == "TFC_GCP_PROVIDER_AUTH").unwrap();
        let rendered = variable_variables(&VariableMap::new(), "varsets/varset-1", auth).unwrap();
        assert_eq!(rendered.get_str(vars::VARIABLE_VALUE).as_deref(), Some("true"));
    }

    #[test]
    fn missing_source_names_the_variable() {
        let folder = ORGANIZATION_VARIABLES.iter().find(|s| s.key == "workspaces_folder").unwrap();
        let err = variable_variables(&VariableMap::new(), "varsets/varset-2", folder).unwrap_err();
        assert!(matches!(err, SetupError::MissingVariable { ref name, .. } if name == vars::FOLDER_ID));
    }

    #[test]
    fn set_variables_type_the_flags() {
        let layout = VariableSetLayout { name: "gcp-organization".into(), description: "d".into(), region: None };
        let rendered = set_variables(&VariableMap::new(), &layout, true, Vec::new());
        assert_eq!(rendered.get(vars::VARIABLE_SET_GLOBAL), Some(&Value::Bool(true)));
        assert_eq!(rendered.get(vars::VARIABLE_SET_PROJECTS), Some(&Value::Array(Vec::new())));
    }
}
