use serde_json::Value;
use std::collections::BTreeMap;

// Placeholder names shared by the templates and the pipelines.
pub const ETAG: &str = "ETAG";
pub const ORGANIZATION: &str = "ORGANIZATION";
pub const ORGANIZATION_ID: &str = "ORGANIZATION_ID";
pub const ORGANIZATION_DOMAIN: &str = "ORGANIZATION_DOMAIN";
pub const BILLING_ACCOUNT: &str = "BILLING_ACCOUNT";
pub const EXT_ADMIN_USER: &str = "EXT_ADMIN_USER";
pub const FINOPS_GROUP: &str = "FINOPS_GROUP";
pub const ADMINS_GROUP: &str = "ADMINS_GROUP";
pub const POLICY_GROUP: &str = "POLICY_GROUP";
pub const EXECUTIVE_GROUP: &str = "EXECUTIVE_GROUP";
pub const TFC_ORGANIZATION: &str = "TFC_ORGANIZATION";
pub const TFC_WORKSPACE_PROJECT: &str = "TFC_WORKSPACE_PROJECT";
pub const ROOT_PROJECT_ID: &str = "ROOT_PROJECT_ID";
pub const ROOT_PROJECT_NAME: &str = "ROOT_PROJECT_NAME";
pub const ROOT_SERVICES: &str = "ROOT_SERVICES";
pub const PROJECT_ID: &str = "PROJECT_ID";
pub const PROJECT_NAME: &str = "PROJECT_NAME";
pub const PROJECT_NUMBER: &str = "PROJECT_NUMBER";
pub const POOL_ID: &str = "POOL_ID";
pub const POOL_DISPLAY_NAME: &str = "POOL_DISPLAY_NAME";
pub const POOL_DESCRIPTION: &str = "POOL_DESCRIPTION";
pub const WRK_ID_POOL: &str = "WRK_ID_POOL";
pub const PROVIDER_ID: &str = "PROVIDER_ID";
pub const PROVIDER_DISPLAY_NAME: &str = "PROVIDER_DISPLAY_NAME";
pub const PROVIDER_DESCRIPTION: &str = "PROVIDER_DESCRIPTION";
pub const PROVIDER_ISSUER: &str = "PROVIDER_ISSUER";
pub const WRK_ID_PROVIDER: &str = "WRK_ID_PROVIDER";
pub const PROVIDER_AUDIENCE: &str = "PROVIDER_AUDIENCE";
pub const BUILDER_ACCOUNT_ID: &str = "BUILDER_ACCOUNT_ID";
pub const BUILDER_DISPLAY_NAME: &str = "BUILDER_DISPLAY_NAME";
pub const BUILDER_DESCRIPTION: &str = "BUILDER_DESCRIPTION";
pub const BUILDER_EMAIL: &str = "BUILDER_EMAIL";
pub const BUILDER_NAME: &str = "BUILDER_NAME";
pub const FOLDER_DISPLAY_NAME: &str = "FOLDER_DISPLAY_NAME";
pub const FOLDER_NAME: &str = "FOLDER_NAME";
pub const FOLDER_ID: &str = "FOLDER_ID";
pub const ROOT_TAG_KEY: &str = "ROOT_TAG_KEY";
pub const ROOT_TAG_DESCRIPTION: &str = "ROOT_TAG_DESCRIPTION";
pub const ROOT_TAG_VALUE: &str = "ROOT_TAG_VALUE";
pub const ROOT_TAG_VALUE_DESCRIPTION: &str = "ROOT_TAG_VALUE_DESCRIPTION";
pub const TAG_KEY_NAME: &str = "TAG_KEY_NAME";
pub const TAG_VALUE_NAME: &str = "TAG_VALUE_NAME";
pub const ROLE_ID: &str = "ROLE_ID";
pub const ROLE_TITLE: &str = "ROLE_TITLE";
pub const ROLE_DESCRIPTION: &str = "ROLE_DESCRIPTION";
pub const ROLE_STAGE: &str = "ROLE_STAGE";
pub const ROLE_PERMISSIONS: &str = "ROLE_PERMISSIONS";
pub const EXECUTIVE_ROLE: &str = "EXECUTIVE_ROLE";
pub const BUILDER_ROLE: &str = "BUILDER_ROLE";
pub const TFC_REGION: &str = "TFC_REGION";
pub const VARIABLE_SET: &str = "VARIABLE_SET";
pub const VARIABLE_SET_NAME: &str = "VARIABLE_SET_NAME";
pub const VARIABLE_SET_DESCRIPTION: &str = "VARIABLE_SET_DESCRIPTION";
pub const VARIABLE_SET_GLOBAL: &str = "VARIABLE_SET_GLOBAL";
pub const VARIABLE_SET_PROJECTS: &str = "VARIABLE_SET_PROJECTS";
pub const VARIABLE_KEY: &str = "VARIABLE_KEY";
pub const VARIABLE_VALUE: &str = "VARIABLE_VALUE";
pub const VARIABLE_CATEGORY: &str = "VARIABLE_CATEGORY";
pub const VARIABLE_SENSITIVE: &str = "VARIABLE_SENSITIVE";
pub const VARIABLE_DESCRIPTION: &str = "VARIABLE_DESCRIPTION";

/// Placeholder name to value, grown step by step during one run.
///
/// Values are typed: a placeholder standing alone in a template scalar is
/// replaced by the value itself, so lists and mappings can be injected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableMap {
    values: BTreeMap<String, Value>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder-style insert, returns the extended map.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String view of a variable; numbers and booleans are rendered as text.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.values.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Merges the outputs of a step; later values win.
    pub fn merge(&mut self, outputs: VariableMap) {
        self.values.extend(outputs.values);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for VariableMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = VariableMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_and_extends() {
        let mut vars = VariableMap::new().with(PROJECT_ID, "root-abc").with(PROJECT_NUMBER, "1");
        vars.merge(VariableMap::new().with(PROJECT_NUMBER, "42").with(BUILDER_EMAIL, "b@x"));
        assert_eq!(vars.get_str(PROJECT_NUMBER).as_deref(), Some("42"));
        assert_eq!(vars.get_str(BUILDER_EMAIL).as_deref(), Some("b@x"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn get_str_renders_scalars_only() {
        let vars: VariableMap = [
            ("N", json!(7)),
            ("B", json!(true)),
            ("L", json!(["a"])),
        ]
        .into_iter()
        .collect();
        assert_eq!(vars.get_str("N").as_deref(), Some("7"));
        assert_eq!(vars.get_str("B").as_deref(), Some("true"));
        assert_eq!(vars.get_str("L"), None);
        assert!(vars.contains("L"));
    }
}
