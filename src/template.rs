use crate::document::Document;
use crate::error::{Result, SetupError};
use crate::vars::VariableMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Templates shipped with the binary, one per reconciled resource.
const EMBEDDED: &[(&str, &str)] = &[
    ("project", include_str!("../templates/project.yaml")),
    ("billing", include_str!("../templates/billing.yaml")),
    ("project_services", include_str!("../templates/project_services.yaml")),
    ("project_iam", include_str!("../templates/project_iam.yaml")),
    ("pool", include_str!("../templates/pool.yaml")),
    ("provider", include_str!("../templates/provider.yaml")),
    ("service_account", include_str!("../templates/service_account.yaml")),
    ("account_iam", include_str!("../templates/account_iam.yaml")),
    ("folder", include_str!("../templates/folder.yaml")),
    ("folder_iam", include_str!("../templates/folder_iam.yaml")),
    ("tag_key", include_str!("../templates/tag_key.yaml")),
    ("tag_value", include_str!("../templates/tag_value.yaml")),
    ("tag_binding", include_str!("../templates/tag_binding.yaml")),
    ("org_iam", include_str!("../templates/org_iam.yaml")),
    ("org_iam_extension", include_str!("../templates/org_iam_extension.yaml")),
    ("role", include_str!("../templates/role.yaml")),
    ("variable_set", include_str!("../templates/variable_set.yaml")),
    ("variable", include_str!("../templates/variable.yaml")),
];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%([A-Z0-9_]+)%").expect("placeholder pattern is valid"))
}

/// A parsed template. Substitution works on the parsed tree, never on text,
/// so a variable value cannot alter the document structure.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    tree: Value,
}

impl Template {
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let name = name.into();
        let tree: Value = serde_yaml::from_str(text).map_err(|e| SetupError::MalformedTemplate {
            template: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { name, tree })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every placeholder name referenced in values or mapping keys.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        collect_placeholders(&self.tree, &mut names);
        names
    }

    pub fn render(&self, vars: &VariableMap) -> Result<Document> {
        self.substitute(&self.tree, vars)
    }

    fn substitute(&self, node: &Value, vars: &VariableMap) -> Result<Value> {
        match node {
            Value::String(s) => self.substitute_str(s, vars),
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(item, vars))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    let key = match self.substitute_str(key, vars)? {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(self.malformed(format!(
                                "mapping key '{}' cannot take the value {}",
                                key, other
                            )))
                        }
                    };
                    out.insert(key, self.substitute(value, vars)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn substitute_str(&self, text: &str, vars: &VariableMap) -> Result<Value> {
        let re = placeholder_regex();

        // A scalar made of exactly one placeholder takes the typed value.
        if let Some(caps) = re.captures(text) {
            if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                return Ok(self.lookup(&caps[1], vars)?.clone());
            }
        } else {
            return Ok(Value::String(text.to_string()));
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in re.captures_iter(text) {
            let whole = caps.get(0).ok_or_else(|| self.malformed("empty placeholder match"))?;
            out.push_str(&text[last..whole.start()]);
            match self.lookup(&caps[1], vars)? {
                Value::String(s) => out.push_str(s),
                Value::Number(n) => out.push_str(&n.to_string()),
                Value::Bool(b) => out.push_str(&b.to_string()),
                Value::Null => {}
                _ => {
                    return Err(self.malformed(format!(
                        "'%{}%' holds a list or mapping and cannot be embedded in \"{}\"",
                        &caps[1], text
                    )))
                }
            }
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(Value::String(out))
    }

    fn lookup<'v>(&self, name: &str, vars: &'v VariableMap) -> Result<&'v Value> {
        vars.get(name).ok_or_else(|| SetupError::MissingVariable {
            template: self.name.clone(),
            name: name.to_string(),
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> SetupError {
        SetupError::MalformedTemplate {
            template: self.name.clone(),
            reason: reason.into(),
        }
    }
}

fn collect_placeholders(node: &Value, names: &mut BTreeSet<String>) {
    let re = placeholder_regex();
    match node {
        Value::String(s) => names.extend(re.captures_iter(s).map(|c| c[1].to_string())),
        Value::Array(items) => items.iter().for_each(|item| collect_placeholders(item, names)),
        Value::Object(map) => {
            for (key, value) in map {
                names.extend(re.captures_iter(key).map(|c| c[1].to_string()));
                collect_placeholders(value, names);
            }
        }
        _ => {}
    }
}

/// The templates of one run: embedded defaults, each optionally replaced by
/// a file `<name>.yaml` in an override directory.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: BTreeMap<String, Template>,
}

impl TemplateSet {
    pub fn embedded() -> Result<Self> {
        Self::load(None)
    }

    pub fn load(override_dir: Option<&Path>) -> Result<Self> {
        let mut templates = BTreeMap::new();
        for (name, text) in EMBEDDED {
            let custom = override_dir.map(|dir| dir.join(format!("{}.yaml", name)));
            let template = match custom {
                Some(path) if path.is_file() => {
                    debug!(template = %name, path = %path.display(), "using template override");
                    let content = fs::read_to_string(&path).map_err(|e| {
                        SetupError::Config(format!("failed to read template '{}': {}", path.display(), e))
                    })?;
                    Template::parse(*name, &content)?
                }
                _ => Template::parse(*name, text)?,
            };
            templates.insert(name.to_string(), template);
        }
        Ok(Self { templates })
    }

    pub fn get(&self, name: &str) -> Result<&Template> {
        self.templates
            .get(name)
            .ok_or_else(|| SetupError::Config(format!("no template named '{}'", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}
