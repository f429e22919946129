//! Terraform Cloud variable sets and variables over the `/api/v2` JSON:API.
//!
//! Documents are flattened to the shape the reconciler works with:
//! a set is `{name: "varsets/<id>", parent: "organizations/<org>",
//! displayName, description, global, priority, projects: [<project id>]}`
//! and a variable is `{name: "varsets/<id>/vars/<var id>", parent:
//! "varsets/<id>", key, value, category, hcl, sensitive, description}`.
//! Sensitive values are never returned by the API.

use super::http::{endpoint, map_status, Intent};
use super::CloudApi;
use crate::adapter::{ResourceIdentity, ResourceKind};
use crate::document::Document;
use crate::error::{Result, SetupError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_URL: &str = "https://app.terraform.io";
const JSON_API: &str = "application/vnd.api+json";
const PAGE_SIZE: &str = "100";

const SET_ATTRIBUTES: &[(&str, &str)] = &[
    ("displayName", "name"),
    ("description", "description"),
    ("global", "global"),
    ("priority", "priority"),
];
const VARIABLE_ATTRIBUTES: &[(&str, &str)] = &[
    ("key", "key"),
    ("value", "value"),
    ("category", "category"),
    ("hcl", "hcl"),
    ("sensitive", "sensitive"),
    ("description", "description"),
];

pub struct TerraformCloud {
    http: reqwest::Client,
    base: String,
    token: String,
    organization: String,
}

impl TerraformCloud {
    /// `url` is the Terraform Cloud or Enterprise address, `token` a user or
    /// team API token of `organization`.
    pub fn connect(
        request_timeout: Duration,
        url: &str,
        token: impl Into<String>,
        organization: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rootstrap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base: format!("{}/api/v2", url.trim_end_matches('/')),
            token: token.into(),
            organization: organization.into(),
        })
    }

    async fn request(&self, method: Method, url: Url, body: Option<&Value>, intent: Intent) -> Result<Option<Value>> {
        debug!(method = %method, url = %url, "calling Terraform Cloud");
        let resource = url.path().trim_start_matches('/').to_string();
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, JSON_API);
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, JSON_API).body(serde_json::to_vec(body)?);
        }
        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Some(Value::Object(Map::new())));
            }
            return Ok(Some(serde_json::from_str(&text)?));
        }
        if status == StatusCode::NOT_FOUND && intent == Intent::Describe {
            return Ok(None);
        }
        let message = error_message(&text);
        Err(match (status, intent) {
            (StatusCode::UNAUTHORIZED, _) => {
                SetupError::Auth(format!("Terraform Cloud rejected the token: {}", message))
            }
            (StatusCode::UNPROCESSABLE_ENTITY, Intent::Create) if message.contains("already been taken") => {
                SetupError::AlreadyExists { resource }
            }
            _ => map_status(status, intent, resource, message),
        })
    }

    /// A write call; the answer's `data` entry.
    async fn call(&self, method: Method, path: &str, body: &Value, intent: Intent) -> Result<Value> {
        let url = endpoint(&self.base, path, &[])?;
        let answer = self
            .request(method, url, Some(body), intent)
            .await?
            .ok_or_else(|| SetupError::api(404, format!("{} not found", path)))?;
        answer
            .get("data")
            .cloned()
            .ok_or_else(|| SetupError::Transport(format!("{} answered without data", path)))
    }

    /// Every `data` entry of a paginated collection.
    async fn list(&self, path: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page: u64 = 1;
        loop {
            let number = page.to_string();
            let url = endpoint(&self.base, path, &[("page[number]", number.as_str()), ("page[size]", PAGE_SIZE)])?;
            let Some(answer) = self.request(Method::GET, url, None, Intent::Describe).await? else {
                break;
            };
            if let Some(data) = answer.get("data").and_then(Value::as_array) {
                items.extend(data.iter().cloned());
            }
            match next_page(&answer) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(items)
    }

    async fn sets(&self, organization: &str) -> Result<Vec<Document>> {
        let data = self.list(&format!("organizations/{}/varsets", organization)).await?;
        Ok(data.iter().map(|d| flatten_set(d, organization)).collect())
    }

    async fn variables(&self, set_id: &str) -> Result<Vec<Document>> {
        let data = self.list(&format!("varsets/{}/relationships/vars", set_id)).await?;
        Ok(data.iter().map(|d| flatten_variable(d, set_id)).collect())
    }

    async fn describe_set(&self, identity: &ResourceIdentity) -> Result<Option<Document>> {
        match identity {
            ResourceIdentity::Lookup { parent, .. } => {
                let organization = strip(parent, "organizations/")?;
                single(identity, self.sets(organization).await?)
            }
            ResourceIdentity::Name(name) => {
                strip(name, "varsets/")?;
                let answer = self
                    .request(Method::GET, endpoint(&self.base, name, &[])?, None, Intent::Describe)
                    .await?;
                Ok(answer
                    .and_then(|a| a.get("data").cloned())
                    .map(|data| flatten_set(&data, &self.organization)))
            }
        }
    }

    async fn describe_variable(&self, identity: &ResourceIdentity) -> Result<Option<Document>> {
        let set = match identity {
            ResourceIdentity::Lookup { parent, .. } => parent.as_str(),
            ResourceIdentity::Name(name) => variable_parts(name)?.0,
        };
        single(identity, self.variables(strip(set, "varsets/")?).await?)
    }
}

#[async_trait]
impl CloudApi for TerraformCloud {
    async fn describe(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<Document>> {
        debug!(kind = %kind, resource = %identity, "describe");
        match kind {
            ResourceKind::VariableSet => self.describe_set(identity).await,
            ResourceKind::Variable => self.describe_variable(identity).await,
            other => Err(SetupError::Unsupported(format!("{} on Terraform Cloud", other))),
        }
    }

    async fn create(&self, kind: ResourceKind, identity: &ResourceIdentity, body: &Document) -> Result<Document> {
        info!(kind = %kind, resource = %identity, "create");
        match kind {
            ResourceKind::VariableSet => {
                let organization = match (body.get("parent").and_then(Value::as_str), identity) {
                    (Some(parent), _) => strip(parent, "organizations/")?,
                    (None, ResourceIdentity::Lookup { parent, .. }) => strip(parent, "organizations/")?,
                    (None, ResourceIdentity::Name(_)) => self.organization.as_str(),
                };
                let path = format!("organizations/{}/varsets", organization);
                let data = self.call(Method::POST, &path, &set_payload(body), Intent::Create).await?;
                Ok(flatten_set(&data, organization))
            }
            ResourceKind::Variable => {
                let set = match identity {
                    ResourceIdentity::Lookup { parent, .. } => parent.as_str(),
                    ResourceIdentity::Name(name) => variable_parts(name)?.0,
                };
                let set_id = strip(set, "varsets/")?;
                let path = format!("varsets/{}/relationships/vars", set_id);
                let data = self.call(Method::POST, &path, &variable_payload(body, None), Intent::Create).await?;
                Ok(flatten_variable(&data, set_id))
            }
            other => Err(SetupError::Unsupported(format!("{} on Terraform Cloud", other))),
        }
    }

    async fn update(
        &self,
        kind: ResourceKind,
        identity: &ResourceIdentity,
        body: &Document,
        _token: Option<&str>,
    ) -> Result<Document> {
        info!(kind = %kind, resource = %identity, "update");
        let ResourceIdentity::Name(name) = identity else {
            return Err(SetupError::Unsupported(format!("{} addressed by lookup ({})", kind, identity)));
        };
        match kind {
            ResourceKind::VariableSet => {
                let data = self.call(Method::PATCH, name, &set_payload(body), Intent::Update).await?;
                Ok(flatten_set(&data, &self.organization))
            }
            ResourceKind::Variable => {
                let (set, id) = variable_parts(name)?;
                let set_id = strip(set, "varsets/")?;
                let path = format!("varsets/{}/relationships/vars/{}", set_id, id);
                let payload = variable_payload(body, Some(id));
                let data = self.call(Method::PATCH, &path, &payload, Intent::Update).await?;
                Ok(flatten_variable(&data, set_id))
            }
            other => Err(SetupError::Unsupported(format!("{} on Terraform Cloud", other))),
        }
    }
}

/// JSON:API errors carry `errors[].detail`, else `errors[].title`.
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| {
            let first = v.pointer("/errors/0")?;
            first
                .get("detail")
                .or_else(|| first.get("title"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| text.trim().to_string())
}

fn next_page(answer: &Value) -> Option<u64> {
    answer.pointer("/meta/pagination/next-page").and_then(Value::as_u64)
}

fn strip<'n>(name: &'n str, prefix: &str) -> Result<&'n str> {
    name.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .ok_or_else(|| SetupError::Config(format!("'{}' is not of the form {}<id>", name, prefix)))
}

/// `varsets/<set>/vars/<id>` into (`varsets/<set>`, `<id>`).
fn variable_parts(name: &str) -> Result<(&str, &str)> {
    name.rsplit_once("/vars/")
        .ok_or_else(|| SetupError::Config(format!("'{}' is not of the form varsets/<id>/vars/<id>", name)))
}

fn single(identity: &ResourceIdentity, candidates: Vec<Document>) -> Result<Option<Document>> {
    let mut matches: Vec<Document> = candidates.into_iter().filter(|doc| identity.matches(doc)).collect();
    if matches.len() > 1 {
        return Err(SetupError::Ambiguous {
            resource: identity.to_string(),
            matches: matches
                .iter()
                .filter_map(|doc| doc.get("name").and_then(Value::as_str).map(str::to_string))
                .collect(),
        });
    }
    Ok(matches.pop())
}

/// Renames `(document field, attribute)` pairs from a flattened document to
/// JSON:API attributes, or back when `into_document`. Nulls are skipped.
fn copy(from: Option<&Value>, pairs: &[(&str, &str)], into_document: bool) -> Map<String, Value> {
    let mut out = Map::new();
    for (field, attribute) in pairs {
        let (source, target) = if into_document { (attribute, field) } else { (field, attribute) };
        match from.and_then(|f| f.get(*source)) {
            Some(Value::Null) | None => {}
            Some(value) => {
                out.insert((*target).to_string(), value.clone());
            }
        }
    }
    out
}

fn flatten_set(data: &Value, organization: &str) -> Document {
    let mut doc = copy(data.get("attributes"), SET_ATTRIBUTES, true);
    let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
    let projects: Vec<Value> = data
        .pointer("/relationships/projects/data")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(|p| p.get("id").cloned()).collect())
        .unwrap_or_default();
    doc.insert("name".to_string(), Value::String(format!("varsets/{}", id)));
    doc.insert("parent".to_string(), Value::String(format!("organizations/{}", organization)));
    doc.insert("projects".to_string(), Value::Array(projects));
    Value::Object(doc)
}

fn flatten_variable(data: &Value, set_id: &str) -> Document {
    let mut doc = copy(data.get("attributes"), VARIABLE_ATTRIBUTES, true);
    let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
    doc.insert("name".to_string(), Value::String(format!("varsets/{}/vars/{}", set_id, id)));
    doc.insert("parent".to_string(), Value::String(format!("varsets/{}", set_id)));
    Value::Object(doc)
}

fn set_payload(body: &Document) -> Value {
    let projects: Vec<Value> = body
        .get("projects")
        .and_then(Value::as_array)
        .map(|list| list.iter().map(|id| json!({"id": id, "type": "projects"})).collect())
        .unwrap_or_default();
    json!({
        "data": {
            "type": "varsets",
            "attributes": copy(Some(body), SET_ATTRIBUTES, false),
            "relationships": {"projects": {"data": projects}},
        }
    })
}

fn variable_payload(body: &Document, id: Option<&str>) -> Value {
    let mut data = json!({
        "type": "vars",
        "attributes": copy(Some(body), VARIABLE_ATTRIBUTES, false),
    });
    if let Some(id) = id {
        data["id"] = Value::String(id.to_string());
    }
    json!({ "data": data })
}
