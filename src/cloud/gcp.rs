//! Google Cloud REST routes for every resource kind.

use super::http::{endpoint, GcpClient, Intent};
use super::operation::{wait, OperationPolicy};
use super::CloudApi;
use crate::adapter::{ResourceIdentity, ResourceKind};
use crate::document::Document;
use crate::error::{Result, SetupError};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const CRM: &str = "https://cloudresourcemanager.googleapis.com/v3";
const IAM: &str = "https://iam.googleapis.com/v1";
const SERVICE_USAGE: &str = "https://serviceusage.googleapis.com/v1";
const BILLING: &str = "https://cloudbilling.googleapis.com/v1";

/// batchEnable accepts at most 20 services per call.
const ENABLE_CHUNK: usize = 20;

/// Fields that are never part of an update mask.
const IMMUTABLE: &[&str] = &["name", "etag", "parent", "shortName", "projectId", "state"];

pub struct GcpCloud {
    client: GcpClient,
    operations: OperationPolicy,
}

impl GcpCloud {
    pub fn connect(request_timeout: Duration, operations: OperationPolicy) -> Result<Self> {
        Ok(Self {
            client: GcpClient::connect(request_timeout)?,
            operations,
        })
    }

    /// Collects every `field` entry of a paginated list call.
    async fn list(&self, base: &str, path: &str, params: &[(&str, &str)], field: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> = params.to_vec();
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page = match self.client.fetch(endpoint(base, path, &query)?).await? {
                Some(page) => page,
                None => break,
            };
            if let Some(list) = page.get(field).and_then(Value::as_array) {
                items.extend(list.iter().cloned());
            }
            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn describe_lookup(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<Document>> {
        let ResourceIdentity::Lookup { parent, field, value } = identity else {
            return Err(SetupError::Unsupported(format!("{} lookup by name", kind)));
        };
        let candidates = match kind {
            ResourceKind::Project => {
                let query = format!("parent:{} AND {}:{} AND state:ACTIVE", parent, field, value);
                self.list(CRM, "projects:search", &[("query", query.as_str())], "projects").await?
            }
            ResourceKind::Folder => self.list(CRM, "folders", &[("parent", parent.as_str())], "folders").await?,
            ResourceKind::TagBinding => {
                self.list(CRM, "tagBindings", &[("parent", parent.as_str())], "tagBindings").await?
            }
            other => return Err(SetupError::Unsupported(format!("{} lookup by field", other))),
        };
        let mut matches: Vec<Document> = candidates
            .into_iter()
            .filter(|doc| identity.matches(doc))
            .filter(|doc| doc.get("state").and_then(Value::as_str).map_or(true, |s| s == "ACTIVE"))
            .collect();
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

    /// Tag keys and values by `tagKeys/N` or by namespaced name. A denied
    /// namespaced lookup means the tag does not exist.
    async fn describe_tag(&self, collection: &str, name: &str) -> Result<Option<Document>> {
        if name.starts_with(&format!("{}/", collection)) {
            return self.client.fetch(endpoint(CRM, name, &[])?).await;
        }
        let path = format!("{}/namespaced", collection);
        match self.client.fetch(endpoint(CRM, &path, &[("name", name)])?).await {
            Err(SetupError::PermissionDenied(_)) => Ok(None),
            other => other,
        }
    }

    async fn enabled_services(&self, project: &str) -> Result<Document> {
        let path = format!("{}/services", project);
        let services = self.list(SERVICE_USAGE, &path, &[("filter", "state:ENABLED")], "services").await?;
        let names: Vec<Value> = services
            .iter()
            .filter_map(|s| s.get("config").and_then(|c| c.get("name")).and_then(Value::as_str))
            .map(|s| Value::String(s.to_string()))
            .collect();
        Ok(json!({ "services": names }))
    }

    async fn enable_services(&self, project: &str, body: &Document) -> Result<Document> {
        let services: Vec<String> = body
            .get("services")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let url = endpoint(SERVICE_USAGE, &format!("{}/services:batchEnable", project), &[])?;
        for chunk in services.chunks(ENABLE_CHUNK) {
            info!(project = %project, count = chunk.len(), "enabling services");
            let op = self
                .client
                .call(Method::POST, url.clone(), Some(&json!({ "serviceIds": chunk })), Intent::Create)
                .await?;
            wait(&self.client, SERVICE_USAGE, op, self.operations).await?;
        }
        self.enabled_services(project).await
    }

    async fn get_iam_policy(&self, resource: &str) -> Result<Option<Document>> {
        let url = endpoint(policy_base(resource), &format!("{}:getIamPolicy", resource), &[])?;
        self.client.fetch_with(url, &json!({})).await
    }

    async fn set_iam_policy(&self, resource: &str, body: &Document, token: Option<&str>) -> Result<Document> {
        let mut policy = without_nulls(body);
        if let (Some(token), Some(obj)) = (token, policy.as_object_mut()) {
            obj.insert("etag".to_string(), Value::String(token.to_string()));
        }
        let url = endpoint(policy_base(resource), &format!("{}:setIamPolicy", resource), &[])?;
        self.client
            .call(Method::POST, url, Some(&json!({ "policy": policy })), Intent::Update)
            .await
    }

    /// POST a creation request and wait for its operation when there is one.
    async fn create_at(&self, base: &str, path: &str, params: &[(&str, &str)], body: &Document) -> Result<Document> {
        let url = endpoint(base, path, params)?;
        let answer = self.client.call(Method::POST, url, Some(body), Intent::Create).await?;
        wait(&self.client, base, answer, self.operations).await
    }

    async fn patch(&self, base: &str, name: &str, body: &Document, token: Option<&str>) -> Result<Document> {
        let mut body = without_nulls(body);
        let mask = update_mask(&body);
        if let (Some(token), Some(obj)) = (token, body.as_object_mut()) {
            obj.insert("etag".to_string(), Value::String(token.to_string()));
        }
        let url = endpoint(base, name, &[("updateMask", mask.as_str())])?;
        let answer = self.client.call(Method::PATCH, url, Some(&body), Intent::Update).await?;
        wait(&self.client, base, answer, self.operations).await
    }

    fn name<'i>(&self, kind: ResourceKind, identity: &'i ResourceIdentity) -> Result<&'i str> {
        match identity {
            ResourceIdentity::Name(name) => Ok(name),
            ResourceIdentity::Lookup { .. } => Err(SetupError::Unsupported(format!(
                "{} addressed by lookup ({})",
                kind, identity
            ))),
        }
    }
}

#[async_trait]
impl CloudApi for GcpCloud {
    async fn describe(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<Document>> {
        debug!(kind = %kind, resource = %identity, "describe");
        if let ResourceIdentity::Lookup { .. } = identity {
            return self.describe_lookup(kind, identity).await;
        }
        let name = self.name(kind, identity)?;
        match kind {
            ResourceKind::TagKey => self.describe_tag("tagKeys", name).await,
            ResourceKind::TagValue => self.describe_tag("tagValues", name).await,
            ResourceKind::IamPolicy => self.get_iam_policy(name).await,
            ResourceKind::ProjectServices => self.enabled_services(name).await.map(Some),
            ResourceKind::BillingInfo => {
                self.client
                    .fetch(endpoint(BILLING, &format!("{}/billingInfo", name), &[])?)
                    .await
            }
            ResourceKind::Project | ResourceKind::Folder | ResourceKind::TagBinding => {
                self.client.fetch(endpoint(CRM, name, &[])?).await
            }
            ResourceKind::ServiceAccount
            | ResourceKind::WorkloadIdentityPool
            | ResourceKind::WorkloadIdentityProvider
            | ResourceKind::CustomRole => self.client.fetch(endpoint(IAM, name, &[])?).await,
            ResourceKind::VariableSet | ResourceKind::Variable => {
                Err(SetupError::Unsupported(format!("{} on Google Cloud", kind)))
            }
        }
    }

    async fn create(&self, kind: ResourceKind, identity: &ResourceIdentity, body: &Document) -> Result<Document> {
        info!(kind = %kind, resource = %identity, "create");
        let body = without_nulls(body);
        let created = match kind {
            ResourceKind::Project => self.create_at(CRM, "projects", &[], &body).await?,
            ResourceKind::Folder => self.create_at(CRM, "folders", &[], &body).await?,
            ResourceKind::TagKey => self.create_at(CRM, "tagKeys", &[], &body).await?,
            ResourceKind::TagValue => self.create_at(CRM, "tagValues", &[], &body).await?,
            ResourceKind::TagBinding => self.create_at(CRM, "tagBindings", &[], &body).await?,
            ResourceKind::WorkloadIdentityPool => {
                let (parent, id) = split_name(self.name(kind, identity)?, "/workloadIdentityPools/")?;
                let path = format!("{}/workloadIdentityPools", parent);
                self.create_at(IAM, &path, &[("workloadIdentityPoolId", id)], &body).await?
            }
            ResourceKind::WorkloadIdentityProvider => {
                let (parent, id) = split_name(self.name(kind, identity)?, "/providers/")?;
                let path = format!("{}/providers", parent);
                self.create_at(IAM, &path, &[("workloadIdentityPoolProviderId", id)], &body).await?
            }
            ResourceKind::ServiceAccount => {
                let (parent, email) = split_name(self.name(kind, identity)?, "/serviceAccounts/")?;
                let account_id = email.split('@').next().unwrap_or(email);
                let request = json!({ "accountId": account_id, "serviceAccount": body });
                let url = endpoint(IAM, &format!("{}/serviceAccounts", parent), &[])?;
                self.client.call(Method::POST, url, Some(&request), Intent::Create).await?
            }
            ResourceKind::CustomRole => {
                let (parent, role_id) = split_name(self.name(kind, identity)?, "/roles/")?;
                let request = json!({ "roleId": role_id, "role": body });
                let url = endpoint(IAM, &format!("{}/roles", parent), &[])?;
                self.client.call(Method::POST, url, Some(&request), Intent::Create).await?
            }
            ResourceKind::IamPolicy => return self.set_iam_policy(self.name(kind, identity)?, &body, None).await,
            ResourceKind::ProjectServices => return self.enable_services(self.name(kind, identity)?, &body).await,
            ResourceKind::BillingInfo => {
                let url = endpoint(BILLING, &format!("{}/billingInfo", self.name(kind, identity)?), &[])?;
                return self.client.call(Method::PUT, url, Some(&body), Intent::Update).await;
            }
            ResourceKind::VariableSet | ResourceKind::Variable => {
                return Err(SetupError::Unsupported(format!("{} on Google Cloud", kind)))
            }
        };
        // Operation responses are sometimes partial; read the resource back.
        Ok(self.describe(kind, identity).await?.unwrap_or(created))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        identity: &ResourceIdentity,
        body: &Document,
        token: Option<&str>,
    ) -> Result<Document> {
        info!(kind = %kind, resource = %identity, "update");
        let name = self.name(kind, identity)?;
        match kind {
            ResourceKind::IamPolicy => self.set_iam_policy(name, body, token).await,
            ResourceKind::ProjectServices => self.enable_services(name, body).await,
            ResourceKind::BillingInfo => {
                let url = endpoint(BILLING, &format!("{}/billingInfo", name), &[])?;
                self.client.call(Method::PUT, url, Some(&without_nulls(body)), Intent::Update).await
            }
            ResourceKind::ServiceAccount => {
                let mut account = without_nulls(body);
                let mask = update_mask(&account);
                if let (Some(token), Some(obj)) = (token, account.as_object_mut()) {
                    obj.insert("etag".to_string(), Value::String(token.to_string()));
                }
                let request = json!({ "serviceAccount": account, "updateMask": mask });
                self.client
                    .call(Method::PATCH, endpoint(IAM, name, &[])?, Some(&request), Intent::Update)
                    .await
            }
            ResourceKind::WorkloadIdentityPool | ResourceKind::WorkloadIdentityProvider | ResourceKind::CustomRole => {
                self.patch(IAM, name, body, token).await?;
                self.describe(kind, identity)
                    .await?
                    .ok_or_else(|| SetupError::api(404, format!("{} not found after update", name)))
            }
            ResourceKind::TagKey | ResourceKind::TagValue => {
                self.patch(CRM, name, body, token).await?;
                self.describe(kind, identity)
                    .await?
                    .ok_or_else(|| SetupError::api(404, format!("{} not found after update", name)))
            }
            ResourceKind::Project | ResourceKind::Folder | ResourceKind::TagBinding => {
                Err(SetupError::Unsupported(format!("updating a {}", kind)))
            }
            ResourceKind::VariableSet | ResourceKind::Variable => {
                Err(SetupError::Unsupported(format!("{} on Google Cloud", kind)))
            }
        }
    }
}

/// IAM policies of service accounts live in the IAM API, all others in
/// Cloud Resource Manager.
fn policy_base(resource: &str) -> &'static str {
    if resource.contains("/serviceAccounts/") {
        IAM
    } else {
        CRM
    }
}

fn split_name<'n>(name: &'n str, separator: &str) -> Result<(&'n str, &'n str)> {
    name.rsplit_once(separator)
        .ok_or_else(|| SetupError::Config(format!("'{}' is not of the form <parent>{}<id>", name, separator)))
}

fn update_mask(body: &Document) -> String {
    body.as_object()
        .map(|obj| {
            obj.keys()
                .filter(|k| !IMMUTABLE.contains(&k.as_str()))
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn without_nulls(body: &Document) -> Document {
    match body {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
