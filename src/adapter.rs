//! Resource kinds and the adapters that reach them through a [`CloudApi`].

use crate::cloud::CloudApi;
use crate::document::{lookup_path, Document};
use crate::error::{Result, SetupError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Project,
    Folder,
    ServiceAccount,
    TagKey,
    TagValue,
    TagBinding,
    WorkloadIdentityPool,
    WorkloadIdentityProvider,
    IamPolicy,
    ProjectServices,
    BillingInfo,
    CustomRole,
    VariableSet,
    Variable,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Project => "project",
            ResourceKind::Folder => "folder",
            ResourceKind::ServiceAccount => "service-account",
            ResourceKind::TagKey => "tag-key",
            ResourceKind::TagValue => "tag-value",
            ResourceKind::TagBinding => "tag-binding",
            ResourceKind::WorkloadIdentityPool => "workload-identity-pool",
            ResourceKind::WorkloadIdentityProvider => "workload-identity-provider",
            ResourceKind::IamPolicy => "iam-policy",
            ResourceKind::ProjectServices => "project-services",
            ResourceKind::BillingInfo => "billing-info",
            ResourceKind::CustomRole => "custom-role",
            ResourceKind::VariableSet => "terraform-variable-set",
            ResourceKind::Variable => "terraform-variable",
        }
    }

    /// Kinds living in Terraform Cloud rather than Google Cloud.
    pub fn is_terraform(&self) -> bool {
        matches!(self, ResourceKind::VariableSet | ResourceKind::Variable)
    }

    /// Kinds reconciled on existence only: once found they are left alone.
    pub fn tracks_body(&self) -> bool {
        !matches!(self, ResourceKind::Project | ResourceKind::Folder | ResourceKind::TagBinding)
    }

    /// Fields projected out of both desired and current state before comparing.
    pub fn managed_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Project => &["displayName", "labels"],
            ResourceKind::Folder => &["displayName", "parent"],
            ResourceKind::ServiceAccount => &["displayName", "description"],
            ResourceKind::TagKey | ResourceKind::TagValue => &["parent", "shortName", "description"],
            ResourceKind::TagBinding => &["parent", "tagValue"],
            ResourceKind::WorkloadIdentityPool => &["displayName", "description", "disabled"],
            ResourceKind::WorkloadIdentityProvider => &[
                "displayName",
                "description",
                "disabled",
                "attributeMapping",
                "attributeCondition",
                "oidc",
            ],
            ResourceKind::IamPolicy => &["bindings", "etag"],
            ResourceKind::ProjectServices => &["services"],
            ResourceKind::BillingInfo => &["billingAccountName"],
            ResourceKind::CustomRole => &["title", "description", "stage", "includedPermissions"],
            ResourceKind::VariableSet => &["displayName", "description", "global", "priority", "projects"],
            ResourceKind::Variable => &["key", "value", "category", "hcl", "sensitive", "description"],
        }
    }

    /// Managed fields the remote never reads back (sensitive values). They
    /// are compared only when the current state carries them.
    pub fn write_only_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Variable => &["value"],
            _ => &[],
        }
    }

    /// List fields compared as sets.
    pub fn set_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::ProjectServices => &["services"],
            ResourceKind::CustomRole => &["includedPermissions"],
            ResourceKind::VariableSet => &["projects"],
            _ => &[],
        }
    }

    pub fn default_policy(&self) -> DriftPolicy {
        match self {
            ResourceKind::ProjectServices => DriftPolicy::Additive,
            _ => DriftPolicy::Exact,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resource is found again on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceIdentity {
    /// Fully qualified name chosen by the caller (or a namespaced alias).
    Name(String),
    /// Server-assigned name: the one resource under `parent` whose `field`
    /// (a dotted path) equals `value`.
    Lookup { parent: String, field: String, value: String },
}

impl ResourceIdentity {
    pub fn name(name: impl Into<String>) -> Self {
        ResourceIdentity::Name(name.into())
    }

    pub fn lookup(parent: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        ResourceIdentity::Lookup {
            parent: parent.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// True when `doc` is the resource this identity designates.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            ResourceIdentity::Name(name) => doc.get("name").and_then(Value::as_str) == Some(name.as_str()),
            ResourceIdentity::Lookup { parent, field, value } => {
                let parent_ok = doc.get("parent").and_then(Value::as_str) == Some(parent.as_str());
                let field_ok = match lookup_path(doc, field) {
                    Some(Value::String(s)) => s == value,
                    Some(Value::Bool(b)) => b.to_string() == *value,
                    Some(Value::Number(n)) => n.to_string() == *value,
                    _ => false,
                };
                parent_ok && field_ok
            }
        }
    }

    /// The identity to write to once the current state is known: lookups
    /// resolve to the server-assigned `name`.
    pub fn resolved(&self, current: &Document) -> ResourceIdentity {
        match current.get("name").and_then(Value::as_str) {
            Some(name) if matches!(self, ResourceIdentity::Lookup { .. }) => ResourceIdentity::Name(name.to_string()),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceIdentity::Name(name) => f.write_str(name),
            ResourceIdentity::Lookup { parent, field, value } => write!(f, "{}[{}={}]", parent, field, value),
        }
    }
}

/// How remote state that the template does not declare is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftPolicy {
    /// Managed fields must match the template; anything else is removed.
    Exact,
    /// The template is a subset that must be present; extra entries stay.
    Additive,
}

#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// `Ok(None)` when the resource does not exist.
    async fn describe(&self, identity: &ResourceIdentity) -> Result<Option<Document>>;

    async fn create(&self, identity: &ResourceIdentity, desired: &Document) -> Result<Document>;

    async fn update(&self, identity: &ResourceIdentity, desired: &Document, token: Option<&str>) -> Result<Document>;

    fn extract_token(&self, state: &Document) -> Option<String> {
        state.get("etag").and_then(Value::as_str).map(str::to_string)
    }

    fn tracks_body(&self) -> bool {
        self.kind().tracks_body()
    }

    fn managed_fields(&self) -> &'static [&'static str] {
        self.kind().managed_fields()
    }

    fn set_fields(&self) -> &'static [&'static str] {
        self.kind().set_fields()
    }

    fn write_only_fields(&self) -> &'static [&'static str] {
        self.kind().write_only_fields()
    }

    fn drift_policy(&self) -> DriftPolicy {
        self.kind().default_policy()
    }
}

/// Adapter for one kind, backed by any [`CloudApi`].
pub struct KindAdapter<'a> {
    api: &'a dyn CloudApi,
    kind: ResourceKind,
    policy: DriftPolicy,
}

impl<'a> KindAdapter<'a> {
    pub fn new(api: &'a dyn CloudApi, kind: ResourceKind) -> Self {
        Self { api, kind, policy: kind.default_policy() }
    }

    pub fn with_policy(mut self, policy: DriftPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn check_not_deleted(&self, identity: &ResourceIdentity, state: &Document) -> Result<()> {
        let deleted = match self.kind {
            ResourceKind::WorkloadIdentityPool | ResourceKind::WorkloadIdentityProvider => {
                state.get("state").and_then(Value::as_str) == Some("DELETED")
            }
            ResourceKind::CustomRole => state.get("deleted").and_then(Value::as_bool).unwrap_or(false),
            _ => false,
        };
        if deleted {
            return Err(SetupError::Deleted { resource: identity.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> ResourceAdapter for KindAdapter<'a> {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn describe(&self, identity: &ResourceIdentity) -> Result<Option<Document>> {
        let state = self.api.describe(self.kind, identity).await?;
        if let Some(state) = &state {
            self.check_not_deleted(identity, state)?;
        }
        Ok(state)
    }

    async fn create(&self, identity: &ResourceIdentity, desired: &Document) -> Result<Document> {
        self.api.create(self.kind, identity, desired).await
    }

    async fn update(&self, identity: &ResourceIdentity, desired: &Document, token: Option<&str>) -> Result<Document> {
        self.api.update(self.kind, identity, desired, token).await
    }

    fn drift_policy(&self) -> DriftPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MemoryCloud;
    use serde_json::json;

    #[test]
    fn lookup_matches_parent_and_dotted_field() {
        let identity = ResourceIdentity::lookup("organizations/123", "labels.root", "true");
        let doc = json!({"name": "projects/1", "parent": "organizations/123", "labels": {"root": "true"}});
        assert!(identity.matches(&doc));
        let other_parent = json!({"parent": "organizations/9", "labels": {"root": "true"}});
        assert!(!identity.matches(&other_parent));
        assert_eq!(identity.resolved(&doc), ResourceIdentity::name("projects/1"));
        assert_eq!(identity.to_string(), "organizations/123[labels.root=true]");
    }

    #[test]
    fn names_resolve_to_themselves() {
        let identity = ResourceIdentity::name("123/root");
        let doc = json!({"name": "tagKeys/7", "namespacedName": "123/root"});
        assert_eq!(identity.resolved(&doc), identity);
    }

    #[test]
    fn kind_tables() {
        assert!(!ResourceKind::Project.tracks_body());
        assert!(ResourceKind::IamPolicy.tracks_body());
        assert_eq!(ResourceKind::ProjectServices.default_policy(), DriftPolicy::Additive);
        assert_eq!(ResourceKind::IamPolicy.default_policy(), DriftPolicy::Exact);
        assert_eq!(ResourceKind::CustomRole.set_fields(), &["includedPermissions"]);
        assert!(ResourceKind::Variable.is_terraform());
        assert!(!ResourceKind::IamPolicy.is_terraform());
        assert_eq!(ResourceKind::Variable.write_only_fields(), &["value"]);
        assert!(ResourceKind::VariableSet.write_only_fields().is_empty());
    }

    #[tokio::test]
    async fn deleted_pool_is_reported() {
        let cloud = MemoryCloud::new();
        let name = "projects/1/locations/global/workloadIdentityPools/pool";
        cloud.seed(
            ResourceKind::WorkloadIdentityPool,
            name,
            json!({"name": name, "state": "DELETED", "displayName": "pool"}),
        );
        let adapter = KindAdapter::new(&cloud, ResourceKind::WorkloadIdentityPool);
        let err = adapter.describe(&ResourceIdentity::name(name)).await.unwrap_err();
        assert!(matches!(err, SetupError::Deleted { .. }));
        assert!(err.to_string().contains("Undelete"));
    }

    #[tokio::test]
    async fn adapter_policy_can_be_overridden() {
        let cloud = MemoryCloud::new();
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy).with_policy(DriftPolicy::Additive);
        assert_eq!(adapter.drift_policy(), DriftPolicy::Additive);
        assert_eq!(adapter.extract_token(&json!({"etag": "BwX"})).as_deref(), Some("BwX"));
        assert_eq!(adapter.extract_token(&json!({})), None);
    }
}
