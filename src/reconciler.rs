//! The idempotent "ensure it exists and matches" routine shared by every kind.

use crate::adapter::{DriftPolicy, ResourceAdapter, ResourceIdentity};
use crate::document::{select_fields, Differ, Document};
use crate::error::{Result, SetupError};
use crate::template::Template;
use crate::vars::{VariableMap, ETAG};
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub outcome: Outcome,
    /// Remote state after the step.
    pub state: Document,
}

/// Fails with `MissingVariable` when the template needs a variable that is
/// not defined. The concurrency token is filled in later and is exempt.
pub fn check_variables(template: &Template, vars: &VariableMap) -> Result<()> {
    match template.placeholders().into_iter().find(|name| name != ETAG && !vars.contains(name)) {
        Some(name) => Err(SetupError::MissingVariable {
            template: template.name().to_string(),
            name,
        }),
        None => Ok(()),
    }
}

fn render(template: &Template, vars: &VariableMap, token: Option<&str>) -> Result<Document> {
    let token = token.map_or(Value::Null, |t| Value::String(t.to_string()));
    let doc = template.render(&vars.clone().with(ETAG, token))?;
    Ok(without_nulls(doc))
}

/// Drops top-level null fields, such as the token of a resource that has none.
fn without_nulls(doc: Document) -> Document {
    match doc {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => other,
    }
}

pub async fn reconcile(
    adapter: &dyn ResourceAdapter,
    identity: &ResourceIdentity,
    template: &Template,
    vars: &VariableMap,
) -> Result<Reconciliation> {
    check_variables(template, vars)?;
    let kind = adapter.kind();

    let current = match adapter.describe(identity).await? {
        Some(current) => current,
        None => {
            let desired = render(template, vars, None)?;
            match adapter.create(identity, &desired).await {
                Ok(state) => {
                    info!(kind = %kind, resource = %identity, outcome = %Outcome::Created, "reconciled");
                    return Ok(Reconciliation { outcome: Outcome::Created, state });
                }
                Err(SetupError::AlreadyExists { resource }) => {
                    warn!(kind = %kind, resource = %resource, "created concurrently, reading it back");
                    match adapter.describe(identity).await? {
                        Some(current) => current,
                        None => return Err(SetupError::AlreadyExists { resource }),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    };

    converge(adapter, identity, template, vars, current).await
}

async fn converge(
    adapter: &dyn ResourceAdapter,
    identity: &ResourceIdentity,
    template: &Template,
    vars: &VariableMap,
    current: Document,
) -> Result<Reconciliation> {
    let kind = adapter.kind();
    if !adapter.tracks_body() {
        info!(kind = %kind, resource = %identity, outcome = %Outcome::Unchanged, "reconciled");
        return Ok(Reconciliation { outcome: Outcome::Unchanged, state: current });
    }

    let token = adapter.extract_token(&current);
    let desired = render(template, vars, token.as_deref())?;

    let differ = Differ::new(adapter.set_fields());
    let live = select_fields(&current, adapter.managed_fields());
    let mut wanted = select_fields(&desired, adapter.managed_fields());
    if let Some(fields) = wanted.as_object_mut() {
        for field in adapter.write_only_fields() {
            if live.get(*field).is_none() {
                fields.remove(*field);
            }
        }
    }

    let body = match adapter.drift_policy() {
        DriftPolicy::Exact if differ.is_equal(&live, &wanted) => None,
        DriftPolicy::Exact => Some(desired),
        DriftPolicy::Additive if differ.contains(&live, &wanted) => None,
        DriftPolicy::Additive => Some(differ.union(&live, &wanted)),
    };

    let Some(body) = body else {
        info!(kind = %kind, resource = %identity, outcome = %Outcome::Unchanged, "reconciled");
        return Ok(Reconciliation { outcome: Outcome::Unchanged, state: current });
    };

    for change in differ.diff(&live, &select_fields(&body, adapter.managed_fields())) {
        debug!(kind = %kind, resource = %identity, "{}", change);
    }

    let target = identity.resolved(&current);
    let state = adapter.update(&target, &body, token.as_deref()).await?;
    info!(kind = %kind, resource = %identity, outcome = %Outcome::Updated, "reconciled");
    Ok(Reconciliation { outcome: Outcome::Updated, state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{KindAdapter, ResourceKind};
    use crate::cloud::{MemoryCloud, Method};
    use serde_json::json;

    fn account_iam() -> Template {
        Template::parse(
            "account_iam",
            r#"
bindings:
  - role: roles/iam.serviceAccountTokenCreator
    members:
      - "group:%EXECUTIVE_GROUP%"
etag: "%ETAG%"
"#,
        )
        .unwrap()
    }

    fn vars() -> VariableMap {
        VariableMap::new().with("EXECUTIVE_GROUP", "exec@acme.com")
    }

    const ACCOUNT: &str = "projects/root-1/serviceAccounts/builder@root-1.iam.gserviceaccount.com";

    #[tokio::test]
    async fn created_then_unchanged() {
        let cloud = MemoryCloud::new();
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy);
        let identity = ResourceIdentity::name(ACCOUNT);

        let first = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(first.outcome, Outcome::Created);
        let second = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(second.outcome, Outcome::Unchanged);
        assert_eq!(first.state, second.state);
        assert_eq!(cloud.writes().len(), 1);
    }

    #[tokio::test]
    async fn extra_binding_is_removed_under_exact_policy() {
        let cloud = MemoryCloud::new();
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy);
        let identity = ResourceIdentity::name(ACCOUNT);
        reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();

        cloud.mutate(ResourceKind::IamPolicy, ACCOUNT, |doc| {
            doc["bindings"]
                .as_array_mut()
                .unwrap()
                .push(json!({"role": "roles/viewer", "members": ["user:intruder@acme.com"]}));
        });

        let result = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(result.outcome, Outcome::Updated);
        let policy = cloud.get(ResourceKind::IamPolicy, ACCOUNT).unwrap();
        assert_eq!(policy["bindings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn additive_policy_keeps_foreign_bindings() {
        let cloud = MemoryCloud::new();
        cloud.seed(
            ResourceKind::IamPolicy,
            "organizations/123",
            json!({"bindings": [{"role": "roles/viewer", "members": ["group:other@acme.com"]}]}),
        );
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy).with_policy(DriftPolicy::Additive);
        let identity = ResourceIdentity::name("organizations/123");

        let result = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(result.outcome, Outcome::Updated);
        let policy = cloud.get(ResourceKind::IamPolicy, "organizations/123").unwrap();
        assert_eq!(policy["bindings"].as_array().unwrap().len(), 2);

        let again = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(again.outcome, Outcome::Unchanged);
    }

    #[tokio::test]
    async fn missing_variable_makes_no_call() {
        let cloud = MemoryCloud::new();
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy);
        let err = reconcile(&adapter, &ResourceIdentity::name(ACCOUNT), &account_iam(), &VariableMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SetupError::MissingVariable { ref name, .. } if name == "EXECUTIVE_GROUP"));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn lost_creation_race_is_recovered() {
        let cloud = MemoryCloud::new();
        cloud.race_next_create(ResourceKind::IamPolicy);
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy);
        let identity = ResourceIdentity::name(ACCOUNT);

        let result = reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();
        assert_eq!(result.outcome, Outcome::Unchanged);
        let methods: Vec<Method> = cloud.calls().iter().map(|c| c.method).collect();
        assert_eq!(methods, vec![Method::Describe, Method::Create, Method::Describe]);
    }

    #[tokio::test]
    async fn existence_only_kinds_are_never_updated() {
        let cloud = MemoryCloud::new();
        let folder = Template::parse("folder", "displayName: '%NAME%'\nparent: organizations/1\n").unwrap();
        let adapter = KindAdapter::new(&cloud, ResourceKind::Folder);
        let identity = ResourceIdentity::lookup("organizations/1", "displayName", "workspaces");
        let v = VariableMap::new().with("NAME", "workspaces");

        assert_eq!(reconcile(&adapter, &identity, &folder, &v).await.unwrap().outcome, Outcome::Created);
        let name = cloud.names(ResourceKind::Folder).remove(0);
        cloud.mutate(ResourceKind::Folder, &name, |doc| doc["labels"] = json!({"x": "y"}));
        assert_eq!(reconcile(&adapter, &identity, &folder, &v).await.unwrap().outcome, Outcome::Unchanged);
    }

    #[tokio::test]
    async fn write_between_read_and_update_is_rejected_by_etag() {
        let cloud = MemoryCloud::new();
        let adapter = KindAdapter::new(&cloud, ResourceKind::IamPolicy);
        let identity = ResourceIdentity::name(ACCOUNT);
        reconcile(&adapter, &identity, &account_iam(), &vars()).await.unwrap();

        cloud.mutate_after_next_describe(ResourceKind::IamPolicy, |doc| {
            doc["bindings"][0]["members"] = json!(["group:auditors@acme.com"]);
        });
        let changed = vars().with("EXECUTIVE_GROUP", "board@acme.com");
        let err = reconcile(&adapter, &identity, &account_iam(), &changed).await.unwrap_err();
        assert!(matches!(err, SetupError::ConcurrentModification { .. }));

        let policy = cloud.get(ResourceKind::IamPolicy, ACCOUNT).unwrap();
        assert_eq!(policy["bindings"][0]["members"], json!(["group:auditors@acme.com"]));
        let last = cloud.calls().pop().unwrap();
        assert_eq!(last.method, Method::Update);
    }

    #[tokio::test]
    async fn hidden_sensitive_value_is_not_drift() {
        let cloud = MemoryCloud::new();
        let template = Template::parse(
            "variable",
            "parent: varsets/varset-1\nkey: token\nvalue: '%SECRET%'\nsensitive: true\ndescription: '%TEXT%'\n",
        )
        .unwrap();
        let adapter = KindAdapter::new(&cloud, ResourceKind::Variable);
        let identity = ResourceIdentity::lookup("varsets/varset-1", "key", "token");
        let v = VariableMap::new().with("SECRET", "s3cr3t").with("TEXT", "API token");

        assert_eq!(reconcile(&adapter, &identity, &template, &v).await.unwrap().outcome, Outcome::Created);
        assert_eq!(reconcile(&adapter, &identity, &template, &v).await.unwrap().outcome, Outcome::Unchanged);

        let reworded = v.clone().with("TEXT", "Registry token");
        assert_eq!(reconcile(&adapter, &identity, &template, &reworded).await.unwrap().outcome, Outcome::Updated);
        let name = cloud.names(ResourceKind::Variable).remove(0);
        let stored = cloud.get(ResourceKind::Variable, &name).unwrap();
        assert_eq!(stored["value"], json!("s3cr3t"));
        assert_eq!(stored["description"], json!("Registry token"));
    }
}
