use rootstrap::cloud::{MemoryCloud, Method};
use rootstrap::config::{self, Layout, Prerequisites, Setup};
use rootstrap::vars;
use rootstrap::{Orchestrator, Outcome, ResourceKind, SetupError, TemplateSet, VariableMap};
use serde_json::{json, Value};

const SETUP: &str = r#"
organization: "123"
billingAccount: 0A1B2C-3D4E5F-6A7B8C
extAdminUser: admin@acme.com
groups:
  finopsGroup: finops@acme.com
  adminsGroup: admins@acme.com
  policyGroup: policy@acme.com
  executiveGroup: exec@acme.com
terraformOrganization: acme-tfc
"#;

fn layout() -> Layout {
    Layout::load(None).unwrap()
}

fn variables() -> VariableMap {
    let setup = Setup::parse(SETUP).unwrap();
    let prerequisites = Prerequisites {
        organization_domain: Some("acme.com".to_string()),
        tfc_organization: None,
        tfc_workspace_project: Some("prj-abc".to_string()),
    }
    .resolve(&setup)
    .unwrap();
    config::variables(&setup, &layout(), &prerequisites)
}

fn members(policy: &Value, role: &str) -> Vec<String> {
    policy["bindings"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|b| b["role"] == json!(role))
        .flat_map(|b| b["members"].as_array().unwrap().iter())
        .map(|m| m.as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn first_build_creates_every_primary_resource_in_order() {
    let cloud = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let report = orchestrator.build(variables()).await.unwrap();

    let kinds: Vec<ResourceKind> = report.resources().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Project,
            ResourceKind::WorkloadIdentityPool,
            ResourceKind::WorkloadIdentityProvider,
            ResourceKind::ServiceAccount,
            ResourceKind::Folder,
            ResourceKind::TagKey,
            ResourceKind::TagValue,
            ResourceKind::TagBinding,
        ]
    );
    assert!(report.resources().all(|s| s.outcome == Outcome::Created));
    assert_eq!(report.count(Outcome::Updated), 0);

    let project_name = report.vars.get_str(vars::PROJECT_NAME).unwrap();
    let project_id = report.vars.get_str(vars::PROJECT_ID).unwrap();
    assert!(project_name.starts_with("projects/"));
    assert!(project_id.starts_with("root-"));

    let email = report.vars.get_str(vars::BUILDER_EMAIL).unwrap();
    assert_eq!(email, format!("builder@{}.iam.gserviceaccount.com", project_id));

    let provider = cloud
        .get(ResourceKind::WorkloadIdentityProvider, &report.vars.get_str(vars::WRK_ID_PROVIDER).unwrap())
        .unwrap();
    assert_eq!(
        provider["attributeCondition"],
        json!("assertion.sub.startsWith(\"organization:acme-tfc:project:prj-abc\")")
    );
    assert_eq!(provider["oidc"]["allowedAudiences"], json!(["https://tfc.acme.com"]));

    let account_policy = cloud
        .get(ResourceKind::IamPolicy, &report.vars.get_str(vars::BUILDER_NAME).unwrap())
        .unwrap();
    let pool = report.vars.get_str(vars::WRK_ID_POOL).unwrap();
    assert_eq!(
        members(&account_policy, "roles/iam.workloadIdentityUser"),
        vec![format!("principalSet://iam.googleapis.com/{}/attribute.terraform_project_id/prj-abc", pool)]
    );

    let folder_policy = cloud
        .get(ResourceKind::IamPolicy, &report.vars.get_str(vars::FOLDER_NAME).unwrap())
        .unwrap();
    assert_eq!(
        members(&folder_policy, "organizations/123/roles/builderRole"),
        vec![format!("serviceAccount:{}", email)]
    );

    let services = cloud.get(ResourceKind::ProjectServices, &project_name).unwrap();
    assert_eq!(services["services"].as_array().unwrap().len(), layout.root_project.services.len());
    let billing = cloud.get(ResourceKind::BillingInfo, &format!("projects/{}", project_id)).unwrap();
    assert_eq!(billing["billingAccountName"], json!("billingAccounts/0A1B2C-3D4E5F-6A7B8C"));
}

#[tokio::test]
async fn second_build_changes_nothing() {
    let cloud = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let first = orchestrator.build(variables()).await.unwrap();
    cloud.clear_calls();
    let second = orchestrator.build(variables()).await.unwrap();

    assert_eq!(second.steps.len(), first.steps.len());
    assert!(second.steps.iter().all(|s| s.outcome == Outcome::Unchanged));
    assert!(cloud.writes().is_empty());
    assert_eq!(second.vars, first.vars);
}

#[tokio::test]
async fn out_of_band_binding_on_the_builder_account_is_reverted() {
    let cloud = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let first = orchestrator.build(variables()).await.unwrap();
    let account = first.vars.get_str(vars::BUILDER_NAME).unwrap();
    let before = cloud.get(ResourceKind::IamPolicy, &account).unwrap();

    assert!(cloud.mutate(ResourceKind::IamPolicy, &account, |policy| {
        policy["bindings"]
            .as_array_mut()
            .unwrap()
            .push(json!({"role": "roles/iam.serviceAccountUser", "members": ["user:intruder@acme.com"]}));
    }));

    let second = orchestrator.build(variables()).await.unwrap();
    let updated: Vec<&str> = second
        .steps
        .iter()
        .filter(|s| s.outcome == Outcome::Updated)
        .map(|s| s.name)
        .collect();
    assert_eq!(updated, vec!["account iam"]);

    let after = cloud.get(ResourceKind::IamPolicy, &account).unwrap();
    assert!(members(&after, "roles/iam.serviceAccountUser").is_empty());
    assert_eq!(after["bindings"], before["bindings"]);
}

#[tokio::test]
async fn lost_creation_race_is_reported_unchanged() {
    let cloud = MemoryCloud::new();
    cloud.race_next_create(ResourceKind::ServiceAccount);
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let report = orchestrator.build(variables()).await.unwrap();
    assert_eq!(report.outcome_of("builder account"), Some(Outcome::Unchanged));
    assert_eq!(report.outcome_of("account iam"), Some(Outcome::Created));

    let account_calls: Vec<Method> = cloud
        .calls()
        .iter()
        .filter(|c| c.kind == ResourceKind::ServiceAccount)
        .map(|c| c.method)
        .collect();
    assert_eq!(account_calls, vec![Method::Describe, Method::Create, Method::Describe]);
}

#[tokio::test]
async fn concurrent_write_between_read_and_update_stops_the_run() {
    let cloud = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let first = orchestrator.build(variables()).await.unwrap();
    let project = first.vars.get_str(vars::PROJECT_NAME).unwrap();
    cloud.mutate(ResourceKind::IamPolicy, &project, |policy| {
        policy["bindings"][0]["members"] = json!(["group:someone-else@acme.com"]);
    });
    let auditor = json!({"role": "roles/viewer", "members": ["user:auditor@acme.com"]});
    let mut edited = cloud.get(ResourceKind::IamPolicy, &project).unwrap();
    edited["bindings"].as_array_mut().unwrap().push(auditor.clone());

    cloud.mutate_after_next_describe(ResourceKind::IamPolicy, move |policy| {
        policy["bindings"].as_array_mut().unwrap().push(auditor);
    });
    let err = orchestrator.build(variables()).await.unwrap_err();
    assert!(matches!(err, SetupError::ConcurrentModification { .. }));

    let stored = cloud.get(ResourceKind::IamPolicy, &project).unwrap();
    assert_eq!(stored["bindings"], edited["bindings"]);
    assert_ne!(stored["etag"], edited["etag"]);
    let last = cloud.calls().last().cloned().unwrap();
    assert_eq!((last.method, last.kind), (Method::Update, ResourceKind::IamPolicy));
}

fn variable(cloud: &MemoryCloud, key: &str) -> Value {
    cloud
        .names(ResourceKind::Variable)
        .iter()
        .filter_map(|name| cloud.get(ResourceKind::Variable, name))
        .find(|v| v["key"] == json!(key))
        .unwrap_or_else(|| panic!("no variable {}", key))
}

#[tokio::test]
async fn build_hands_the_structure_to_terraform_cloud() {
    let gcp = MemoryCloud::new();
    let tfc = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&gcp, &templates, &layout).with_terraform(&tfc);

    let report = orchestrator.build(variables()).await.unwrap();
    assert!(gcp.calls().iter().all(|c| !c.kind.is_terraform()));
    assert!(tfc.calls().iter().all(|c| c.kind.is_terraform()));
    assert_eq!(report.outcome_of("credentials variable set"), Some(Outcome::Created));
    assert_eq!(report.outcome_of("organization variable set"), Some(Outcome::Created));
    let variables_created = report
        .steps
        .iter()
        .filter(|s| s.kind == ResourceKind::Variable && s.outcome == Outcome::Created)
        .count();
    assert_eq!(variables_created, 9);

    let sets: Vec<Value> = tfc
        .names(ResourceKind::VariableSet)
        .iter()
        .filter_map(|name| tfc.get(ResourceKind::VariableSet, name))
        .collect();
    let credentials = sets.iter().find(|s| s["displayName"] == json!("gcp-credentials")).unwrap();
    assert_eq!(credentials["global"], json!(false));
    assert_eq!(credentials["projects"], json!(["prj-abc"]));
    assert_eq!(credentials["parent"], json!("organizations/acme-tfc"));
    let organization = sets.iter().find(|s| s["displayName"] == json!("gcp-organization")).unwrap();
    assert_eq!(organization["global"], json!(true));

    let provider = report.vars.get_str(vars::WRK_ID_PROVIDER).unwrap();
    assert_eq!(variable(&tfc, "TFC_GCP_WORKLOAD_PROVIDER_NAME")["value"], json!(provider));
    assert_eq!(variable(&tfc, "TFC_GCP_WORKLOAD_IDENTITY_AUDIENCE")["value"], json!("https://tfc.acme.com"));
    assert_eq!(variable(&tfc, "TFC_GCP_PROVIDER_AUTH")["value"], json!("true"));
    let email = variable(&tfc, "TFC_GCP_RUN_SERVICE_ACCOUNT_EMAIL");
    assert_eq!(email["value"], json!(report.vars.get_str(vars::BUILDER_EMAIL).unwrap()));
    assert_eq!(email["category"], json!("env"));
    assert_eq!(email["sensitive"], json!(true));
    assert_eq!(email["parent"], credentials["name"]);
    assert_eq!(variable(&tfc, "project")["value"], json!(report.vars.get_str(vars::PROJECT_ID).unwrap()));

    let folder = report.vars.get_str(vars::FOLDER_NAME).unwrap();
    let workspaces_folder = variable(&tfc, "workspaces_folder");
    assert_eq!(workspaces_folder["value"], json!(folder.trim_start_matches("folders/")));
    assert_eq!(workspaces_folder["parent"], organization["name"]);
    assert_eq!(variable(&tfc, "billing_account")["value"], json!("0A1B2C-3D4E5F-6A7B8C"));
    assert_eq!(variable(&tfc, "organization")["value"], json!("acme.com"));
    assert_eq!(variable(&tfc, "region")["value"], json!("europe-west1"));
    assert_eq!(variable(&tfc, "region")["category"], json!("terraform"));

    tfc.clear_calls();
    let again = orchestrator.build(variables()).await.unwrap();
    assert!(again.steps.iter().all(|s| s.outcome == Outcome::Unchanged));
    assert!(tfc.writes().is_empty());
}

#[tokio::test]
async fn changed_variable_value_is_updated_in_place() {
    let gcp = MemoryCloud::new();
    let tfc = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&gcp, &templates, &layout).with_terraform(&tfc);

    orchestrator.build(variables()).await.unwrap();
    let region = variable(&tfc, "region");
    let name = region["name"].as_str().unwrap().to_string();
    tfc.mutate(ResourceKind::Variable, &name, |v| v["value"] = json!("us-central1"));

    let report = orchestrator.build(variables()).await.unwrap();
    assert_eq!(report.outcome_of("region"), Some(Outcome::Updated));
    assert_eq!(tfc.get(ResourceKind::Variable, &name).unwrap()["value"], json!("europe-west1"));
    assert_eq!(tfc.names(ResourceKind::Variable).len(), 9);
}

#[tokio::test]
async fn root_project_id_held_by_a_deleted_project_names_the_override() {
    let cloud = MemoryCloud::new();
    let derived = variables().get_str(vars::ROOT_PROJECT_ID).unwrap();
    cloud.seed(
        ResourceKind::Project,
        "projects/999",
        json!({
            "projectId": derived,
            "parent": "organizations/123",
            "labels": {"root": "true"},
            "state": "DELETE_REQUESTED",
        }),
    );
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let err = orchestrator.build(variables()).await.unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, SetupError::Config(_)));
    assert!(message.contains(&derived), "{}", message);
    assert!(message.contains("rootProject.id"), "{}", message);

    let mut pinned = layout.clone();
    pinned.root_project.id = "root-acme-2".to_string();
    let setup = Setup::parse(SETUP).unwrap();
    let prerequisites = Prerequisites {
        organization_domain: Some("acme.com".to_string()),
        tfc_organization: None,
        tfc_workspace_project: Some("prj-abc".to_string()),
    }
    .resolve(&setup)
    .unwrap();
    let orchestrator = Orchestrator::new(&cloud, &templates, &pinned);
    let report = orchestrator.build(config::variables(&setup, &pinned, &prerequisites)).await.unwrap();
    assert_eq!(report.outcome_of("root project"), Some(Outcome::Created));
    assert_eq!(report.vars.get_str(vars::PROJECT_ID).as_deref(), Some("root-acme-2"));
}

#[tokio::test]
async fn missing_variable_fails_before_any_call() {
    let cloud = MemoryCloud::new();
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let full = variables();
    let incomplete: VariableMap = full
        .names()
        .filter(|n| *n != vars::ROOT_PROJECT_ID)
        .map(|n| (n.to_string(), full.get(n).cloned().unwrap_or(Value::Null)))
        .collect();

    let err = orchestrator.build(incomplete).await.unwrap_err();
    assert!(matches!(err, SetupError::MissingVariable { ref name, .. } if name == vars::ROOT_PROJECT_ID));
    assert!(cloud.calls().is_empty());
}

#[test]
fn missing_prerequisites_are_all_named() {
    let setup = Setup::parse(SETUP).unwrap();
    let err = Prerequisites::default().resolve(&setup).unwrap_err();
    match &err {
        SetupError::MissingPrerequisite { names } => {
            assert_eq!(names, &vec![vars::ORGANIZATION_DOMAIN.to_string(), vars::TFC_WORKSPACE_PROJECT.to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn init_sets_an_authoritative_organization_policy() {
    let cloud = MemoryCloud::new();
    cloud.seed(
        ResourceKind::IamPolicy,
        "organizations/123",
        json!({"bindings": [{"role": "roles/owner", "members": ["user:former-admin@acme.com"]}]}),
    );
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let report = orchestrator.init(variables()).await.unwrap();
    assert_eq!(report.outcome_of("organization iam"), Some(Outcome::Updated));

    let policy = cloud.get(ResourceKind::IamPolicy, "organizations/123").unwrap();
    assert!(members(&policy, "roles/owner").is_empty());
    assert_eq!(
        members(&policy, "roles/resourcemanager.organizationAdmin"),
        vec!["group:admins@acme.com".to_string(), "user:admin@acme.com".to_string()]
    );

    let again = orchestrator.init(variables()).await.unwrap();
    assert_eq!(again.outcome_of("organization iam"), Some(Outcome::Unchanged));
}

#[tokio::test]
async fn roles_are_created_and_granted_additively() {
    let cloud = MemoryCloud::new();
    cloud.seed(
        ResourceKind::IamPolicy,
        "organizations/123",
        json!({"bindings": [{"role": "roles/billing.admin", "members": ["group:finops@acme.com"]}]}),
    );
    let templates = TemplateSet::embedded().unwrap();
    let layout = layout();
    let orchestrator = Orchestrator::new(&cloud, &templates, &layout);

    let report = orchestrator.roles(variables()).await.unwrap();
    assert_eq!(report.outcome_of("executive role"), Some(Outcome::Created));
    assert_eq!(report.outcome_of("builder role"), Some(Outcome::Created));
    assert_eq!(report.outcome_of("organization iam extension"), Some(Outcome::Updated));

    let role = cloud.get(ResourceKind::CustomRole, "organizations/123/roles/executiveRole").unwrap();
    assert_eq!(role["title"], json!("Executive"));
    assert_eq!(role["includedPermissions"].as_array().unwrap().len(), rootstrap::roles::EXECUTIVE_PERMISSIONS.len());

    let policy = cloud.get(ResourceKind::IamPolicy, "organizations/123").unwrap();
    assert_eq!(members(&policy, "roles/billing.admin"), vec!["group:finops@acme.com".to_string()]);
    assert_eq!(
        members(&policy, "organizations/123/roles/executiveRole"),
        vec!["group:exec@acme.com".to_string()]
    );

    cloud.clear_calls();
    let again = orchestrator.roles(variables()).await.unwrap();
    assert!(again.steps.iter().all(|s| s.outcome == Outcome::Unchanged));
    assert!(cloud.writes().is_empty());
}
