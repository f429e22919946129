//! Ordered pipelines of reconciliations, threading step outputs forward.

use crate::adapter::{DriftPolicy, KindAdapter, ResourceIdentity, ResourceKind};
use crate::cloud::CloudApi;
use crate::config::Layout;
use crate::document::{lookup_path, Document};
use crate::error::{Result, SetupError};
use crate::reconciler::{reconcile, Outcome};
use crate::roles::{self, BUILDER_PERMISSIONS, EXECUTIVE_PERMISSIONS};
use crate::template::TemplateSet;
use crate::vars::{self, VariableMap};
use crate::varsets::{self, VariableSpec, CREDENTIAL_VARIABLES, ORGANIZATION_VARIABLES};
use serde_json::Value;
use tracing::info;

const CRM_RESOURCE_PREFIX: &str = "//cloudresourcemanager.googleapis.com/";

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub name: &'static str,
    pub kind: ResourceKind,
    pub outcome: Outcome,
}

/// Outcome of every step of one run plus the final variables.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub vars: VariableMap,
}

impl RunReport {
    /// Steps on primary Google Cloud resources; policies, services, billing
    /// links, roles and Terraform Cloud variables are left out.
    pub fn resources(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| {
            !s.kind.is_terraform()
                && !matches!(
                    s.kind,
                    ResourceKind::IamPolicy
                        | ResourceKind::ProjectServices
                        | ResourceKind::BillingInfo
                        | ResourceKind::CustomRole
                )
        })
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn outcome_of(&self, step: &str) -> Option<Outcome> {
        self.steps.iter().find(|s| s.name == step).map(|s| s.outcome)
    }
}

struct Step<'t> {
    name: &'static str,
    kind: ResourceKind,
    template: &'t str,
    identity: ResourceIdentity,
    policy: Option<DriftPolicy>,
}

impl<'t> Step<'t> {
    fn new(name: &'static str, kind: ResourceKind, template: &'t str, identity: ResourceIdentity) -> Self {
        Self { name, kind, template, identity, policy: None }
    }

    fn with_policy(mut self, policy: DriftPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

pub struct Orchestrator<'a> {
    api: &'a dyn CloudApi,
    terraform: &'a dyn CloudApi,
    templates: &'a TemplateSet,
    layout: &'a Layout,
}

impl<'a> Orchestrator<'a> {
    /// `api` serves every kind until [`Orchestrator::with_terraform`] routes
    /// the Terraform Cloud kinds elsewhere.
    pub fn new(api: &'a dyn CloudApi, templates: &'a TemplateSet, layout: &'a Layout) -> Self {
        Self { api, terraform: api, templates, layout }
    }

    pub fn with_terraform(mut self, terraform: &'a dyn CloudApi) -> Self {
        self.terraform = terraform;
        self
    }

    async fn run(&self, steps: &mut Vec<StepReport>, step: Step<'_>, vars: &VariableMap) -> Result<Document> {
        let api = if step.kind.is_terraform() { self.terraform } else { self.api };
        let mut adapter = KindAdapter::new(api, step.kind);
        if let Some(policy) = step.policy {
            adapter = adapter.with_policy(policy);
        }
        let template = self.templates.get(step.template)?;
        let result = reconcile(&adapter, &step.identity, template, vars).await?;
        info!(step = step.name, kind = %step.kind, outcome = %result.outcome, "step done");
        steps.push(StepReport {
            name: step.name,
            kind: step.kind,
            outcome: result.outcome,
        });
        Ok(result.state)
    }

    /// Root project, federation with Terraform Cloud, builder account,
    /// workspaces folder, root tag and the Terraform Cloud variable sets.
    pub async fn build(&self, initial: VariableMap) -> Result<RunReport> {
        let mut report = RunReport { steps: Vec::new(), vars: initial };
        let org = required(&report.vars, vars::ORGANIZATION, "build")?;
        let org_id = required(&report.vars, vars::ORGANIZATION_ID, "build")?;

        // root project
        let step = Step::new(
            "root project",
            ResourceKind::Project,
            "project",
            ResourceIdentity::lookup(org.clone(), "labels.root", "true"),
        );
        let project = match self.run(&mut report.steps, step, &report.vars).await {
            Err(SetupError::AlreadyExists { resource }) => {
                let id = report.vars.get_str(vars::ROOT_PROJECT_ID).unwrap_or_default();
                return Err(SetupError::Config(format!(
                    "project id '{}' is taken ({}), possibly by a project pending deletion. \
                     Set rootProject.id in the overrides file to create the root project under another id.",
                    id, resource
                )));
            }
            other => other?,
        };
        let project_name = output(&project, "name", "root project")?;
        let project_id = output(&project, "projectId", "root project")?;
        report.vars.insert(vars::PROJECT_NAME, project_name.clone());
        report.vars.insert(vars::PROJECT_NUMBER, project_name.trim_start_matches("projects/"));
        report.vars.insert(vars::PROJECT_ID, project_id.clone());

        let step = Step::new(
            "billing",
            ResourceKind::BillingInfo,
            "billing",
            ResourceIdentity::name(format!("projects/{}", project_id)),
        );
        self.run(&mut report.steps, step, &report.vars).await?;

        let step = Step::new(
            "services",
            ResourceKind::ProjectServices,
            "project_services",
            ResourceIdentity::name(project_name.clone()),
        );
        self.run(&mut report.steps, step, &report.vars).await?;

        let step = Step::new(
            "project iam",
            ResourceKind::IamPolicy,
            "project_iam",
            ResourceIdentity::name(project_name.clone()),
        );
        self.run(&mut report.steps, step, &report.vars).await?;

        // workload identity federation
        let pool_id = required(&report.vars, vars::POOL_ID, "pool")?;
        let step = Step::new(
            "pool",
            ResourceKind::WorkloadIdentityPool,
            "pool",
            ResourceIdentity::name(format!("{}/locations/global/workloadIdentityPools/{}", project_name, pool_id)),
        );
        let pool = self.run(&mut report.steps, step, &report.vars).await?;
        let pool_name = output(&pool, "name", "pool")?;
        report.vars.insert(vars::WRK_ID_POOL, pool_name.clone());

        let provider_id = required(&report.vars, vars::PROVIDER_ID, "provider")?;
        let step = Step::new(
            "provider",
            ResourceKind::WorkloadIdentityProvider,
            "provider",
            ResourceIdentity::name(format!("{}/providers/{}", pool_name, provider_id)),
        );
        let provider = self.run(&mut report.steps, step, &report.vars).await?;
        report.vars.insert(vars::WRK_ID_PROVIDER, output(&provider, "name", "provider")?);
        report.vars.insert(vars::PROVIDER_AUDIENCE, output(&provider, "oidc.allowedAudiences.0", "provider")?);

        // builder account
        let account_id = required(&report.vars, vars::BUILDER_ACCOUNT_ID, "builder account")?;
        let email = format!("{}@{}.iam.gserviceaccount.com", account_id, project_id);
        let step = Step::new(
            "builder account",
            ResourceKind::ServiceAccount,
            "service_account",
            ResourceIdentity::name(format!("projects/{}/serviceAccounts/{}", project_id, email)),
        );
        let account = self.run(&mut report.steps, step, &report.vars).await?;
        let account_name = output(&account, "name", "builder account")?;
        report.vars.insert(vars::BUILDER_EMAIL, output(&account, "email", "builder account")?);
        report.vars.insert(vars::BUILDER_NAME, account_name.clone());

        let step = Step::new(
            "account iam",
            ResourceKind::IamPolicy,
            "account_iam",
            ResourceIdentity::name(account_name),
        );
        self.run(&mut report.steps, step, &report.vars).await?;

        // workspaces folder
        let folder_display = required(&report.vars, vars::FOLDER_DISPLAY_NAME, "folder")?;
        let step = Step::new(
            "folder",
            ResourceKind::Folder,
            "folder",
            ResourceIdentity::lookup(org.clone(), "displayName", folder_display),
        );
        let folder = self.run(&mut report.steps, step, &report.vars).await?;
        let folder_name = output(&folder, "name", "folder")?;
        report.vars.insert(vars::FOLDER_NAME, folder_name.clone());
        report.vars.insert(vars::FOLDER_ID, folder_name.trim_start_matches("folders/"));

        let step = Step::new("folder iam", ResourceKind::IamPolicy, "folder_iam", ResourceIdentity::name(folder_name));
        self.run(&mut report.steps, step, &report.vars).await?;

        // root tag
        let key = required(&report.vars, vars::ROOT_TAG_KEY, "tag key")?;
        let value = required(&report.vars, vars::ROOT_TAG_VALUE, "tag value")?;
        let step = Step::new(
            "tag key",
            ResourceKind::TagKey,
            "tag_key",
            ResourceIdentity::name(format!("{}/{}", org_id, key)),
        );
        let tag_key = self.run(&mut report.steps, step, &report.vars).await?;
        report.vars.insert(vars::TAG_KEY_NAME, output(&tag_key, "name", "tag key")?);

        let step = Step::new(
            "tag value",
            ResourceKind::TagValue,
            "tag_value",
            ResourceIdentity::name(format!("{}/{}/{}", org_id, key, value)),
        );
        let tag_value = self.run(&mut report.steps, step, &report.vars).await?;
        let tag_value_name = output(&tag_value, "name", "tag value")?;
        report.vars.insert(vars::TAG_VALUE_NAME, tag_value_name.clone());

        let step = Step::new(
            "tag binding",
            ResourceKind::TagBinding,
            "tag_binding",
            ResourceIdentity::lookup(format!("{}{}", CRM_RESOURCE_PREFIX, project_name), "tagValue", tag_value_name),
        );
        self.run(&mut report.steps, step, &report.vars).await?;

        self.variable_sets(&mut report).await?;
        Ok(report)
    }

    /// Credentials set on the workspaces project, then the global
    /// organization set, each followed by its variables.
    async fn variable_sets(&self, report: &mut RunReport) -> Result<()> {
        let tfc_org = required(&report.vars, vars::TFC_ORGANIZATION, "variable sets")?;
        let tfc_project = required(&report.vars, vars::TFC_WORKSPACE_PROJECT, "variable sets")?;
        let parent = format!("organizations/{}", tfc_org);

        let layout = &self.layout.credentials_variable_set;
        let step = Step::new(
            "credentials variable set",
            ResourceKind::VariableSet,
            "variable_set",
            ResourceIdentity::lookup(parent.clone(), "displayName", layout.name.clone()),
        );
        let set_vars = varsets::set_variables(&report.vars, layout, false, vec![tfc_project]);
        let set = self.run(&mut report.steps, step, &set_vars).await?;
        let set_name = output(&set, "name", "credentials variable set")?;
        self.variables(report, &set_name, CREDENTIAL_VARIABLES).await?;

        let layout = &self.layout.organization_variable_set;
        let step = Step::new(
            "organization variable set",
            ResourceKind::VariableSet,
            "variable_set",
            ResourceIdentity::lookup(parent, "displayName", layout.name.clone()),
        );
        let set_vars = varsets::set_variables(&report.vars, layout, true, Vec::new());
        let set = self.run(&mut report.steps, step, &set_vars).await?;
        let set_name = output(&set, "name", "organization variable set")?;
        self.variables(report, &set_name, ORGANIZATION_VARIABLES).await
    }

    async fn variables(&self, report: &mut RunReport, set: &str, specs: &[VariableSpec]) -> Result<()> {
        for spec in specs {
            let step = Step::new(
                spec.key,
                ResourceKind::Variable,
                "variable",
                ResourceIdentity::lookup(set, "key", spec.key),
            );
            let variable_vars = varsets::variable_variables(&report.vars, set, spec)?;
            self.run(&mut report.steps, step, &variable_vars).await?;
        }
        Ok(())
    }

    /// Authoritative organization IAM policy for the top-level groups.
    pub async fn init(&self, initial: VariableMap) -> Result<RunReport> {
        let mut report = RunReport { steps: Vec::new(), vars: initial };
        let org = required(&report.vars, vars::ORGANIZATION, "init")?;
        let step = Step::new("organization iam", ResourceKind::IamPolicy, "org_iam", ResourceIdentity::name(org));
        self.run(&mut report.steps, step, &report.vars).await?;
        Ok(report)
    }

    /// Executive and builder custom roles, then an additive grant of the
    /// executive role to the executive group on the organization.
    pub async fn roles(&self, initial: VariableMap) -> Result<RunReport> {
        let mut report = RunReport { steps: Vec::new(), vars: initial };
        let org = required(&report.vars, vars::ORGANIZATION, "roles")?;

        let executive = &self.layout.executive_role;
        let executive_name = roles::role_name(&org, &executive.id);
        let step = Step::new(
            "executive role",
            ResourceKind::CustomRole,
            "role",
            ResourceIdentity::name(executive_name.clone()),
        );
        let role_vars = roles::role_variables(&report.vars, executive, EXECUTIVE_PERMISSIONS);
        self.run(&mut report.steps, step, &role_vars).await?;

        let builder = &self.layout.builder_role;
        let step = Step::new(
            "builder role",
            ResourceKind::CustomRole,
            "role",
            ResourceIdentity::name(roles::role_name(&org, &builder.id)),
        );
        let role_vars = roles::role_variables(&report.vars, builder, BUILDER_PERMISSIONS);
        self.run(&mut report.steps, step, &role_vars).await?;

        report.vars.insert(vars::EXECUTIVE_ROLE, executive_name);
        let step = Step::new(
            "organization iam extension",
            ResourceKind::IamPolicy,
            "org_iam_extension",
            ResourceIdentity::name(org),
        )
        .with_policy(DriftPolicy::Additive);
        self.run(&mut report.steps, step, &report.vars).await?;

        Ok(report)
    }
}

fn required(vars: &VariableMap, name: &str, step: &str) -> Result<String> {
    vars.get_str(name).ok_or_else(|| SetupError::MissingVariable {
        template: step.to_string(),
        name: name.to_string(),
    })
}

/// A field a later step depends on, read from the state a step returned.
fn output(state: &Document, field: &str, step: &str) -> Result<String> {
    match lookup_path(state, field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(SetupError::Transport(format!("{} state has no '{}' field", step, field))),
    }
}
