//! Idempotent bootstrap of a GCP organization root structure federated with
//! Terraform Cloud, including the variable sets that hand it to the workspaces.

pub mod adapter;
pub mod cloud;
pub mod config;
pub mod document;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod roles;
pub mod template;
pub mod vars;
pub mod varsets;

pub use adapter::{DriftPolicy, KindAdapter, ResourceAdapter, ResourceIdentity, ResourceKind};
pub use cloud::{CloudApi, GcpCloud, MemoryCloud, TerraformCloud};
pub use error::{Result, SetupError};
pub use orchestrator::{Orchestrator, RunReport, StepReport};
pub use reconciler::{reconcile, Outcome, Reconciliation};
pub use template::{Template, TemplateSet};
pub use vars::VariableMap;
