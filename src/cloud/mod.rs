//! Remote resource API behind a generic describe / create / update interface.

mod gcp;
mod http;
mod memory;
mod operation;
mod terraform;

pub use gcp::GcpCloud;
pub use http::GcpClient;
pub use memory::{Call, Method, MemoryCloud};
pub use operation::OperationPolicy;
pub use terraform::{TerraformCloud, DEFAULT_URL as TERRAFORM_CLOUD_URL};

use crate::adapter::{ResourceIdentity, ResourceKind};
use crate::document::Document;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// `Ok(None)` when nothing matches the identity.
    async fn describe(&self, kind: ResourceKind, identity: &ResourceIdentity) -> Result<Option<Document>>;

    async fn create(&self, kind: ResourceKind, identity: &ResourceIdentity, body: &Document) -> Result<Document>;

    /// Rejected with `ConcurrentModification` when `token` is stale.
    async fn update(
        &self,
        kind: ResourceKind,
        identity: &ResourceIdentity,
        body: &Document,
        token: Option<&str>,
    ) -> Result<Document>;
}
