use dcsync_domain::{EndpointType, OperationType, ResourceType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("subcloud not found: {0}")]
    SubcloudNotFound(String),

    #[error("no {endpoint_type} worker for subcloud {region}")]
    WorkerNotFound {
        region: String,
        endpoint_type: EndpointType,
    },

    #[error("{operation} not implemented for {resource_type}")]
    Unsupported {
        resource_type: ResourceType,
        operation: OperationType,
    },

    /// A referenced resource is not present on the subcloud yet. The item is
    /// failed; the next audit pass re-enqueues it after the dependency lands.
    #[error("dependency not ready: {0}")]
    Precondition(String),

    #[error("key rotation failed: {0}")]
    Rotation(String),

    #[error("store error: {0}")]
    Store(#[from] dcsync_store::StoreError),

    #[error("client error: {0}")]
    Client(#[from] dcsync_client::ClientError),

    #[error(transparent)]
    Domain(#[from] dcsync_domain::DomainError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal engine error: {0}")]
    Internal(String),
}
