use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("subcloud not found: {0}")]
    SubcloudNotFound(String),

    #[error("orch request not found: {0}")]
    RequestNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
