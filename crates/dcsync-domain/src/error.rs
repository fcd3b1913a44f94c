use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("malformed assignment id: {0} (expected <target>_<actor>_<role>)")]
    MalformedAssignmentId(String),

    #[error("malformed resource info for {resource_type}: {message}")]
    MalformedResourceInfo {
        resource_type: String,
        message: String,
    },

    #[error("missing source resource id for {0} request")]
    MissingSourceId(String),
}
