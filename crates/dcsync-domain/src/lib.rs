pub mod error;
pub mod records;
pub mod types;


pub use error::DomainError;
pub use records::{
    compose_assignment_id, split_assignment_id, user_revoke_event_id, AssignmentIdParts,
    AssignmentRecord, AssignmentType, AssignmentView, LocalUserRecord, NamedRef, PasswordRecord,
    ProjectRecord, RevocationEventRecord, RoleRecord, UserFields, UserRecord,
};
pub use types::{
    Availability, EndpointType, ManagementState, OperationType, RegionName, ResourceType,
    Subcloud, SyncStatus, ADMIN_USER_NAME, FERNET_REPO_MASTER_ID, NULL_DOMAIN_ID,
    SYSTEM_CONTROLLER_REGION,
};
