use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Well-known names ──────────────────────────────────────────────────────────

/// Region name of the system controller (master) cloud.
pub const SYSTEM_CONTROLLER_REGION: &str = "SystemController";

/// Master-side resource id used for the fernet key ring. There is exactly one
/// key ring per cloud, so the id is a constant.
pub const FERNET_REPO_MASTER_ID: &str = "keys";

/// Sentinel domain id stored on roles that belong to no domain. The backend
/// uses this literal instead of NULL so the (name, domain) uniqueness
/// constraint still applies.
pub const NULL_DOMAIN_ID: &str = "<<null>>";

/// Local user name whose replication forces the subcloud session to be
/// rebuilt (its password may just have changed under us).
pub const ADMIN_USER_NAME: &str = "admin";

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionName(pub String);

impl RegionName {
    pub fn new(s: impl Into<String>) -> Self {
        RegionName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementState {
    Managed,
    Unmanaged,
}

impl std::fmt::Display for ManagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "managed"),
            ManagementState::Unmanaged => write!(f, "unmanaged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Online => write!(f, "online"),
            Availability::Offline => write!(f, "offline"),
        }
    }
}

/// Per (subcloud, endpoint type) synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    Unknown,
    InSync,
    OutOfSync,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Unknown => write!(f, "unknown"),
            SyncStatus::InSync => write!(f, "in-sync"),
            SyncStatus::OutOfSync => write!(f, "out-of-sync"),
        }
    }
}

/// A category of resources synchronized together. Each endpoint type gets its
/// own worker per subcloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Identity,
    Platform,
}

impl EndpointType {
    pub const ALL: [EndpointType; 2] = [EndpointType::Identity, EndpointType::Platform];
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointType::Identity => write!(f, "identity"),
            EndpointType::Platform => write!(f, "platform"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Users,
    Projects,
    Roles,
    Assignments,
    RevokeEvents,
    UserRevokeEvents,
    FernetRepo,
}

impl ResourceType {
    /// Which endpoint type's worker services this resource type.
    pub fn endpoint_type(&self) -> EndpointType {
        match self {
            ResourceType::Users
            | ResourceType::Projects
            | ResourceType::Roles
            | ResourceType::Assignments
            | ResourceType::RevokeEvents
            | ResourceType::UserRevokeEvents => EndpointType::Identity,
            ResourceType::FernetRepo => EndpointType::Platform,
        }
    }

    /// Audit order. Users come first because services may hold unscoped
    /// tokens, and assignments reference users, projects and roles by id.
    pub const AUDIT_ORDER: [ResourceType; 6] = [
        ResourceType::Users,
        ResourceType::Projects,
        ResourceType::Roles,
        ResourceType::Assignments,
        ResourceType::RevokeEvents,
        ResourceType::UserRevokeEvents,
    ];
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Users => write!(f, "users"),
            ResourceType::Projects => write!(f, "projects"),
            ResourceType::Roles => write!(f, "roles"),
            ResourceType::Assignments => write!(f, "assignments"),
            ResourceType::RevokeEvents => write!(f, "revoke_events"),
            ResourceType::UserRevokeEvents => write!(f, "user_revoke_events"),
            ResourceType::FernetRepo => write!(f, "fernet_repo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Put => write!(f, "put"),
            OperationType::Patch => write!(f, "patch"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

// ── Subcloud ──────────────────────────────────────────────────────────────────

/// Registry record for one managed subcloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subcloud {
    pub region_name: RegionName,
    pub software_version: String,
    pub management_state: ManagementState,
    pub availability: Availability,
    pub management_subnet: String,
    pub management_start_ip: String,
    pub management_end_ip: String,
    pub systemcontroller_gateway_ip: String,
    pub created_at: DateTime<Utc>,
}

impl Subcloud {
    pub fn is_managed(&self) -> bool {
        self.management_state == ManagementState::Managed
    }

    /// Deletion is only permitted for unmanaged, offline subclouds.
    pub fn is_deletable(&self) -> bool {
        self.management_state == ManagementState::Unmanaged
            && self.availability == Availability::Offline
    }
}
