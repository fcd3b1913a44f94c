use chrono::{DateTime, Utc};
use dcsync_domain::{EndpointType, OperationType, RegionName, ResourceType, SyncStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Endpoint status ───────────────────────────────────────────────────────────

/// Per (subcloud, endpoint type) synchronization bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub region: RegionName,
    pub endpoint_type: EndpointType,
    pub sync_status: SyncStatus,
    /// When the last reconciliation audit for this scope finished.
    pub last_audit_at: Option<DateTime<Utc>>,
    /// Whether that audit found no discrepancies. The worker only promotes
    /// the endpoint to in-sync when this is set and its queue is drained.
    pub last_audit_clean: bool,
}

impl EndpointStatus {
    pub fn new(region: RegionName, endpoint_type: EndpointType) -> Self {
        Self {
            region,
            endpoint_type,
            sync_status: SyncStatus::Unknown,
            last_audit_at: None,
            last_audit_clean: false,
        }
    }
}

// ── Resource mappings ─────────────────────────────────────────────────────────

/// Links a master-side resource id to its id on one subcloud. At most one row
/// exists per (master_id, region); the row is removed when the subcloud-side
/// resource is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub master_id: String,
    pub region: RegionName,
    pub subcloud_id: String,
    pub resource_type: ResourceType,
    pub created_at: DateTime<Utc>,
}

impl ResourceMapping {
    pub fn new(
        resource_type: ResourceType,
        master_id: impl Into<String>,
        region: RegionName,
        subcloud_id: impl Into<String>,
    ) -> Self {
        Self {
            master_id: master_id.into(),
            region,
            subcloud_id: subcloud_id.into(),
            resource_type,
            created_at: Utc::now(),
        }
    }
}

// ── Work queue ────────────────────────────────────────────────────────────────

/// What to do: one job may fan out to several subclouds as [`OrchRequest`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchJob {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub operation: OperationType,
    /// Master-side id of the resource this job is about. Synthetic for
    /// assignments and user revocation events.
    pub source_resource_id: String,
    /// Optional inline payload (e.g. patch fields, fernet key ring).
    pub resource_info: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl OrchJob {
    pub fn new(
        resource_type: ResourceType,
        operation: OperationType,
        source_resource_id: impl Into<String>,
        resource_info: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_type,
            operation,
            source_resource_id: source_resource_id.into(),
            resource_info,
            created_at: Utc::now(),
        }
    }

    /// Key used for queued-state de-duplication.
    pub fn coalesce_key(&self) -> (ResourceType, OperationType, &str) {
        (self.resource_type, self.operation, &self.source_resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl RequestState {
    /// A job may only be purged once every request of it is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Aborted
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Queued => write!(f, "queued"),
            RequestState::InProgress => write!(f, "in-progress"),
            RequestState::Completed => write!(f, "completed"),
            RequestState::Failed => write!(f, "failed"),
            RequestState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-subcloud instance of an [`OrchJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub region: RegionName,
    pub endpoint_type: EndpointType,
    pub state: RequestState,
    pub attempts: u32,
    /// Monotonic insertion sequence; the worker drains in this order.
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// A claimed request joined with its job, handed to the sync worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request: OrchRequest,
    pub job: OrchJob,
}
