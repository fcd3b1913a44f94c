use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcsync_domain::{EndpointType, RegionName, Subcloud, SyncStatus};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{
    EndpointStatus, OrchJob, OrchRequest, RequestState, ResourceMapping, WorkItem,
};

/// The engine's local transactional bookkeeping store: subcloud registry,
/// endpoint status, resource mappings, and the durable work queue.
///
/// All writes are strongly consistent. Implementations must uphold:
/// - at most one [`ResourceMapping`] row per (master_id, region);
/// - at most one in-progress [`OrchRequest`] per (region, endpoint_type);
/// - queued requests are claimed in insertion order.
#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    // ── Subcloud registry ─────────────────────────────────────────────────

    async fn get_subcloud(&self, region: &RegionName) -> Result<Option<Subcloud>, StoreError>;
    async fn list_subclouds(&self) -> Result<Vec<Subcloud>, StoreError>;
    async fn upsert_subcloud(&self, subcloud: &Subcloud) -> Result<(), StoreError>;
    async fn delete_subcloud(&self, region: &RegionName) -> Result<(), StoreError>;

    // ── Endpoint status ───────────────────────────────────────────────────

    async fn endpoint_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<EndpointStatus, StoreError>;

    /// Update the sync status for one endpoint. Writes against an unmanaged
    /// subcloud are silently dropped unless the new status is `unknown`.
    async fn set_sync_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        status: SyncStatus,
    ) -> Result<(), StoreError>;

    /// Force every endpoint status of a subcloud to `unknown` (the
    /// managed-to-unmanaged transition).
    async fn set_all_statuses_unknown(&self, region: &RegionName) -> Result<(), StoreError>;

    async fn record_audit_result(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        clean: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Resource mappings ─────────────────────────────────────────────────

    /// Insert or replace the mapping for (mapping.master_id, mapping.region).
    async fn put_mapping(&self, mapping: &ResourceMapping) -> Result<(), StoreError>;

    async fn mapping_by_master(
        &self,
        master_id: &str,
        region: &RegionName,
    ) -> Result<Option<ResourceMapping>, StoreError>;

    async fn mapping_by_subcloud(
        &self,
        region: &RegionName,
        subcloud_id: &str,
    ) -> Result<Option<ResourceMapping>, StoreError>;

    async fn delete_mapping(&self, master_id: &str, region: &RegionName)
        -> Result<(), StoreError>;

    async fn delete_mappings_for_region(&self, region: &RegionName) -> Result<(), StoreError>;

    // ── Work queue ────────────────────────────────────────────────────────

    /// Enqueue one request per region for `job`. A region that already has a
    /// *queued* request with the same (resource_type, operation,
    /// source_resource_id) coalesces onto it: no new request is appended and
    /// the queued one keeps its position. Returns ids of requests actually
    /// created.
    async fn enqueue(
        &self,
        job: &OrchJob,
        regions: &[RegionName],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Claim the oldest queued request for this scope, marking it
    /// in-progress. Returns `None` while another request of the scope is
    /// already in-progress (single in-flight discipline) or the queue is
    /// empty.
    async fn claim_next(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Return an in-progress request to the queue, keeping its position.
    async fn requeue(&self, request_id: Uuid) -> Result<(), StoreError>;

    /// Move a request to a terminal state.
    async fn finish(&self, request_id: Uuid, state: RequestState) -> Result<(), StoreError>;

    async fn queued_count(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<usize, StoreError>;

    async fn list_requests(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<Vec<OrchRequest>, StoreError>;

    /// Abort every non-terminal request targeting a subcloud (delete path).
    async fn abort_requests_for_region(&self, region: &RegionName) -> Result<(), StoreError>;

    /// Delete jobs whose requests are all terminal, together with those
    /// requests. Returns the number of jobs purged.
    async fn purge_terminal_jobs(&self) -> Result<usize, StoreError>;
}
