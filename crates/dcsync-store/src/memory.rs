use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcsync_domain::{EndpointType, ManagementState, RegionName, Subcloud, SyncStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{
    EndpointStatus, OrchJob, OrchRequest, RequestState, ResourceMapping, WorkItem,
};
use crate::store::SyncStore;

#[derive(Debug, Default)]
struct Inner {
    subclouds: HashMap<RegionName, Subcloud>,
    statuses: HashMap<(RegionName, EndpointType), EndpointStatus>,
    mappings: HashMap<(String, RegionName), ResourceMapping>,
    jobs: HashMap<Uuid, OrchJob>,
    requests: HashMap<Uuid, OrchRequest>,
    next_seq: u64,
}

impl Inner {
    fn status_allowed(&self, region: &RegionName, status: SyncStatus) -> Result<bool, StoreError> {
        let subcloud = self
            .subclouds
            .get(region)
            .ok_or_else(|| StoreError::SubcloudNotFound(region.to_string()))?;
        // Status writes against unmanaged subclouds are dropped unless the
        // write forces the status back to unknown.
        Ok(subcloud.management_state == ManagementState::Managed || status == SyncStatus::Unknown)
    }
}

/// In-memory implementation of [`SyncStore`].
///
/// All data is lost on process exit. Suitable for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for InMemoryStore {
    async fn get_subcloud(&self, region: &RegionName) -> Result<Option<Subcloud>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.subclouds.get(region).cloned())
    }

    async fn list_subclouds(&self) -> Result<Vec<Subcloud>, StoreError> {
        let guard = self.inner.read().await;
        let mut list: Vec<Subcloud> = guard.subclouds.values().cloned().collect();
        list.sort_by(|a, b| a.region_name.as_str().cmp(b.region_name.as_str()));
        Ok(list)
    }

    async fn upsert_subcloud(&self, subcloud: &Subcloud) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .subclouds
            .insert(subcloud.region_name.clone(), subcloud.clone());
        Ok(())
    }

    async fn delete_subcloud(&self, region: &RegionName) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.subclouds.remove(region);
        guard.statuses.retain(|(r, _), _| r != region);
        Ok(())
    }

    async fn endpoint_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<EndpointStatus, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .statuses
            .get(&(region.clone(), endpoint_type))
            .cloned()
            .unwrap_or_else(|| EndpointStatus::new(region.clone(), endpoint_type)))
    }

    async fn set_sync_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.status_allowed(region, status)? {
            return Ok(());
        }
        let entry = guard
            .statuses
            .entry((region.clone(), endpoint_type))
            .or_insert_with(|| EndpointStatus::new(region.clone(), endpoint_type));
        entry.sync_status = status;
        Ok(())
    }

    async fn set_all_statuses_unknown(&self, region: &RegionName) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        for endpoint_type in EndpointType::ALL {
            let entry = guard
                .statuses
                .entry((region.clone(), endpoint_type))
                .or_insert_with(|| EndpointStatus::new(region.clone(), endpoint_type));
            entry.sync_status = SyncStatus::Unknown;
            entry.last_audit_clean = false;
        }
        Ok(())
    }

    async fn record_audit_result(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        clean: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let entry = guard
            .statuses
            .entry((region.clone(), endpoint_type))
            .or_insert_with(|| EndpointStatus::new(region.clone(), endpoint_type));
        entry.last_audit_at = Some(at);
        entry.last_audit_clean = clean;
        Ok(())
    }

    async fn put_mapping(&self, mapping: &ResourceMapping) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.mappings.insert(
            (mapping.master_id.clone(), mapping.region.clone()),
            mapping.clone(),
        );
        Ok(())
    }

    async fn mapping_by_master(
        &self,
        master_id: &str,
        region: &RegionName,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .mappings
            .get(&(master_id.to_string(), region.clone()))
            .cloned())
    }

    async fn mapping_by_subcloud(
        &self,
        region: &RegionName,
        subcloud_id: &str,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .mappings
            .values()
            .find(|m| &m.region == region && m.subcloud_id == subcloud_id)
            .cloned())
    }

    async fn delete_mapping(
        &self,
        master_id: &str,
        region: &RegionName,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .mappings
            .remove(&(master_id.to_string(), region.clone()));
        Ok(())
    }

    async fn delete_mappings_for_region(&self, region: &RegionName) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.mappings.retain(|(_, r), _| r != region);
        Ok(())
    }

    async fn enqueue(
        &self,
        job: &OrchJob,
        regions: &[RegionName],
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut guard = self.inner.write().await;
        let mut created = Vec::new();
        for region in regions {
            let duplicate = guard.requests.values().any(|r| {
                r.state == RequestState::Queued
                    && &r.region == region
                    && guard
                        .jobs
                        .get(&r.job_id)
                        .map(|j| j.coalesce_key() == job.coalesce_key())
                        .unwrap_or(false)
            });
            if duplicate {
                continue;
            }
            let seq = guard.next_seq;
            guard.next_seq += 1;
            let request = OrchRequest {
                id: Uuid::new_v4(),
                job_id: job.id,
                region: region.clone(),
                endpoint_type: job.resource_type.endpoint_type(),
                state: RequestState::Queued,
                attempts: 0,
                seq,
                updated_at: Utc::now(),
            };
            created.push(request.id);
            guard.requests.insert(request.id, request);
        }
        if !created.is_empty() {
            guard.jobs.insert(job.id, job.clone());
        }
        Ok(created)
    }

    async fn claim_next(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<Option<WorkItem>, StoreError> {
        let mut guard = self.inner.write().await;
        let in_flight = guard.requests.values().any(|r| {
            &r.region == region
                && r.endpoint_type == endpoint_type
                && r.state == RequestState::InProgress
        });
        if in_flight {
            return Ok(None);
        }
        let next_id = guard
            .requests
            .values()
            .filter(|r| {
                &r.region == region
                    && r.endpoint_type == endpoint_type
                    && r.state == RequestState::Queued
            })
            .min_by_key(|r| r.seq)
            .map(|r| r.id);
        let Some(id) = next_id else {
            return Ok(None);
        };
        let request = guard
            .requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))?;
        request.state = RequestState::InProgress;
        request.attempts += 1;
        request.updated_at = Utc::now();
        let request = request.clone();
        let job = guard
            .jobs
            .get(&request.job_id)
            .cloned()
            .ok_or_else(|| StoreError::Internal(format!("job {} missing", request.job_id)))?;
        Ok(Some(WorkItem { request, job }))
    }

    async fn requeue(&self, request_id: Uuid) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let request = guard
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::RequestNotFound(request_id.to_string()))?;
        request.state = RequestState::Queued;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(&self, request_id: Uuid, state: RequestState) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let request = guard
            .requests
            .get_mut(&request_id)
            .ok_or_else(|| StoreError::RequestNotFound(request_id.to_string()))?;
        request.state = state;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn queued_count(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<usize, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .requests
            .values()
            .filter(|r| {
                &r.region == region
                    && r.endpoint_type == endpoint_type
                    && !r.state.is_terminal()
            })
            .count())
    }

    async fn list_requests(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<Vec<OrchRequest>, StoreError> {
        let guard = self.inner.read().await;
        let mut list: Vec<OrchRequest> = guard
            .requests
            .values()
            .filter(|r| &r.region == region && r.endpoint_type == endpoint_type)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.seq);
        Ok(list)
    }

    async fn abort_requests_for_region(&self, region: &RegionName) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        for request in guard.requests.values_mut() {
            if &request.region == region && !request.state.is_terminal() {
                request.state = RequestState::Aborted;
                request.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn purge_terminal_jobs(&self) -> Result<usize, StoreError> {
        let mut guard = self.inner.write().await;
        let job_ids: Vec<Uuid> = guard.jobs.keys().cloned().collect();
        let mut purged = 0;
        for job_id in job_ids {
            let all_terminal = guard
                .requests
                .values()
                .filter(|r| r.job_id == job_id)
                .all(|r| r.state.is_terminal());
            if all_terminal {
                guard.jobs.remove(&job_id);
                guard.requests.retain(|_, r| r.job_id != job_id);
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcsync_domain::{Availability, OperationType, ResourceType};

    fn dummy_subcloud(region: &str, state: ManagementState) -> Subcloud {
        Subcloud {
            region_name: RegionName::new(region),
            software_version: "24.03".into(),
            management_state: state,
            availability: Availability::Online,
            management_subnet: "192.168.101.0/24".into(),
            management_start_ip: "192.168.101.2".into(),
            management_end_ip: "192.168.101.50".into(),
            systemcontroller_gateway_ip: "192.168.204.101".into(),
            created_at: Utc::now(),
        }
    }

    fn user_job(master_id: &str, op: OperationType) -> OrchJob {
        OrchJob::new(ResourceType::Users, op, master_id, None)
    }

    #[tokio::test]
    async fn subcloud_round_trip() {
        let store = InMemoryStore::new();
        let sc = dummy_subcloud("subcloud-1", ManagementState::Managed);
        store.upsert_subcloud(&sc).await.unwrap();

        let got = store
            .get_subcloud(&RegionName::new("subcloud-1"))
            .await
            .unwrap();
        assert_eq!(got, Some(sc));

        store
            .delete_subcloud(&RegionName::new("subcloud-1"))
            .await
            .unwrap();
        assert!(store
            .get_subcloud(&RegionName::new("subcloud-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_writes_dropped_while_unmanaged() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");
        store
            .upsert_subcloud(&dummy_subcloud("subcloud-1", ManagementState::Unmanaged))
            .await
            .unwrap();

        store
            .set_sync_status(&region, EndpointType::Identity, SyncStatus::InSync)
            .await
            .unwrap();
        let status = store
            .endpoint_status(&region, EndpointType::Identity)
            .await
            .unwrap();
        assert_eq!(status.sync_status, SyncStatus::Unknown, "write dropped");

        // Forcing unknown is always allowed.
        store
            .set_sync_status(&region, EndpointType::Identity, SyncStatus::Unknown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn managed_status_write_sticks_and_unmanage_resets() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");
        store
            .upsert_subcloud(&dummy_subcloud("subcloud-1", ManagementState::Managed))
            .await
            .unwrap();
        store
            .set_sync_status(&region, EndpointType::Identity, SyncStatus::OutOfSync)
            .await
            .unwrap();
        assert_eq!(
            store
                .endpoint_status(&region, EndpointType::Identity)
                .await
                .unwrap()
                .sync_status,
            SyncStatus::OutOfSync
        );

        store.set_all_statuses_unknown(&region).await.unwrap();
        for endpoint_type in EndpointType::ALL {
            assert_eq!(
                store
                    .endpoint_status(&region, endpoint_type)
                    .await
                    .unwrap()
                    .sync_status,
                SyncStatus::Unknown
            );
        }
    }

    #[tokio::test]
    async fn mapping_is_unique_per_master_and_region() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");
        store
            .put_mapping(&ResourceMapping::new(
                ResourceType::Users,
                "u-1",
                region.clone(),
                "u-7",
            ))
            .await
            .unwrap();
        // Second put replaces, never duplicates.
        store
            .put_mapping(&ResourceMapping::new(
                ResourceType::Users,
                "u-1",
                region.clone(),
                "u-8",
            ))
            .await
            .unwrap();

        let got = store.mapping_by_master("u-1", &region).await.unwrap().unwrap();
        assert_eq!(got.subcloud_id, "u-8");
        assert!(store
            .mapping_by_subcloud(&region, "u-7")
            .await
            .unwrap()
            .is_none());

        store.delete_mapping("u-1", &region).await.unwrap();
        assert!(store.mapping_by_master("u-1", &region).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_coalesces_queued_duplicates() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");

        let first = user_job("u-1", OperationType::Create);
        let created = store.enqueue(&first, &[region.clone()]).await.unwrap();
        assert_eq!(created.len(), 1);

        // Same (resource, op, master id) while still queued: coalesce.
        let dup = user_job("u-1", OperationType::Create);
        let created = store.enqueue(&dup, &[region.clone()]).await.unwrap();
        assert!(created.is_empty());
        assert_eq!(
            store
                .queued_count(&region, EndpointType::Identity)
                .await
                .unwrap(),
            1
        );

        // A different operation for the same resource is separate work.
        let delete = user_job("u-1", OperationType::Delete);
        let created = store.enqueue(&delete, &[region.clone()]).await.unwrap();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn claim_respects_insertion_order_and_single_flight() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");

        store
            .enqueue(&user_job("u-1", OperationType::Create), &[region.clone()])
            .await
            .unwrap();
        store
            .enqueue(&user_job("u-2", OperationType::Create), &[region.clone()])
            .await
            .unwrap();

        let first = store
            .claim_next(&region, EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.job.source_resource_id, "u-1");
        assert_eq!(first.request.attempts, 1);

        // One in-flight item per scope.
        assert!(store
            .claim_next(&region, EndpointType::Identity)
            .await
            .unwrap()
            .is_none());

        store
            .finish(first.request.id, RequestState::Completed)
            .await
            .unwrap();
        let second = store
            .claim_next(&region, EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.job.source_resource_id, "u-2");
    }

    #[tokio::test]
    async fn requeue_keeps_queue_position() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");
        store
            .enqueue(&user_job("u-1", OperationType::Create), &[region.clone()])
            .await
            .unwrap();
        store
            .enqueue(&user_job("u-2", OperationType::Create), &[region.clone()])
            .await
            .unwrap();

        let item = store
            .claim_next(&region, EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        store.requeue(item.request.id).await.unwrap();

        // The requeued item is claimed again before newer work.
        let again = store
            .claim_next(&region, EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.job.source_resource_id, "u-1");
        assert_eq!(again.request.attempts, 2);
    }

    #[tokio::test]
    async fn fan_out_creates_one_request_per_region() {
        let store = InMemoryStore::new();
        let regions = [
            RegionName::new("subcloud-1"),
            RegionName::new("subcloud-2"),
            RegionName::new("subcloud-3"),
        ];
        let job = OrchJob::new(
            ResourceType::FernetRepo,
            OperationType::Put,
            "keys",
            Some(serde_json::json!({"0": "material"})),
        );
        let created = store.enqueue(&job, &regions).await.unwrap();
        assert_eq!(created.len(), 3);
        for region in &regions {
            assert_eq!(
                store
                    .queued_count(region, EndpointType::Platform)
                    .await
                    .unwrap(),
                1
            );
        }
    }

    #[tokio::test]
    async fn purge_removes_only_fully_terminal_jobs() {
        let store = InMemoryStore::new();
        let regions = [RegionName::new("subcloud-1"), RegionName::new("subcloud-2")];
        let job = user_job("u-1", OperationType::Create);
        store.enqueue(&job, &regions).await.unwrap();

        let item = store
            .claim_next(&regions[0], EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        store
            .finish(item.request.id, RequestState::Completed)
            .await
            .unwrap();

        // One request still queued for subcloud-2: nothing purged.
        assert_eq!(store.purge_terminal_jobs().await.unwrap(), 0);

        let item = store
            .claim_next(&regions[1], EndpointType::Identity)
            .await
            .unwrap()
            .unwrap();
        store
            .finish(item.request.id, RequestState::Failed)
            .await
            .unwrap();
        assert_eq!(store.purge_terminal_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn abort_requests_for_region() {
        let store = InMemoryStore::new();
        let region = RegionName::new("subcloud-1");
        store
            .enqueue(&user_job("u-1", OperationType::Create), &[region.clone()])
            .await
            .unwrap();
        store.abort_requests_for_region(&region).await.unwrap();
        assert_eq!(
            store
                .queued_count(&region, EndpointType::Identity)
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.purge_terminal_jobs().await.unwrap(), 1);
    }
}
