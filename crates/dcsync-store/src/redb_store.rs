use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcsync_domain::{EndpointType, ManagementState, RegionName, Subcloud, SyncStatus};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{
    EndpointStatus, OrchJob, OrchRequest, RequestState, ResourceMapping, WorkItem,
};
use crate::store::SyncStore;

const SUBCLOUDS: TableDefinition<&str, &[u8]> = TableDefinition::new("subclouds");
const STATUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoint_statuses");
const MAPPINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_mappings");
const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("orch_jobs");
const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("orch_requests");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

fn internal(e: impl std::fmt::Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

fn status_key(region: &RegionName, endpoint_type: EndpointType) -> String {
    format!("{}|{}", region, endpoint_type)
}

fn mapping_key(master_id: &str, region: &RegionName) -> String {
    format!("{}|{}", master_id, region)
}

/// Persistent [`SyncStore`] backed by a redb database file.
///
/// The work queue and mapping table survive process restarts, which is what
/// lets an interrupted sync replay its remaining items.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Ensure tables exist
        {
            let wtxn = db.begin_write().map_err(internal)?;
            wtxn.open_table(SUBCLOUDS).map_err(internal)?;
            wtxn.open_table(STATUSES).map_err(internal)?;
            wtxn.open_table(MAPPINGS).map_err(internal)?;
            wtxn.open_table(JOBS).map_err(internal)?;
            wtxn.open_table(REQUESTS).map_err(internal)?;
            wtxn.open_table(META).map_err(internal)?;
            wtxn.commit().map_err(internal)?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn read_all_requests(&self) -> Result<Vec<OrchRequest>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(REQUESTS).map_err(internal)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    fn write_request(&self, request: &OrchRequest) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(request)?;
        let key = request.id.to_string();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(REQUESTS).map_err(internal)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    fn load_request(&self, request_id: Uuid) -> Result<OrchRequest, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(REQUESTS).map_err(internal)?;
        let key = request_id.to_string();
        match table.get(key.as_str()).map_err(internal)? {
            Some(guard) => Ok(serde_json::from_slice(guard.value())?),
            None => Err(StoreError::RequestNotFound(key)),
        }
    }
}

#[async_trait]
impl SyncStore for RedbStore {
    async fn get_subcloud(&self, region: &RegionName) -> Result<Option<Subcloud>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(SUBCLOUDS).map_err(internal)?;
        match table.get(region.as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn list_subclouds(&self) -> Result<Vec<Subcloud>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(SUBCLOUDS).map_err(internal)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    async fn upsert_subcloud(&self, subcloud: &Subcloud) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(subcloud)?;
        let key = subcloud.region_name.as_str().to_string();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(SUBCLOUDS).map_err(internal)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn delete_subcloud(&self, region: &RegionName) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(SUBCLOUDS).map_err(internal)?;
            table.remove(region.as_str()).map_err(internal)?;

            let mut statuses = wtxn.open_table(STATUSES).map_err(internal)?;
            for endpoint_type in EndpointType::ALL {
                let key = status_key(region, endpoint_type);
                statuses.remove(key.as_str()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn endpoint_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<EndpointStatus, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(STATUSES).map_err(internal)?;
        let key = status_key(region, endpoint_type);
        match table.get(key.as_str()).map_err(internal)? {
            Some(guard) => Ok(serde_json::from_slice(guard.value())?),
            None => Ok(EndpointStatus::new(region.clone(), endpoint_type)),
        }
    }

    async fn set_sync_status(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        status: SyncStatus,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let subclouds = wtxn.open_table(SUBCLOUDS).map_err(internal)?;
            let subcloud: Subcloud = match subclouds.get(region.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::SubcloudNotFound(region.to_string())),
            };
            // Unmanaged subclouds only accept the forced reset to unknown.
            if subcloud.management_state != ManagementState::Managed
                && status != SyncStatus::Unknown
            {
                return Ok(());
            }

            let mut statuses = wtxn.open_table(STATUSES).map_err(internal)?;
            let key = status_key(region, endpoint_type);
            let mut entry: EndpointStatus = match statuses.get(key.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => EndpointStatus::new(region.clone(), endpoint_type),
            };
            entry.sync_status = status;
            let bytes = serde_json::to_vec(&entry)?;
            statuses
                .insert(key.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn set_all_statuses_unknown(&self, region: &RegionName) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut statuses = wtxn.open_table(STATUSES).map_err(internal)?;
            for endpoint_type in EndpointType::ALL {
                let key = status_key(region, endpoint_type);
                let mut entry: EndpointStatus =
                    match statuses.get(key.as_str()).map_err(internal)? {
                        Some(guard) => serde_json::from_slice(guard.value())?,
                        None => EndpointStatus::new(region.clone(), endpoint_type),
                    };
                entry.sync_status = SyncStatus::Unknown;
                entry.last_audit_clean = false;
                let bytes = serde_json::to_vec(&entry)?;
                statuses
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn record_audit_result(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
        clean: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut statuses = wtxn.open_table(STATUSES).map_err(internal)?;
            let key = status_key(region, endpoint_type);
            let mut entry: EndpointStatus = match statuses.get(key.as_str()).map_err(internal)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => EndpointStatus::new(region.clone(), endpoint_type),
            };
            entry.last_audit_at = Some(at);
            entry.last_audit_clean = clean;
            let bytes = serde_json::to_vec(&entry)?;
            statuses
                .insert(key.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn put_mapping(&self, mapping: &ResourceMapping) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(mapping)?;
        let key = mapping_key(&mapping.master_id, &mapping.region);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(MAPPINGS).map_err(internal)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn mapping_by_master(
        &self,
        master_id: &str,
        region: &RegionName,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(MAPPINGS).map_err(internal)?;
        let key = mapping_key(master_id, region);
        match table.get(key.as_str()).map_err(internal)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn mapping_by_subcloud(
        &self,
        region: &RegionName,
        subcloud_id: &str,
    ) -> Result<Option<ResourceMapping>, StoreError> {
        let rtxn = self.db.begin_read().map_err(internal)?;
        let table = rtxn.open_table(MAPPINGS).map_err(internal)?;
        for entry in table.iter().map_err(internal)? {
            let (_k, v) = entry.map_err(internal)?;
            let mapping: ResourceMapping = serde_json::from_slice(v.value())?;
            if &mapping.region == region && mapping.subcloud_id == subcloud_id {
                return Ok(Some(mapping));
            }
        }
        Ok(None)
    }

    async fn delete_mapping(
        &self,
        master_id: &str,
        region: &RegionName,
    ) -> Result<(), StoreError> {
        let key = mapping_key(master_id, region);
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(MAPPINGS).map_err(internal)?;
            table.remove(key.as_str()).map_err(internal)?;
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn delete_mappings_for_region(&self, region: &RegionName) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut table = wtxn.open_table(MAPPINGS).map_err(internal)?;
            let mut doomed = Vec::new();
            for entry in table.iter().map_err(internal)? {
                let (k, v) = entry.map_err(internal)?;
                let mapping: ResourceMapping = serde_json::from_slice(v.value())?;
                if &mapping.region == region {
                    doomed.push(k.value().to_string());
                }
            }
            for key in doomed {
                table.remove(key.as_str()).map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn enqueue(
        &self,
        job: &OrchJob,
        regions: &[RegionName],
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut created = Vec::new();
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut requests = wtxn.open_table(REQUESTS).map_err(internal)?;
            let mut jobs = wtxn.open_table(JOBS).map_err(internal)?;
            let mut meta = wtxn.open_table(META).map_err(internal)?;

            // Snapshot queued requests once for the duplicate check.
            let mut queued: Vec<(OrchRequest, OrchJob)> = Vec::new();
            for entry in requests.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                let request: OrchRequest = serde_json::from_slice(v.value())?;
                if request.state != RequestState::Queued {
                    continue;
                }
                let key = request.job_id.to_string();
                if let Some(guard) = jobs.get(key.as_str()).map_err(internal)? {
                    let existing: OrchJob = serde_json::from_slice(guard.value())?;
                    queued.push((request, existing));
                }
            }

            let mut seq = meta
                .get("request_seq")
                .map_err(internal)?
                .map(|g| g.value())
                .unwrap_or(0);

            for region in regions {
                let duplicate = queued.iter().any(|(request, existing)| {
                    &request.region == region && existing.coalesce_key() == job.coalesce_key()
                });
                if duplicate {
                    continue;
                }
                seq += 1;
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
                let bytes = serde_json::to_vec(&request)?;
                let key = request.id.to_string();
                requests
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(internal)?;
                created.push(request.id);
            }

            if !created.is_empty() {
                meta.insert("request_seq", seq).map_err(internal)?;
                let bytes = serde_json::to_vec(job)?;
                let key = job.id.to_string();
                jobs.insert(key.as_str(), bytes.as_slice())
                    .map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(created)
    }

    async fn claim_next(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<Option<WorkItem>, StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        let claimed = {
            let mut requests = wtxn.open_table(REQUESTS).map_err(internal)?;
            let jobs = wtxn.open_table(JOBS).map_err(internal)?;

            let mut in_flight = false;
            let mut next: Option<OrchRequest> = None;
            for entry in requests.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                let request: OrchRequest = serde_json::from_slice(v.value())?;
                if &request.region != region || request.endpoint_type != endpoint_type {
                    continue;
                }
                match request.state {
                    RequestState::InProgress => {
                        in_flight = true;
                        break;
                    }
                    RequestState::Queued => {
                        if next.as_ref().map_or(true, |n| request.seq < n.seq) {
                            next = Some(request);
                        }
                    }
                    _ => {}
                }
            }

            if in_flight {
                None
            } else if let Some(mut request) = next {
                request.state = RequestState::InProgress;
                request.attempts += 1;
                request.updated_at = Utc::now();
                let bytes = serde_json::to_vec(&request)?;
                let key = request.id.to_string();
                requests
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(internal)?;

                let job_key = request.job_id.to_string();
                let job: OrchJob = match jobs.get(job_key.as_str()).map_err(internal)? {
                    Some(guard) => serde_json::from_slice(guard.value())?,
                    None => {
                        return Err(StoreError::Internal(format!(
                            "job {} missing for request {}",
                            request.job_id, request.id
                        )))
                    }
                };
                Some(WorkItem { request, job })
            } else {
                None
            }
        };
        wtxn.commit().map_err(internal)?;
        Ok(claimed)
    }

    async fn requeue(&self, request_id: Uuid) -> Result<(), StoreError> {
        let mut request = self.load_request(request_id)?;
        request.state = RequestState::Queued;
        request.updated_at = Utc::now();
        self.write_request(&request)
    }

    async fn finish(&self, request_id: Uuid, state: RequestState) -> Result<(), StoreError> {
        let mut request = self.load_request(request_id)?;
        request.state = state;
        request.updated_at = Utc::now();
        self.write_request(&request)
    }

    async fn queued_count(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<usize, StoreError> {
        Ok(self
            .read_all_requests()?
            .into_iter()
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
        let mut list: Vec<OrchRequest> = self
            .read_all_requests()?
            .into_iter()
            .filter(|r| &r.region == region && r.endpoint_type == endpoint_type)
            .collect();
        list.sort_by_key(|r| r.seq);
        Ok(list)
    }

    async fn abort_requests_for_region(&self, region: &RegionName) -> Result<(), StoreError> {
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut requests = wtxn.open_table(REQUESTS).map_err(internal)?;
            let mut updated = Vec::new();
            for entry in requests.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                let mut request: OrchRequest = serde_json::from_slice(v.value())?;
                if &request.region == region && !request.state.is_terminal() {
                    request.state = RequestState::Aborted;
                    request.updated_at = Utc::now();
                    updated.push(request);
                }
            }
            for request in updated {
                let bytes = serde_json::to_vec(&request)?;
                let key = request.id.to_string();
                requests
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(internal)?;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(())
    }

    async fn purge_terminal_jobs(&self) -> Result<usize, StoreError> {
        let mut purged = 0;
        let wtxn = self.db.begin_write().map_err(internal)?;
        {
            let mut requests = wtxn.open_table(REQUESTS).map_err(internal)?;
            let mut jobs = wtxn.open_table(JOBS).map_err(internal)?;

            let mut all: Vec<OrchRequest> = Vec::new();
            for entry in requests.iter().map_err(internal)? {
                let (_k, v) = entry.map_err(internal)?;
                all.push(serde_json::from_slice(v.value())?);
            }

            let mut job_keys = Vec::new();
            for entry in jobs.iter().map_err(internal)? {
                let (k, _v) = entry.map_err(internal)?;
                job_keys.push(k.value().to_string());
            }

            for job_key in job_keys {
                let all_terminal = all
                    .iter()
                    .filter(|r| r.job_id.to_string() == job_key)
                    .all(|r| r.state.is_terminal());
                if !all_terminal {
                    continue;
                }
                jobs.remove(job_key.as_str()).map_err(internal)?;
                for request in all.iter().filter(|r| r.job_id.to_string() == job_key) {
                    let key = request.id.to_string();
                    requests.remove(key.as_str()).map_err(internal)?;
                }
                purged += 1;
            }
        }
        wtxn.commit().map_err(internal)?;
        Ok(purged)
    }
}
