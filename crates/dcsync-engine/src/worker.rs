use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dcsync_client::{ClientError, CloudClients};
use dcsync_config::{EngineConfig, ExclusionLists};
use dcsync_domain::{
    EndpointType, OperationType, RegionName, ResourceType, SyncStatus,
};
use dcsync_store::{RequestState, ResourceMapping, SyncStore, WorkItem};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::EngineError;
use crate::fault::Faults;

/// Control channels shared between a worker and its subcloud engine.
pub struct WorkerSignals {
    /// Pinged when new work lands in this worker's scope.
    pub wake: Arc<Notify>,
    /// Set when an audit pass should run before the next drain.
    pub audit_requested: Arc<AtomicBool>,
    /// Subcloud-level enable/disable gate.
    pub enabled: watch::Receiver<bool>,
    /// Set once on delete; the worker exits at the next handler boundary.
    pub stop: watch::Receiver<bool>,
}

/// What the sync loop does with a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Completed,
    /// Leave the item queued and back off before the next attempt.
    Retry { mark_out_of_sync: bool },
    Failed { mark_out_of_sync: bool },
}

/// Single-writer sync loop for one (subcloud, endpoint type) scope.
///
/// Owns two long-lived sessions (master + subcloud) and drains its queue
/// strictly in insertion order, one item at a time. Audits for the same
/// scope run inside this loop too, so they can never interleave with item
/// processing.
pub struct SyncWorker {
    pub(crate) region: RegionName,
    pub(crate) endpoint_type: EndpointType,
    pub(crate) store: Arc<dyn SyncStore>,
    pub(crate) master: CloudClients,
    pub(crate) subcloud: CloudClients,
    pub(crate) faults: Arc<Faults>,
    pub(crate) exclusions: ExclusionLists,
    worker_sleep: Duration,
    backoff: Backoff,
    wake: Arc<Notify>,
    audit_requested: Arc<AtomicBool>,
    enabled: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
}

impl SyncWorker {
    pub fn new(
        region: RegionName,
        endpoint_type: EndpointType,
        store: Arc<dyn SyncStore>,
        master: CloudClients,
        subcloud: CloudClients,
        faults: Arc<Faults>,
        config: &EngineConfig,
        signals: WorkerSignals,
    ) -> Self {
        Self {
            region,
            endpoint_type,
            store,
            master,
            subcloud,
            faults,
            exclusions: config.exclusions.clone(),
            worker_sleep: config.worker_sleep,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            wake: signals.wake,
            audit_requested: signals.audit_requested,
            enabled: signals.enabled,
            stop: signals.stop,
        }
    }

    pub async fn run(mut self) {
        info!(region = %self.region, endpoint = %self.endpoint_type, "sync worker started");
        loop {
            if *self.stop.borrow() {
                break;
            }
            if *self.enabled.borrow() {
                if self.audit_requested.swap(false, Ordering::SeqCst) {
                    if let Err(e) = self.run_audit().await {
                        warn!(
                            region = %self.region,
                            endpoint = %self.endpoint_type,
                            error = %e,
                            "audit pass failed"
                        );
                        if matches!(e, EngineError::Client(ClientError::Unreachable(_))) {
                            self.note_unreachable().await;
                        }
                    }
                }
                self.drain_queue().await;
            }

            let wait = self.backoff.current().unwrap_or(self.worker_sleep);
            let mut stop = self.stop.clone();
            let mut enabled = self.enabled.clone();
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = stop.changed() => {}
                _ = enabled.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(region = %self.region, endpoint = %self.endpoint_type, "sync worker stopped");
    }

    /// Drain queued items for this scope in insertion order, one at a time.
    /// Stops early on a retryable failure (the backoff delay is slept out in
    /// the main loop) and at the stop/disable boundary.
    pub(crate) async fn drain_queue(&mut self) {
        loop {
            if *self.stop.borrow() || !*self.enabled.borrow() {
                return;
            }
            let item = match self.store.claim_next(&self.region, self.endpoint_type).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!(region = %self.region, error = %e, "claiming work failed");
                    return;
                }
            };

            match self.process(&item).await {
                Disposition::Completed => {
                    if let Err(e) = self
                        .store
                        .finish(item.request.id, RequestState::Completed)
                        .await
                    {
                        warn!(region = %self.region, error = %e, "completing request failed");
                    }
                    self.backoff.reset();
                    self.maybe_mark_in_sync().await;
                }
                Disposition::Retry { mark_out_of_sync } => {
                    if let Err(e) = self.store.requeue(item.request.id).await {
                        warn!(region = %self.region, error = %e, "requeueing request failed");
                    }
                    if mark_out_of_sync {
                        self.note_unreachable().await;
                    } else {
                        let delay = self.backoff.advance();
                        debug!(region = %self.region, ?delay, "backing off");
                    }
                    return;
                }
                Disposition::Failed { mark_out_of_sync } => {
                    if let Err(e) = self
                        .store
                        .finish(item.request.id, RequestState::Failed)
                        .await
                    {
                        warn!(region = %self.region, error = %e, "failing request failed");
                    }
                    if mark_out_of_sync {
                        self.mark_out_of_sync().await;
                    }
                }
            }
        }

        if let Err(e) = self.store.purge_terminal_jobs().await {
            warn!(region = %self.region, error = %e, "purging finished jobs failed");
        }
    }

    /// Run one item through its handler, refreshing both sessions and
    /// retrying exactly once on a rejected credential.
    pub(crate) async fn process(&self, item: &WorkItem) -> Disposition {
        debug!(
            region = %self.region,
            resource = %item.job.resource_type,
            operation = %item.job.operation,
            id = %item.job.source_resource_id,
            attempt = item.request.attempts,
            "processing work item"
        );
        match self.dispatch(item).await {
            Ok(()) => Disposition::Completed,
            Err(EngineError::Client(ClientError::Unauthorized)) => {
                info!(
                    region = %self.region,
                    "credential rejected, refreshing sessions and retrying once"
                );
                self.master.invalidate_session();
                self.subcloud.invalidate_session();
                match self.dispatch(item).await {
                    Ok(()) => Disposition::Completed,
                    Err(EngineError::Client(ClientError::Unauthorized)) => Disposition::Retry {
                        mark_out_of_sync: false,
                    },
                    Err(e) => self.classify(item, e),
                }
            }
            Err(e) => self.classify(item, e),
        }
    }

    async fn dispatch(&self, item: &WorkItem) -> Result<(), EngineError> {
        let job = &item.job;
        if job.source_resource_id.is_empty() {
            return Err(dcsync_domain::DomainError::MissingSourceId(
                job.resource_type.to_string(),
            )
            .into());
        }
        match (job.resource_type, job.operation) {
            (ResourceType::Users, OperationType::Create) => self.create_user(item).await,
            (ResourceType::Users, OperationType::Put) => self.update_user(item).await,
            (ResourceType::Users, OperationType::Patch) => self.patch_user(item).await,
            (ResourceType::Users, OperationType::Delete) => self.delete_user(item).await,

            (ResourceType::Projects, OperationType::Create) => self.create_project(item).await,
            (ResourceType::Projects, OperationType::Put) => self.update_project(item).await,
            (ResourceType::Projects, OperationType::Patch) => self.patch_project(item).await,
            (ResourceType::Projects, OperationType::Delete) => self.delete_project(item).await,

            (ResourceType::Roles, OperationType::Create) => self.create_role(item).await,
            (ResourceType::Roles, OperationType::Put) => self.update_role(item).await,
            (ResourceType::Roles, OperationType::Patch) => self.patch_role(item).await,
            (ResourceType::Roles, OperationType::Delete) => self.delete_role(item).await,

            (ResourceType::Assignments, OperationType::Create) => {
                self.create_assignment(item).await
            }
            // The composite key leaves nothing mutable.
            (ResourceType::Assignments, OperationType::Put) => Ok(()),
            (ResourceType::Assignments, OperationType::Delete) => {
                self.delete_assignment(item).await
            }

            (ResourceType::RevokeEvents, OperationType::Create) => {
                self.create_revoke_event(item).await
            }
            (ResourceType::RevokeEvents, OperationType::Delete) => {
                self.delete_revoke_event(item).await
            }
            (ResourceType::UserRevokeEvents, OperationType::Create) => {
                self.create_user_revoke_event(item).await
            }
            (ResourceType::UserRevokeEvents, OperationType::Delete) => {
                self.delete_user_revoke_event(item).await
            }

            (ResourceType::FernetRepo, OperationType::Create) => {
                self.create_fernet_repo(item).await
            }
            (ResourceType::FernetRepo, OperationType::Put) => self.update_fernet_repo(item).await,

            (resource_type, operation) => Err(EngineError::Unsupported {
                resource_type,
                operation,
            }),
        }
    }

    fn classify(&self, item: &WorkItem, error: EngineError) -> Disposition {
        match &error {
            EngineError::Client(ClientError::Unreachable(_)) => {
                error!(
                    region = %self.region,
                    endpoint = %self.endpoint_type,
                    resource = %item.job.resource_type,
                    error = %error,
                    "subcloud not reachable"
                );
                Disposition::Retry {
                    mark_out_of_sync: true,
                }
            }
            // The retry-once already happened in process().
            EngineError::Client(ClientError::Unauthorized) => Disposition::Retry {
                mark_out_of_sync: false,
            },
            EngineError::Client(ClientError::EmptyResponse { .. })
            | EngineError::Client(ClientError::BadRequest(_))
            | EngineError::Domain(_)
            | EngineError::Unsupported { .. }
            | EngineError::Precondition(_) => {
                error!(
                    region = %self.region,
                    resource = %item.job.resource_type,
                    operation = %item.job.operation,
                    id = %item.job.source_resource_id,
                    error = %error,
                    "work item failed"
                );
                Disposition::Failed {
                    mark_out_of_sync: false,
                }
            }
            _ => {
                error!(
                    region = %self.region,
                    resource = %item.job.resource_type,
                    operation = %item.job.operation,
                    id = %item.job.source_resource_id,
                    error = %error,
                    "work item failed unexpectedly"
                );
                Disposition::Failed {
                    mark_out_of_sync: true,
                }
            }
        }
    }

    /// Unreachable subcloud: surface the condition and back off.
    async fn note_unreachable(&mut self) {
        self.mark_out_of_sync().await;
        let delay = self.backoff.advance();
        info!(
            region = %self.region,
            endpoint = %self.endpoint_type,
            ?delay,
            "backing off until subcloud is reachable"
        );
    }

    pub(crate) async fn mark_out_of_sync(&self) {
        if let Err(e) = self
            .store
            .set_sync_status(&self.region, self.endpoint_type, SyncStatus::OutOfSync)
            .await
        {
            warn!(region = %self.region, error = %e, "recording out-of-sync status failed");
        }
        self.faults
            .mark_out_of_sync(&self.region, self.endpoint_type)
            .await;
    }

    /// After a successful item: the endpoint is in-sync once its queue is
    /// drained and the last audit found nothing to fix.
    async fn maybe_mark_in_sync(&self) {
        let queued = match self
            .store
            .queued_count(&self.region, self.endpoint_type)
            .await
        {
            Ok(n) => n,
            Err(_) => return,
        };
        if queued != 0 {
            return;
        }
        let status = match self
            .store
            .endpoint_status(&self.region, self.endpoint_type)
            .await
        {
            Ok(status) => status,
            Err(_) => return,
        };
        if status.last_audit_clean {
            if let Err(e) = self
                .store
                .set_sync_status(&self.region, self.endpoint_type, SyncStatus::InSync)
                .await
            {
                warn!(region = %self.region, error = %e, "recording in-sync status failed");
                return;
            }
            self.faults
                .mark_recovered(&self.region, self.endpoint_type)
                .await;
        }
    }

    // ── Shared helpers for the handler catalog ────────────────────────────

    pub(crate) async fn persist_mapping(
        &self,
        resource_type: ResourceType,
        master_id: &str,
        subcloud_id: &str,
    ) -> Result<(), EngineError> {
        self.store
            .put_mapping(&ResourceMapping::new(
                resource_type,
                master_id,
                self.region.clone(),
                subcloud_id,
            ))
            .await?;
        Ok(())
    }

    /// Write the mapping only when it is missing or points elsewhere.
    pub(crate) async fn ensure_mapping(
        &self,
        resource_type: ResourceType,
        master_id: &str,
        subcloud_id: &str,
    ) -> Result<(), EngineError> {
        match self.store.mapping_by_master(master_id, &self.region).await? {
            Some(existing) if existing.subcloud_id == subcloud_id => Ok(()),
            _ => self.persist_mapping(resource_type, master_id, subcloud_id).await,
        }
    }

    /// Run a master-side call, refreshing the master session and retrying
    /// once if the credential was rejected.
    pub(crate) async fn with_master_retry<T, F, Fut>(&self, f: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        match f().await {
            Err(ClientError::Unauthorized) => {
                info!(region = %self.region, "master credential rejected, refreshing session");
                self.master.invalidate_session();
                f().await
            }
            other => other,
        }
    }

    /// Subcloud-side twin of [`with_master_retry`](Self::with_master_retry).
    pub(crate) async fn with_subcloud_retry<T, F, Fut>(&self, f: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        match f().await {
            Err(ClientError::Unauthorized) => {
                info!(region = %self.region, "subcloud credential rejected, refreshing session");
                self.subcloud.invalidate_session();
                f().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, offline_harness, user_record};
    use chrono::Utc;
    use dcsync_domain::OperationType;
    use dcsync_store::OrchJob;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    async fn enqueue_user_create(h: &crate::testutil::Harness, master_id: &str) {
        let job = OrchJob::new(
            ResourceType::Users,
            OperationType::Create,
            master_id,
            None,
        );
        h.store.enqueue(&job, &[h.region.clone()]).await.unwrap();
    }

    #[tokio::test]
    async fn create_propagates_record_and_mapping() {
        let mut h = harness(EndpointType::Identity).await;
        let bob = user_record("u-2", "bob", &["h1"]);

        Mock::given(method("GET"))
            .and(path("/identity/users/u-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&bob))
            .mount(&h.master)
            .await;
        Mock::given(method("POST"))
            .and(path("/identity/users/"))
            .respond_with(ResponseTemplate::new(201).set_body_json(&bob))
            .expect(1)
            .mount(&h.subcloud)
            .await;

        // A clean audit already happened; finishing the queue may promote
        // the endpoint to in-sync.
        h.store
            .record_audit_result(&h.region, EndpointType::Identity, true, Utc::now())
            .await
            .unwrap();

        enqueue_user_create(&h, "u-2").await;
        h.worker.drain_queue().await;

        let mapping = h
            .store
            .mapping_by_master("u-2", &h.region)
            .await
            .unwrap()
            .expect("mapping should exist");
        assert_eq!(mapping.subcloud_id, "u-2", "the master id is preserved");
        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Identity)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            h.store
                .endpoint_status(&h.region, EndpointType::Identity)
                .await
                .unwrap()
                .sync_status,
            SyncStatus::InSync
        );
    }

    #[tokio::test]
    async fn transient_401_refreshes_once_and_completes() {
        let mut h = harness(EndpointType::Identity).await;
        let bob = user_record("u-2", "bob", &["h1"]);

        Mock::given(method("GET"))
            .and(path("/identity/users/u-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&bob))
            .mount(&h.master)
            .await;
        // First create attempt is rejected, the retry succeeds.
        Mock::given(method("POST"))
            .and(path("/identity/users/"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&h.subcloud)
            .await;
        Mock::given(method("POST"))
            .and(path("/identity/users/"))
            .respond_with(ResponseTemplate::new(201).set_body_json(&bob))
            .with_priority(5)
            .mount(&h.subcloud)
            .await;

        enqueue_user_create(&h, "u-2").await;
        h.worker.drain_queue().await;

        // Exactly one refresh of both sessions, no backoff entry left.
        assert_eq!(h.subcloud_token.invalidations(), 1);
        assert_eq!(h.master_token.invalidations(), 1);
        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Identity)
                .await
                .unwrap(),
            0
        );
        assert!(h.worker.backoff.current().is_none());
        assert!(h
            .store
            .mapping_by_master("u-2", &h.region)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn offline_subcloud_backs_off_and_faults_once() {
        let mut h = offline_harness(EndpointType::Identity).await;
        let bob = user_record("u-2", "bob", &["h1"]);

        Mock::given(method("GET"))
            .and(path("/identity/users/u-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&bob))
            .mount(&h.master)
            .await;

        enqueue_user_create(&h, "u-2").await;

        for expected_delay in [30u64, 60, 120] {
            h.worker.drain_queue().await;
            assert_eq!(
                h.store
                    .queued_count(&h.region, EndpointType::Identity)
                    .await
                    .unwrap(),
                1,
                "item stays queued while the subcloud is down"
            );
            assert_eq!(
                h.worker.backoff.current(),
                Some(Duration::from_secs(expected_delay))
            );
        }

        assert_eq!(
            h.store
                .endpoint_status(&h.region, EndpointType::Identity)
                .await
                .unwrap()
                .sync_status,
            SyncStatus::OutOfSync
        );
        let entity_id =
            crate::fault::Faults::entity_id(&h.region, EndpointType::Identity);
        assert_eq!(
            h.reporter.raised_count(&entity_id),
            1,
            "repeated failures raise the fault exactly once"
        );
        let delay = h.worker.backoff.current().unwrap();
        assert!(delay >= Duration::from_secs(30) && delay < Duration::from_secs(900));
    }

    #[tokio::test]
    async fn create_conflict_adopts_the_existing_user() {
        let mut h = harness(EndpointType::Identity).await;
        let master_alice = user_record("u-1", "alice", &["h1"]);
        let subcloud_alice = user_record("u-7", "alice", &["h1"]);

        Mock::given(method("GET"))
            .and(path("/identity/users/u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&master_alice))
            .mount(&h.master)
            .await;
        Mock::given(method("POST"))
            .and(path("/identity/users/"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&h.subcloud)
            .await;
        Mock::given(method("GET"))
            .and(path("/identity/users/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(vec![subcloud_alice.clone()]),
            )
            .mount(&h.subcloud)
            .await;

        enqueue_user_create(&h, "u-1").await;
        h.worker.drain_queue().await;

        let mapping = h
            .store
            .mapping_by_master("u-1", &h.region)
            .await
            .unwrap()
            .expect("conflict should resolve to adoption");
        assert_eq!(mapping.subcloud_id, "u-7");
    }

    #[tokio::test]
    async fn delete_resolves_the_mapping_and_drops_it() {
        let mut h = harness(EndpointType::Identity).await;
        h.store
            .put_mapping(&ResourceMapping::new(
                ResourceType::Users,
                "u-2",
                h.region.clone(),
                "u-9",
            ))
            .await
            .unwrap();
        // Already gone on the subcloud: still success.
        Mock::given(method("DELETE"))
            .and(path("/identity/users/u-9"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&h.subcloud)
            .await;

        let job = OrchJob::new(ResourceType::Users, OperationType::Delete, "u-2", None);
        h.store.enqueue(&job, &[h.region.clone()]).await.unwrap();
        h.worker.drain_queue().await;

        assert!(h
            .store
            .mapping_by_master("u-2", &h.region)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Identity)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unsupported_operation_fails_the_item_quietly() {
        let mut h = harness(EndpointType::Platform).await;
        let job = OrchJob::new(
            ResourceType::FernetRepo,
            OperationType::Delete,
            "keys",
            None,
        );
        h.store.enqueue(&job, &[h.region.clone()]).await.unwrap();

        h.worker.drain_queue().await;

        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Platform)
                .await
                .unwrap(),
            0
        );
        assert!(h.reporter.raised.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fernet_put_replaces_the_subcloud_ring() {
        let mut h = harness(EndpointType::Platform).await;
        Mock::given(method("PUT"))
            .and(path("/fernet_repo"))
            .and(wiremock::matchers::body_json(serde_json::json!([
                { "id": 0, "key": "zero" },
                { "id": 1, "key": "one" }
            ])))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&h.subcloud)
            .await;

        let job = OrchJob::new(
            ResourceType::FernetRepo,
            OperationType::Put,
            "keys",
            Some(serde_json::json!({ "0": "zero", "1": "one" })),
        );
        h.store.enqueue(&job, &[h.region.clone()]).await.unwrap();
        h.worker.drain_queue().await;

        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Platform)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn disabled_worker_leaves_the_queue_alone() {
        let mut h = harness(EndpointType::Identity).await;
        h.enabled_tx.send(false).unwrap();

        enqueue_user_create(&h, "u-2").await;
        h.worker.drain_queue().await;

        assert_eq!(
            h.store
                .queued_count(&h.region, EndpointType::Identity)
                .await
                .unwrap(),
            1
        );
    }
}
