use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dcsync_client::{FernetKey, PlatformClient};
use dcsync_config::EngineConfig;
use dcsync_domain::{
    DomainError, EndpointType, OperationType, RegionName, ResourceType, FERNET_REPO_MASTER_ID,
};
use dcsync_store::{OrchJob, SyncStore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::manager::GenericSyncManager;

/// Serialize a key ring as the `{key_id: key_material}` map carried in a
/// work item's resource info.
pub fn keys_to_resource_info(keys: &[FernetKey]) -> Value {
    let map: BTreeMap<String, String> = keys
        .iter()
        .map(|k| (k.id.to_string(), k.key.clone()))
        .collect();
    serde_json::to_value(map).unwrap_or(Value::Null)
}

/// Decode a work item's resource info back into a key ring, sorted by key
/// index.
pub fn keys_from_resource_info(job: &OrchJob) -> Result<Vec<FernetKey>, EngineError> {
    let info = job
        .resource_info
        .as_ref()
        .ok_or_else(|| DomainError::MalformedResourceInfo {
            resource_type: job.resource_type.to_string(),
            message: "missing key ring".into(),
        })?;
    let map: BTreeMap<String, String> =
        serde_json::from_value(info.clone()).map_err(|e| DomainError::MalformedResourceInfo {
            resource_type: job.resource_type.to_string(),
            message: e.to_string(),
        })?;
    let mut keys = Vec::with_capacity(map.len());
    for (id, key) in map {
        let id = id.parse::<u32>().map_err(|_| DomainError::MalformedResourceInfo {
            resource_type: job.resource_type.to_string(),
            message: format!("key index '{}' is not numeric", id),
        })?;
        keys.push(FernetKey { id, key });
    }
    keys.sort_by_key(|k| k.id);
    Ok(keys)
}

/// Content hash of a key ring, independent of key order.
pub fn key_ring_hash(keys: &[FernetKey]) -> String {
    let mut sorted: Vec<&FernetKey> = keys.iter().collect();
    sorted.sort_by_key(|k| k.id);
    let mut hasher = Sha256::new();
    for key in sorted {
        hasher.update(key.id.to_be_bytes());
        hasher.update(key.key.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Rotates the master fernet key ring on a timer and fans the new ring out
/// to every subcloud as a synthetic work item on the platform endpoint.
pub struct FernetKeyManager {
    store: Arc<dyn SyncStore>,
    master_platform: PlatformClient,
    gsm: Option<Arc<GenericSyncManager>>,
    rotate_command: PathBuf,
    interval: Duration,
    /// Ring hash of the last successful distribution; unchanged rings are
    /// not re-pushed.
    last_distributed: Mutex<Option<String>>,
}

impl FernetKeyManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        master_platform: PlatformClient,
        gsm: Option<Arc<GenericSyncManager>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            master_platform,
            gsm,
            rotate_command: config.rotate_command.clone(),
            interval: config.key_rotation_interval,
            last_distributed: Mutex::new(None),
        }
    }

    /// Periodic rotation task. A failed cycle is logged; the next cycle
    /// retries from scratch.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "fernet key manager started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so rotation happens on
        // the configured cadence, not at boot.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.rotate_keys().await {
                        warn!(error = %e, "fernet key rotation cycle failed");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("fernet key manager stopped");
    }

    /// Rotate the master ring and schedule distribution to all subclouds.
    pub async fn rotate_keys(&self) -> Result<(), EngineError> {
        let status = tokio::process::Command::new(&self.rotate_command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                EngineError::Rotation(format!(
                    "could not run {}: {}",
                    self.rotate_command.display(),
                    e
                ))
            })?;
        if !status.success() {
            return Err(EngineError::Rotation(format!(
                "{} exited with {}",
                self.rotate_command.display(),
                status
            )));
        }
        info!("master fernet keys rotated");
        self.schedule_work(OperationType::Put, None).await
    }

    /// Push the current master ring to one newly added subcloud.
    pub async fn distribute_keys(&self, region: &RegionName) -> Result<(), EngineError> {
        if self.store.get_subcloud(region).await?.is_none() {
            return Err(EngineError::SubcloudNotFound(region.to_string()));
        }
        self.schedule_work(OperationType::Create, Some(region)).await
    }

    pub(crate) async fn schedule_work(
        &self,
        operation: OperationType,
        target: Option<&RegionName>,
    ) -> Result<(), EngineError> {
        let keys = match self.master_platform.get_fernet_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "retrieving master fernet keys failed");
                return Ok(());
            }
        };
        if keys.is_empty() {
            info!("no fernet keys returned from master");
            return Ok(());
        }

        let ring_hash = key_ring_hash(&keys);
        let mut last = self.last_distributed.lock().await;
        if operation == OperationType::Put && last.as_deref() == Some(ring_hash.as_str()) {
            debug!("fernet key ring unchanged, skipping distribution");
            return Ok(());
        }

        let regions: Vec<RegionName> = match target {
            Some(region) => vec![region.clone()],
            None => self
                .store
                .list_subclouds()
                .await?
                .into_iter()
                .map(|sc| sc.region_name)
                .collect(),
        };
        if regions.is_empty() {
            debug!("no subclouds to distribute fernet keys to");
            return Ok(());
        }

        let job = OrchJob::new(
            ResourceType::FernetRepo,
            operation,
            FERNET_REPO_MASTER_ID,
            Some(keys_to_resource_info(&keys)),
        );
        self.store.enqueue(&job, &regions).await?;
        if operation == OperationType::Put {
            *last = Some(ring_hash);
        }
        drop(last);

        info!(
            regions = regions.len(),
            operation = %operation,
            "fernet key distribution scheduled"
        );
        if let Some(gsm) = &self.gsm {
            gsm.sync_request(EndpointType::Platform).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, test_subcloud as subcloud};
    use dcsync_client::StaticToken;
    use dcsync_store::InMemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager_with_keys(store: Arc<InMemoryStore>, server: &MockServer) -> FernetKeyManager {
        let platform = PlatformClient::new(
            server.uri(),
            reqwest::Client::new(),
            Arc::new(StaticToken("secret".into())),
        );
        FernetKeyManager::new(store, platform, None, &test_config())
    }

    fn mock_keys() -> serde_json::Value {
        serde_json::json!([
            { "id": 0, "key": "key-zero" },
            { "id": 1, "key": "key-one" }
        ])
    }

    #[tokio::test]
    async fn rotation_fans_out_to_every_subcloud() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_keys()))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        for region in ["subcloud-1", "subcloud-2", "subcloud-3"] {
            store.upsert_subcloud(&subcloud(region)).await.unwrap();
        }

        let manager = manager_with_keys(store.clone(), &server).await;
        manager.rotate_keys().await.unwrap();

        // One put work item per subcloud, identical payload.
        let mut payloads = Vec::new();
        for region in ["subcloud-1", "subcloud-2", "subcloud-3"] {
            let region = RegionName::new(region);
            let item = store
                .claim_next(&region, EndpointType::Platform)
                .await
                .unwrap()
                .expect("fernet work item expected");
            assert_eq!(item.job.resource_type, ResourceType::FernetRepo);
            assert_eq!(item.job.operation, OperationType::Put);
            assert_eq!(item.job.source_resource_id, FERNET_REPO_MASTER_ID);
            payloads.push(item.job.resource_info.clone().unwrap());
        }
        assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn unchanged_ring_is_not_redistributed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_keys()))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        store.upsert_subcloud(&subcloud("subcloud-1")).await.unwrap();
        let region = RegionName::new("subcloud-1");

        let manager = manager_with_keys(store.clone(), &server).await;
        manager
            .schedule_work(OperationType::Put, None)
            .await
            .unwrap();
        let item = store
            .claim_next(&region, EndpointType::Platform)
            .await
            .unwrap()
            .unwrap();
        store
            .finish(item.request.id, dcsync_store::RequestState::Completed)
            .await
            .unwrap();

        // Same ring again: nothing new is queued.
        manager
            .schedule_work(OperationType::Put, None)
            .await
            .unwrap();
        assert_eq!(
            store
                .queued_count(&region, EndpointType::Platform)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn add_subcloud_distribution_targets_one_region() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_keys()))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        store.upsert_subcloud(&subcloud("subcloud-1")).await.unwrap();
        store.upsert_subcloud(&subcloud("subcloud-2")).await.unwrap();

        let manager = manager_with_keys(store.clone(), &server).await;
        manager
            .distribute_keys(&RegionName::new("subcloud-2"))
            .await
            .unwrap();

        assert_eq!(
            store
                .queued_count(&RegionName::new("subcloud-1"), EndpointType::Platform)
                .await
                .unwrap(),
            0
        );
        let item = store
            .claim_next(&RegionName::new("subcloud-2"), EndpointType::Platform)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.job.operation, OperationType::Create);
    }

    #[tokio::test]
    async fn distribute_to_unknown_region_fails() {
        let server = MockServer::start().await;
        let store = Arc::new(InMemoryStore::new());
        let manager = manager_with_keys(store, &server).await;
        assert!(matches!(
            manager.distribute_keys(&RegionName::new("ghost")).await,
            Err(EngineError::SubcloudNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_master_ring_schedules_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fernet_repo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        store.upsert_subcloud(&subcloud("subcloud-1")).await.unwrap();
        let manager = manager_with_keys(store.clone(), &server).await;
        manager
            .schedule_work(OperationType::Put, None)
            .await
            .unwrap();
        assert_eq!(
            store
                .queued_count(&RegionName::new("subcloud-1"), EndpointType::Platform)
                .await
                .unwrap(),
            0
        );
    }

    #[test]
    fn resource_info_round_trip() {
        let keys = vec![
            FernetKey { id: 1, key: "one".into() },
            FernetKey { id: 0, key: "zero".into() },
        ];
        let info = keys_to_resource_info(&keys);
        let job = OrchJob::new(
            ResourceType::FernetRepo,
            OperationType::Put,
            FERNET_REPO_MASTER_ID,
            Some(info),
        );
        let decoded = keys_from_resource_info(&job).unwrap();
        assert_eq!(decoded[0].id, 0);
        assert_eq!(decoded[1].id, 1);
    }

    #[test]
    fn ring_hash_ignores_order() {
        let a = vec![
            FernetKey { id: 0, key: "zero".into() },
            FernetKey { id: 1, key: "one".into() },
        ];
        let b = vec![
            FernetKey { id: 1, key: "one".into() },
            FernetKey { id: 0, key: "zero".into() },
        ];
        assert_eq!(key_ring_hash(&a), key_ring_hash(&b));
        let c = vec![FernetKey { id: 0, key: "other".into() }];
        assert_ne!(key_ring_hash(&a), key_ring_hash(&c));
    }
}
