use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dcsync_client::{AdminCredentials, ClientFactory, CloudEndpoints, EndpointTemplates};
use dcsync_config::EngineConfig;
use dcsync_domain::{EndpointType, ManagementState, RegionName, Subcloud};
use dcsync_store::SyncStore;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::fault::Faults;
use crate::hosts;
use crate::subcloud::SubcloudEngine;

/// Build the per-cloud client factory from the engine configuration.
pub fn build_client_factory(config: &EngineConfig) -> Result<ClientFactory, EngineError> {
    let master = CloudEndpoints {
        dbsync: config.master.dbsync_url.clone(),
        identity: config.master.identity_url.clone(),
        platform: config.master.platform_url.clone(),
    };
    let templates = EndpointTemplates {
        dbsync: config.subcloud_templates.dbsync_url.clone(),
        identity: config.subcloud_templates.identity_url.clone(),
        platform: config.subcloud_templates.platform_url.clone(),
    };
    let credentials = AdminCredentials {
        username: config.credentials.username.clone(),
        password: config.credentials.password.clone(),
        project: config.credentials.project.clone(),
    };
    Ok(ClientFactory::new(
        master,
        templates,
        credentials,
        config.connect_timeout,
    )?)
}

/// Process-wide registry of subcloud engines, keyed by region name.
///
/// The registry lock only guards the map itself; sync work never runs under
/// it.
pub struct GenericSyncManager {
    store: Arc<dyn SyncStore>,
    factory: Arc<ClientFactory>,
    faults: Arc<Faults>,
    config: Arc<EngineConfig>,
    engines: RwLock<HashMap<RegionName, Arc<SubcloudEngine>>>,
}

impl GenericSyncManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        factory: Arc<ClientFactory>,
        faults: Arc<Faults>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            factory,
            faults,
            config,
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the registry from the durable subcloud list on startup.
    /// Managed subclouds resume syncing immediately.
    pub async fn init_from_store(&self) -> Result<(), EngineError> {
        for subcloud in self.store.list_subclouds().await? {
            info!(region = %subcloud.region_name, "loading subcloud");
            let engine = SubcloudEngine::new(
                &subcloud,
                self.store.clone(),
                &self.factory,
                self.faults.clone(),
                &self.config,
            );
            if subcloud.is_managed() {
                engine.enable().await;
            }
            self.engines
                .write()
                .await
                .insert(subcloud.region_name.clone(), engine);
        }
        Ok(())
    }

    pub async fn add_subcloud(&self, subcloud: Subcloud) -> Result<(), EngineError> {
        info!(region = %subcloud.region_name, "adding subcloud");
        self.store.upsert_subcloud(&subcloud).await?;
        let engine = SubcloudEngine::new(
            &subcloud,
            self.store.clone(),
            &self.factory,
            self.faults.clone(),
            &self.config,
        );
        let replaced = self
            .engines
            .write()
            .await
            .insert(subcloud.region_name.clone(), engine);
        if let Some(old) = replaced {
            warn!(region = %subcloud.region_name, "replacing an existing engine for this region");
            if let Err(e) = old.delete().await {
                warn!(region = %subcloud.region_name, error = %e, "stopping replaced engine failed");
            }
            // delete() dropped the fresh registry row too; restore it.
            self.store.upsert_subcloud(&subcloud).await?;
        }
        self.refresh_hosts_file().await?;
        Ok(())
    }

    /// Tear a subcloud down. Only permitted while it is unmanaged and
    /// offline.
    pub async fn del_subcloud(&self, region: &RegionName) -> Result<(), EngineError> {
        if let Some(subcloud) = self.store.get_subcloud(region).await? {
            if !subcloud.is_deletable() {
                return Err(EngineError::Precondition(format!(
                    "subcloud {} must be unmanaged and offline before deletion",
                    region
                )));
            }
        }
        let engine = self
            .engines
            .write()
            .await
            .remove(region)
            .ok_or_else(|| EngineError::SubcloudNotFound(region.to_string()))?;
        info!(region = %region, "deleting subcloud");
        engine.delete().await?;
        self.refresh_hosts_file().await?;
        Ok(())
    }

    /// Manage a subcloud: mark it managed and start its workers.
    pub async fn enable_subcloud(&self, region: &RegionName) -> Result<(), EngineError> {
        let engine = self.engine(region).await?;
        let mut subcloud = self
            .store
            .get_subcloud(region)
            .await?
            .ok_or_else(|| EngineError::SubcloudNotFound(region.to_string()))?;
        info!(region = %region, "enabling subcloud");
        subcloud.management_state = ManagementState::Managed;
        self.store.upsert_subcloud(&subcloud).await?;
        engine.enable().await;
        Ok(())
    }

    /// Unmanage a subcloud: pause its workers and reset every endpoint
    /// status to unknown.
    pub async fn disable_subcloud(&self, region: &RegionName) -> Result<(), EngineError> {
        let engine = self.engine(region).await?;
        let mut subcloud = self
            .store
            .get_subcloud(region)
            .await?
            .ok_or_else(|| EngineError::SubcloudNotFound(region.to_string()))?;
        info!(region = %region, "disabling subcloud");
        subcloud.management_state = ManagementState::Unmanaged;
        self.store.upsert_subcloud(&subcloud).await?;
        self.store.set_all_statuses_unknown(region).await?;
        engine.disable().await;
        Ok(())
    }

    pub async fn update_subcloud_version(
        &self,
        region: &RegionName,
        version: &str,
    ) -> Result<(), EngineError> {
        let engine = self.engine(region).await?;
        engine.set_version(version).await
    }

    /// Someone enqueued work: wake every subcloud's worker for the endpoint.
    pub async fn sync_request(&self, endpoint_type: EndpointType) {
        for engine in self.engines.read().await.values() {
            engine.wake(endpoint_type).await;
        }
    }

    /// Trigger the periodic reconciliation audit on every enabled subcloud.
    pub async fn run_sync_audit(&self) {
        for engine in self.engines.read().await.values() {
            engine.run_sync_audit().await;
        }
    }

    /// On-demand audit for one scope, used right after add-subcloud so a new
    /// subcloud converges without waiting for the next cadence.
    pub async fn initial_sync(
        &self,
        region: &RegionName,
        endpoint_type: EndpointType,
    ) -> Result<(), EngineError> {
        let engine = self.engine(region).await?;
        engine.request_audit(endpoint_type).await
    }

    async fn engine(&self, region: &RegionName) -> Result<Arc<SubcloudEngine>, EngineError> {
        self.engines
            .read()
            .await
            .get(region)
            .cloned()
            .ok_or_else(|| EngineError::SubcloudNotFound(region.to_string()))
    }

    async fn refresh_hosts_file(&self) -> Result<(), EngineError> {
        let Some(path) = &self.config.hosts_file else {
            return Ok(());
        };
        let subclouds = self.store.list_subclouds().await?;
        if hosts::write_addn_hosts(path, &subclouds)? {
            hosts::reload_dns_daemon();
        }
        Ok(())
    }
}

/// Periodic audit driver: one tick fans out to every enabled subcloud.
pub async fn run_audit_scheduler(
    manager: Arc<GenericSyncManager>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(?interval, "audit scheduler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.run_sync_audit().await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    info!("audit scheduler stopped");
}
