use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dcsync_client::ClientFactory;
use dcsync_config::EngineConfig;
use dcsync_domain::{EndpointType, RegionName, Subcloud};
use dcsync_store::SyncStore;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::fault::Faults;
use crate::worker::{SyncWorker, WorkerSignals};

/// Lifecycle of one subcloud's engine.
///
/// Transitions:
///   Loading → Enabled ↔ Disabled → Deleting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubcloudState {
    /// Workers exist but are not processing.
    Loading,
    /// Workers running, audits scheduled.
    Enabled,
    /// Workers paused, audits skipped.
    Disabled,
    /// Workers stopped, resources released.
    Deleting,
}

impl std::fmt::Display for SubcloudState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubcloudState::Loading => write!(f, "loading"),
            SubcloudState::Enabled => write!(f, "enabled"),
            SubcloudState::Disabled => write!(f, "disabled"),
            SubcloudState::Deleting => write!(f, "deleting"),
        }
    }
}

struct WorkerHandle {
    endpoint_type: EndpointType,
    wake: Arc<Notify>,
    audit_requested: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Owns one sync worker per endpoint type for a single subcloud and drives
/// their shared lifecycle.
pub struct SubcloudEngine {
    region: RegionName,
    store: Arc<dyn SyncStore>,
    state: Mutex<SubcloudState>,
    enabled_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl SubcloudEngine {
    /// Create the engine and spawn its workers. The workers idle until
    /// [`enable`](Self::enable) opens the gate.
    pub fn new(
        subcloud: &Subcloud,
        store: Arc<dyn SyncStore>,
        factory: &ClientFactory,
        faults: Arc<Faults>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let (enabled_tx, enabled_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(EndpointType::ALL.len());
        for endpoint_type in EndpointType::ALL {
            let wake = Arc::new(Notify::new());
            let audit_requested = Arc::new(AtomicBool::new(false));
            let signals = WorkerSignals {
                wake: wake.clone(),
                audit_requested: audit_requested.clone(),
                enabled: enabled_rx.clone(),
                stop: stop_rx.clone(),
            };
            // Each worker owns its own pair of sessions.
            let worker = SyncWorker::new(
                subcloud.region_name.clone(),
                endpoint_type,
                store.clone(),
                factory.master_clients(),
                factory.subcloud_clients(subcloud),
                faults.clone(),
                config,
                signals,
            );
            let join = tokio::spawn(worker.run());
            handles.push(WorkerHandle {
                endpoint_type,
                wake,
                audit_requested,
                join,
            });
        }

        info!(region = %subcloud.region_name, "subcloud engine loaded");
        Arc::new(Self {
            region: subcloud.region_name.clone(),
            store,
            state: Mutex::new(SubcloudState::Loading),
            enabled_tx,
            stop_tx,
            workers: Mutex::new(handles),
        })
    }

    pub fn region(&self) -> &RegionName {
        &self.region
    }

    pub async fn state(&self) -> SubcloudState {
        *self.state.lock().await
    }

    /// Start (or resume) the workers. Idempotent; a deleting engine stays
    /// deleting.
    pub async fn enable(&self) {
        let mut state = self.state.lock().await;
        if *state == SubcloudState::Deleting {
            warn!(region = %self.region, "ignoring enable of a deleting subcloud");
            return;
        }
        *state = SubcloudState::Enabled;
        let _ = self.enabled_tx.send(true);
        drop(state);
        self.wake_all().await;
        info!(region = %self.region, "subcloud enabled");
    }

    /// Pause the workers at the next handler boundary. Idempotent.
    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        if *state == SubcloudState::Deleting {
            return;
        }
        *state = SubcloudState::Disabled;
        let _ = self.enabled_tx.send(false);
        info!(region = %self.region, "subcloud disabled");
    }

    /// Stop the workers, wait for them to exit, and release every local
    /// bookkeeping row owned by this subcloud. In-flight work is not rolled
    /// back; the queue is aborted and purged instead.
    pub async fn delete(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock().await;
            *state = SubcloudState::Deleting;
        }
        let _ = self.enabled_tx.send(false);
        let _ = self.stop_tx.send(true);

        let handles: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            handle.wake.notify_one();
            if let Err(e) = handle.join.await {
                warn!(region = %self.region, endpoint = %handle.endpoint_type, error = %e, "worker join failed");
            }
        }

        self.store.abort_requests_for_region(&self.region).await?;
        self.store.purge_terminal_jobs().await?;
        self.store.delete_mappings_for_region(&self.region).await?;
        self.store.delete_subcloud(&self.region).await?;
        info!(region = %self.region, "subcloud deleted");
        Ok(())
    }

    /// Wake the worker for one endpoint type.
    pub async fn wake(&self, endpoint_type: EndpointType) {
        for handle in self.workers.lock().await.iter() {
            if handle.endpoint_type == endpoint_type {
                handle.wake.notify_one();
            }
        }
    }

    async fn wake_all(&self) {
        for handle in self.workers.lock().await.iter() {
            handle.wake.notify_one();
        }
    }

    /// Schedule an audit on every endpoint. Skipped while disabled.
    pub async fn run_sync_audit(&self) {
        if *self.state.lock().await != SubcloudState::Enabled {
            return;
        }
        for handle in self.workers.lock().await.iter() {
            handle.audit_requested.store(true, Ordering::SeqCst);
            handle.wake.notify_one();
        }
    }

    /// On-demand audit for one endpoint type (the initial-sync path).
    pub async fn request_audit(&self, endpoint_type: EndpointType) -> Result<(), EngineError> {
        let workers = self.workers.lock().await;
        let handle = workers
            .iter()
            .find(|h| h.endpoint_type == endpoint_type)
            .ok_or_else(|| EngineError::WorkerNotFound {
                region: self.region.to_string(),
                endpoint_type,
            })?;
        handle.audit_requested.store(true, Ordering::SeqCst);
        handle.wake.notify_one();
        Ok(())
    }

    pub async fn set_version(&self, version: &str) -> Result<(), EngineError> {
        let mut subcloud = self
            .store
            .get_subcloud(&self.region)
            .await?
            .ok_or_else(|| EngineError::SubcloudNotFound(self.region.to_string()))?;
        subcloud.software_version = version.to_string();
        self.store.upsert_subcloud(&subcloud).await?;
        info!(region = %self.region, version, "subcloud version updated");
        Ok(())
    }
}
